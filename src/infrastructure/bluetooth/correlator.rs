//! Request correlator
//!
//! Tags each outbound command with a fresh id and completes the matching
//! caller when the response with that id arrives. Responses may come back
//! in any order.
//!
//! Each pending entry carries a [`PendingKind`]. The dispatcher applies it
//! to the bridge state while routing the response, before the caller wakes,
//! so frames that follow the response already see the new state.

use crate::domain::error::BridgeError;
use crate::domain::models::CharacteristicRef;
use crate::infrastructure::bluetooth::codec::encode_frame;
use crate::infrastructure::bluetooth::protocol::Command;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

type Completion = oneshot::Sender<Result<Value, BridgeError>>;

/// Bridge state a successful response commits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingKind {
    Plain,
    Connect { address: String },
    Disconnect { address: String },
    Subscribe { target: CharacteristicRef },
    Unsubscribe { target: CharacteristicRef },
}

struct Pending {
    kind: PendingKind,
    completion: Completion,
}

#[derive(Default)]
struct PendingTable {
    next_id: u64,
    pending: HashMap<u64, Pending>,
    closed: bool,
}

impl PendingTable {
    /// Next id not currently outstanding. Wraps at `u64::MAX`.
    fn allocate_id(&mut self) -> u64 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Result of a request still in flight
#[derive(Debug)]
pub struct PendingResponse {
    id: u64,
    receiver: oneshot::Receiver<Result<Value, BridgeError>>,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingResponse {
    type Output = Result<Value, BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the correlator itself is gone
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(BridgeError::LinkClosed)))
    }
}

pub struct Correlator {
    table: Mutex<PendingTable>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl Correlator {
    /// Encoded frames are queued on `outbound` for the writer task
    pub fn new(outbound: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            table: Mutex::new(PendingTable::default()),
            outbound,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register and transmit a correlated command.
    ///
    /// The pending entry exists before the frame is queued, so even an
    /// immediate response finds it.
    pub fn send(&self, command: &Command, kind: PendingKind) -> Result<PendingResponse, BridgeError> {
        let mut table = self.lock();
        if table.closed {
            return Err(BridgeError::LinkClosed);
        }

        let id = table.allocate_id();
        let frame = command
            .to_frame(Some(id))
            .map_err(|e| BridgeError::Encode(e.to_string()))
            .and_then(|value| encode_frame(&value).map_err(|e| BridgeError::Encode(e.to_string())))?;

        let (completion, receiver) = oneshot::channel();
        table.pending.insert(id, Pending { kind, completion });
        if self.outbound.send(frame).is_err() {
            table.pending.remove(&id);
            return Err(BridgeError::LinkClosed);
        }

        trace!(id, cmd = command.name(), pending = table.pending.len(), "out");
        Ok(PendingResponse { id, receiver })
    }

    /// Transmit a command that expects no response
    pub fn notify(&self, command: &Command) -> Result<(), BridgeError> {
        let table = self.lock();
        if table.closed {
            return Err(BridgeError::LinkClosed);
        }

        let frame = command
            .to_frame(None)
            .map_err(|e| BridgeError::Encode(e.to_string()))
            .and_then(|value| encode_frame(&value).map_err(|e| BridgeError::Encode(e.to_string())))?;
        self.outbound
            .send(frame)
            .map_err(|_| BridgeError::LinkClosed)?;

        trace!(cmd = command.name(), "out");
        Ok(())
    }

    /// Complete request `id` successfully. Returns `false` if no such
    /// request is outstanding, in which case nothing happens.
    pub fn resolve(&self, id: u64, result: Value) -> bool {
        self.complete(id, Ok(result), |_, outcome| outcome)
    }

    /// Fail request `id`. Same no-op rule as [`Correlator::resolve`].
    pub fn reject(&self, id: u64, error: BridgeError) -> bool {
        self.complete(id, Err(error), |_, outcome| outcome)
    }

    /// Remove request `id`, pass its outcome through `apply` and hand the
    /// result to the caller. `apply` runs even if the caller stopped waiting.
    pub fn complete(
        &self,
        id: u64,
        outcome: Result<Value, BridgeError>,
        apply: impl FnOnce(&PendingKind, Result<Value, BridgeError>) -> Result<Value, BridgeError>,
    ) -> bool {
        let Some(entry) = self.lock().pending.remove(&id) else {
            return false;
        };
        let outcome = apply(&entry.kind, outcome);
        // The caller may be gone (aborted); the state change above still stands
        let _ = entry.completion.send(outcome);
        true
    }

    /// Fail every outstanding request with `reason` and refuse new ones.
    ///
    /// Returns the number of requests failed, or `None` if the correlator
    /// was already closed.
    pub fn close(&self, reason: BridgeError) -> Option<usize> {
        let drained: Vec<(u64, Pending)> = {
            let mut table = self.lock();
            if table.closed {
                return None;
            }
            table.closed = true;
            table.pending.drain().collect()
        };

        let count = drained.len();
        for (id, entry) in drained {
            debug!(id, "failing pending request: {}", reason);
            let _ = entry.completion.send(Err(reason.clone()));
        }
        Some(count)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::codec::FrameDecoder;
    use proptest::prelude::*;
    use serde_json::json;

    fn correlator() -> (Correlator, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Correlator::new(tx), rx)
    }

    fn read_command(characteristic: &str) -> Command {
        Command::Read {
            device: Some("handle-1".into()),
            service: "{180d}".to_string(),
            characteristic: characteristic.to_string(),
        }
    }

    #[test]
    fn test_send_queues_tagged_frame() {
        let (correlator, mut outbound) = correlator();
        let pending = correlator
            .send(
                &Command::Connect {
                    address: "AA:BB:CC:DD:EE:FF".to_string(),
                },
                PendingKind::Plain,
            )
            .unwrap();
        assert_eq!(pending.id(), 0);

        let mut decoder = FrameDecoder::default();
        decoder.push(&outbound.try_recv().unwrap());
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(
            frame,
            json!({ "cmd": "connect", "address": "AA:BB:CC:DD:EE:FF", "_id": 0 })
        );
        assert_eq!(correlator.pending_count(), 1);
    }

    #[test]
    fn test_notify_has_no_id() {
        let (correlator, mut outbound) = correlator();
        correlator.notify(&Command::Scan).unwrap();

        let mut decoder = FrameDecoder::default();
        decoder.push(&outbound.try_recv().unwrap());
        assert_eq!(decoder.next_frame().unwrap().unwrap(), json!({ "cmd": "scan" }));
        assert_eq!(correlator.pending_count(), 0);
    }

    proptest! {
        #[test]
        fn any_resolve_order_reaches_the_right_callers(
            order in (1usize..24).prop_flat_map(|n| Just((0..n).collect::<Vec<usize>>()).prop_shuffle())
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (correlator, _outbound) = correlator();
            let pending: Vec<PendingResponse> = (0..order.len())
                .map(|i| correlator.send(&read_command(&format!("{{2a{:02}}}", i)), PendingKind::Plain).unwrap())
                .collect();

            for &index in &order {
                prop_assert!(correlator.resolve(pending[index].id(), json!([index])));
            }

            for (index, response) in pending.into_iter().enumerate() {
                prop_assert_eq!(runtime.block_on(response).unwrap(), json!([index]));
            }
            prop_assert_eq!(correlator.pending_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_complete_applies_kind_before_waking_caller() {
        let (correlator, _outbound) = correlator();
        let target = CharacteristicRef::new("AA", "180d", "2a37");
        let pending = correlator
            .send(&read_command("{2a37}"), PendingKind::Subscribe { target: target.clone() })
            .unwrap();
        let id = pending.id();

        let mut applied = None;
        assert!(correlator.complete(id, Ok(json!("sub-9")), |kind, outcome| {
            applied = Some(kind.clone());
            outcome.map(|_| json!("rewritten"))
        }));
        assert_eq!(applied, Some(PendingKind::Subscribe { target }));
        assert_eq!(pending.await.unwrap(), json!("rewritten"));
    }

    #[test]
    fn test_complete_runs_for_abandoned_caller() {
        let (correlator, _outbound) = correlator();
        let pending = correlator
            .send(
                &Command::Connect {
                    address: "AA".to_string(),
                },
                PendingKind::Connect {
                    address: "AA".to_string(),
                },
            )
            .unwrap();
        let id = pending.id();
        drop(pending);

        let mut applied = false;
        assert!(correlator.complete(id, Ok(json!(1)), |_, outcome| {
            applied = true;
            outcome
        }));
        assert!(applied);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_completion_happens_once() {
        let (correlator, _outbound) = correlator();
        let first = correlator.send(&read_command("{2a37}"), PendingKind::Plain).unwrap();
        let second = correlator.send(&read_command("{2a38}"), PendingKind::Plain).unwrap();

        assert!(correlator.resolve(first.id(), json!([1])));
        assert!(!correlator.resolve(first.id(), json!([2])));
        assert!(!correlator.reject(first.id(), BridgeError::Remote("late".to_string())));
        assert_eq!(first.await.unwrap(), json!([1]));

        assert!(correlator.reject(second.id(), BridgeError::Remote("GATT error".to_string())));
        assert!(!correlator.resolve(second.id(), json!([3])));
        assert_eq!(
            second.await,
            Err(BridgeError::Remote("GATT error".to_string()))
        );
    }

    #[test]
    fn test_unknown_id_is_noop() {
        let (correlator, _outbound) = correlator();
        assert!(!correlator.resolve(99, json!(null)));
        assert!(!correlator.reject(99, BridgeError::LinkClosed));
    }

    #[tokio::test]
    async fn test_close_fails_all_pending_once() {
        let (correlator, _outbound) = correlator();
        let pending: Vec<PendingResponse> = (0..3)
            .map(|_| correlator.send(&read_command("{2a37}"), PendingKind::Plain).unwrap())
            .collect();

        assert_eq!(correlator.close(BridgeError::LinkClosed), Some(3));
        assert_eq!(correlator.close(BridgeError::LinkClosed), None);

        for response in pending {
            assert_eq!(response.await, Err(BridgeError::LinkClosed));
        }
        assert!(matches!(
            correlator.send(&read_command("{2a37}"), PendingKind::Plain),
            Err(BridgeError::LinkClosed)
        ));
        assert!(matches!(
            correlator.notify(&Command::StopScan),
            Err(BridgeError::LinkClosed)
        ));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_ids_skip_outstanding_after_wrap() {
        let (correlator, _outbound) = correlator();
        let zero = correlator.send(&read_command("{2a37}"), PendingKind::Plain).unwrap();
        assert_eq!(zero.id(), 0);

        correlator.lock().next_id = u64::MAX;
        let last = correlator.send(&read_command("{2a37}"), PendingKind::Plain).unwrap();
        assert_eq!(last.id(), u64::MAX);
        // 0 is still outstanding, so the counter moves past it
        let next = correlator.send(&read_command("{2a37}"), PendingKind::Plain).unwrap();
        assert_eq!(next.id(), 1);
    }

    #[tokio::test]
    async fn test_dead_writer_fails_send() {
        let (correlator, outbound) = correlator();
        drop(outbound);
        assert!(matches!(
            correlator.send(&read_command("{2a37}"), PendingKind::Plain),
            Err(BridgeError::LinkClosed)
        ));
        assert_eq!(correlator.pending_count(), 0);
    }
}
