//! Bluetooth Bridge Service
//!
//! Public facade over the BLE server link: command methods for the host API
//! and the inbound router that turns server messages into [`BridgeEvent`]s.

use crate::domain::error::BridgeError;
use crate::domain::models::{BridgeEvent, Characteristic, CharacteristicRef, PowerState};
use crate::domain::settings::BridgeSettings;
use crate::infrastructure::bluetooth::{
    codec::{FrameReader, FrameWriter, DEFAULT_MAX_FRAME_BYTES},
    correlator::{Correlator, PendingKind},
    devices::DeviceTable,
    protocol::{self, Command, InboundMessage, RemoteId, WireCharacteristic},
    subscriptions::SubscriptionRegistry,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, trace, warn};

/// Runtime options of a bridge
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub max_frame_bytes: usize,
    /// `None` keeps requests pending until the link closes
    pub request_timeout: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            request_timeout: None,
        }
    }
}

impl From<&BridgeSettings> for BridgeConfig {
    fn from(settings: &BridgeSettings) -> Self {
        Self {
            max_frame_bytes: settings.max_frame_bytes,
            request_timeout: settings.request_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// State shared by the facade, the reader task and the writer task
struct Shared {
    correlator: Correlator,
    devices: Mutex<DeviceTable>,
    subscriptions: Mutex<SubscriptionRegistry>,
    power_state: Mutex<PowerState>,
    event_sender: mpsc::UnboundedSender<BridgeEvent>,
    request_timeout: Option<Duration>,
    shutdown: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn emit(&self, event: BridgeEvent) {
        let _ = self.event_sender.send(event);
    }

    fn set_power_state(&self, state: PowerState) {
        *lock(&self.power_state) = state;
        info!("BLE server power state: {}", state);
        self.emit(BridgeEvent::StateChange(state));
    }

    /// Route one inbound message. An error means the link must be dropped.
    fn dispatch(&self, message: Value) -> Result<(), BridgeError> {
        trace!(%message, "in");

        match InboundMessage::from_value(message)? {
            InboundMessage::Start => self.set_power_state(PowerState::PoweredOn),
            InboundMessage::ScanResult(scan) => {
                self.emit(BridgeEvent::Discover(scan.into_advertisement()));
            }
            InboundMessage::Response(response) => {
                let id = response.id;
                let routed = self
                    .correlator
                    .complete(id, response.into_outcome(), |kind, outcome| {
                        self.commit(kind, outcome)
                    });
                if !routed {
                    warn!(id, "Dropping response for unknown request");
                }
            }
            InboundMessage::DisconnectEvent(event) => self.handle_remote_disconnect(&event.device),
            InboundMessage::ValueChanged(notification) => {
                let target = lock(&self.subscriptions)
                    .lookup(&notification.subscription_id)
                    .cloned();
                match target {
                    Some(target) => self.emit(BridgeEvent::Read {
                        target,
                        result: Ok(notification.value),
                        is_notification: true,
                    }),
                    None => warn!(
                        subscription = %notification.subscription_id,
                        "Dropping notification for unknown subscription"
                    ),
                }
            }
            InboundMessage::Unknown(kind) => debug!(%kind, "Ignoring message of unknown type"),
        }
        Ok(())
    }

    /// Record what a successful response confirmed. Runs on the reader task
    /// before the caller wakes and before the next inbound frame.
    fn commit(
        &self,
        kind: &PendingKind,
        outcome: Result<Value, BridgeError>,
    ) -> Result<Value, BridgeError> {
        let result = outcome?;
        match kind {
            PendingKind::Plain => {}
            PendingKind::Connect { address } => {
                let handle = RemoteId::deserialize(&result)
                    .map_err(|e| BridgeError::unexpected_result("connect", e))?;
                debug!(%address, %handle, "Connected");
                if let Some(old) = lock(&self.devices).put(address, handle) {
                    debug!(%address, %old, "Replaced device handle");
                }
            }
            PendingKind::Disconnect { address } => {
                lock(&self.devices).remove(address);
                let dropped = lock(&self.subscriptions).remove_device(address);
                debug!(%address, subscriptions = dropped.len(), "Disconnected");
            }
            PendingKind::Subscribe { target } => {
                let id = RemoteId::deserialize(&result)
                    .map_err(|e| BridgeError::unexpected_result("subscribe", e))?;
                debug!(%target, subscription = %id, "Subscribed");
                lock(&self.subscriptions).register(id, target.clone());
            }
            PendingKind::Unsubscribe { target } => {
                let removed = lock(&self.subscriptions).unregister_target(target);
                debug!(%target, removed = removed.len(), "Unsubscribed");
            }
        }
        Ok(result)
    }

    fn handle_remote_disconnect(&self, handle: &RemoteId) {
        let addresses = {
            let mut devices = lock(&self.devices);
            let addresses = devices.addresses_for(handle);
            for address in &addresses {
                devices.remove(address);
            }
            addresses
        };

        if addresses.is_empty() {
            warn!(device = %handle, "Dropping disconnect event for unknown device");
            return;
        }

        for address in addresses {
            lock(&self.subscriptions).remove_device(&address);
            info!(%address, "Device disconnected by BLE server");
            self.emit(BridgeEvent::Disconnect {
                address,
                error: None,
            });
        }
    }

    /// Tear down the link once: fail pending requests and report power off
    fn terminate(&self, reason: BridgeError) {
        let Some(failed) = self.correlator.close(reason.clone()) else {
            return;
        };
        if failed > 0 {
            warn!(failed, "Failed pending requests: {}", reason);
        }
        {
            let devices = lock(&self.devices);
            if !devices.is_empty() {
                warn!(connected = devices.len(), "Link closed with devices still connected");
            }
        }
        self.set_power_state(PowerState::PoweredOff);
    }
}

/// Bridge between the host BLE API and the BLE server process.
///
/// Cloning is cheap; all clones drive the same link.
#[derive(Clone)]
pub struct BluetoothBridge {
    shared: Arc<Shared>,
}

impl BluetoothBridge {
    /// Start the bridge over a duplex byte stream to the BLE server.
    ///
    /// Spawns the reader and writer tasks on the current tokio runtime and
    /// returns the facade plus the receiver of facade events.
    pub fn start<R, W>(
        reader: R,
        writer: W,
        config: BridgeConfig,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            correlator: Correlator::new(outbound_tx),
            devices: Mutex::new(DeviceTable::new()),
            subscriptions: Mutex::new(SubscriptionRegistry::new()),
            power_state: Mutex::new(PowerState::Unknown),
            event_sender,
            request_timeout: config.request_timeout,
            shutdown: Notify::new(),
        });

        tokio::spawn(Self::writer_loop(
            FrameWriter::new(writer),
            outbound_rx,
            Arc::downgrade(&shared),
        ));
        tokio::spawn(Self::reader_loop(
            FrameReader::new(reader, config.max_frame_bytes),
            Arc::clone(&shared),
        ));

        (Self { shared }, event_receiver)
    }

    /// Writer loop - writes queued frames in order.
    ///
    /// Holds only a weak reference so the queue closes once the bridge is dropped.
    async fn writer_loop<W: AsyncWrite + Unpin>(
        mut writer: FrameWriter<W>,
        mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
        shared: Weak<Shared>,
    ) {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = writer.write_encoded(&frame).await {
                error!("Failed to write to BLE server: {}", e);
                // Nobody would answer the queued requests
                if let Some(shared) = shared.upgrade() {
                    shared.shutdown.notify_one();
                }
                break;
            }
        }
        debug!("Writer loop finished");
    }

    /// Reader loop - decodes frames and dispatches them until the link ends
    async fn reader_loop<R: AsyncRead + Unpin>(mut reader: FrameReader<R>, shared: Arc<Shared>) {
        let reason = loop {
            tokio::select! {
                _ = shared.shutdown.notified() => {
                    info!("Bridge shut down");
                    break BridgeError::LinkClosed;
                }
                frame = reader.read_frame() => match frame {
                    Ok(Some(message)) => {
                        if let Err(e) = shared.dispatch(message) {
                            error!("Closing link: {}", e);
                            break e;
                        }
                    }
                    Ok(None) => {
                        info!("BLE server closed the stream");
                        break BridgeError::LinkClosed;
                    }
                    Err(e) => {
                        error!("Closing link: {}", e);
                        break BridgeError::from(e);
                    }
                },
            }
        };
        shared.terminate(reason);
    }

    async fn request(&self, command: Command, kind: PendingKind) -> Result<Value, BridgeError> {
        let mut pending = self.shared.correlator.send(&command, kind)?;
        let id = pending.id();
        debug!(id, cmd = command.name(), "Request sent");

        let Some(limit) = self.shared.request_timeout else {
            return pending.await;
        };
        match tokio::time::timeout(limit, &mut pending).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let error = BridgeError::Timeout { id };
                if self.shared.correlator.reject(id, error.clone()) {
                    warn!(id, cmd = command.name(), "Request timed out");
                    Err(error)
                } else {
                    // The response was routed as the timer fired
                    pending.await
                }
            }
        }
    }

    /// Handle for `address`, `None` if it isn't connected. The command is
    /// still sent; the BLE server rejects it.
    fn handle_for(&self, address: &str) -> Option<RemoteId> {
        let handle = lock(&self.shared.devices).get(address).cloned();
        if handle.is_none() {
            warn!(address, "No device handle for address");
        }
        handle
    }

    fn emit(&self, event: BridgeEvent) {
        self.shared.emit(event);
    }

    /// Start scanning for devices. Advertisements arrive as `Discover` events.
    pub fn start_scanning(&self) -> Result<(), BridgeError> {
        info!("Starting BLE scan");
        self.shared.correlator.notify(&Command::Scan)
    }

    /// Stop scanning for devices
    pub fn stop_scanning(&self) -> Result<(), BridgeError> {
        info!("Stopping BLE scan");
        self.shared.correlator.notify(&Command::StopScan)
    }

    /// Connect to a device by address.
    ///
    /// The handle is recorded by the time this returns. Unsolicited frames
    /// right behind the response already see it.
    pub async fn connect(&self, address: &str) -> Result<(), BridgeError> {
        info!(address, "Connecting");
        let error = self
            .request(
                Command::Connect {
                    address: address.to_string(),
                },
                PendingKind::Connect {
                    address: address.to_string(),
                },
            )
            .await
            .err();

        if let Some(e) = &error {
            warn!(address, "Connect failed: {}", e);
        }
        self.emit(BridgeEvent::Connect {
            address: address.to_string(),
            error: error.clone(),
        });
        error.map_or(Ok(()), Err)
    }

    /// Disconnect a device. Its handle and subscriptions are dropped on success.
    pub async fn disconnect(&self, address: &str) -> Result<(), BridgeError> {
        info!(address, "Disconnecting");
        let error = self
            .request(
                Command::Disconnect {
                    device: self.handle_for(address),
                },
                PendingKind::Disconnect {
                    address: address.to_string(),
                },
            )
            .await
            .err();

        if let Some(e) = &error {
            warn!(address, "Disconnect failed: {}", e);
        }
        self.emit(BridgeEvent::Disconnect {
            address: address.to_string(),
            error: error.clone(),
        });
        error.map_or(Ok(()), Err)
    }

    /// List the primary services of a connected device
    pub async fn discover_services(&self, address: &str) -> Result<Vec<String>, BridgeError> {
        let result = self
            .request(
                Command::Services {
                    device: self.handle_for(address),
                },
                PendingKind::Plain,
            )
            .await
            .and_then(|result| {
                serde_json::from_value::<Vec<String>>(result)
                    .map_err(|e| BridgeError::unexpected_result("services", e))
            })
            .map(|uuids| uuids.iter().map(|uuid| protocol::from_wire_uuid(uuid)).collect());

        self.emit(BridgeEvent::ServicesDiscover {
            address: address.to_string(),
            result: result.clone(),
        });
        result
    }

    /// List the characteristics of a service with their property flags
    pub async fn discover_characteristics(
        &self,
        address: &str,
        service: &str,
    ) -> Result<Vec<Characteristic>, BridgeError> {
        let result = self
            .request(
                Command::Characteristics {
                    device: self.handle_for(address),
                    service: protocol::to_wire_uuid(service),
                },
                PendingKind::Plain,
            )
            .await
            .and_then(|result| {
                serde_json::from_value::<Vec<WireCharacteristic>>(result)
                    .map_err(|e| BridgeError::unexpected_result("characteristics", e))
            })
            .map(|characteristics| {
                characteristics
                    .into_iter()
                    .map(WireCharacteristic::into_characteristic)
                    .collect()
            });

        self.emit(BridgeEvent::CharacteristicsDiscover {
            address: address.to_string(),
            service: service.to_string(),
            result: result.clone(),
        });
        result
    }

    /// Read a characteristic value
    pub async fn read(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<Vec<u8>, BridgeError> {
        let target = CharacteristicRef::new(address, service, characteristic);
        let result = self
            .request(
                Command::Read {
                    device: self.handle_for(address),
                    service: protocol::to_wire_uuid(service),
                    characteristic: protocol::to_wire_uuid(characteristic),
                },
                PendingKind::Plain,
            )
            .await
            .and_then(|result| {
                serde_json::from_value::<Vec<u8>>(result)
                    .map_err(|e| BridgeError::unexpected_result("read", e))
            });

        self.emit(BridgeEvent::Read {
            target,
            result: result.clone(),
            is_notification: false,
        });
        result
    }

    /// Write a characteristic value, optionally as a write without response
    pub async fn write(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
        data: &[u8],
        without_response: bool,
    ) -> Result<(), BridgeError> {
        let target = CharacteristicRef::new(address, service, characteristic);
        let error = self
            .request(
                Command::Write {
                    device: self.handle_for(address),
                    service: protocol::to_wire_uuid(service),
                    characteristic: protocol::to_wire_uuid(characteristic),
                    value: data.to_vec(),
                    without_response,
                },
                PendingKind::Plain,
            )
            .await
            .err();

        if let Some(e) = &error {
            warn!(%target, "Write failed: {}", e);
        }
        self.emit(BridgeEvent::Write {
            target,
            error: error.clone(),
        });
        error.map_or(Ok(()), Err)
    }

    /// Enable or disable value-changed notifications on a characteristic.
    ///
    /// Returns the new state. Notifications pushed right behind a subscribe
    /// response are already routed.
    pub async fn notify(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
        enable: bool,
    ) -> Result<bool, BridgeError> {
        let target = CharacteristicRef::new(address, service, characteristic);
        let device = self.handle_for(address);
        let service = protocol::to_wire_uuid(service);
        let characteristic = protocol::to_wire_uuid(characteristic);
        let (command, kind) = if enable {
            (
                Command::Subscribe {
                    device,
                    service,
                    characteristic,
                },
                PendingKind::Subscribe {
                    target: target.clone(),
                },
            )
        } else {
            (
                Command::Unsubscribe {
                    device,
                    service,
                    characteristic,
                },
                PendingKind::Unsubscribe {
                    target: target.clone(),
                },
            )
        };

        let result = self.request(command, kind).await.map(|_| enable);

        if let Err(e) = &result {
            warn!(%target, "Notify change failed: {}", e);
        }
        self.emit(BridgeEvent::Notify {
            target,
            result: result.clone(),
        });
        result
    }

    /// Stop the bridge locally. Pending requests fail with `LinkClosed` and
    /// `poweredOff` is reported, as if the BLE server had gone away.
    pub fn close(&self) {
        self.shared.shutdown.notify_one();
    }

    pub fn state(&self) -> PowerState {
        *lock(&self.shared.power_state)
    }

    /// Number of devices with a live handle
    pub fn connected_count(&self) -> usize {
        lock(&self.shared.devices).len()
    }

    pub fn is_connected(&self, address: &str) -> bool {
        lock(&self.shared.devices).is_connected(address)
    }

    pub fn device_handle(&self, address: &str) -> Option<RemoteId> {
        lock(&self.shared.devices).get(address).cloned()
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.shared.subscriptions).len()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.pending_count()
    }
}
