use thiserror::Error;

/// Failure of a bridge operation, delivered to the caller that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The BLE server answered the request with an error string
    #[error("{0}")]
    Remote(String),
    #[error("link to BLE server closed")]
    LinkClosed,
    /// The inbound stream could not be decoded; the link is torn down
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("request {id} timed out")]
    Timeout { id: u64 },
    #[error("unexpected result for {command}: {reason}")]
    UnexpectedResult {
        command: &'static str,
        reason: String,
    },
    #[error("failed to encode command: {0}")]
    Encode(String),
}

impl BridgeError {
    pub fn unexpected_result(command: &'static str, err: impl std::fmt::Display) -> Self {
        Self::UnexpectedResult {
            command,
            reason: err.to_string(),
        }
    }
}
