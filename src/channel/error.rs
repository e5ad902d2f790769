use thiserror::Error;

/// Failure on the controller/worker communication layer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("no channel handle is open")]
    NoHandle,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("channel disconnected")]
    Disconnected,

    #[error("worker unreachable: {0}")]
    Unreachable(String),
}
