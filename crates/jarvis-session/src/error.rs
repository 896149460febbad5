//! Error types for the session layer

use thiserror::Error;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur on the channel / routing layer
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Channel unavailable: send attempted while not connected")]
    ChannelUnavailable,

    #[error("No reply within {0:?} for correlation id {1}")]
    CorrelationTimeout(std::time::Duration, String),

    #[error("Reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Pending request cancelled by session teardown")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}
