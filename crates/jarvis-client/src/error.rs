//! Error types for the interaction layer

use jarvis_session::SessionError;
use jarvis_voice::VoiceError;
use thiserror::Error;

/// Result type alias for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the interaction state machine
#[derive(Error, Debug)]
pub enum ClientError {
    /// Conflicting state transition: only `Idle` accepts new user-initiated
    /// capture or synthesis.
    #[error("Session busy: another interaction is in progress")]
    SessionBusy,

    /// The gateway answered the request with an error envelope.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// A reply envelope arrived without the expected payload field.
    #[error("Malformed reply: missing {0}")]
    MalformedReply(&'static str),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Voice(#[from] VoiceError),
}
