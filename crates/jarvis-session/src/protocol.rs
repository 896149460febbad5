//! Wire protocol for the gateway channel.
//!
//! Every message is a JSON envelope `{type, data, id, timestamp}`. Requests
//! that expect a reply are matched to it by the `id` (correlation id); the
//! gateway echoes the id on the response envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound envelope types recognized by the gateway.
pub mod outbound {
    pub const PROCESS_COMMAND: &str = "process_command";
    pub const EXECUTE_TASK: &str = "execute_task";
    pub const AUDIO_DATA: &str = "audio_data";
    pub const SYNTHESIZE_REQUEST: &str = "synthesize_request";
    pub const PING: &str = "ping";
}

/// Inbound envelope types emitted by the gateway and capability services.
pub mod inbound {
    pub const COMMAND_RESULT: &str = "command_result";
    pub const TASK_RESULT: &str = "task_result";
    pub const RECOGNITION_RESULT: &str = "recognition_result";
    pub const SYNTHESIS_RESULT: &str = "synthesis_result";
    pub const CONNECTION_ESTABLISHED: &str = "connection_established";
    pub const ERROR: &str = "error";
    pub const PONG: &str = "pong";
}

/// Whether an outbound envelope type expects exactly one correlated reply.
/// `ping` is fire-and-forget; `pong` is routed as a topic broadcast.
pub fn expects_reply(envelope_type: &str) -> bool {
    matches!(
        envelope_type,
        outbound::PROCESS_COMMAND
            | outbound::EXECUTE_TASK
            | outbound::AUDIO_DATA
            | outbound::SYNTHESIZE_REQUEST
    )
}

/// The wire unit exchanged over the channel. Immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// String tag selecting the capability service / reply kind.
    #[serde(rename = "type")]
    pub envelope_type: String,
    /// Payload object; shape depends on `envelope_type`.
    #[serde(default)]
    pub data: Value,
    /// Opaque correlation token (uuid v4 on outbound envelopes). Service
    /// broadcasts like `pong` arrive without one.
    #[serde(default)]
    pub id: String,
    /// Unix seconds, fractional (matches the gateway's server_time floats).
    #[serde(default)]
    pub timestamp: f64,
    /// Server-assigned session id; the gateway greeting carries it at the
    /// top level of the frame rather than inside `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Envelope {
    /// Build a new outbound envelope with a fresh correlation id.
    pub fn new(envelope_type: impl Into<String>, data: Value) -> Self {
        Self {
            envelope_type: envelope_type.into(),
            data,
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: unix_now(),
            session_id: None,
        }
    }

    /// True when this envelope is the gateway error type.
    pub fn is_error(&self) -> bool {
        self.envelope_type == inbound::ERROR
    }

    /// Error message carried by an `error` envelope, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.data.get("message").and_then(Value::as_str)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// One logical identity for a user's interaction. Owned by the channel
/// manager; survives transient disconnects, destroyed on explicit teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier; replaced by the server-assigned id from
    /// `connection_established` once the first connect completes.
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            created_at: Utc::now(),
        }
    }
}

fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
