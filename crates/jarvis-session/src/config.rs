//! Session configuration loaded from `.env`.
//!
//! Endpoint, identity, and the timing knobs for reconnection and correlation
//! timeouts. Change behavior without code edits.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_gateway_url() -> String {
    "ws://127.0.0.1:8000/ws".to_string()
}

fn default_user_id() -> String {
    "default_user".to_string()
}

fn default_voice() -> String {
    "default".to_string()
}

fn default_correlation_timeout_secs() -> u64 {
    30
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_cap_ms() -> u64 {
    5_000
}

fn default_reconnect_max_attempts() -> u32 {
    5
}

fn default_max_utterance_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Session configuration loaded from environment.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | JARVIS_GATEWAY_URL | ws://127.0.0.1:8000/ws | Gateway websocket endpoint. |
/// | JARVIS_USER_ID | default_user | Logical user identity attached to requests. |
/// | JARVIS_VOICE | default | Synthesis voice profile (read-only for the core). |
/// | JARVIS_CORRELATION_TIMEOUT_SECS | 30 | Pending-reply timeout per request. |
/// | JARVIS_RECONNECT_BASE_MS | 1000 | Backoff base for reconnect attempts. |
/// | JARVIS_RECONNECT_CAP_MS | 5000 | Backoff cap. |
/// | JARVIS_RECONNECT_MAX_ATTEMPTS | 5 | Attempts before ConnectionState::Failed. |
/// | JARVIS_MAX_UTTERANCE_SECS | 30 | Force-stop bound for one recording. |
/// | JARVIS_AUTO_PLAYBACK | true | Play synthesized replies automatically. |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// JARVIS_GATEWAY_URL: single bidirectional gateway endpoint; reconnects target the same URL.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// JARVIS_USER_ID: stamped into process_command / execute_task requests.
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// JARVIS_VOICE: voice profile sent with synthesize_request. Never mutated by the core.
    #[serde(default = "default_voice")]
    pub voice: String,
    /// JARVIS_CORRELATION_TIMEOUT_SECS: pending entries older than this resolve with a timeout error.
    #[serde(default = "default_correlation_timeout_secs")]
    pub correlation_timeout_secs: u64,
    /// JARVIS_RECONNECT_BASE_MS: first retry delay; doubles per attempt.
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// JARVIS_RECONNECT_CAP_MS: retry delay never exceeds this.
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
    /// JARVIS_RECONNECT_MAX_ATTEMPTS: failures before the channel goes terminal (Failed).
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    /// JARVIS_MAX_UTTERANCE_SECS: recording is force-finalized after this bound.
    #[serde(default = "default_max_utterance_secs")]
    pub max_utterance_secs: u64,
    /// JARVIS_AUTO_PLAYBACK: when true, command results with synthesized audio are played back.
    #[serde(default = "default_true")]
    pub auto_playback: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            user_id: default_user_id(),
            voice: default_voice(),
            correlation_timeout_secs: default_correlation_timeout_secs(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            max_utterance_secs: default_max_utterance_secs(),
            auto_playback: default_true(),
        }
    }
}

impl SessionConfig {
    /// Load from environment. Unset or invalid => defaults (see struct field docs).
    pub fn from_env() -> Self {
        Self {
            gateway_url: env_str("JARVIS_GATEWAY_URL", default_gateway_url()),
            user_id: env_str("JARVIS_USER_ID", default_user_id()),
            voice: env_str("JARVIS_VOICE", default_voice()),
            correlation_timeout_secs: env_u64(
                "JARVIS_CORRELATION_TIMEOUT_SECS",
                default_correlation_timeout_secs(),
            ),
            reconnect_base_ms: env_u64("JARVIS_RECONNECT_BASE_MS", default_reconnect_base_ms()),
            reconnect_cap_ms: env_u64("JARVIS_RECONNECT_CAP_MS", default_reconnect_cap_ms()),
            reconnect_max_attempts: env_u64(
                "JARVIS_RECONNECT_MAX_ATTEMPTS",
                default_reconnect_max_attempts() as u64,
            ) as u32,
            max_utterance_secs: env_u64("JARVIS_MAX_UTTERANCE_SECS", default_max_utterance_secs()),
            auto_playback: env_bool("JARVIS_AUTO_PLAYBACK", true),
        }
    }

    /// Pending-reply timeout as a `Duration`.
    pub fn correlation_timeout(&self) -> Duration {
        Duration::from_secs(self.correlation_timeout_secs)
    }

    /// Force-stop bound for a single utterance.
    pub fn max_utterance(&self) -> Duration {
        Duration::from_secs(self.max_utterance_secs)
    }

    /// Backoff delay for a reconnect attempt (1-based), capped exponential.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(10);
        let factor = 1u64 << exp;
        let ms = self
            .reconnect_base_ms
            .saturating_mul(factor)
            .min(self.reconnect_cap_ms);
        Duration::from_millis(ms)
    }
}

fn env_str(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
