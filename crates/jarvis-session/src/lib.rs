//! # Jarvis Session — gateway channel and message correlation
//!
//! The session layer of the Jarvis assistant client: one bidirectional
//! websocket to the API gateway, behind which the capability services
//! (recognition, language understanding, task execution, synthesis) live.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     Message Router                        │
//! │   dispatch(type, data) ──► pending map (correlation id)   │
//! │   on_envelope ──► awaiting consumer │ topic │ catch-all   │
//! └───────────────▲───────────────────────────────────────────┘
//!                 │ envelopes, transport order
//! ┌───────────────┴───────────────────────────────────────────┐
//! │                    Channel Manager                        │
//! │  Disconnected → Connecting → Connected → Reconnecting     │
//! │  capped backoff (1s..5s, 5 attempts) → Failed (terminal)  │
//! └───────────────▲───────────────────────────────────────────┘
//!                 │ Transport trait (websocket / in-memory)
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod router;
pub mod transport;

pub use channel::{ChannelManager, ConnectionEvent, ConnectionState};
pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use protocol::{expects_reply, inbound, outbound, Envelope, Session};
pub use router::MessageRouter;
pub use transport::{MemoryPeer, MemoryTransport, Transport, TransportConn, WsTransport};
