//! # Jarvis Client — the interaction layer of the assistant
//!
//! Sits on top of the session layer (`jarvis-session`) and the voice layer
//! (`jarvis-voice`). The interaction state machine is the single authority
//! on what the session is doing — idle, recording, processing, speaking —
//! and the [`AssistantClient`] handle wires all the layers together.

pub mod client;
pub mod error;
pub mod interaction;

pub use client::AssistantClient;
pub use error::{ClientError, ClientResult};
pub use interaction::{CommandOutcome, Interaction, InteractionEvent, InteractionState};
