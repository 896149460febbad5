//! **Interaction State Machine** — the single source of truth for what the
//! session is doing: idle, recording, awaiting a response, or speaking.
//!
//! Only `Idle` accepts user-initiated capture or synthesis; that one guard
//! keeps microphone and speaker from ever overlapping and prevents two
//! in-flight commands from the same session. Transitions never perform
//! network I/O directly — requests go through the message router and are
//! awaited via correlation.

use crate::error::{ClientError, ClientResult};
use jarvis_session::{inbound, outbound, ChannelManager, MessageRouter, SessionConfig, SessionError};
use jarvis_voice::{decode_base64_audio, CapturePipeline, PlaybackSink, UtterancePayload};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Mutually-exclusive interaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionState {
    Idle,
    Recording,
    Processing,
    Speaking,
    Error,
}

/// Notifications consumed by presentation collaborators.
#[derive(Debug, Clone)]
pub enum InteractionEvent {
    /// Emitted on every transition.
    StateChanged {
        from: InteractionState,
        to: InteractionState,
    },
    /// The language service answered a command; delivered exactly once.
    CommandResult { response: String },
    /// The recognition service transcribed an utterance.
    Recognized { text: String },
    /// An error was surfaced to the user (timeout, gateway error, device).
    ErrorSurfaced { message: String },
}

/// Outcome of one processed command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Response text from the language service.
    pub response: String,
    /// True when a synthesized reply was played back.
    pub spoke: bool,
}

/// The interaction state machine. Owns the capture pipeline and the playback
/// sink; talks to the gateway only through the message router.
pub struct Interaction {
    config: SessionConfig,
    channel: Arc<ChannelManager>,
    router: Arc<MessageRouter>,
    pipeline: Mutex<CapturePipeline>,
    playback: Arc<dyn PlaybackSink>,
    state: RwLock<InteractionState>,
    events: broadcast::Sender<InteractionEvent>,
}

impl Interaction {
    pub fn new(
        config: SessionConfig,
        channel: Arc<ChannelManager>,
        router: Arc<MessageRouter>,
        pipeline: CapturePipeline,
        playback: Arc<dyn PlaybackSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            channel,
            router,
            pipeline: Mutex::new(pipeline),
            playback,
            state: RwLock::new(InteractionState::Idle),
            events,
        }
    }

    pub async fn state(&self) -> InteractionState {
        *self.state.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InteractionEvent> {
        self.events.subscribe()
    }

    /// Live amplitude feed for the currently open utterance.
    pub async fn subscribe_amplitude(&self) -> broadcast::Receiver<f32> {
        self.pipeline.lock().await.subscribe_amplitude()
    }

    /// Fires when an open utterance hits the max-duration bound; the owner
    /// should then call [`Interaction::stop_and_process`].
    pub async fn subscribe_capture_limit(&self) -> broadcast::Receiver<()> {
        self.pipeline.lock().await.subscribe_limit()
    }

    /// Begin capturing an utterance. Rejected with `SessionBusy` unless the
    /// machine is `Idle`; rejected with `DeviceUnavailable` if the
    /// microphone cannot be acquired. Neither rejection changes state.
    pub async fn start_recording(&self) -> ClientResult<()> {
        let mut state = self.state.write().await;
        if *state != InteractionState::Idle {
            return Err(ClientError::SessionBusy);
        }
        self.pipeline.lock().await.start()?;
        let from = *state;
        *state = InteractionState::Recording;
        drop(state);
        self.emit_transition(from, InteractionState::Recording);
        Ok(())
    }

    /// Finalize the utterance and run it through recognition → command
    /// processing → (optionally) synthesis and playback. Returns once the
    /// machine is back in `Idle`.
    pub async fn stop_and_process(&self) -> ClientResult<CommandOutcome> {
        let payload = {
            let mut state = self.state.write().await;
            if *state != InteractionState::Recording {
                return Err(ClientError::Voice(jarvis_voice::VoiceError::NotRecording));
            }
            let payload = self.pipeline.lock().await.stop().await?;
            let from = *state;
            *state = InteractionState::Processing;
            drop(state);
            self.emit_transition(from, InteractionState::Processing);
            payload
        };

        let result = self.process_utterance(payload).await;
        self.settle(result).await
    }

    /// Process a typed command, bypassing capture. Same mutual-exclusion
    /// guard as recording.
    pub async fn send_text(&self, text: &str) -> ClientResult<CommandOutcome> {
        self.enter_processing().await?;
        let result = self.process_text(text.to_string()).await;
        self.settle(result).await
    }

    /// Dispatch a structured task to the execution service and return the
    /// task result payload. Same mutual-exclusion guard as commands.
    pub async fn execute_task(&self, task_type: &str, data: Value) -> ClientResult<Value> {
        self.enter_processing().await?;
        let session = self.channel.session().await;
        let result: ClientResult<Value> = async {
            let reply = self
                .router
                .request(
                    outbound::EXECUTE_TASK,
                    json!({
                        "type": task_type,
                        "data": data,
                        "user_id": session.user_id,
                        "session_id": session.id,
                    }),
                )
                .await?;
            let reply = check_gateway_reply(reply)?;
            Ok(reply.data)
        }
        .await;
        self.settle(result).await
    }

    /// Request synthesis of arbitrary text. Rejected before reaching the
    /// channel manager unless the machine is `Idle`.
    pub async fn synthesize(&self, text: &str) -> ClientResult<()> {
        self.enter_processing().await?;
        let result = self
            .request_synthesis_and_play(text)
            .await
            .map(|spoke| CommandOutcome {
                response: String::new(),
                spoke,
            });
        self.settle(result).await.map(|_| ())
    }

    /// Acknowledge a surfaced unrecoverable failure, returning to `Idle`.
    pub async fn acknowledge_error(&self) {
        let mut state = self.state.write().await;
        if *state == InteractionState::Error {
            *state = InteractionState::Idle;
            drop(state);
            self.emit_transition(InteractionState::Error, InteractionState::Idle);
        }
    }

    /// Abrupt teardown: release the microphone, silence the speaker. Safe in
    /// any state.
    pub async fn teardown(&self) {
        self.pipeline.lock().await.abort();
        self.playback.stop();
        let mut state = self.state.write().await;
        let from = *state;
        if from != InteractionState::Idle {
            *state = InteractionState::Idle;
            drop(state);
            self.emit_transition(from, InteractionState::Idle);
        }
        info!("interaction torn down");
    }

    async fn enter_processing(&self) -> ClientResult<()> {
        let mut state = self.state.write().await;
        if *state != InteractionState::Idle {
            return Err(ClientError::SessionBusy);
        }
        let from = *state;
        *state = InteractionState::Processing;
        drop(state);
        self.emit_transition(from, InteractionState::Processing);
        Ok(())
    }

    /// Drive a finalized utterance through the capability services.
    async fn process_utterance(&self, payload: UtterancePayload) -> ClientResult<CommandOutcome> {
        debug!(
            "processing utterance: {} samples, {:.2}s",
            payload.samples,
            payload.duration.as_secs_f64()
        );
        let reply = self
            .router
            .request(outbound::AUDIO_DATA, json!({ "data": payload.audio_b64 }))
            .await?;
        let reply = check_gateway_reply(reply)?;
        let text = reply
            .data
            .get("text")
            .and_then(Value::as_str)
            .ok_or(ClientError::MalformedReply("text"))?
            .to_string();
        info!("recognized: {}", text);
        let _ = self
            .events
            .send(InteractionEvent::Recognized { text: text.clone() });

        self.process_text(text).await
    }

    /// Dispatch the command and, when auto-playback is on, speak the reply.
    async fn process_text(&self, text: String) -> ClientResult<CommandOutcome> {
        let session = self.channel.session().await;
        let reply = self
            .router
            .request(
                outbound::PROCESS_COMMAND,
                json!({
                    "text": text,
                    "context": {},
                    "user_id": session.user_id,
                    "session_id": session.id,
                }),
            )
            .await?;
        let reply = check_gateway_reply(reply)?;
        let response = reply
            .data
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let _ = self.events.send(InteractionEvent::CommandResult {
            response: response.clone(),
        });

        let spoke = if self.config.auto_playback && !response.is_empty() {
            self.request_synthesis_and_play(&response).await?
        } else {
            false
        };

        Ok(CommandOutcome { response, spoke })
    }

    /// Ask the synthesis service for audio and play it. Enters `Speaking`
    /// only when audio actually arrives.
    async fn request_synthesis_and_play(&self, text: &str) -> ClientResult<bool> {
        let reply = self
            .router
            .request(
                outbound::SYNTHESIZE_REQUEST,
                json!({ "text": text, "voice": self.config.voice }),
            )
            .await?;
        let reply = check_gateway_reply(reply)?;
        let audio_b64 = match reply.data.get("audio_data").and_then(Value::as_str) {
            Some(data) if !data.is_empty() => data.to_string(),
            _ => return Ok(false),
        };
        let bytes = decode_base64_audio(&audio_b64)?;

        self.set_state(InteractionState::Speaking).await;
        self.playback.play(&bytes)?;
        let playback = Arc::clone(&self.playback);
        // Playback completion is a blocking wait on the audio device.
        tokio::task::spawn_blocking(move || playback.drain())
            .await
            .map_err(|e| ClientError::Voice(jarvis_voice::VoiceError::Playback(e.to_string())))?;
        Ok(true)
    }

    /// Land the machine after a processing run: `Idle` on success and on
    /// locally-surfaced errors, `Error` on unrecoverable channel failures.
    async fn settle<T>(&self, result: ClientResult<T>) -> ClientResult<T> {
        match &result {
            Ok(_) => self.set_state(InteractionState::Idle).await,
            Err(e) => {
                let message = e.to_string();
                warn!("processing failed: {}", message);
                let _ = self.events.send(InteractionEvent::ErrorSurfaced { message });
                if is_unrecoverable(e) {
                    self.set_state(InteractionState::Error).await;
                } else {
                    self.set_state(InteractionState::Idle).await;
                }
            }
        }
        result
    }

    async fn set_state(&self, to: InteractionState) {
        let mut state = self.state.write().await;
        let from = *state;
        if from == to {
            return;
        }
        *state = to;
        drop(state);
        self.emit_transition(from, to);
    }

    fn emit_transition(&self, from: InteractionState, to: InteractionState) {
        debug!("interaction state: {:?} -> {:?}", from, to);
        let _ = self.events.send(InteractionEvent::StateChanged { from, to });
    }
}

/// Channel-level failures require an explicit acknowledge before the session
/// accepts new work; everything else resolves locally back to `Idle`.
fn is_unrecoverable(error: &ClientError) -> bool {
    matches!(
        error,
        ClientError::Session(
            SessionError::ChannelUnavailable
                | SessionError::ReconnectExhausted(_)
                | SessionError::Transport(_)
        )
    )
}

/// A reply envelope may itself be the gateway `error` type.
fn check_gateway_reply(
    reply: jarvis_session::Envelope,
) -> ClientResult<jarvis_session::Envelope> {
    if reply.envelope_type == inbound::ERROR {
        let message = reply
            .error_message()
            .unwrap_or("unspecified gateway error")
            .to_string();
        return Err(ClientError::Gateway(message));
    }
    Ok(reply)
}
