//! Assembled assistant client: channel, router, voice pipeline and the
//! interaction state machine wired together behind one handle.

use crate::error::ClientResult;
use crate::interaction::Interaction;
use jarvis_session::{
    outbound, ChannelManager, ConnectionState, MessageRouter, SessionConfig, Transport,
};
use jarvis_voice::{CaptureConfig, CaptureDevice, CapturePipeline, PlaybackSink};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Top-level handle for one assistant session.
///
/// Construction wires the layers but opens nothing; `start()` establishes
/// the gateway channel and begins routing. All voice and command operations
/// live on [`AssistantClient::interaction`].
pub struct AssistantClient {
    channel: Arc<ChannelManager>,
    router: Arc<MessageRouter>,
    interaction: Arc<Interaction>,
}

impl AssistantClient {
    /// Wire a client from explicit seams. Tests inject in-memory transports
    /// and scripted devices here; production callers use
    /// [`AssistantClient::with_defaults`].
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        capture: Arc<dyn CaptureDevice>,
        playback: Arc<dyn PlaybackSink>,
    ) -> Self {
        let channel = Arc::new(ChannelManager::new(config.clone(), transport));
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&channel),
            Duration::from_secs(config.correlation_timeout_secs),
        ));
        let pipeline = CapturePipeline::new(
            CaptureConfig::default(),
            capture,
            Duration::from_secs(config.max_utterance_secs),
        );
        let interaction = Arc::new(Interaction::new(
            config,
            Arc::clone(&channel),
            Arc::clone(&router),
            pipeline,
            playback,
        ));
        Self {
            channel,
            router,
            interaction,
        }
    }

    /// Production wiring: websocket transport, cpal microphone, rodio
    /// speaker.
    pub fn with_defaults(config: SessionConfig) -> ClientResult<Self> {
        let transport = Arc::new(jarvis_session::WsTransport::default());
        let capture = Arc::new(jarvis_voice::CpalCapture::default());
        let playback = Arc::new(jarvis_voice::RodioPlayback::new()?);
        Ok(Self::new(config, transport, capture, playback))
    }

    /// Open the gateway channel and start the router. Returns immediately;
    /// connection progress is observable via [`AssistantClient::channel`]
    /// events.
    pub async fn start(&self) -> ClientResult<()> {
        self.channel.connect().await?;
        if let Some(inbound) = self.channel.take_inbound().await {
            self.router.start(inbound).await;
        }

        // A recording that hits the max-duration bound is force-finalized
        // and processed as if the user had stopped it.
        let interaction = Arc::clone(&self.interaction);
        let mut limit = interaction.subscribe_capture_limit().await;
        tokio::spawn(async move {
            use tokio::sync::broadcast::error::RecvError;
            loop {
                match limit.recv().await {
                    Ok(()) => {
                        if interaction.state().await == crate::InteractionState::Recording {
                            if let Err(e) = interaction.stop_and_process().await {
                                tracing::warn!("forced stop failed: {}", e);
                            }
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        info!("assistant client started");
        Ok(())
    }

    /// Fire-and-forget liveness probe.
    pub async fn ping(&self) -> ClientResult<()> {
        self.router.dispatch(outbound::PING, json!({})).await?;
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.channel.state().await
    }

    pub fn channel(&self) -> &Arc<ChannelManager> {
        &self.channel
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn interaction(&self) -> &Arc<Interaction> {
        &self.interaction
    }

    /// Orderly shutdown: cancel in-flight requests, release devices, close
    /// the channel.
    pub async fn teardown(&self) {
        self.interaction.teardown().await;
        self.router.shutdown().await;
        self.channel.disconnect().await;
        info!("assistant client torn down");
    }
}
