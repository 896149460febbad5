//! End-to-end interaction flows against a scripted in-memory gateway.

use jarvis_client::{AssistantClient, ClientError, InteractionEvent, InteractionState};
use jarvis_session::{inbound, ConnectionState, Envelope, MemoryPeer, MemoryTransport, SessionConfig, SessionError};
use jarvis_voice::{encode_pcm16_base64, NullPlayback, PlaybackSink, ScriptedCapture, VoiceError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

fn test_config(timeout_secs: u64) -> SessionConfig {
    SessionConfig {
        user_id: "tester".into(),
        correlation_timeout_secs: timeout_secs,
        reconnect_base_ms: 1,
        reconnect_cap_ms: 5,
        ..SessionConfig::default()
    }
}

struct Harness {
    client: AssistantClient,
    playback: Arc<NullPlayback>,
    peer: Option<MemoryPeer>,
}

async fn start_client(config: SessionConfig, capture: ScriptedCapture) -> Harness {
    let (transport, mut peers) = MemoryTransport::new();
    let playback = Arc::new(NullPlayback::new());
    let client = AssistantClient::new(
        config,
        Arc::new(transport),
        Arc::new(capture),
        playback.clone() as Arc<dyn PlaybackSink>,
    );
    client.start().await.unwrap();
    let peer = peers.recv().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while client.connection_state().await != ConnectionState::Connected {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("never connected");
    Harness {
        client,
        playback,
        peer: Some(peer),
    }
}

/// Gateway double: answers recognition, command and synthesis requests with
/// correlated replies, the way the real services do.
fn scripted_gateway(mut peer: MemoryPeer) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        peer.send(&Envelope::new(
            inbound::CONNECTION_ESTABLISHED,
            json!({"session_id": "session_42"}),
        ))
        .unwrap();

        let mut seen = Vec::new();
        while let Some(request) = peer.recv().await {
            seen.push(request.envelope_type.clone());
            let reply = match request.envelope_type.as_str() {
                "audio_data" => Some(Envelope::new(
                    inbound::RECOGNITION_RESULT,
                    json!({"text": "Привет"}),
                )),
                "process_command" => {
                    assert_eq!(request.data["text"], "Привет");
                    assert_eq!(request.data["user_id"], "tester");
                    Some(Envelope::new(
                        inbound::COMMAND_RESULT,
                        json!({"response": "Привет! Чем могу помочь?"}),
                    ))
                }
                "synthesize_request" => Some(Envelope::new(
                    inbound::SYNTHESIS_RESULT,
                    json!({"audio_data": encode_pcm16_base64(&[0.1, -0.1, 0.2])}),
                )),
                "execute_task" => Some(Envelope::new(
                    inbound::TASK_RESULT,
                    json!({"status": "done", "task": request.data["type"]}),
                )),
                _ => None,
            };
            if let Some(mut reply) = reply {
                reply.id = request.id.clone();
                if peer.send(&reply).is_err() {
                    break;
                }
            }
        }
        seen
    })
}

#[tokio::test]
async fn voice_command_runs_the_full_chain() {
    let capture = ScriptedCapture::new(vec![vec![0.4; 1_600], vec![0.2; 1_600]]);
    let mut harness = start_client(test_config(5), capture).await;
    let gateway = scripted_gateway(harness.peer.take().unwrap());
    let interaction = harness.client.interaction().clone();
    let mut events = interaction.subscribe();

    interaction.start_recording().await.unwrap();
    assert_eq!(interaction.state().await, InteractionState::Recording);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let outcome = interaction.stop_and_process().await.unwrap();
    assert_eq!(outcome.response, "Привет! Чем могу помочь?");
    assert!(outcome.spoke);
    assert_eq!(interaction.state().await, InteractionState::Idle);
    assert_eq!(harness.playback.played_count(), 1);
    // Every pending entry resolved exactly once.
    assert_eq!(harness.client.router().pending_len(), 0);

    // The machine walked the full state sequence, in order.
    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let InteractionEvent::StateChanged { to, .. } = event {
            transitions.push(to);
        }
    }
    assert_eq!(
        transitions,
        vec![
            InteractionState::Recording,
            InteractionState::Processing,
            InteractionState::Speaking,
            InteractionState::Idle,
        ]
    );

    harness.client.teardown().await;
    let seen = gateway.await.unwrap();
    assert_eq!(seen, vec!["audio_data", "process_command", "synthesize_request"]);
}

#[tokio::test]
async fn typed_command_without_auto_playback_stays_silent() {
    let config = SessionConfig {
        auto_playback: false,
        ..test_config(5)
    };
    let mut harness = start_client(config, ScriptedCapture::new(vec![])).await;
    let gateway = scripted_gateway(harness.peer.take().unwrap());
    let interaction = harness.client.interaction();

    let outcome = interaction.send_text("Привет").await.unwrap();
    assert_eq!(outcome.response, "Привет! Чем могу помочь?");
    assert!(!outcome.spoke);
    assert_eq!(harness.playback.played_count(), 0);

    harness.client.teardown().await;
    let seen = gateway.await.unwrap();
    // No synthesis request was ever dispatched.
    assert_eq!(seen, vec!["process_command"]);
}

#[tokio::test]
async fn task_execution_returns_the_result_payload() {
    let mut harness = start_client(test_config(5), ScriptedCapture::new(vec![])).await;
    let gateway = scripted_gateway(harness.peer.take().unwrap());
    let interaction = harness.client.interaction();

    let data = interaction
        .execute_task("open_app", json!({"name": "browser"}))
        .await
        .unwrap();
    assert_eq!(data["status"], "done");
    assert_eq!(data["task"], "open_app");
    assert_eq!(interaction.state().await, InteractionState::Idle);

    harness.client.teardown().await;
    let seen = gateway.await.unwrap();
    assert_eq!(seen, vec!["execute_task"]);
}

#[tokio::test]
async fn unavailable_microphone_leaves_the_machine_idle() {
    let mut harness = start_client(test_config(5), ScriptedCapture::unavailable()).await;
    let _peer = harness.peer.take().unwrap();
    let interaction = harness.client.interaction();

    let result = interaction.start_recording().await;
    assert!(matches!(
        result,
        Err(ClientError::Voice(VoiceError::DeviceUnavailable(_)))
    ));
    assert_eq!(interaction.state().await, InteractionState::Idle);

    harness.client.teardown().await;
}

#[tokio::test]
async fn synthesis_while_recording_is_rejected_before_the_channel() {
    let capture = ScriptedCapture::new(vec![vec![0.1; 1_600]]);
    let mut harness = start_client(test_config(5), capture).await;
    let mut peer = harness.peer.take().unwrap();
    let interaction = harness.client.interaction();

    interaction.start_recording().await.unwrap();
    let result = interaction.synthesize("занято").await;
    assert!(matches!(result, Err(ClientError::SessionBusy)));
    assert_eq!(interaction.state().await, InteractionState::Recording);

    // Nothing reached the gateway.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let quiet = tokio::time::timeout(Duration::from_millis(50), peer.recv()).await;
    assert!(quiet.is_err());

    harness.client.teardown().await;
}

#[tokio::test]
async fn correlation_timeout_surfaces_and_returns_to_idle() {
    let config = SessionConfig {
        correlation_timeout_secs: 1,
        ..test_config(1)
    };
    let mut harness = start_client(config, ScriptedCapture::new(vec![])).await;
    // Gateway stays silent: requests are received but never answered.
    let mut peer = harness.peer.take().unwrap();
    let silent = tokio::spawn(async move { while peer.recv().await.is_some() {} });

    let interaction = harness.client.interaction().clone();
    let mut events = interaction.subscribe();

    let result = interaction.send_text("есть кто?").await;
    assert!(matches!(
        result,
        Err(ClientError::Session(SessionError::CorrelationTimeout(_, _)))
    ));
    // Timeout is a recoverable failure: surfaced, then back to Idle.
    assert_eq!(interaction.state().await, InteractionState::Idle);
    assert_eq!(harness.client.router().pending_len(), 0);

    let mut surfaced = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, InteractionEvent::ErrorSurfaced { .. }) {
            surfaced = true;
        }
    }
    assert!(surfaced);

    harness.client.teardown().await;
    silent.abort();
}

#[tokio::test]
async fn gateway_error_envelope_becomes_a_client_error() {
    let mut harness = start_client(test_config(5), ScriptedCapture::new(vec![])).await;
    let mut peer = harness.peer.take().unwrap();
    let gateway = tokio::spawn(async move {
        while let Some(request) = peer.recv().await {
            let mut reply = Envelope::new(
                inbound::ERROR,
                json!({"message": "language service offline"}),
            );
            reply.id = request.id.clone();
            if peer.send(&reply).is_err() {
                break;
            }
        }
    });

    let interaction = harness.client.interaction();
    let result = interaction.send_text("Привет").await;
    match result {
        Err(ClientError::Gateway(message)) => {
            assert_eq!(message, "language service offline")
        }
        other => panic!("expected gateway error, got {:?}", other.map(|o| o.response)),
    }
    assert_eq!(interaction.state().await, InteractionState::Idle);

    harness.client.teardown().await;
    gateway.abort();
}

#[tokio::test]
async fn max_duration_recording_is_force_processed() {
    let config = SessionConfig {
        max_utterance_secs: 1,
        ..test_config(5)
    };
    let capture = ScriptedCapture::new(vec![vec![0.2; 1_600]]).on_repeat(Duration::from_millis(1));
    let mut harness = start_client(config, capture).await;
    let gateway = scripted_gateway(harness.peer.take().unwrap());
    let interaction = harness.client.interaction().clone();

    interaction.start_recording().await.unwrap();

    // The bound fires without a user stop; the chain runs to completion.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if interaction.state().await == InteractionState::Idle
                && harness.playback.played_count() > 0
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bounded recording never processed");

    harness.client.teardown().await;
    let seen = gateway.await.unwrap();
    assert_eq!(seen, vec!["audio_data", "process_command", "synthesize_request"]);
}

#[tokio::test]
async fn teardown_releases_everything() {
    let capture = ScriptedCapture::new(vec![vec![0.3; 1_600]]).on_repeat(Duration::from_millis(5));
    let mut harness = start_client(test_config(5), capture).await;
    let _peer = harness.peer.take().unwrap();
    let interaction = harness.client.interaction();

    interaction.start_recording().await.unwrap();
    harness.client.teardown().await;

    assert_eq!(interaction.state().await, InteractionState::Idle);
    assert_eq!(harness.client.connection_state().await, ConnectionState::Disconnected);
    assert_eq!(harness.client.router().pending_len(), 0);
}
