//! Jarvis Console
//!
//! A line-oriented front end for the assistant client: type a command to
//! send it to the gateway, or drive the microphone with `:rec` / `:stop`.
//! Connection and interaction events are printed as they happen.

use jarvis_client::{AssistantClient, InteractionEvent};
use jarvis_session::{ConnectionEvent, SessionConfig};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[jarvis-console] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SessionConfig::from_env();
    tracing::info!(gateway = %config.gateway_url, user = %config.user_id, "Jarvis console starting");

    let client = match AssistantClient::with_defaults(config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("[jarvis-console] audio setup failed: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = client.start().await {
        eprintln!("[jarvis-console] could not start: {}", e);
        std::process::exit(1);
    }

    spawn_event_printers(&client);

    println!("commands: :rec  :stop  :say <text>  :task <type>  :ping  :ack  :quit  (anything else is sent as a command)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(l)) => l,
                    _ => break,
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if !handle_line(&client, line).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down console");
                break;
            }
        }
    }

    client.teardown().await;
}

/// Returns false when the console should exit.
async fn handle_line(client: &Arc<AssistantClient>, line: &str) -> bool {
    let interaction = client.interaction();
    match line {
        ":quit" | ":q" => return false,
        ":rec" => {
            if let Err(e) = interaction.start_recording().await {
                println!("! {}", e);
            } else {
                println!("recording… :stop to finish");
            }
        }
        ":stop" => match interaction.stop_and_process().await {
            Ok(outcome) => println!("< {}", outcome.response),
            Err(e) => println!("! {}", e),
        },
        ":ping" => {
            if let Err(e) = client.ping().await {
                println!("! {}", e);
            }
        }
        ":ack" => interaction.acknowledge_error().await,
        _ => {
            let result = if let Some(text) = line.strip_prefix(":say ") {
                interaction.synthesize(text).await.map(|_| String::new())
            } else if let Some(task) = line.strip_prefix(":task ") {
                interaction
                    .execute_task(task.trim(), serde_json::json!({}))
                    .await
                    .map(|data| data.to_string())
            } else {
                interaction.send_text(line).await.map(|o| o.response)
            };
            match result {
                Ok(response) if !response.is_empty() => println!("< {}", response),
                Ok(_) => {}
                Err(e) => println!("! {}", e),
            }
        }
    }
    true
}

fn spawn_event_printers(client: &Arc<AssistantClient>) {
    let mut connection = client.channel().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = connection.recv().await {
            match event {
                ConnectionEvent::StateChanged { from, to } => {
                    tracing::info!("connection: {:?} -> {:?}", from, to)
                }
                ConnectionEvent::SessionEstablished { session_id } => {
                    tracing::info!("session established: {}", session_id)
                }
                ConnectionEvent::ReconnectExhausted { attempts } => {
                    println!("! connection lost after {} attempts, use :ping after fixing the gateway", attempts)
                }
            }
        }
    });

    let mut events = client.interaction().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                InteractionEvent::Recognized { text } => println!("> {}", text),
                InteractionEvent::ErrorSurfaced { message } => println!("! {}", message),
                InteractionEvent::StateChanged { .. } | InteractionEvent::CommandResult { .. } => {}
            }
        }
    });
}
