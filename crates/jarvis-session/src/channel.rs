//! **Channel Manager** — owns the gateway connection and its state machine.
//!
//! Exactly one `ConnectionState` at any time, written only here; everyone
//! else subscribes. Reconnection uses capped exponential backoff with a hard
//! attempt bound; exhausting the bound parks the channel in `Failed` until an
//! explicit `connect()` resets the counter.

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::protocol::{inbound, Envelope, Session};
use crate::transport::{Transport, TransportConn};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection lifecycle: Disconnected → Connecting → Connected, with
/// Reconnecting on transport drops and Failed after the attempt bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Events emitted by the channel manager on its broadcast bus.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Emitted on every ConnectionState transition.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// The gateway acknowledged the connection and assigned a session id.
    SessionEstablished { session_id: String },
    /// Terminal: the backoff bound was hit. Not retried automatically.
    ReconnectExhausted { attempts: u32 },
}

struct ChannelInner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    state: RwLock<ConnectionState>,
    session: RwLock<Session>,
    events: broadcast::Sender<ConnectionEvent>,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    /// Present only while a connection is live; cleared on drop/shutdown.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    shutdown: watch::Sender<bool>,
}

impl ChannelInner {
    async fn set_state(&self, to: ConnectionState) {
        let mut guard = self.state.write().await;
        let from = *guard;
        if from == to {
            return;
        }
        *guard = to;
        drop(guard);
        debug!("connection state: {:?} -> {:?}", from, to);
        let _ = self.events.send(ConnectionEvent::StateChanged { from, to });
    }

    /// The real gateway greeting carries `session_id` at the top level of
    /// the frame; older shapes put it inside `data`.
    fn capture_session_id(envelope: &Envelope) -> Option<String> {
        envelope.session_id.clone().or_else(|| {
            envelope
                .data
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
    }
}

/// Owns the transport connection, the connection state machine, and the
/// reconnection policy. Cheap to clone via `Arc` by the caller.
pub struct ChannelManager {
    inner: Arc<ChannelInner>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelManager {
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let session = Session::new(config.user_id.clone());
        Self {
            inner: Arc::new(ChannelInner {
                config,
                transport,
                state: RwLock::new(ConnectionState::Disconnected),
                session: RwLock::new(session),
                events,
                inbound_tx,
                outbound: Mutex::new(None),
                shutdown,
            }),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            run_task: Mutex::new(None),
        }
    }

    /// Establish the transport. Idempotent while already connecting or
    /// connected; from `Failed` this resets the attempt counter and retries.
    pub async fn connect(&self) -> SessionResult<()> {
        // The run_task lock serializes concurrent connect() calls so the
        // state check and the spawn are one atomic step.
        let mut run_task = self.run_task.lock().await;
        {
            let state = self.inner.state.read().await;
            if matches!(
                *state,
                ConnectionState::Connecting
                    | ConnectionState::Connected
                    | ConnectionState::Reconnecting
            ) {
                debug!("connect() ignored: already {:?}", *state);
                return Ok(());
            }
        }

        // Reap a finished run task from a previous Failed/Disconnected cycle.
        if let Some(handle) = run_task.take() {
            handle.abort();
        }

        let _ = self.inner.shutdown.send(false);
        self.inner.set_state(ConnectionState::Connecting).await;
        info!("connecting to {}", self.inner.config.gateway_url);

        let inner = Arc::clone(&self.inner);
        *run_task = Some(tokio::spawn(run(inner)));
        Ok(())
    }

    /// Tear down the transport and cancel any pending reconnection timer.
    pub async fn disconnect(&self) {
        let _ = self.inner.shutdown.send(true);
        if let Some(handle) = self.run_task.lock().await.take() {
            let _ = handle.await;
        }
        self.inner.set_state(ConnectionState::Disconnected).await;
        info!("channel disconnected");
    }

    /// Send one envelope. Fails with `ChannelUnavailable` unless connected;
    /// once the channel has gone terminal the error is `ReconnectExhausted`
    /// until an explicit `connect()`.
    pub async fn send(&self, envelope: &Envelope) -> SessionResult<()> {
        match *self.inner.state.read().await {
            ConnectionState::Connected => {}
            ConnectionState::Failed => {
                return Err(SessionError::ReconnectExhausted(
                    self.inner.config.reconnect_max_attempts,
                ))
            }
            _ => return Err(SessionError::ChannelUnavailable),
        }
        let text = envelope.to_json()?;
        let guard = self.inner.outbound.lock().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(text)
                .map_err(|_| SessionError::ChannelUnavailable),
            None => Err(SessionError::ChannelUnavailable),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    /// Current session identity. Survives transient disconnects.
    pub async fn session(&self) -> Session {
        self.inner.session.read().await.clone()
    }

    /// Subscribe to connection events (state changes, terminal failures).
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Take the inbound envelope stream. Envelopes arrive in transport order.
    /// Can only be taken once.
    pub async fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        self.inbound_rx.lock().await.take()
    }
}

enum PumpEnd {
    Shutdown,
    Dropped,
}

/// Connection loop: connect, pump frames until drop or shutdown, back off and
/// retry on failure. The attempt counter resets to zero only on a successful
/// connect.
async fn run(inner: Arc<ChannelInner>) {
    let mut shutdown_rx = inner.shutdown.subscribe();
    let mut attempts: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            inner.set_state(ConnectionState::Disconnected).await;
            return;
        }

        match inner.transport.connect(&inner.config.gateway_url).await {
            Ok(conn) => {
                attempts = 0;
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                *inner.outbound.lock().await = Some(out_tx);
                inner.set_state(ConnectionState::Connected).await;
                info!("gateway connected");

                let end = pump(&inner, conn, out_rx, &mut shutdown_rx).await;
                *inner.outbound.lock().await = None;

                match end {
                    PumpEnd::Shutdown => {
                        inner.set_state(ConnectionState::Disconnected).await;
                        return;
                    }
                    PumpEnd::Dropped => {
                        warn!("transport dropped, reconnecting");
                        inner.set_state(ConnectionState::Reconnecting).await;
                    }
                }
            }
            Err(e) => {
                attempts += 1;
                warn!(
                    "connect attempt {}/{} failed: {}",
                    attempts, inner.config.reconnect_max_attempts, e
                );
                if attempts >= inner.config.reconnect_max_attempts {
                    inner.set_state(ConnectionState::Failed).await;
                    let _ = inner
                        .events
                        .send(ConnectionEvent::ReconnectExhausted { attempts });
                    warn!("reconnect attempts exhausted; waiting for explicit connect()");
                    return;
                }
                inner.set_state(ConnectionState::Reconnecting).await;
                let delay = inner.config.reconnect_delay(attempts);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    // The watch guard is not Send; it must drop before the
                    // arm body awaits.
                    _ = async { let _ = shutdown_rx.wait_for(|s| *s).await; } => {
                        inner.set_state(ConnectionState::Disconnected).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Pump one live connection: forward queued outbound frames, parse inbound
/// frames into envelopes, watch for shutdown.
async fn pump(
    inner: &Arc<ChannelInner>,
    mut conn: Box<dyn TransportConn>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> PumpEnd {
    loop {
        tokio::select! {
            // As in `run`: the watch guard must drop before the close await.
            _ = async { let _ = shutdown_rx.wait_for(|s| *s).await; } => {
                conn.close().await;
                return PumpEnd::Shutdown;
            }
            out = out_rx.recv() => {
                let text = match out {
                    Some(t) => t,
                    None => {
                        conn.close().await;
                        return PumpEnd::Shutdown;
                    }
                };
                if let Err(e) = conn.send(text).await {
                    warn!("send failed: {}", e);
                    return PumpEnd::Dropped;
                }
            }
            frame = conn.recv() => {
                match frame {
                    Some(Ok(text)) => {
                        let envelope = match Envelope::from_json(&text) {
                            Ok(env) => env,
                            Err(e) => {
                                warn!("unparseable frame dropped: {}", e);
                                continue;
                            }
                        };
                        if envelope.envelope_type == inbound::CONNECTION_ESTABLISHED {
                            if let Some(id) = ChannelInner::capture_session_id(&envelope) {
                                inner.session.write().await.id = id.clone();
                                info!("session established: {}", id);
                                let _ = inner
                                    .events
                                    .send(ConnectionEvent::SessionEstablished { session_id: id });
                            }
                        }
                        let _ = inner.inbound_tx.send(envelope);
                    }
                    Some(Err(e)) => {
                        warn!("transport error: {}", e);
                        return PumpEnd::Dropped;
                    }
                    None => return PumpEnd::Dropped,
                }
            }
        }
    }
}
