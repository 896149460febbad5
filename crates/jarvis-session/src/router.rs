//! **Message Router** — correlates requests with replies and fans out
//! broadcast envelopes.
//!
//! Every dispatched request that expects a reply gets a pending entry keyed
//! by its correlation id. Exactly one resolution is guaranteed per entry:
//! the matching response, a timeout error, or cancellation on teardown.
//! Replies with an already-resolved id are ignored (idempotent delivery).

use crate::channel::ChannelManager;
use crate::error::{SessionError, SessionResult};
use crate::protocol::{expects_reply, Envelope};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct PendingEntry {
    reply_tx: oneshot::Sender<SessionResult<Envelope>>,
    deadline: Instant,
}

/// Routes envelopes between the channel and waiting consumers/subscribers.
pub struct MessageRouter {
    channel: Arc<ChannelManager>,
    reply_timeout: Duration,
    pending: Arc<DashMap<String, PendingEntry>>,
    subscribers: Arc<DashMap<String, mpsc::UnboundedSender<Envelope>>>,
    catch_all: Arc<Mutex<Option<mpsc::UnboundedSender<Envelope>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageRouter {
    pub fn new(channel: Arc<ChannelManager>, reply_timeout: Duration) -> Self {
        Self {
            channel,
            reply_timeout,
            pending: Arc::new(DashMap::new()),
            subscribers: Arc::new(DashMap::new()),
            catch_all: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the inbound pump and the pending-entry sweeper. Call once after
    /// construction; `inbound` comes from `ChannelManager::take_inbound()`.
    pub async fn start(&self, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        let pending = Arc::clone(&self.pending);
        let subscribers = Arc::clone(&self.subscribers);
        let catch_all = Arc::clone(&self.catch_all);
        let pump = tokio::spawn(async move {
            // Envelopes arrive in transport order; this single task keeps it.
            while let Some(envelope) = inbound.recv().await {
                deliver(&pending, &subscribers, &catch_all, envelope).await;
            }
        });

        let pending = Arc::clone(&self.pending);
        let reply_timeout = self.reply_timeout;
        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(250));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let now = Instant::now();
                let expired: Vec<String> = pending
                    .iter()
                    .filter(|entry| entry.value().deadline <= now)
                    .map(|entry| entry.key().clone())
                    .collect();
                for id in expired {
                    if let Some((id, entry)) = pending.remove(&id) {
                        warn!("correlation timeout for {}", id);
                        let _ = entry
                            .reply_tx
                            .send(Err(SessionError::CorrelationTimeout(reply_timeout, id)));
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(pump);
        tasks.push(sweeper);
    }

    /// Frame an outbound request and forward it to the channel manager.
    /// Returns the correlation id. If the type expects a reply, a pending
    /// entry is recorded; pair with [`MessageRouter::await_reply`].
    pub async fn dispatch(
        &self,
        envelope_type: &str,
        data: Value,
    ) -> SessionResult<(String, Option<oneshot::Receiver<SessionResult<Envelope>>>)> {
        let envelope = Envelope::new(envelope_type, data);
        let id = envelope.id.clone();

        let reply_rx = if expects_reply(envelope_type) {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.pending.insert(
                id.clone(),
                PendingEntry {
                    reply_tx,
                    deadline: Instant::now() + self.reply_timeout,
                },
            );
            Some(reply_rx)
        } else {
            None
        };

        if let Err(e) = self.channel.send(&envelope).await {
            // Never leave an orphaned entry behind a failed send.
            self.pending.remove(&id);
            return Err(e);
        }
        debug!("dispatched {} ({})", envelope_type, id);
        Ok((id, reply_rx))
    }

    /// Dispatch a request and suspend until its single resolution arrives.
    pub async fn request(&self, envelope_type: &str, data: Value) -> SessionResult<Envelope> {
        let (id, reply_rx) = self.dispatch(envelope_type, data).await?;
        match reply_rx {
            Some(rx) => Self::await_reply(rx).await,
            None => Err(SessionError::Config(format!(
                "{} ({}) does not expect a reply",
                envelope_type, id
            ))),
        }
    }

    /// Await the resolution of a previously dispatched request.
    pub async fn await_reply(
        reply_rx: oneshot::Receiver<SessionResult<Envelope>>,
    ) -> SessionResult<Envelope> {
        match reply_rx.await {
            Ok(result) => result,
            // Sender dropped without resolving: only happens on teardown.
            Err(_) => Err(SessionError::Cancelled),
        }
    }

    /// Register a topic subscriber for broadcast envelopes of one type.
    /// Replaces any previous subscriber for that type.
    pub fn subscribe_topic(&self, envelope_type: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(envelope_type.to_string(), tx);
        rx
    }

    /// Register the catch-all subscriber receiving unmatched/unknown types
    /// for diagnostic visibility.
    pub async fn subscribe_catch_all(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.catch_all.lock().await = Some(tx);
        rx
    }

    /// Number of unresolved pending entries (bounded by the sweeper).
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Teardown: stop the pump and sweeper, reject every pending entry with
    /// a cancellation error. Every in-flight request still resolves exactly
    /// once.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry.reply_tx.send(Err(SessionError::Cancelled));
            }
        }
    }
}

async fn deliver(
    pending: &DashMap<String, PendingEntry>,
    subscribers: &DashMap<String, mpsc::UnboundedSender<Envelope>>,
    catch_all: &Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    mut envelope: Envelope,
) {
    // Correlated reply takes priority; a second envelope with the same id
    // finds no entry and falls through to topic routing.
    if let Some((id, entry)) = pending.remove(&envelope.id) {
        debug!("resolved {} with {}", id, envelope.envelope_type);
        let _ = entry.reply_tx.send(Ok(envelope));
        return;
    }

    if let Some(tx) = subscribers.get(&envelope.envelope_type) {
        match tx.send(envelope) {
            Ok(()) => return,
            // Subscriber went away; recover the envelope for the catch-all.
            Err(e) => envelope = e.0,
        }
    }

    let guard = catch_all.lock().await;
    match guard.as_ref() {
        Some(tx) => {
            let _ = tx.send(envelope);
        }
        None => debug!(
            "no route for envelope type {} ({})",
            envelope.envelope_type, envelope.id
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ConnectionState;
    use crate::config::SessionConfig;
    use crate::protocol::{inbound, outbound};
    use crate::transport::{MemoryPeer, MemoryTransport};
    use serde_json::json;

    async fn connected_stack(
        reply_timeout: Duration,
    ) -> (Arc<ChannelManager>, Arc<MessageRouter>, MemoryPeer) {
        let (transport, mut peers) = MemoryTransport::new();
        let config = SessionConfig {
            reconnect_base_ms: 1,
            reconnect_cap_ms: 5,
            ..SessionConfig::default()
        };
        let channel = Arc::new(ChannelManager::new(config, Arc::new(transport)));
        channel.connect().await.unwrap();
        let peer = peers.recv().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while channel.state().await != ConnectionState::Connected {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        let router = Arc::new(MessageRouter::new(Arc::clone(&channel), reply_timeout));
        let inbound_rx = channel.take_inbound().await.unwrap();
        router.start(inbound_rx).await;
        (channel, router, peer)
    }

    #[tokio::test]
    async fn request_resolves_with_matching_reply() {
        let (channel, router, mut peer) = connected_stack(Duration::from_secs(5)).await;

        let echo = tokio::spawn(async move {
            let seen = peer.recv().await.unwrap();
            assert_eq!(seen.envelope_type, "process_command");
            let mut reply = Envelope::new(inbound::COMMAND_RESULT, json!({"response": "готово"}));
            reply.id = seen.id.clone();
            peer.send(&reply).unwrap();
            peer
        });

        let reply = router
            .request(outbound::PROCESS_COMMAND, json!({"text": "Привет"}))
            .await
            .unwrap();
        assert_eq!(reply.envelope_type, "command_result");
        assert_eq!(reply.data["response"], "готово");
        assert_eq!(router.pending_len(), 0);

        let _peer = echo.await.unwrap();
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn duplicate_reply_is_ignored() {
        let (channel, router, mut peer) = connected_stack(Duration::from_secs(5)).await;
        let mut catch_all = router.subscribe_catch_all().await;

        let (id, reply_rx) = router
            .dispatch(outbound::EXECUTE_TASK, json!({"type": "open_app"}))
            .await
            .unwrap();
        let _sent = peer.recv().await.unwrap();

        let mut reply = Envelope::new(inbound::TASK_RESULT, json!({"status": "done"}));
        reply.id = id.clone();
        peer.send(&reply).unwrap();
        peer.send(&reply).unwrap();

        let first = MessageRouter::await_reply(reply_rx.unwrap()).await.unwrap();
        assert_eq!(first.data["status"], "done");

        // The second copy had no pending entry left; it fell through to
        // topic routing and then the catch-all.
        let dup = tokio::time::timeout(Duration::from_secs(1), catch_all.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dup.id, id);
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn stale_entries_time_out_and_are_removed() {
        let (channel, router, mut peer) = connected_stack(Duration::from_millis(100)).await;

        let (_id, reply_rx) = router
            .dispatch(outbound::SYNTHESIZE_REQUEST, json!({"text": "hi", "voice": "default"}))
            .await
            .unwrap();
        let _sent = peer.recv().await.unwrap();
        assert_eq!(router.pending_len(), 1);

        let result = MessageRouter::await_reply(reply_rx.unwrap()).await;
        assert!(matches!(result, Err(SessionError::CorrelationTimeout(_, _))));
        assert_eq!(router.pending_len(), 0);
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn topic_subscriber_receives_broadcasts() {
        let (channel, router, peer) = connected_stack(Duration::from_secs(5)).await;
        let mut pongs = router.subscribe_topic(inbound::PONG);

        peer.send(&Envelope::new(inbound::PONG, json!({}))).unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(1), pongs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.envelope_type, "pong");
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn unknown_types_reach_the_catch_all() {
        let (channel, router, peer) = connected_stack(Duration::from_secs(5)).await;
        let mut catch_all = router.subscribe_catch_all().await;

        peer.send(&Envelope::new("mystery_broadcast", json!({"k": 1})))
            .unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(1), catch_all.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.envelope_type, "mystery_broadcast");
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn dropped_subscriber_falls_through_to_catch_all() {
        let (channel, router, peer) = connected_stack(Duration::from_secs(5)).await;
        let pongs = router.subscribe_topic(inbound::PONG);
        drop(pongs);
        let mut catch_all = router.subscribe_catch_all().await;

        peer.send(&Envelope::new(inbound::PONG, json!({"seq": 3})))
            .unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(1), catch_all.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.envelope_type, "pong");
        // The payload survives the failed topic send intact.
        assert_eq!(seen.data["seq"], 3);
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn gateway_shaped_frames_are_not_dropped() {
        let (channel, router, peer) = connected_stack(Duration::from_secs(5)).await;
        let mut catch_all = router.subscribe_catch_all().await;

        // The gateway's own pong shape: no id, no data object.
        peer.send_raw(r#"{"type": "pong", "timestamp": 12345.0}"#);
        let seen = tokio::time::timeout(Duration::from_secs(1), catch_all.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.envelope_type, "pong");
        assert!(seen.id.is_empty());
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn teardown_rejects_pending_with_cancellation() {
        let (channel, router, mut peer) = connected_stack(Duration::from_secs(30)).await;

        let (_id, reply_rx) = router
            .dispatch(outbound::PROCESS_COMMAND, json!({"text": "slow"}))
            .await
            .unwrap();
        let _sent = peer.recv().await.unwrap();

        router.shutdown().await;
        let result = MessageRouter::await_reply(reply_rx.unwrap()).await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert_eq!(router.pending_len(), 0);
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn dispatch_without_channel_leaves_no_pending_entry() {
        let (transport, _peers) = MemoryTransport::new();
        let channel = Arc::new(ChannelManager::new(
            SessionConfig::default(),
            Arc::new(transport),
        ));
        let router = MessageRouter::new(Arc::clone(&channel), Duration::from_secs(5));

        let result = router
            .dispatch(outbound::PROCESS_COMMAND, json!({"text": "hi"}))
            .await;
        assert!(matches!(result, Err(SessionError::ChannelUnavailable)));
        assert_eq!(router.pending_len(), 0);
    }

    #[tokio::test]
    async fn ping_does_not_record_a_pending_entry() {
        let (channel, router, mut peer) = connected_stack(Duration::from_secs(5)).await;
        let (_id, reply_rx) = router.dispatch(outbound::PING, json!({})).await.unwrap();
        assert!(reply_rx.is_none());
        assert_eq!(router.pending_len(), 0);
        let seen = peer.recv().await.unwrap();
        assert_eq!(seen.envelope_type, "ping");
        channel.disconnect().await;
    }
}
