//! Transport seam for the gateway channel.
//!
//! The channel manager talks to the wire through the `Transport` trait so the
//! whole session layer can run against an in-memory gateway in tests. The
//! production implementation is a tokio-tungstenite websocket.

use crate::error::{SessionError, SessionResult};
use crate::protocol::Envelope;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Factory for one bidirectional connection to the gateway endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> SessionResult<Box<dyn TransportConn>>;
}

/// One live connection: ordered text frames in both directions.
#[async_trait]
pub trait TransportConn: Send {
    async fn send(&mut self, text: String) -> SessionResult<()>;

    /// Next inbound frame. `None` means the peer closed the connection.
    async fn recv(&mut self) -> Option<SessionResult<String>>;

    async fn close(&mut self);
}

/// Production websocket transport (tokio-tungstenite).
#[derive(Debug, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> SessionResult<Box<dyn TransportConn>> {
        let (stream, _) = connect_async(url).await?;
        debug!("websocket connected: {}", url);
        Ok(Box::new(WsConn { stream }))
    }
}

struct WsConn {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl TransportConn for WsConn {
    async fn send(&mut self, text: String) -> SessionResult<()> {
        self.stream
            .send(tungstenite::Message::Text(text.into()))
            .await
            .map_err(SessionError::from)
    }

    async fn recv(&mut self) -> Option<SessionResult<String>> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(tungstenite::Message::Close(frame)) => {
                    if let Some(frame) = frame {
                        warn!("websocket closed: {} {}", frame.code, frame.reason);
                    }
                    return None;
                }
                // Binary / ping / pong frames are not part of the envelope protocol.
                Ok(_) => continue,
                Err(e) => return Some(Err(SessionError::from(e))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// In-memory transport: every accepted connect yields a [`MemoryPeer`] on the
/// test side, and connect failures can be scripted to exercise the
/// reconnection policy.
pub struct MemoryTransport {
    fail_next: Arc<AtomicU32>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryTransport {
    /// Create the transport plus the receiver of gateway-side peers.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        (
            Self {
                fail_next: Arc::new(AtomicU32::new(0)),
                peers,
            },
            peer_rx,
        )
    }

    /// Script the next `n` connect attempts to fail with a transport error.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, _url: &str) -> SessionResult<Box<dyn TransportConn>> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(SessionError::Transport("scripted connect failure".into()));
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        self.peers
            .send(MemoryPeer {
                inbound: client_rx,
                outbound: server_tx,
            })
            .map_err(|_| SessionError::Transport("memory gateway is gone".into()))?;
        Ok(Box::new(MemoryConn {
            tx: client_tx,
            rx: server_rx,
        }))
    }
}

struct MemoryConn {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl TransportConn for MemoryConn {
    async fn send(&mut self, text: String) -> SessionResult<()> {
        self.tx
            .send(text)
            .map_err(|_| SessionError::Transport("memory connection closed".into()))
    }

    async fn recv(&mut self) -> Option<SessionResult<String>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

/// Gateway side of one in-memory connection. Dropping it simulates a
/// transport drop as seen by the client.
pub struct MemoryPeer {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

impl MemoryPeer {
    /// Next envelope the client sent over this connection.
    pub async fn recv(&mut self) -> Option<Envelope> {
        let text = self.inbound.recv().await?;
        Envelope::from_json(&text).ok()
    }

    /// Inject an envelope as if the gateway had sent it.
    pub fn send(&self, envelope: &Envelope) -> SessionResult<()> {
        let text = envelope.to_json()?;
        self.outbound
            .send(text)
            .map_err(|_| SessionError::Transport("client side closed".into()))
    }

    /// Inject a raw (possibly malformed) frame.
    pub fn send_raw(&self, text: impl Into<String>) {
        let _ = self.outbound.send(text.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::outbound;
    use serde_json::json;

    #[tokio::test]
    async fn memory_transport_round_trip() {
        let (transport, mut peers) = MemoryTransport::new();
        let mut conn = transport.connect("mem://gateway").await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        let env = Envelope::new(outbound::PING, json!({}));
        conn.send(env.to_json().unwrap()).await.unwrap();
        let seen = peer.recv().await.unwrap();
        assert_eq!(seen.envelope_type, "ping");
        assert_eq!(seen.id, env.id);

        peer.send(&Envelope::new("pong", json!({}))).unwrap();
        let text = conn.recv().await.unwrap().unwrap();
        assert!(text.contains("pong"));
    }

    #[tokio::test]
    async fn scripted_connect_failures_are_consumed() {
        let (transport, _peers) = MemoryTransport::new();
        transport.fail_next_connects(2);
        assert!(transport.connect("mem://gateway").await.is_err());
        assert!(transport.connect("mem://gateway").await.is_err());
        assert!(transport.connect("mem://gateway").await.is_ok());
    }

    #[tokio::test]
    async fn dropped_peer_closes_the_client_side() {
        let (transport, mut peers) = MemoryTransport::new();
        let mut conn = transport.connect("mem://gateway").await.unwrap();
        let peer = peers.recv().await.unwrap();
        drop(peer);
        assert!(conn.recv().await.is_none());
    }
}
