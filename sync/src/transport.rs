//! Transport abstraction.
//!
//! A transport moves whole [`Envelope`]s between two peers. Byte-level
//! framing (WebSocket, HTTP, WebRTC) lives in implementations outside this
//! crate; [`MemoryTransport`] connects two peers inside one process.

use async_trait::async_trait;
use parking_lot::Mutex;
use pocket_engine::Envelope;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};

/// Message pipe between two peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection.
    async fn connect(&self) -> Result<()>;

    /// Close the connection. The peer's `recv` returns `None` afterwards.
    async fn disconnect(&self) -> Result<()>;

    async fn send(&self, envelope: Envelope) -> Result<()>;

    /// Next incoming message, or `None` once the connection is gone.
    async fn recv(&self) -> Option<Envelope>;

    fn is_connected(&self) -> bool;
}

/// Sender for in-memory envelopes.
pub type EnvelopeSender = mpsc::UnboundedSender<Envelope>;

/// One end of an in-process connection.
#[derive(Debug)]
pub struct MemoryTransport {
    outgoing: Mutex<Option<EnvelopeSender>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
    connected: AtomicBool,
}

impl MemoryTransport {
    /// Create two connected ends.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    fn new(outgoing: EnvelopeSender, incoming: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self {
            outgoing: Mutex::new(Some(outgoing)),
            incoming: tokio::sync::Mutex::new(incoming),
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        if self.outgoing.lock().is_none() {
            return Err(SyncError::Transport("connection was shut down".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the sender closes the peer's receiver.
        self.outgoing.lock().take();
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        if !self.is_connected() {
            return Err(SyncError::Transport("not connected".into()));
        }
        let guard = self.outgoing.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| SyncError::Transport("connection was shut down".into()))?;
        sender
            .send(envelope)
            .map_err(|_| SyncError::Transport("peer hung up".into()))
    }

    async fn recv(&self) -> Option<Envelope> {
        self.incoming.lock().await.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pocket_engine::Message;

    #[tokio::test]
    async fn pair_delivers_both_ways() {
        let (a, b) = MemoryTransport::pair();
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        a.send(Envelope::new("1", 0, Message::Ping)).await.unwrap();
        assert_eq!(b.recv().await.unwrap().id, "1");

        b.send(Envelope::new("2", 0, Message::Pong)).await.unwrap();
        assert_eq!(a.recv().await.unwrap().message, Message::Pong);
    }

    #[tokio::test]
    async fn send_requires_connect() {
        let (a, _b) = MemoryTransport::pair();
        assert!(matches!(
            a.send(Envelope::new("1", 0, Message::Ping)).await,
            Err(SyncError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_closes_peer() {
        let (a, b) = MemoryTransport::pair();
        a.connect().await.unwrap();
        a.disconnect().await.unwrap();
        assert!(b.recv().await.is_none());
        assert!(a.connect().await.is_err());
    }
}
