//! Per-session event channel.
//!
//! Every client session owns one broadcast channel; any number of
//! subscribers (UI, telemetry, tests) can listen without the session
//! knowing about them. Events are dropped when nobody is subscribed.

use pocket_engine::{ChangeRecord, Checkpoint, CollectionName, DocumentId, ErrorCode};
use tokio::sync::broadcast;

use crate::client::SessionState;

/// Events buffered per subscriber before the slowest one starts lagging.
pub const EVENT_CAPACITY: usize = 256;

/// Something observable happened on a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    HandshakeCompleted {
        session_id: String,
        accepted_collections: Vec<CollectionName>,
    },
    PushCompleted {
        accepted: usize,
        rejected: usize,
    },
    PullCompleted {
        changes: usize,
        checkpoint: Checkpoint,
        has_more: bool,
    },
    /// The peer refused a change
    Rejected {
        collection: CollectionName,
        document_id: DocumentId,
        code: ErrorCode,
        server_version: Option<Box<ChangeRecord>>,
    },
    MissedPong {
        missed: u32,
    },
    Error {
        code: Option<ErrorCode>,
        message: String,
    },
}

/// Broadcast channel wrapper owned by one session.
#[derive(Debug, Clone)]
pub struct EventChannel {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of subscribers reached.
    pub fn emit(&self, event: SessionEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_to_every_subscriber() {
        let channel = EventChannel::new();
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();

        let sent = channel.emit(SessionEvent::MissedPong { missed: 1 });
        assert_eq!(sent, 2);
        assert_eq!(first.recv().await.unwrap(), SessionEvent::MissedPong { missed: 1 });
        assert_eq!(second.recv().await.unwrap(), SessionEvent::MissedPong { missed: 1 });
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let channel = EventChannel::new();
        assert_eq!(channel.emit(SessionEvent::MissedPong { missed: 1 }), 0);
        assert_eq!(channel.subscriber_count(), 0);
    }
}
