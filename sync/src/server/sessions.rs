//! Session registry.
//!
//! Tracks every handshaken session and expires the ones that stay idle
//! longer than the configured timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pocket_engine::{Capabilities, CollectionName, ErrorCode, NodeId};

/// A session as the server sees it.
#[derive(Debug, Clone)]
pub struct ServerSession {
    /// Unique identifier for this session
    pub id: String,
    /// Client's node ID
    pub node_id: NodeId,
    /// Accepted collections; ignored when `all_collections` is set
    pub collections: Vec<CollectionName>,
    pub all_collections: bool,
    pub capabilities: Capabilities,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ServerSession {
    pub fn serves(&self, collection: &str) -> bool {
        self.all_collections || self.collections.iter().any(|c| c == collection)
    }

    fn idle_longer_than(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        (now - self.last_seen)
            .to_std()
            .map(|idle| idle > timeout)
            .unwrap_or(false)
    }
}

/// Manages live sessions.
///
/// Thread-safe and can be shared across connections via `Arc`.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<String, ServerSession>,
    /// Index of sessions by node_id
    by_node_id: DashMap<NodeId, Vec<String>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new session. Returns the session ID.
    pub fn register(
        &self,
        node_id: NodeId,
        collections: Vec<CollectionName>,
        all_collections: bool,
        capabilities: Capabilities,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        self.sessions.insert(
            id.clone(),
            ServerSession {
                id: id.clone(),
                node_id: node_id.clone(),
                collections,
                all_collections,
                capabilities,
                connected_at: now,
                last_seen: now,
            },
        );
        self.by_node_id
            .entry(node_id.clone())
            .or_default()
            .push(id.clone());

        tracing::info!(session_id = %id, node_id = %node_id, "session registered");
        id
    }

    pub fn unregister(&self, id: &str) -> Option<ServerSession> {
        let (_, session) = self.sessions.remove(id)?;

        if let Some(mut ids) = self.by_node_id.get_mut(&session.node_id) {
            ids.retain(|s| s != id);
            if ids.is_empty() {
                drop(ids);
                self.by_node_id.remove(&session.node_id);
            }
        }

        tracing::info!(session_id = %id, node_id = %session.node_id, "session unregistered");
        Some(session)
    }

    /// Look up a live session and refresh its idle timer.
    ///
    /// Unknown and expired sessions both yield `SESSION_EXPIRED`; an
    /// expired session is removed.
    pub fn touch(&self, id: &str, idle_timeout: Duration) -> Result<ServerSession, ErrorCode> {
        let now = Utc::now();
        {
            let mut session = self.sessions.get_mut(id).ok_or(ErrorCode::SessionExpired)?;
            if !session.idle_longer_than(idle_timeout, now) {
                session.last_seen = now;
                return Ok(session.clone());
            }
        }

        tracing::info!(session_id = %id, "session expired");
        self.unregister(id);
        Err(ErrorCode::SessionExpired)
    }

    /// Drop every session idle longer than `idle_timeout`.
    pub fn expire_idle(&self, idle_timeout: Duration) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_longer_than(idle_timeout, now))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &expired {
            self.unregister(id);
        }
        expired.len()
    }

    pub fn get(&self, id: &str) -> Option<ServerSession> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Session IDs opened by a node.
    pub fn sessions_for_node(&self, node_id: &str) -> Vec<String> {
        self.by_node_id
            .get(node_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of unique node IDs with a session.
    pub fn node_count(&self) -> usize {
        self.by_node_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_unregister() {
        let manager = SessionManager::new();
        let id = manager.register("node-1".into(), vec![], true, Capabilities::default());
        assert_eq!(manager.session_count(), 1);
        assert_eq!(manager.node_count(), 1);
        assert_eq!(manager.sessions_for_node("node-1"), vec![id.clone()]);

        manager.unregister(&id);
        assert_eq!(manager.session_count(), 0);
        assert_eq!(manager.node_count(), 0);
    }

    #[test]
    fn touch_refreshes_and_expires() {
        let manager = SessionManager::new();
        let id = manager.register("node-1".into(), vec!["todos".into()], false, Capabilities::default());

        let session = manager.touch(&id, Duration::from_secs(60)).unwrap();
        assert!(session.serves("todos"));
        assert!(!session.serves("notes"));

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(
            manager.touch(&id, Duration::from_millis(1)).unwrap_err(),
            ErrorCode::SessionExpired
        );
        assert_eq!(manager.session_count(), 0);
        assert_eq!(
            manager.touch("unknown", Duration::from_secs(60)).unwrap_err(),
            ErrorCode::SessionExpired
        );
    }

    #[test]
    fn expire_idle_sweeps() {
        let manager = SessionManager::new();
        manager.register("a".into(), vec![], true, Capabilities::default());
        manager.register("b".into(), vec![], true, Capabilities::default());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(manager.expire_idle(Duration::from_secs(60)), 0);
        assert_eq!(manager.expire_idle(Duration::from_millis(1)), 2);
    }
}
