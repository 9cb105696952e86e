//! Peer side of the sync protocol.
//!
//! [`SyncServer`] holds the authoritative merge state: a replica folding
//! in every accepted change, the change log that pulls page through, and
//! the set of acceptance keys that makes re-sent pushes idempotent.
//! Conflicts are settled by the same LWW rule the clients use; a losing
//! change is rejected with the server's winning version attached.

mod pull;
mod push;
mod sessions;

pub use sessions::{ServerSession, SessionManager};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use pocket_engine::{
    encode_checkpoint, error_code_for, Capabilities, ChangeLog, ChangeRecord, Checkpoint,
    CollectionName, DocumentId, Envelope, ErrorCode, ErrorPayload, HandshakeAckPayload,
    HandshakePayload, Message, Replica,
};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::now_millis;
use crate::transport::Transport;

/// Merge state shared by every session.
pub(crate) struct ServerState {
    replica: Replica,
    log: ChangeLog,
    /// Acceptance keys of every change taken so far
    accepted: HashSet<String>,
    /// Winning change per document
    latest: HashMap<(CollectionName, DocumentId), ChangeRecord>,
}

impl ServerState {
    fn new(node_id: &str) -> Self {
        Self {
            replica: Replica::new(node_id),
            log: ChangeLog::new(),
            accepted: HashSet::new(),
            latest: HashMap::new(),
        }
    }

    fn record(&mut self, key: String, change: ChangeRecord) {
        self.accepted.insert(key);
        self.latest.insert(
            (change.collection.clone(), change.document_id.clone()),
            change.clone(),
        );
        self.log.append(change);
    }

    fn latest_version(&self, change: &ChangeRecord) -> Option<&ChangeRecord> {
        self.latest
            .get(&(change.collection.clone(), change.document_id.clone()))
    }

    fn checkpoint(&self) -> Checkpoint {
        encode_checkpoint(self.log.head())
    }
}

/// In-process sync peer.
pub struct SyncServer {
    config: ServerConfig,
    sessions: SessionManager,
    state: Mutex<ServerState>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let state = ServerState::new(&config.server_node_id);
        Self {
            config,
            sessions: SessionManager::new(),
            state: Mutex::new(state),
        }
    }

    pub fn new_shared(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Current value of a document in the server's merge state.
    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        self.state.lock().replica.get(collection, id).cloned()
    }

    /// Number of changes in the log.
    pub fn change_count(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Checkpoint just past the newest change.
    pub fn checkpoint(&self) -> Checkpoint {
        self.state.lock().checkpoint()
    }

    pub fn expire_idle_sessions(&self) -> usize {
        self.sessions.expire_idle(self.config.session_idle_timeout)
    }

    /// Answer one request.
    pub fn handle(&self, request: &Envelope) -> Envelope {
        let message = match request.validate() {
            Ok(()) => self.dispatch(request).unwrap_or_else(Message::Error),
            Err(e) => Message::Error(ErrorPayload::new(error_code_for(&e), e.to_string())),
        };
        if let Message::Error(error) = &message {
            tracing::warn!(
                request = request.message.kind(),
                code = %error.code,
                message = %error.message,
                "request failed"
            );
        }
        Envelope::reply(request, uuid::Uuid::new_v4().to_string(), now_millis(), message)
    }

    fn dispatch(&self, request: &Envelope) -> Result<Message, ErrorPayload> {
        match &request.message {
            Message::Handshake(payload) => self.handshake(payload),

            Message::Push(payload) => {
                if payload.changes.len() > self.config.max_push_batch {
                    return Err(ErrorPayload::new(
                        ErrorCode::QuotaExceeded,
                        format!(
                            "batch of {} exceeds the limit of {}",
                            payload.changes.len(),
                            self.config.max_push_batch
                        ),
                    ));
                }
                let session = self.session(&payload.session_id)?;
                let mut state = self.state.lock();
                Ok(Message::PushAck(push::handle_push(
                    &mut state,
                    &session,
                    payload.clone(),
                )))
            }

            Message::Pull(payload) => {
                let session = self.session(&payload.session_id)?;
                let state = self.state.lock();
                Ok(Message::PullResponse(pull::handle_pull(
                    &state,
                    &session,
                    &self.config,
                    payload,
                )))
            }

            Message::Ping => {
                tracing::trace!(id = %request.id, "ping");
                Ok(Message::Pong)
            }

            other => Err(ErrorPayload::new(
                ErrorCode::InvalidMessage,
                format!("unexpected {} message", other.kind()),
            )),
        }
    }

    fn session(&self, id: &str) -> Result<ServerSession, ErrorPayload> {
        self.sessions
            .touch(id, self.config.session_idle_timeout)
            .map_err(|code| ErrorPayload::new(code, format!("session '{}' is not active", id)))
    }

    fn handshake(&self, payload: &HandshakePayload) -> Result<Message, ErrorPayload> {
        if let Some(expected) = &self.config.auth_token {
            if payload.auth.as_deref() != Some(expected.as_str()) {
                return Err(ErrorPayload::new(ErrorCode::AuthFailed, "invalid auth token"));
            }
        }

        let available = &self.config.available_collections;
        let requested = &payload.collections;
        let all_collections = available.is_empty() && requested.is_empty();
        let collections: Vec<CollectionName> = if available.is_empty() {
            requested.clone()
        } else if requested.is_empty() {
            available.clone()
        } else {
            requested
                .iter()
                .filter(|c| available.contains(c))
                .cloned()
                .collect()
        };

        let session_id = self.sessions.register(
            payload.node_id.clone(),
            collections.clone(),
            all_collections,
            payload.capabilities.clone(),
        );

        tracing::info!(
            session_id = %session_id,
            node_id = %payload.node_id,
            requested = requested.len(),
            accepted = collections.len(),
            "handshake accepted"
        );

        Ok(Message::HandshakeAck(HandshakeAckPayload {
            session_id,
            server_node_id: self.config.server_node_id.clone(),
            accepted_collections: collections,
            server_capabilities: Capabilities {
                max_batch_size: Some(self.config.max_push_batch),
                selective_sync: true,
                keepalive: true,
            },
            checkpoint: payload
                .checkpoint
                .clone()
                .unwrap_or_else(|| encode_checkpoint(0)),
        }))
    }

    /// Serve one connection until the peer hangs up.
    ///
    /// Sessions opened over the connection are unregistered when it ends.
    pub fn serve<T: Transport + 'static>(self: &Arc<Self>, transport: T) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = transport.connect().await {
                tracing::warn!(error = %e, "failed to accept connection");
                return;
            }

            let mut opened = Vec::new();
            while let Some(request) = transport.recv().await {
                let reply = server.handle(&request);
                if let Message::HandshakeAck(ack) = &reply.message {
                    opened.push(ack.session_id.clone());
                }
                if let Err(e) = transport.send(reply).await {
                    tracing::warn!(error = %e, "failed to send reply");
                    break;
                }
            }

            for id in &opened {
                server.sessions.unregister(id);
            }
            tracing::info!(
                sessions_closed = opened.len(),
                active_sessions = server.sessions.session_count(),
                "peer disconnected"
            );
        })
    }
}
