//! Client side of the sync protocol.
//!
//! A [`SyncClient`] drives one session over an injected [`Transport`]:
//!
//! ```text
//! new → handshaking → active ⇄ {pushing, pulling} → closing → closed
//!                                   any state → error
//! ```
//!
//! Requests are correlated with replies through the envelope's `replyTo`
//! field; a background reader task routes each reply to the waiting call
//! and answers server pings. An optional heartbeat task sends pings and
//! moves the session to `error` after too many missed pongs.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use pocket_engine::{
    Capabilities, ChangeRecord, Checkpoint, CollectionName, Envelope, ErrorCode,
    HandshakePayload, Message, NodeId, PullPayload, PullResponsePayload, PushAckPayload,
    PushPayload,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::checkpoint::CheckpointStore;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventChannel, SessionEvent};
use crate::now_millis;
use crate::transport::Transport;

/// Lifecycle state of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    New,
    Handshaking,
    Active,
    Pushing,
    Pulling,
    Closing,
    Closed,
    Error,
}

impl SessionState {
    /// Whether new push and pull calls are accepted.
    pub fn accepts_requests(self) -> bool {
        matches!(
            self,
            SessionState::Active | SessionState::Pushing | SessionState::Pulling
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }
}

/// An established session, as agreed during the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSession {
    pub session_id: String,
    pub node_id: NodeId,
    pub server_node_id: NodeId,
    /// Last checkpoint received from the server
    pub checkpoint: Checkpoint,
    /// Collections the server accepted
    pub subscribed_collections: Vec<CollectionName>,
    pub peer_capabilities: Capabilities,
    pub established_at: DateTime<Utc>,
}

/// Totals of a paginated pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub pages: usize,
    pub changes: usize,
    pub checkpoint: Option<Checkpoint>,
}

/// Requests currently holding a busy state, per kind.
#[derive(Debug, Default)]
struct InFlight {
    pushes: usize,
    pulls: usize,
}

impl InFlight {
    fn counter(&mut self, busy: SessionState) -> &mut usize {
        match busy {
            SessionState::Pulling => &mut self.pulls,
            _ => &mut self.pushes,
        }
    }

    /// Busy state implied by what is still running.
    fn busy_state(&self) -> SessionState {
        if self.pulls > 0 {
            SessionState::Pulling
        } else if self.pushes > 0 {
            SessionState::Pushing
        } else {
            SessionState::Active
        }
    }
}

/// Holds a busy state for one request.
struct Busy<'a, T> {
    shared: &'a Shared<T>,
    busy: SessionState,
}

/// Leaving a busy state returns to `active` only once no other request is
/// in flight.
impl<T> Drop for Busy<'_, T> {
    fn drop(&mut self) {
        let (from, to) = {
            let mut state = self.shared.state.lock();
            let mut in_flight = self.shared.in_flight.lock();
            let counter = in_flight.counter(self.busy);
            *counter = counter.saturating_sub(1);

            let from = *state;
            if !matches!(from, SessionState::Pushing | SessionState::Pulling) {
                return;
            }
            let to = in_flight.busy_state();
            *state = to;
            (from, to)
        };
        if from != to {
            self.shared
                .events
                .emit(SessionEvent::StateChanged { from, to });
        }
    }
}

struct Shared<T> {
    transport: T,
    config: SyncConfig,
    state: Mutex<SessionState>,
    /// Only touched while `state` is locked
    in_flight: Mutex<InFlight>,
    session: Mutex<Option<SyncSession>>,
    pending: DashMap<String, oneshot::Sender<Envelope>>,
    events: EventChannel,
    missed_pongs: AtomicU32,
}

impl<T: Transport> Shared<T> {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn transition(&self, to: SessionState) {
        let from = std::mem::replace(&mut *self.state.lock(), to);
        if from != to {
            tracing::debug!(node_id = %self.config.node_id, ?from, ?to, "session state changed");
            self.events.emit(SessionEvent::StateChanged { from, to });
        }
    }

    /// Move to `to` only while still in `from`.
    fn transition_from(&self, from: SessionState, to: SessionState) -> bool {
        {
            let mut state = self.state.lock();
            if *state != from {
                return false;
            }
            *state = to;
        }
        self.events.emit(SessionEvent::StateChanged { from, to });
        true
    }

    /// Send a message and wait for the correlated reply.
    ///
    /// An `error` reply is turned into [`SyncError::Protocol`].
    async fn request(&self, message: Message) -> Result<Envelope> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let envelope = Envelope::new(id.clone(), now_millis(), message);
        if let Err(e) = self.transport.send(envelope).await {
            self.pending.remove(&id);
            return Err(e);
        }

        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => match reply.message {
                Message::Error(payload) => Err(SyncError::Protocol {
                    code: payload.code,
                    message: payload.message,
                }),
                _ => Ok(reply),
            },
            // The reader dropped every waiter: the connection is gone.
            Ok(Err(_)) => Err(SyncError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(SyncError::Timeout(timeout))
            }
        }
    }

    fn report(&self, error: &SyncError) {
        if matches!(
            error.code(),
            Some(ErrorCode::SessionExpired | ErrorCode::AuthFailed | ErrorCode::VersionMismatch)
        ) {
            self.transition(SessionState::Error);
        }
        self.events.emit(SessionEvent::Error {
            code: error.code(),
            message: error.to_string(),
        });
    }
}

/// Route incoming envelopes until the transport closes.
async fn read_loop<T: Transport>(shared: Arc<Shared<T>>) {
    while let Some(envelope) = shared.transport.recv().await {
        if let Err(e) = envelope.validate() {
            tracing::warn!(error = %e, "dropping invalid envelope");
            continue;
        }

        if let Some(reply_to) = &envelope.reply_to {
            if let Some((_, waiter)) = shared.pending.remove(reply_to) {
                let _ = waiter.send(envelope);
                continue;
            }
        }

        match &envelope.message {
            Message::Ping => {
                let pong = Envelope::reply(
                    &envelope,
                    uuid::Uuid::new_v4().to_string(),
                    now_millis(),
                    Message::Pong,
                );
                if let Err(e) = shared.transport.send(pong).await {
                    tracing::warn!(error = %e, "failed to answer ping");
                }
            }
            other => {
                tracing::trace!(kind = other.kind(), id = %envelope.id, "unsolicited message ignored");
            }
        }
    }

    shared.pending.clear();
    if !matches!(shared.state(), SessionState::Closing | SessionState::Closed) {
        tracing::warn!(node_id = %shared.config.node_id, "connection lost");
        shared.transition(SessionState::Error);
        shared.events.emit(SessionEvent::Error {
            code: None,
            message: "connection lost".into(),
        });
    }
}

/// Ping the peer every `interval` until the session stops accepting requests.
async fn heartbeat<T: Transport>(shared: Arc<Shared<T>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !shared.state().accepts_requests() {
            break;
        }

        match shared.request(Message::Ping).await {
            Ok(_) => {
                shared.missed_pongs.store(0, Ordering::SeqCst);
                tracing::trace!(node_id = %shared.config.node_id, "pong received");
            }
            Err(SyncError::Timeout(_)) => {
                let missed = shared.missed_pongs.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::warn!(node_id = %shared.config.node_id, missed, "pong missed");
                shared.events.emit(SessionEvent::MissedPong { missed });

                if missed >= shared.config.max_missed_pongs {
                    shared.transition(SessionState::Error);
                    shared.events.emit(SessionEvent::Error {
                        code: None,
                        message: format!("{} consecutive pongs missed", missed),
                    });
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "keepalive stopped");
                break;
            }
        }
    }
}

/// One sync session over a transport.
pub struct SyncClient<T: Transport + 'static> {
    shared: Arc<Shared<T>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport + 'static> SyncClient<T> {
    pub fn new(transport: T, config: SyncConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                state: Mutex::new(SessionState::New),
                in_flight: Mutex::new(InFlight::default()),
                session: Mutex::new(None),
                pending: DashMap::new(),
                events: EventChannel::new(),
                missed_pongs: AtomicU32::new(0),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn session(&self) -> Option<SyncSession> {
        self.shared.session.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn events(&self) -> &EventChannel {
        &self.shared.events
    }

    /// Connect the transport and perform the handshake.
    pub async fn connect(&self, checkpoint: Option<Checkpoint>) -> Result<SyncSession> {
        let shared = &self.shared;
        if !shared.transition_from(SessionState::New, SessionState::Handshaking) {
            return Err(SyncError::InvalidState(format!(
                "cannot connect from {:?}",
                shared.state()
            )));
        }

        if let Err(e) = shared.transport.connect().await {
            shared.report(&e);
            shared.transition(SessionState::Error);
            return Err(e);
        }
        self.tasks
            .lock()
            .push(tokio::spawn(read_loop(Arc::clone(shared))));

        let config = &shared.config;
        let hello = HandshakePayload {
            node_id: config.node_id.clone(),
            collections: config.collections.clone(),
            checkpoint,
            capabilities: Capabilities {
                max_batch_size: Some(config.push_batch_size),
                selective_sync: true,
                keepalive: config.ping_interval.is_some(),
            },
            auth: config.auth_token.clone(),
        };

        let reply = match shared.request(Message::Handshake(hello)).await {
            Ok(reply) => reply,
            Err(e) => {
                shared.report(&e);
                shared.transition(SessionState::Error);
                return Err(e);
            }
        };
        let Message::HandshakeAck(ack) = reply.message else {
            let e = unexpected("handshake-ack", &reply.message);
            shared.report(&e);
            shared.transition(SessionState::Error);
            return Err(e);
        };

        let session = SyncSession {
            session_id: ack.session_id,
            node_id: config.node_id.clone(),
            server_node_id: ack.server_node_id,
            checkpoint: ack.checkpoint,
            subscribed_collections: ack.accepted_collections,
            peer_capabilities: ack.server_capabilities,
            established_at: Utc::now(),
        };
        *shared.session.lock() = Some(session.clone());
        // The connection may already have dropped behind the ack.
        if !shared.transition_from(SessionState::Handshaking, SessionState::Active) {
            return Err(SyncError::Closed);
        }
        shared.events.emit(SessionEvent::HandshakeCompleted {
            session_id: session.session_id.clone(),
            accepted_collections: session.subscribed_collections.clone(),
        });

        tracing::info!(
            node_id = %session.node_id,
            session_id = %session.session_id,
            server = %session.server_node_id,
            collections = session.subscribed_collections.len(),
            "sync session established"
        );

        if let Some(interval) = config.ping_interval {
            self.tasks
                .lock()
                .push(tokio::spawn(heartbeat(Arc::clone(shared), interval)));
        }

        Ok(session)
    }

    /// Enter a busy state and return the session id. The state is left
    /// when the returned guard drops, even if the request is cancelled.
    fn begin(&self, busy: SessionState) -> Result<(String, Busy<'_, T>)> {
        let from = {
            let mut state = self.shared.state.lock();
            let current = *state;
            match current {
                s if s.accepts_requests() => {
                    *self.shared.in_flight.lock().counter(busy) += 1;
                    std::mem::replace(&mut *state, busy)
                }
                SessionState::Closing | SessionState::Closed => return Err(SyncError::Closed),
                other => {
                    return Err(SyncError::InvalidState(format!(
                        "{:?} session cannot send requests",
                        other
                    )))
                }
            }
        };
        if from != busy {
            self.shared
                .events
                .emit(SessionEvent::StateChanged { from, to: busy });
        }

        let session_id = self
            .shared
            .session
            .lock()
            .as_ref()
            .map(|s| s.session_id.clone());
        let guard = Busy {
            shared: &self.shared,
            busy,
        };
        let session_id =
            session_id.ok_or_else(|| SyncError::InvalidState("no session".into()))?;
        Ok((session_id, guard))
    }


    /// Push one ordered batch of changes.
    ///
    /// The server judges every record on its own; the ack lists which were
    /// accepted and which were rejected, with the server's version when it
    /// has a newer one.
    pub async fn push(&self, changes: Vec<ChangeRecord>) -> Result<PushAckPayload> {
        let (session_id, busy) = self.begin(SessionState::Pushing)?;
        let sent = changes.len();
        let checkpoint = self.session().map(|s| s.checkpoint);

        let result = self
            .shared
            .request(Message::Push(PushPayload {
                session_id: session_id.clone(),
                changes,
                checkpoint,
            }))
            .await;
        drop(busy);

        let reply = result.inspect_err(|e| self.shared.report(e))?;
        let Message::PushAck(ack) = reply.message else {
            return Err(unexpected("push-ack", &reply.message));
        };

        tracing::debug!(
            session_id = %session_id,
            sent,
            accepted = ack.accepted.len(),
            rejected = ack.rejected.len(),
            "push acknowledged"
        );
        for rejected in &ack.rejected {
            tracing::warn!(
                collection = %rejected.collection,
                document_id = %rejected.document_id,
                seq = rejected.seq,
                code = %rejected.code,
                reason = %rejected.reason,
                "change rejected"
            );
            self.shared.events.emit(SessionEvent::Rejected {
                collection: rejected.collection.clone(),
                document_id: rejected.document_id.clone(),
                code: rejected.code,
                server_version: rejected.server_version.clone().map(Box::new),
            });
        }
        self.shared.events.emit(SessionEvent::PushCompleted {
            accepted: ack.accepted.len(),
            rejected: ack.rejected.len(),
        });

        Ok(ack)
    }

    /// Fetch one page of changes after `checkpoint`.
    pub async fn pull(&self, checkpoint: Option<Checkpoint>) -> Result<PullResponsePayload> {
        let (session_id, busy) = self.begin(SessionState::Pulling)?;

        let result = self
            .shared
            .request(Message::Pull(PullPayload {
                session_id: session_id.clone(),
                checkpoint,
                collections: None,
                limit: Some(self.shared.config.pull_page_size),
            }))
            .await;
        drop(busy);

        let reply = result.inspect_err(|e| self.shared.report(e))?;
        let Message::PullResponse(page) = reply.message else {
            return Err(unexpected("pull-response", &reply.message));
        };

        if let Some(session) = self.shared.session.lock().as_mut() {
            session.checkpoint = page.checkpoint.clone();
        }
        tracing::debug!(
            session_id = %session_id,
            changes = page.changes.len(),
            checkpoint = %page.checkpoint,
            has_more = page.has_more,
            "pull page received"
        );
        self.shared.events.emit(SessionEvent::PullCompleted {
            changes: page.changes.len(),
            checkpoint: page.checkpoint.clone(),
            has_more: page.has_more,
        });

        Ok(page)
    }

    /// Pull every page, handing each to `apply` and persisting the
    /// returned checkpoint before requesting the next.
    pub async fn pull_all<C, F>(&self, checkpoints: &C, mut apply: F) -> Result<PullSummary>
    where
        C: CheckpointStore + ?Sized,
        F: FnMut(&[ChangeRecord]) -> Result<()>,
    {
        let peer = self
            .session()
            .map(|s| s.server_node_id)
            .ok_or_else(|| SyncError::InvalidState("not connected".into()))?;

        let mut summary = PullSummary::default();
        let mut checkpoint = checkpoints.load(&peer).await?;

        loop {
            let page = self.pull(checkpoint.clone()).await?;
            apply(&page.changes)?;
            checkpoints.save(&peer, page.checkpoint.clone()).await?;

            summary.pages += 1;
            summary.changes += page.changes.len();
            checkpoint = Some(page.checkpoint);
            if !page.has_more {
                break;
            }
        }

        summary.checkpoint = checkpoint;
        Ok(summary)
    }

    /// Stop accepting new requests, let in-flight ones settle, then
    /// disconnect.
    pub async fn close(&self) -> Result<()> {
        match self.state() {
            SessionState::Closed => return Ok(()),
            SessionState::New => {
                self.shared.transition(SessionState::Closed);
                return Ok(());
            }
            _ => {}
        }
        self.shared.transition(SessionState::Closing);

        let deadline = tokio::time::Instant::now() + self.shared.config.request_timeout;
        while !self.shared.pending.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let result = self.shared.transport.disconnect().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.transition(SessionState::Closed);
        tracing::info!(node_id = %self.shared.config.node_id, "sync session closed");
        result
    }
}

impl<T: Transport + 'static> Drop for SyncClient<T> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn unexpected(expected: &str, got: &Message) -> SyncError {
    SyncError::protocol(
        ErrorCode::InvalidMessage,
        format!("expected {}, got {}", expected, got.kind()),
    )
}
