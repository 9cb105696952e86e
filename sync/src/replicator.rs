//! Replicator - ties local writes to the sync protocol.
//!
//! Local writes hit the document store immediately and are tracked as
//! optimistic updates. `push` sends the replica's outbox and settles the
//! verdicts: accepted changes are confirmed, a rejection carrying the
//! server's version is merged and the local update rolled back, and
//! updates that keep failing are rolled back once they run out of
//! attempts. `pull` pages through remote changes, merging each one that
//! passes the selective-sync filter.
//!
//! Replica, store and tracker sit behind one mutex that is never held
//! across an await.

use parking_lot::Mutex;
use pocket_engine::{
    ChangeId, DocumentStore, Error, OptimisticTracker, OptimisticUpdate, PushAckPayload,
    RejectedChange, RemoteApply, Replica, ReplicaSnapshot, RollbackManager, RollbackResult,
    SelectiveSync, TrackerStats, UpdateId,
};
use serde_json::Value;

use crate::checkpoint::CheckpointStore;
use crate::client::{PullSummary, SyncClient, SyncSession};
use crate::error::Result;
use crate::now_millis;
use crate::transport::Transport;

/// Outcome of a push round.
#[derive(Debug, Clone, Default)]
pub struct PushReport {
    pub sent: usize,
    pub accepted: usize,
    pub rejected: Vec<RejectedChange>,
    /// Updates reverted because of rejections or exhausted attempts
    pub rollback: RollbackResult,
}

/// Outcome of a pull round.
#[derive(Debug, Clone, Default)]
pub struct PullReport {
    pub summary: PullSummary,
    /// Remote changes that won and were written to the store
    pub applied: usize,
    /// Remote changes outside the selective-sync scope
    pub filtered: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub push: PushReport,
    pub pull: PullReport,
}

enum LocalWrite {
    Insert(Value),
    Update(Value),
    Delete,
}

struct Local<S> {
    replica: Replica,
    store: S,
    tracker: OptimisticTracker,
    filter: SelectiveSync,
}

/// One node's end of synchronization.
pub struct Replicator<T, S, C>
where
    T: Transport + 'static,
    S: DocumentStore,
    C: CheckpointStore,
{
    client: SyncClient<T>,
    local: Mutex<Local<S>>,
    checkpoints: C,
}

impl<T, S, C> Replicator<T, S, C>
where
    T: Transport + 'static,
    S: DocumentStore,
    C: CheckpointStore,
{
    pub fn new(client: SyncClient<T>, store: S, checkpoints: C) -> Self {
        let replica = Replica::new(client.config().node_id.clone());
        Self {
            client,
            local: Mutex::new(Local {
                replica,
                store,
                tracker: OptimisticTracker::new(),
                filter: SelectiveSync::new(),
            }),
            checkpoints,
        }
    }

    /// Resume from a persisted replica snapshot.
    pub fn with_snapshot(self, snapshot: ReplicaSnapshot) -> Result<Self> {
        self.local.lock().replica.import_state(snapshot)?;
        Ok(self)
    }

    pub fn with_filter(self, filter: SelectiveSync) -> Self {
        self.set_filter(filter);
        self
    }

    pub fn set_filter(&self, filter: SelectiveSync) {
        self.local.lock().filter = filter;
    }

    pub fn client(&self) -> &SyncClient<T> {
        &self.client
    }

    pub fn checkpoints(&self) -> &C {
        &self.checkpoints
    }

    pub async fn connect(&self) -> Result<SyncSession> {
        self.client.connect(None).await
    }

    pub async fn close(&self) -> Result<()> {
        self.client.close().await
    }

    pub fn insert(&self, collection: &str, id: &str, document: Value) -> Result<UpdateId> {
        self.write(collection, id, LocalWrite::Insert(document))
    }

    pub fn update(&self, collection: &str, id: &str, document: Value) -> Result<UpdateId> {
        self.write(collection, id, LocalWrite::Update(document))
    }

    pub fn delete(&self, collection: &str, id: &str) -> Result<UpdateId> {
        self.write(collection, id, LocalWrite::Delete)
    }

    fn write(&self, collection: &str, id: &str, write: LocalWrite) -> Result<UpdateId> {
        let now = now_millis();
        let mut local = self.local.lock();
        let Local {
            replica,
            store,
            tracker,
            ..
        } = &mut *local;

        let exists = replica.get(collection, id).is_some();
        match (&write, exists) {
            (LocalWrite::Insert(_), true) => {
                return Err(Error::DocumentAlreadyExists {
                    collection: collection.to_string(),
                    id: id.to_string(),
                }
                .into())
            }
            (LocalWrite::Update(_) | LocalWrite::Delete, false) => {
                return Err(Error::DocumentNotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                }
                .into())
            }
            _ => {}
        }

        // Store first, so a refused write leaves the replica untouched.
        let previous = store.get(collection, id);
        let change = match write {
            LocalWrite::Insert(document) => {
                store.put(collection, id, document.clone())?;
                replica.insert(collection, id, document, now)?
            }
            LocalWrite::Update(document) => {
                store.put(collection, id, document.clone())?;
                replica.update(collection, id, document, now)?
            }
            LocalWrite::Delete => {
                store.delete(collection, id)?;
                replica.delete(collection, id, now)?
            }
        };

        tracing::trace!(change = %change.id(), operation = ?change.operation, "local write");
        Ok(tracker.track(change, previous, now))
    }

    /// Document as the application sees it.
    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        self.local.lock().store.get(collection, id)
    }

    /// Run a closure against the document store.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.local.lock().store)
    }

    pub fn stats(&self) -> TrackerStats {
        self.local.lock().tracker.stats()
    }

    /// Unconfirmed updates, oldest first.
    pub fn unconfirmed(&self) -> Vec<OptimisticUpdate> {
        self.local
            .lock()
            .tracker
            .all()
            .into_iter()
            .filter(|u| !u.is_confirmed())
            .cloned()
            .collect()
    }

    pub fn export_state(&self) -> ReplicaSnapshot {
        self.local.lock().replica.export_state()
    }

    /// Push the outbox in batches and settle every verdict.
    pub async fn push(&self) -> Result<PushReport> {
        let (node_id, pending) = {
            let local = self.local.lock();
            (local.replica.node_id().clone(), local.replica.pending_changes())
        };

        let mut report = PushReport::default();
        let batch_size = self.client.config().push_batch_size.max(1);
        let mut failure = None;

        for batch in pending.chunks(batch_size) {
            report.sent += batch.len();
            match self.client.push(batch.to_vec()).await {
                Ok(ack) => self.settle(&node_id, ack, &mut report),
                Err(e) => {
                    let mut local = self.local.lock();
                    for change in batch {
                        let update = local
                            .tracker
                            .find_by_change(&change.id())
                            .map(|u| u.id.clone());
                        if let Some(update) = update {
                            local.tracker.mark_failed(&update, e.to_string());
                        }
                    }
                    failure = Some(e);
                    break;
                }
            }
        }

        self.give_up_exhausted(&mut report);

        tracing::debug!(
            node_id = %node_id,
            sent = report.sent,
            accepted = report.accepted,
            rejected = report.rejected.len(),
            rolled_back = report.rollback.succeeded(),
            "push round finished"
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn settle(&self, node_id: &str, ack: PushAckPayload, report: &mut PushReport) {
        let mut local = self.local.lock();
        let Local {
            replica,
            store,
            tracker,
            ..
        } = &mut *local;

        for accepted in &ack.accepted {
            let id = ChangeId::new(node_id, accepted.seq);
            replica.acknowledge(&id);
            let update = tracker.find_by_change(&id).map(|u| u.id.clone());
            if let Some(update) = update {
                tracker.mark_synced(&update);
            }
        }
        report.accepted += ack.accepted.len();

        for rejected in ack.rejected {
            let id = ChangeId::new(node_id, rejected.seq);
            let update = tracker.find_by_change(&id).map(|u| u.id.clone());

            match (&rejected.server_version, update) {
                (Some(server_version), Some(update)) => {
                    replica.apply_remote(server_version);
                    replica.acknowledge(&id);
                    let result = RollbackManager::new(tracker, store).rollback(&update);
                    if let Err(e) =
                        reconcile(replica, store, &rejected.collection, &rejected.document_id)
                    {
                        tracing::warn!(
                            error = %e,
                            document_id = %rejected.document_id,
                            "failed to apply server version"
                        );
                    }
                    report.rollback.extend(result);
                }
                (None, Some(update)) if !rejected.code.retryable() => {
                    replica.acknowledge(&id);
                    tracker.mark_failed(&update, rejected.reason.clone());
                    report
                        .rollback
                        .extend(roll_back(replica, tracker, store, vec![update]));
                }
                (None, Some(update)) => {
                    tracker.mark_failed(&update, rejected.reason.clone());
                }
                (_, None) => {
                    tracing::warn!(change = %id, "rejection for an untracked change");
                    replica.acknowledge(&id);
                }
            }
            report.rejected.push(rejected);
        }

        replica.compact_outbox();
        tracker.prune_synced();
    }

    /// Roll back updates that failed too often and stop resending them.
    fn give_up_exhausted(&self, report: &mut PushReport) {
        let max_attempts = self.client.config().max_push_attempts;
        let mut local = self.local.lock();
        let Local {
            replica,
            store,
            tracker,
            ..
        } = &mut *local;

        let exhausted: Vec<(UpdateId, ChangeId)> = tracker
            .failed()
            .into_iter()
            .filter(|u| u.attempts >= max_attempts)
            .map(|u| (u.id.clone(), u.change.id()))
            .collect();
        if exhausted.is_empty() {
            return;
        }

        let ids = exhausted.iter().map(|(update, _)| update.clone()).collect();
        let result = roll_back(replica, tracker, store, ids);
        for (update, change) in &exhausted {
            if result.rolled_back.contains(update) {
                replica.acknowledge(change);
            }
        }
        replica.compact_outbox();

        tracing::warn!(
            rolled_back = result.succeeded(),
            failed = result.failed_count(),
            max_attempts,
            "gave up on undeliverable updates"
        );
        report.rollback.extend(result);
    }

    /// Pull every page and merge what falls inside the filter.
    pub async fn pull(&self) -> Result<PullReport> {
        let mut applied = 0;
        let mut filtered = 0;

        let summary = self
            .client
            .pull_all(&self.checkpoints, |changes| {
                let mut local = self.local.lock();
                let Local {
                    replica,
                    store,
                    filter,
                    ..
                } = &mut *local;

                for change in changes {
                    if !filter.should_sync_change(change) {
                        filtered += 1;
                        continue;
                    }
                    if replica.apply_remote(change) == RemoteApply::Applied {
                        reconcile(replica, store, &change.collection, &change.document_id)?;
                        applied += 1;
                    }
                }
                Ok(())
            })
            .await?;

        Ok(PullReport {
            summary,
            applied,
            filtered,
        })
    }

    /// Push, then pull.
    pub async fn sync(&self) -> Result<SyncReport> {
        let push = self.push().await?;
        let pull = self.pull().await?;
        Ok(SyncReport { push, pull })
    }
}

/// Roll back updates in the store and put the replica's view back to each
/// pre-image. Nothing is queued for sync.
fn roll_back<S: DocumentStore>(
    replica: &mut Replica,
    tracker: &mut OptimisticTracker,
    store: &mut S,
    ids: Vec<UpdateId>,
) -> RollbackResult {
    let updates: Vec<OptimisticUpdate> = ids
        .iter()
        .filter_map(|id| tracker.get(id).cloned())
        .collect();
    let result = RollbackManager::new(tracker, store).rollback_ids(ids);

    // Newest-first, so the oldest pre-image is the one left standing.
    for id in &result.rolled_back {
        if let Some(update) = updates.iter().find(|u| &u.id == id) {
            replica.revert_local(
                &update.collection,
                &update.document_id,
                update.previous_document.clone(),
            );
        }
    }
    result
}

/// Write the replica's current view of a document into the store.
fn reconcile<S: DocumentStore>(
    replica: &Replica,
    store: &mut S,
    collection: &str,
    id: &str,
) -> std::result::Result<(), Error> {
    match replica.get(collection, id) {
        Some(document) => store.put(collection, id, document.clone()),
        None => store.delete(collection, id).map(|_| ()),
    }
}
