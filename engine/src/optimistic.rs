//! Optimistic update tracking.
//!
//! Every local mutation is applied to the document store immediately and
//! wrapped in an [`OptimisticUpdate`] that keeps what is needed to undo it:
//! nothing extra for inserts, the full pre-image for updates and deletes.
//! Updates stay in the tracker until the peer confirms them or they are
//! rolled back; a failed push leaves them visible as `pending`/`failed`.

use crate::{
    error::Result, ChangeId, ChangeOperation, ChangeRecord, CollectionName, DocumentId,
    DocumentStore, Error, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Identifier of a tracked update.
pub type UpdateId = String;

/// Confirmation state of an optimistic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Synced,
    Failed,
}

/// A local mutation applied before confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticUpdate {
    pub id: UpdateId,
    pub collection: CollectionName,
    pub document_id: DocumentId,
    /// The change that was applied
    pub change: ChangeRecord,
    /// Document as it was before the change, if it existed
    pub previous_document: Option<Value>,
    /// When the update was applied locally
    pub created_at: Timestamp,
    pub sync_state: SyncState,
    /// Number of failed delivery attempts
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Tracker-wide insertion order, breaks `created_at` ties
    pub order: u64,
}

impl OptimisticUpdate {
    pub fn operation(&self) -> ChangeOperation {
        self.change.operation
    }

    pub fn is_confirmed(&self) -> bool {
        self.sync_state == SyncState::Synced
    }
}

/// Counts of tracked updates by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStats {
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
}

impl TrackerStats {
    pub fn total(&self) -> usize {
        self.pending + self.synced + self.failed
    }
}

/// Registry of optimistic updates for one node.
#[derive(Debug, Clone, Default)]
pub struct OptimisticTracker {
    updates: HashMap<UpdateId, OptimisticUpdate>,
    by_change: HashMap<ChangeId, UpdateId>,
    next_order: u64,
}

impl OptimisticTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `change` to the store and track it.
    ///
    /// The pre-image is read before the write. Nothing is tracked if the
    /// store refuses the write.
    pub fn apply<S: DocumentStore + ?Sized>(
        &mut self,
        store: &mut S,
        change: ChangeRecord,
        now: Timestamp,
    ) -> Result<UpdateId> {
        change.validate()?;
        let previous = store.get(&change.collection, &change.document_id);

        match (change.operation, &change.document) {
            (ChangeOperation::Delete, _) => {
                store.delete(&change.collection, &change.document_id)?;
            }
            (_, Some(document)) => {
                store.put(&change.collection, &change.document_id, document.clone())?;
            }
            (_, None) => {
                return Err(Error::InvalidChange(format!(
                    "{} carries no document",
                    change.id()
                )))
            }
        }

        Ok(self.track(change, previous, now))
    }

    /// Track a change that the caller already applied.
    pub fn track(
        &mut self,
        change: ChangeRecord,
        previous_document: Option<Value>,
        now: Timestamp,
    ) -> UpdateId {
        self.next_order += 1;
        let id = format!("{}-{}", change.node_id, self.next_order);

        self.by_change.insert(change.id(), id.clone());
        self.updates.insert(
            id.clone(),
            OptimisticUpdate {
                id: id.clone(),
                collection: change.collection.clone(),
                document_id: change.document_id.clone(),
                change,
                previous_document,
                created_at: now,
                sync_state: SyncState::Pending,
                attempts: 0,
                last_error: None,
                order: self.next_order,
            },
        );
        id
    }

    pub fn get(&self, id: &str) -> Option<&OptimisticUpdate> {
        self.updates.get(id)
    }

    /// Update that carries the given change.
    pub fn find_by_change(&self, change: &ChangeId) -> Option<&OptimisticUpdate> {
        self.by_change.get(change).and_then(|id| self.updates.get(id))
    }

    /// Mark an update as confirmed by the peer.
    pub fn mark_synced(&mut self, id: &str) -> bool {
        match self.updates.get_mut(id) {
            Some(update) => {
                update.sync_state = SyncState::Synced;
                update.last_error = None;
                true
            }
            None => false,
        }
    }

    /// Confirm every unconfirmed update on a document. Returns how many
    /// changed state.
    pub fn mark_document_synced(&mut self, collection: &str, document_id: &str) -> usize {
        let mut confirmed = 0;
        for update in self.updates.values_mut() {
            if update.collection == collection
                && update.document_id == document_id
                && !update.is_confirmed()
            {
                update.sync_state = SyncState::Synced;
                update.last_error = None;
                confirmed += 1;
            }
        }
        confirmed
    }

    /// Record a failed delivery attempt.
    pub fn mark_failed(&mut self, id: &str, error: impl Into<String>) -> bool {
        match self.updates.get_mut(id) {
            Some(update) => {
                update.sync_state = SyncState::Failed;
                update.attempts = update.attempts.saturating_add(1);
                update.last_error = Some(error.into());
                true
            }
            None => false,
        }
    }

    /// Flag an update as failed with an error that did not come from a
    /// delivery attempt. `attempts` is left alone.
    pub fn record_error(&mut self, id: &str, error: impl Into<String>) -> bool {
        match self.updates.get_mut(id) {
            Some(update) => {
                update.sync_state = SyncState::Failed;
                update.last_error = Some(error.into());
                true
            }
            None => false,
        }
    }

    /// Put a failed update back in the queue for another attempt.
    pub fn retry(&mut self, id: &str) -> bool {
        match self.updates.get_mut(id) {
            Some(update) if update.sync_state == SyncState::Failed => {
                update.sync_state = SyncState::Pending;
                true
            }
            _ => false,
        }
    }

    /// Stop tracking an update.
    pub fn remove(&mut self, id: &str) -> Option<OptimisticUpdate> {
        let update = self.updates.remove(id)?;
        self.by_change.remove(&update.change.id());
        Some(update)
    }

    /// Drop every confirmed update. Returns how many were dropped.
    pub fn prune_synced(&mut self) -> usize {
        let synced: Vec<_> = self
            .updates
            .values()
            .filter(|u| u.is_confirmed())
            .map(|u| u.id.clone())
            .collect();
        for id in &synced {
            self.remove(id);
        }
        synced.len()
    }

    fn select<F>(&self, keep: F) -> Vec<&OptimisticUpdate>
    where
        F: Fn(&OptimisticUpdate) -> bool,
    {
        let mut selected: Vec<_> = self.updates.values().filter(|u| keep(u)).collect();
        selected.sort_by_key(|u| (u.created_at, u.order));
        selected
    }

    /// All updates, oldest first.
    pub fn all(&self) -> Vec<&OptimisticUpdate> {
        self.select(|_| true)
    }

    pub fn pending(&self) -> Vec<&OptimisticUpdate> {
        self.select(|u| u.sync_state == SyncState::Pending)
    }

    pub fn failed(&self) -> Vec<&OptimisticUpdate> {
        self.select(|u| u.sync_state == SyncState::Failed)
    }

    pub fn for_document(&self, collection: &str, document_id: &str) -> Vec<&OptimisticUpdate> {
        self.select(|u| u.collection == collection && u.document_id == document_id)
    }

    pub fn for_collection(&self, collection: &str) -> Vec<&OptimisticUpdate> {
        self.select(|u| u.collection == collection)
    }

    /// True if the document has unconfirmed local changes.
    pub fn has_unconfirmed(&self, collection: &str, document_id: &str) -> bool {
        self.updates.values().any(|u| {
            u.collection == collection && u.document_id == document_id && !u.is_confirmed()
        })
    }

    pub fn stats(&self) -> TrackerStats {
        let mut stats = TrackerStats::default();
        for update in self.updates.values() {
            match update.sync_state {
                SyncState::Pending => stats.pending += 1,
                SyncState::Synced => stats.synced += 1,
                SyncState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}
