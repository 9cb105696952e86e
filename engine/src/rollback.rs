//! Rollback of optimistic updates.
//!
//! Reverting an update applies its inverse to the document store:
//! - insert → hard-delete
//! - update → reapply the stored pre-image
//! - delete → reinsert the stored pre-image
//!
//! Batches are always reverted newest-first so an older rollback never
//! clobbers the effect of a newer one on the same document. A failure
//! on one update is recorded and the batch carries on.

use crate::{
    error::Result, ChangeOperation, DocumentStore, Error, OptimisticTracker, OptimisticUpdate,
    SyncState, UpdateId,
};
use serde::{Deserialize, Serialize};

/// A rollback that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackError {
    pub update_id: UpdateId,
    pub message: String,
}

/// Outcome of a rollback batch, with exact counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    /// Updates reverted, in the order they were reverted
    pub rolled_back: Vec<UpdateId>,
    /// Updates that could not be reverted
    pub failed: Vec<UpdateId>,
    pub errors: Vec<RollbackError>,
}

impl RollbackResult {
    pub fn succeeded(&self) -> usize {
        self.rolled_back.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// True when every targeted update was reverted.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Fold another batch's outcome into this one.
    pub fn extend(&mut self, other: RollbackResult) {
        self.rolled_back.extend(other.rolled_back);
        self.failed.extend(other.failed);
        self.errors.extend(other.errors);
    }
}

/// Reverts tracked updates against a document store.
pub struct RollbackManager<'a, S: DocumentStore + ?Sized> {
    tracker: &'a mut OptimisticTracker,
    store: &'a mut S,
}

impl<'a, S: DocumentStore + ?Sized> RollbackManager<'a, S> {
    pub fn new(tracker: &'a mut OptimisticTracker, store: &'a mut S) -> Self {
        Self { tracker, store }
    }

    /// Revert a single update.
    pub fn rollback(&mut self, id: &str) -> RollbackResult {
        if self.tracker.get(id).is_none() {
            let mut result = RollbackResult::default();
            result.failed.push(id.to_string());
            result.errors.push(RollbackError {
                update_id: id.to_string(),
                message: Error::UpdateNotFound(id.to_string()).to_string(),
            });
            return result;
        }
        self.rollback_ids(vec![id.to_string()])
    }

    /// Revert every unconfirmed update on one document.
    pub fn rollback_document(&mut self, collection: &str, document_id: &str) -> RollbackResult {
        let ids = unconfirmed(self.tracker.for_document(collection, document_id));
        self.rollback_ids(ids)
    }

    /// Revert every unconfirmed update in a collection.
    pub fn rollback_collection(&mut self, collection: &str) -> RollbackResult {
        let ids = unconfirmed(self.tracker.for_collection(collection));
        self.rollback_ids(ids)
    }

    /// Revert every unconfirmed update.
    pub fn rollback_all(&mut self) -> RollbackResult {
        let ids = unconfirmed(self.tracker.all());
        self.rollback_ids(ids)
    }

    /// Revert failed updates that have used up their delivery attempts.
    pub fn rollback_failed(&mut self, max_attempts: u32) -> RollbackResult {
        let ids = self
            .tracker
            .failed()
            .into_iter()
            .filter(|u| u.attempts >= max_attempts)
            .map(|u| u.id.clone())
            .collect();
        self.rollback_ids(ids)
    }

    /// Revert the given updates newest-first, whatever order they came in.
    pub fn rollback_ids(&mut self, ids: Vec<UpdateId>) -> RollbackResult {
        let mut targets: Vec<_> = ids
            .iter()
            .filter_map(|id| self.tracker.get(id))
            .map(|u| (u.created_at, u.order, u.id.clone()))
            .collect();
        targets.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        targets.dedup_by(|a, b| a.2 == b.2);

        let mut result = RollbackResult::default();
        for (_, _, id) in targets {
            let Some(update) = self.tracker.get(&id).cloned() else {
                continue;
            };
            match revert(&mut *self.store, &update) {
                Ok(()) => {
                    self.tracker.remove(&id);
                    result.rolled_back.push(id);
                }
                Err(e) => {
                    tracing::warn!(
                        update_id = %id,
                        collection = %update.collection,
                        document_id = %update.document_id,
                        error = %e,
                        "rollback failed"
                    );
                    self.tracker.record_error(&id, e.to_string());
                    result.failed.push(id.clone());
                    result.errors.push(RollbackError {
                        update_id: id,
                        message: e.to_string(),
                    });
                }
            }
        }

        tracing::debug!(
            rolled_back = result.succeeded(),
            failed = result.failed_count(),
            "rollback batch finished"
        );
        result
    }
}

fn unconfirmed(updates: Vec<&OptimisticUpdate>) -> Vec<UpdateId> {
    updates
        .into_iter()
        .filter(|u| u.sync_state != SyncState::Synced)
        .map(|u| u.id.clone())
        .collect()
}

/// Apply the inverse of one update.
fn revert<S: DocumentStore + ?Sized>(store: &mut S, update: &OptimisticUpdate) -> Result<()> {
    let collection = &update.collection;
    let id = &update.document_id;

    match (update.operation(), &update.previous_document) {
        (ChangeOperation::Insert, None) => {
            store.delete(collection, id)?;
        }
        // An insert over an existing document behaves like an update.
        (_, Some(previous)) => {
            store.put(collection, id, previous.clone())?;
        }
        (operation, None) => {
            return Err(Error::InvalidChange(format!(
                "{:?} of {}/{} has no pre-image to restore",
                operation, collection, id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStore, Replica};
    use serde_json::json;

    struct Fixture {
        replica: Replica,
        store: MemoryStore,
        tracker: OptimisticTracker,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                replica: Replica::new("n1"),
                store: MemoryStore::new(),
                tracker: OptimisticTracker::new(),
            }
        }

        fn insert(&mut self, id: &str, doc: serde_json::Value, now: u64) -> UpdateId {
            let change = self.replica.insert("todos", id, doc, now).unwrap();
            self.tracker.apply(&mut self.store, change, now).unwrap()
        }

        fn update(&mut self, id: &str, doc: serde_json::Value, now: u64) -> UpdateId {
            let change = self.replica.update("todos", id, doc, now).unwrap();
            self.tracker.apply(&mut self.store, change, now).unwrap()
        }

        fn delete(&mut self, id: &str, now: u64) -> UpdateId {
            let change = self.replica.delete("todos", id, now).unwrap();
            self.tracker.apply(&mut self.store, change, now).unwrap()
        }

        fn manager(&mut self) -> RollbackManager<'_, MemoryStore> {
            RollbackManager::new(&mut self.tracker, &mut self.store)
        }
    }

    #[test]
    fn rollback_insert_removes_document() {
        let mut f = Fixture::new();
        let id = f.insert("t1", json!({"v": 1}), 1);
        let result = f.manager().rollback(&id);
        assert_eq!(result.rolled_back, vec![id]);
        assert_eq!(f.store.get("todos", "t1"), None);
        assert!(f.tracker.is_empty());
    }

    #[test]
    fn rollback_update_restores_pre_image() {
        let mut f = Fixture::new();
        let mut seed = Replica::new("seed");
        let seeded = seed.insert("todos", "t1", json!({"v": 1}), 0).unwrap();
        f.replica.apply_remote(&seeded);
        f.store.put("todos", "t1", json!({"v": 1})).unwrap();
        let id = f.update("t1", json!({"v": 2}), 2);

        assert!(f.manager().rollback(&id).is_complete());
        assert_eq!(f.store.get("todos", "t1"), Some(json!({"v": 1})));
    }

    #[test]
    fn rollback_delete_reinserts_pre_image() {
        let mut f = Fixture::new();
        let insert = f.insert("t1", json!({"v": 1}), 1);
        f.tracker.mark_synced(&insert);
        let delete = f.delete("t1", 2);
        assert_eq!(f.store.get("todos", "t1"), None);

        let result = f.manager().rollback_document("todos", "t1");
        assert_eq!(result.rolled_back, vec![delete]);
        assert_eq!(f.store.get("todos", "t1"), Some(json!({"v": 1})));
    }

    #[test]
    fn stacked_updates_roll_back_newest_first() {
        let mut f = Fixture::new();
        let a = f.insert("t1", json!({"v": 1}), 1);
        let b = f.update("t1", json!({"v": 2}), 2);
        let c = f.update("t1", json!({"v": 3}), 3);

        // Requested oldest-first; must still revert c, b, a.
        let result = f.manager().rollback_ids(vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(result.rolled_back, vec![c, b, a]);
        assert_eq!(f.store.get("todos", "t1"), None);
    }

    #[test]
    fn partial_failure_is_reported_with_counts() {
        let mut f = Fixture::new();
        let ok = f.insert("t1", json!({}), 1);
        let change = f.replica.insert("locked", "x", json!({}), 2).unwrap();
        let locked = f.tracker.apply(&mut f.store, change, 2).unwrap();
        f.store.set_read_only("locked", true);

        let result = f.manager().rollback_all();
        assert_eq!(result.succeeded(), 1);
        assert_eq!(result.failed_count(), 1);
        assert_eq!(result.rolled_back, vec![ok]);
        assert_eq!(result.failed, vec![locked.clone()]);
        assert_eq!(result.errors[0].update_id, locked);

        let remaining = f.tracker.get(&locked).unwrap();
        assert_eq!(remaining.sync_state, SyncState::Failed);
        assert_eq!(remaining.attempts, 0);
        assert!(remaining.last_error.is_some());
    }

    #[test]
    fn failed_rollback_does_not_use_up_attempts() {
        let mut f = Fixture::new();
        let change = f.replica.insert("locked", "x", json!({}), 1).unwrap();
        let locked = f.tracker.apply(&mut f.store, change, 1).unwrap();
        f.tracker.mark_failed(&locked, "timeout");
        f.store.set_read_only("locked", true);

        for _ in 0..3 {
            assert_eq!(f.manager().rollback(&locked).failed_count(), 1);
        }
        assert_eq!(f.tracker.get(&locked).unwrap().attempts, 1);

        // Still below the limit, so an attempt-based sweep skips it.
        f.store.set_read_only("locked", false);
        assert!(f.manager().rollback_failed(2).rolled_back.is_empty());
        assert_eq!(f.manager().rollback_failed(1).rolled_back, vec![locked]);
    }

    #[test]
    fn rollback_failed_respects_attempts() {
        let mut f = Fixture::new();
        let a = f.insert("a", json!({}), 1);
        let b = f.insert("b", json!({}), 2);
        f.tracker.mark_failed(&a, "x");
        f.tracker.mark_failed(&a, "x");
        f.tracker.mark_failed(&b, "x");

        let result = f.manager().rollback_failed(2);
        assert_eq!(result.rolled_back, vec![a]);
        assert!(f.tracker.get(&b).is_some());
    }

    #[test]
    fn confirmed_updates_are_left_alone() {
        let mut f = Fixture::new();
        let a = f.insert("a", json!({}), 1);
        f.tracker.mark_synced(&a);
        let result = f.manager().rollback_collection("todos");
        assert_eq!(result.succeeded(), 0);
        assert!(f.store.get("todos", "a").is_some());
    }

    #[test]
    fn unknown_update_is_an_error_entry() {
        let mut f = Fixture::new();
        let result = f.manager().rollback("nope");
        assert_eq!(result.failed, vec!["nope".to_string()]);
        assert_eq!(result.errors.len(), 1);
    }
}
