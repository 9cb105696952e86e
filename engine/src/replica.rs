//! Replica - the merge engine's view of every collection on one node.
//!
//! A replica owns one [`LwwMap`] per collection, the node's vector clock
//! and sequence counter, and an outbox [`ChangeLog`] of local changes not
//! yet acknowledged by a peer. Local mutations produce stamped
//! [`ChangeRecord`]s; remote changes are folded in through the LWW rule so
//! that applying the same change twice is a no-op.

use crate::{
    change::ChangeLog, error::Result, snapshot::ReplicaSnapshot, ChangeId, ChangeOperation,
    ChangeRecord, CollectionName, DocumentId, Error, LamportTimestamp, LwwMap, NodeId, TieBreak,
    Timestamp, VectorClock,
};
use serde_json::Value;
use std::collections::BTreeMap;

/// Result of folding a remote change into the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// The change won and the document now reflects it
    Applied,
    /// An equal or newer write was already present
    Ignored,
}

/// Merge-engine state for one node.
#[derive(Debug, Clone)]
pub struct Replica {
    node_id: NodeId,
    tie_break: TieBreak,
    vector_clock: VectorClock,
    seq: u64,
    collections: BTreeMap<CollectionName, LwwMap<Value>>,
    outbox: ChangeLog,
}

impl Replica {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self::with_tie_break(node_id, TieBreak::default())
    }

    pub fn with_tie_break(node_id: impl Into<NodeId>, tie_break: TieBreak) -> Self {
        Self {
            node_id: node_id.into(),
            tie_break,
            vector_clock: VectorClock::new(),
            seq: 0,
            collections: BTreeMap::new(),
            outbox: ChangeLog::new(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    /// Sequence number of the last local change.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    fn map_mut(&mut self, collection: &str) -> &mut LwwMap<Value> {
        let node_id = self.node_id.clone();
        let tie_break = self.tie_break;
        self.collections
            .entry(collection.to_string())
            .or_insert_with(|| LwwMap::with_tie_break(node_id, tie_break))
    }

    /// Insert a new document locally.
    pub fn insert(
        &mut self,
        collection: &str,
        id: &str,
        document: Value,
        now: Timestamp,
    ) -> Result<ChangeRecord> {
        if self.get(collection, id).is_some() {
            return Err(Error::DocumentAlreadyExists {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        let stamp = self.map_mut(collection).set(id, document.clone());
        Ok(self.record_local(collection, id, ChangeOperation::Insert, Some(document), stamp, now))
    }

    /// Replace an existing document locally.
    pub fn update(
        &mut self,
        collection: &str,
        id: &str,
        document: Value,
        now: Timestamp,
    ) -> Result<ChangeRecord> {
        if self.get(collection, id).is_none() {
            return Err(not_found(collection, id));
        }
        let stamp = self.map_mut(collection).set(id, document.clone());
        Ok(self.record_local(collection, id, ChangeOperation::Update, Some(document), stamp, now))
    }

    /// Delete a document locally, leaving a tombstone.
    pub fn delete(&mut self, collection: &str, id: &str, now: Timestamp) -> Result<ChangeRecord> {
        let stamp = self
            .map_mut(collection)
            .delete(id)
            .ok_or_else(|| not_found(collection, id))?;
        Ok(self.record_local(collection, id, ChangeOperation::Delete, None, stamp, now))
    }

    fn record_local(
        &mut self,
        collection: &str,
        id: &str,
        operation: ChangeOperation,
        document: Option<Value>,
        stamp: LamportTimestamp,
        now: Timestamp,
    ) -> ChangeRecord {
        self.seq += 1;
        self.vector_clock.increment(&self.node_id);

        let change = ChangeRecord {
            collection: collection.to_string(),
            document_id: id.to_string(),
            operation,
            document,
            timestamp: now,
            node_id: self.node_id.clone(),
            seq: self.seq,
            lamport: stamp.counter,
            vector_clock: self.vector_clock.clone(),
        };
        self.outbox.append(change.clone());
        change
    }

    /// Fold a change produced elsewhere (or a server's winning version)
    /// into the replica.
    pub fn apply_remote(&mut self, change: &ChangeRecord) -> RemoteApply {
        self.vector_clock.merge(&change.vector_clock);

        let stamp = change.stamp();
        let map = self.map_mut(&change.collection);
        let applied = match (&change.operation, &change.document) {
            (ChangeOperation::Delete, _) => map.apply_remote_delete(&change.document_id, stamp),
            (_, Some(document)) => map.apply_remote_set(&change.document_id, document.clone(), stamp),
            (_, None) => false,
        };

        if applied {
            RemoteApply::Applied
        } else {
            tracing::trace!(
                change = %change.id(),
                document_id = %change.document_id,
                "remote change ignored"
            );
            RemoteApply::Ignored
        }
    }

    /// Bring a document back to its pre-image after the local write was
    /// rolled back. `None` hides it again. Nothing is queued for sync and
    /// the entry keeps its timestamp, so newer remote writes still win.
    pub fn revert_local(&mut self, collection: &str, id: &str, previous: Option<Value>) -> bool {
        self.collections
            .get_mut(collection)
            .map_or(false, |map| map.revert(id, previous))
    }

    /// Live document.
    pub fn get(&self, collection: &str, id: &str) -> Option<&Value> {
        self.collections.get(collection)?.get(id)
    }

    /// Merge state of a collection, tombstones included.
    pub fn collection(&self, name: &str) -> Option<&LwwMap<Value>> {
        self.collections.get(name)
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &CollectionName> {
        self.collections.keys()
    }

    /// Live documents of a collection in id order.
    pub fn documents(&self, collection: &str) -> Vec<(&DocumentId, &Value)> {
        self.collections
            .get(collection)
            .map(|m| m.iter().collect())
            .unwrap_or_default()
    }

    pub fn outbox(&self) -> &ChangeLog {
        &self.outbox
    }

    /// Local changes the peer has not acknowledged, oldest first.
    pub fn pending_changes(&self) -> Vec<ChangeRecord> {
        self.outbox.unacknowledged().cloned().collect()
    }

    pub fn acknowledge(&mut self, id: &ChangeId) -> bool {
        self.outbox.acknowledge(id)
    }

    /// Drop acknowledged changes from the front of the outbox.
    pub fn compact_outbox(&mut self) -> usize {
        self.outbox.compact()
    }

    /// Export the replica for persistence.
    pub fn export_state(&self) -> ReplicaSnapshot {
        let mut snapshot = ReplicaSnapshot::new(self.node_id.clone());
        snapshot.seq = self.seq;
        snapshot.tie_break = self.tie_break;
        snapshot.vector_clock = self.vector_clock.clone();
        snapshot.collections = self.collections.clone();
        snapshot.outbox = self.pending_changes();
        snapshot
    }

    /// Replace this replica's state with a snapshot of the same node.
    pub fn import_state(&mut self, snapshot: ReplicaSnapshot) -> Result<()> {
        snapshot.validate()?;
        if snapshot.node_id != self.node_id {
            return Err(Error::InvalidSnapshot(format!(
                "node ID mismatch: expected '{}', got '{}'",
                self.node_id, snapshot.node_id
            )));
        }

        self.seq = snapshot.seq;
        self.tie_break = snapshot.tie_break;
        self.vector_clock = snapshot.vector_clock;
        self.collections = snapshot.collections;
        self.outbox = ChangeLog::new();
        for change in snapshot.outbox {
            self.outbox.append(change);
        }
        Ok(())
    }
}

fn not_found(collection: &str, id: &str) -> Error {
    Error::DocumentNotFound {
        collection: collection.to_string(),
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn revert_local_restores_without_queueing() {
        let mut replica = Replica::new("a");
        replica.insert("todos", "t1", json!({"n": 1}), 1).unwrap();
        replica.update("todos", "t1", json!({"n": 2}), 2).unwrap();
        let pending = replica.pending_changes().len();

        assert!(replica.revert_local("todos", "t1", Some(json!({"n": 1}))));
        assert_eq!(replica.get("todos", "t1"), Some(&json!({"n": 1})));
        assert_eq!(replica.pending_changes().len(), pending);

        // A reverted insert leaves the id free for a fresh insert.
        replica.insert("todos", "t2", json!({}), 3).unwrap();
        assert!(replica.revert_local("todos", "t2", None));
        assert_eq!(replica.get("todos", "t2"), None);
        assert!(replica.insert("todos", "t2", json!({"again": true}), 4).is_ok());
        assert!(!replica.revert_local("notes", "x", None));
    }

    #[test]
    fn local_writes_produce_stamped_changes() {
        let mut replica = Replica::new("a");
        let c1 = replica.insert("todos", "t1", json!({"n": 1}), 1000).unwrap();
        let c2 = replica.update("todos", "t1", json!({"n": 2}), 1001).unwrap();

        assert_eq!(c1.seq, 1);
        assert_eq!(c2.seq, 2);
        assert!(c2.lamport > c1.lamport);
        assert_eq!(c2.vector_clock.get("a"), 2);
        assert_eq!(replica.pending_changes().len(), 2);
    }

    #[test]
    fn invalid_local_writes_are_rejected() {
        let mut replica = Replica::new("a");
        assert!(matches!(
            replica.update("todos", "t1", json!({}), 1),
            Err(Error::DocumentNotFound { .. })
        ));
        replica.insert("todos", "t1", json!({}), 1).unwrap();
        assert!(matches!(
            replica.insert("todos", "t1", json!({}), 2),
            Err(Error::DocumentAlreadyExists { .. })
        ));
        replica.delete("todos", "t1", 3).unwrap();
        assert!(replica.delete("todos", "t1", 4).is_err());
    }

    #[test]
    fn remote_change_applies_once() {
        let mut a = Replica::new("a");
        let mut b = Replica::new("b");
        let change = a.insert("todos", "t1", json!({"title": "x"}), 1000).unwrap();

        assert_eq!(b.apply_remote(&change), RemoteApply::Applied);
        assert_eq!(b.apply_remote(&change), RemoteApply::Ignored);
        assert_eq!(b.get("todos", "t1"), Some(&json!({"title": "x"})));
        assert_eq!(b.vector_clock().get("a"), 1);
    }

    #[test]
    fn remote_delete_wins_over_older_set() {
        let mut a = Replica::new("a");
        let mut b = Replica::new("b");
        let insert = a.insert("todos", "t1", json!({}), 1).unwrap();
        b.apply_remote(&insert);
        let delete = b.delete("todos", "t1", 2).unwrap();

        a.apply_remote(&delete);
        assert!(a.get("todos", "t1").is_none());
        assert_eq!(a.apply_remote(&insert), RemoteApply::Ignored);
    }

    #[test]
    fn own_changes_echoed_back_are_ignored() {
        let mut a = Replica::new("a");
        let change = a.insert("todos", "t1", json!({"v": 1}), 1).unwrap();
        assert_eq!(a.apply_remote(&change), RemoteApply::Ignored);
    }

    #[test]
    fn acknowledge_and_compact() {
        let mut a = Replica::new("a");
        let c1 = a.insert("todos", "t1", json!({}), 1).unwrap();
        a.insert("todos", "t2", json!({}), 2).unwrap();
        assert!(a.acknowledge(&c1.id()));
        assert_eq!(a.compact_outbox(), 1);
        assert_eq!(a.pending_changes().len(), 1);
    }

    #[test]
    fn export_import_roundtrip() {
        let mut a = Replica::new("a");
        a.insert("todos", "t1", json!({"v": 1}), 1).unwrap();
        a.insert("notes", "n1", json!({"v": 2}), 2).unwrap();
        a.delete("todos", "t1", 3).unwrap();

        let snapshot = a.export_state();
        let json = snapshot.to_json().unwrap();

        let mut restored = Replica::new("a");
        restored
            .import_state(ReplicaSnapshot::from_json(&json).unwrap())
            .unwrap();
        assert_eq!(restored.get("notes", "n1"), Some(&json!({"v": 2})));
        assert!(restored.get("todos", "t1").is_none());
        assert_eq!(restored.seq(), 3);
        assert_eq!(restored.pending_changes().len(), 3);

        let next = restored.insert("todos", "t2", json!({}), 4).unwrap();
        assert_eq!(next.seq, 4);
    }

    #[test]
    fn import_rejects_other_node() {
        let a = Replica::new("a");
        let mut b = Replica::new("b");
        assert!(matches!(
            b.import_state(a.export_state()),
            Err(Error::InvalidSnapshot(_))
        ));
    }
}
