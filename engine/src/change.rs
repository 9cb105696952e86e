//! Change records and the append-only change log.
//!
//! Every mutation that crosses a node boundary is described by an immutable
//! [`ChangeRecord`] stamped with the writer's causal metadata. Records are
//! kept in a [`ChangeLog`]: an arena indexed by `(nodeId, seq)` whose
//! positions double as resumable checkpoints.

use crate::{
    error::Result, Checkpoint, CollectionName, DocumentId, Error, LamportTimestamp, NodeId,
    Timestamp, VectorClock,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// The kind of mutation a change describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// Identity of a change: the writing node and its per-node sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeId {
    pub node_id: NodeId,
    pub seq: u64,
}

impl ChangeId {
    pub fn new(node_id: impl Into<NodeId>, seq: u64) -> Self {
        Self {
            node_id: node_id.into(),
            seq,
        }
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node_id, self.seq)
    }
}

/// An immutable description of a mutation plus its causal metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Target collection
    pub collection: CollectionName,
    /// Target document
    pub document_id: DocumentId,
    /// Insert, update or delete
    pub operation: ChangeOperation,
    /// Full document for inserts and updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<serde_json::Value>,
    /// Wall-clock time of the write (milliseconds since epoch)
    pub timestamp: Timestamp,
    /// Node that produced the change
    pub node_id: NodeId,
    /// Per-node sequence number
    pub seq: u64,
    /// Lamport counter used for last-writer-wins arbitration
    pub lamport: u64,
    /// Writer's causal history at the time of the change
    pub vector_clock: VectorClock,
}

impl ChangeRecord {
    /// Identity of this change.
    pub fn id(&self) -> ChangeId {
        ChangeId::new(self.node_id.clone(), self.seq)
    }

    /// Timestamp used by the merge engine.
    pub fn stamp(&self) -> LamportTimestamp {
        LamportTimestamp::new(self.lamport, self.node_id.clone())
    }

    /// Key under which a receiving peer deduplicates this change.
    ///
    /// Keys on content identity rather than delivery order so that a
    /// re-sent batch is recognised no matter how it was split.
    pub fn acceptance_key(&self) -> String {
        format!(
            "{}|{}/{}|{}",
            self.node_id, self.collection, self.document_id, self.vector_clock
        )
    }

    pub fn is_delete(&self) -> bool {
        self.operation == ChangeOperation::Delete
    }

    /// Structural validation performed before a change is accepted.
    pub fn validate(&self) -> Result<()> {
        if self.collection.is_empty() {
            return Err(Error::InvalidChange("empty collection name".into()));
        }
        if self.document_id.is_empty() {
            return Err(Error::InvalidChange("empty document id".into()));
        }
        if self.node_id.is_empty() {
            return Err(Error::InvalidChange("empty node id".into()));
        }
        match (self.operation, &self.document) {
            (ChangeOperation::Insert | ChangeOperation::Update, None) => {
                Err(Error::InvalidChange(format!(
                    "{:?} of {} carries no document",
                    self.operation, self.document_id
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Encode a log position as an opaque checkpoint.
pub fn encode_checkpoint(position: u64) -> Checkpoint {
    position.to_string()
}

/// Decode a checkpoint. Absent or malformed checkpoints start from zero;
/// replaying from the beginning is safe because merges are idempotent.
pub fn decode_checkpoint(checkpoint: Option<&str>) -> u64 {
    checkpoint.and_then(|c| c.parse().ok()).unwrap_or(0)
}

/// One page of a log scan.
#[derive(Debug, Clone, PartialEq)]
pub struct LogPage {
    pub changes: Vec<ChangeRecord>,
    /// Position to resume from
    pub next: u64,
    pub has_more: bool,
}

/// Append-only change log with `(nodeId, seq)` index.
///
/// Positions are absolute and never reused; compaction only drops an
/// acknowledged prefix.
#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    /// Absolute position of `entries[0]`
    base: u64,
    entries: VecDeque<ChangeRecord>,
    index: HashMap<ChangeId, u64>,
    acknowledged: HashSet<ChangeId>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a change. Returns its position, or `None` if a change with
    /// the same id is already present.
    pub fn append(&mut self, change: ChangeRecord) -> Option<u64> {
        let id = change.id();
        if self.index.contains_key(&id) {
            return None;
        }
        let position = self.head();
        self.index.insert(id, position);
        self.entries.push_back(change);
        Some(position)
    }

    pub fn get(&self, id: &ChangeId) -> Option<&ChangeRecord> {
        let position = *self.index.get(id)?;
        self.entries.get((position - self.base) as usize)
    }

    pub fn contains(&self, id: &ChangeId) -> bool {
        self.index.contains_key(id)
    }

    /// Position one past the newest entry.
    pub fn head(&self) -> u64 {
        self.base + self.entries.len() as u64
    }

    /// Position of the oldest retained entry.
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Scan up to `limit` changes at or after `from` that satisfy `keep`.
    ///
    /// When the page is full and further matches exist, `next` points just
    /// past the last returned change; otherwise it is the log head, so
    /// skipped non-matching entries are never rescanned.
    pub fn since_where<F>(&self, from: u64, limit: usize, keep: F) -> LogPage
    where
        F: Fn(&ChangeRecord) -> bool,
    {
        let start = from.max(self.base);
        let mut changes = Vec::new();
        let mut next = self.head();
        let mut has_more = false;

        for (offset, change) in self.entries.iter().enumerate().skip((start - self.base) as usize) {
            if !keep(change) {
                continue;
            }
            if changes.len() == limit {
                has_more = true;
                break;
            }
            changes.push(change.clone());
            next = self.base + offset as u64 + 1;
        }

        if !has_more {
            next = self.head();
        }

        LogPage {
            changes,
            next,
            has_more,
        }
    }

    /// Scan without a predicate.
    pub fn since(&self, from: u64, limit: usize) -> LogPage {
        self.since_where(from, limit, |_| true)
    }

    /// Mark a change as acknowledged by the peer.
    pub fn acknowledge(&mut self, id: &ChangeId) -> bool {
        if self.index.contains_key(id) {
            self.acknowledged.insert(id.clone())
        } else {
            false
        }
    }

    pub fn is_acknowledged(&self, id: &ChangeId) -> bool {
        self.acknowledged.contains(id)
    }

    /// Changes not yet acknowledged, oldest first.
    pub fn unacknowledged(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.entries
            .iter()
            .filter(|c| !self.acknowledged.contains(&c.id()))
    }

    /// Drop the acknowledged prefix. Returns the number of entries removed.
    pub fn compact(&mut self) -> usize {
        let mut removed = 0;
        while let Some(front) = self.entries.front() {
            let id = front.id();
            if !self.acknowledged.contains(&id) {
                break;
            }
            self.entries.pop_front();
            self.index.remove(&id);
            self.acknowledged.remove(&id);
            self.base += 1;
            removed += 1;
        }
        removed
    }
}
