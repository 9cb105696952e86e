//! Snapshot types for persisting and restoring replica state.
//!
//! Snapshots are the bridge between the in-memory [`Replica`](crate::Replica)
//! and persistent storage. Tombstones and clocks are included so a restored
//! replica keeps arbitrating conflicts exactly as before.

use crate::{
    error::Result, ChangeRecord, CollectionName, Error, LwwMap, NodeId, TieBreak, VectorClock,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of a replica.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Node ID of the replica
    pub node_id: NodeId,
    /// Last local sequence number
    pub seq: u64,
    /// Tie-break policy of every collection map
    pub tie_break: TieBreak,
    /// Node's causal history
    pub vector_clock: VectorClock,
    /// Merge state per collection, tombstones included
    pub collections: BTreeMap<CollectionName, LwwMap<Value>>,
    /// Local changes not yet acknowledged
    pub outbox: Vec<ChangeRecord>,
}

impl ReplicaSnapshot {
    /// Create a new empty snapshot.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            node_id: node_id.into(),
            seq: 0,
            tie_break: TieBreak::default(),
            vector_clock: VectorClock::new(),
            collections: BTreeMap::new(),
            outbox: Vec::new(),
        }
    }

    /// Count live documents across all collections.
    pub fn document_count(&self) -> usize {
        self.collections.values().map(|c| c.len()).sum()
    }

    /// Validate internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported format version: {} (expected {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        for (name, map) in &self.collections {
            if map.node_id() != &self.node_id {
                return Err(Error::InvalidSnapshot(format!(
                    "collection '{}' belongs to node '{}'",
                    name,
                    map.node_id()
                )));
            }
        }

        if let Some(change) = self.outbox.iter().find(|c| c.seq > self.seq) {
            return Err(Error::InvalidSnapshot(format!(
                "outbox change {} is ahead of sequence {}",
                change.id(),
                self.seq
            )));
        }

        Ok(())
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::InvalidSnapshot(format!("serialization failed: {}", e)))
    }

    /// Deserialize from JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidSnapshot(format!("deserialization failed: {}", e)))
    }
}
