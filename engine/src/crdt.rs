//! Last-writer-wins map with tombstones.
//!
//! This is the single source of truth for conflict resolution. Each key
//! holds a value, the Lamport timestamp of the write that produced it and
//! a tombstone flag. An incoming write replaces the stored entry only if
//! its timestamp is strictly greater, so the accept/reject decision is a
//! pure function of the two timestamps. That makes merging commutative,
//! associative and idempotent.
//!
//! Deleted keys keep their entry (and the deleting timestamp) so that a
//! causally older set arriving later is still discarded. Reads hide
//! tombstones.

use crate::{LamportClock, LamportTimestamp, NodeId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// How two writes with the same Lamport counter are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TieBreak {
    /// Higher node id wins; comparisons are total (default)
    #[default]
    NodeId,
    /// Equal counters keep whatever is already stored
    KeepExisting,
}

impl TieBreak {
    fn compare(self, incoming: &LamportTimestamp, existing: &LamportTimestamp) -> Ordering {
        match self {
            TieBreak::NodeId => incoming.cmp(existing),
            TieBreak::KeepExisting => incoming.counter.cmp(&existing.counter),
        }
    }
}

/// A stored value with its arbitration metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LwwEntry<V> {
    /// Last value; kept after deletion, absent for deletes of unseen keys
    pub value: Option<V>,
    pub timestamp: LamportTimestamp,
    pub tombstone: bool,
}

impl<V> LwwEntry<V> {
    pub fn live(value: V, timestamp: LamportTimestamp) -> Self {
        Self {
            value: Some(value),
            timestamp,
            tombstone: false,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.tombstone
    }
}

/// Which side won a tied write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Winner {
    Local,
    Remote,
}

/// Record of a conflict that was resolved during a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub key: String,
    pub local: LamportTimestamp,
    pub remote: LamportTimestamp,
    pub winner: Winner,
}

/// Summary of a [`LwwMap::merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Keys whose entry was replaced or created
    pub applied: Vec<String>,
    /// True when any key had two different writes with equal counters
    pub had_conflict: bool,
    pub conflicts: Vec<ConflictResolution>,
}

/// Last-writer-wins map owned by one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LwwMap<V> {
    clock: LamportClock,
    tie_break: TieBreak,
    entries: BTreeMap<String, LwwEntry<V>>,
}

impl<V: Clone> LwwMap<V> {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self::with_tie_break(node_id, TieBreak::default())
    }

    pub fn with_tie_break(node_id: impl Into<NodeId>, tie_break: TieBreak) -> Self {
        Self {
            clock: LamportClock::new(node_id),
            tie_break,
            entries: BTreeMap::new(),
        }
    }

    /// Rebuild a map from previously exported state.
    pub fn from_state(
        clock: LamportClock,
        tie_break: TieBreak,
        entries: BTreeMap<String, LwwEntry<V>>,
    ) -> Self {
        Self {
            clock,
            tie_break,
            entries,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.clock.node_id
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Local write. Ticks the clock and stores a live entry.
    pub fn set(&mut self, key: impl Into<String>, value: V) -> LamportTimestamp {
        let timestamp = self.clock.tick();
        self.entries
            .insert(key.into(), LwwEntry::live(value, timestamp.clone()));
        timestamp
    }

    /// Local delete. Ticks the clock and tombstones the entry, keeping the
    /// prior value. Returns `None` if there was no live entry.
    pub fn delete(&mut self, key: &str) -> Option<LamportTimestamp> {
        if !self.has(key) {
            return None;
        }
        let timestamp = self.clock.tick();
        let entry = self.entries.get_mut(key)?;
        entry.tombstone = true;
        entry.timestamp = timestamp.clone();
        Some(timestamp)
    }

    /// Apply a set produced by another node. Returns true if it won.
    pub fn apply_remote_set(
        &mut self,
        key: impl Into<String>,
        value: V,
        timestamp: LamportTimestamp,
    ) -> bool {
        self.clock.receive(timestamp.counter);
        let key = key.into();
        if !self.accepts(&key, &timestamp) {
            return false;
        }
        self.entries.insert(key, LwwEntry::live(value, timestamp));
        true
    }

    /// Apply a delete produced by another node. Returns true if it won.
    ///
    /// Deletes of unseen keys still leave a tombstone so older sets lose.
    pub fn apply_remote_delete(&mut self, key: impl Into<String>, timestamp: LamportTimestamp) -> bool {
        self.clock.receive(timestamp.counter);
        let key = key.into();
        if !self.accepts(&key, &timestamp) {
            return false;
        }
        let value = self.entries.remove(&key).and_then(|e| e.value);
        self.entries.insert(
            key,
            LwwEntry {
                value,
                timestamp,
                tombstone: true,
            },
        );
        true
    }

    /// Merge a whole remote entry set using the same greater-than rule.
    pub fn merge(&mut self, remote: &BTreeMap<String, LwwEntry<V>>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        if let Some(max) = remote.values().map(|e| e.timestamp.counter).max() {
            self.clock.receive(max);
        }

        for (key, incoming) in remote {
            if let Some(existing) = self.entries.get(key) {
                let tied = existing.timestamp.counter == incoming.timestamp.counter
                    && (existing.timestamp.node_id != incoming.timestamp.node_id
                        || existing.tombstone != incoming.tombstone);
                let wins = self.tie_break.compare(&incoming.timestamp, &existing.timestamp)
                    == Ordering::Greater;

                if tied {
                    outcome.had_conflict = true;
                    let resolution = ConflictResolution {
                        key: key.clone(),
                        local: existing.timestamp.clone(),
                        remote: incoming.timestamp.clone(),
                        winner: if wins { Winner::Remote } else { Winner::Local },
                    };
                    tracing::debug!(
                        key = %key,
                        local = %resolution.local,
                        remote = %resolution.remote,
                        winner = ?resolution.winner,
                        "LWW tie resolved"
                    );
                    outcome.conflicts.push(resolution);
                }
                if !wins {
                    continue;
                }
            }
            self.entries.insert(key.clone(), incoming.clone());
            outcome.applied.push(key.clone());
        }

        outcome
    }

    fn accepts(&self, key: &str, incoming: &LamportTimestamp) -> bool {
        match self.entries.get(key) {
            Some(existing) => {
                self.tie_break.compare(incoming, &existing.timestamp) == Ordering::Greater
            }
            None => true,
        }
    }

    /// Live value for a key.
    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|e| e.is_live())
            .and_then(|e| e.value.as_ref())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Raw entry including tombstones.
    pub fn entry(&self, key: &str) -> Option<&LwwEntry<V>> {
        self.entries.get(key)
    }

    /// Live keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.iter().map(|(k, _)| k)
    }

    /// Live values in key order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }

    /// Live `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &V)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.is_live())
            .filter_map(|(k, e)| e.value.as_ref().map(|v| (k, v)))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tombstone every live key with one fresh timestamp.
    pub fn clear(&mut self) -> Option<LamportTimestamp> {
        if self.is_empty() {
            return None;
        }
        let timestamp = self.clock.tick();
        for entry in self.entries.values_mut().filter(|e| e.is_live()) {
            entry.tombstone = true;
            entry.timestamp = timestamp.clone();
        }
        Some(timestamp)
    }

    /// Put an entry's visible state back after a rolled-back local write.
    ///
    /// `Some` makes the entry live with that value, `None` tombstones it.
    /// The timestamp is kept and the clock does not tick. Returns false if
    /// the key is unknown.
    pub fn revert(&mut self, key: &str, value: Option<V>) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        match value {
            Some(value) => {
                entry.value = Some(value);
                entry.tombstone = false;
            }
            None => entry.tombstone = true,
        }
        true
    }

    /// Every entry including tombstones, for replication.
    pub fn state(&self) -> &BTreeMap<String, LwwEntry<V>> {
        &self.entries
    }

    pub fn tombstone_count(&self) -> usize {
        self.entries.values().filter(|e| e.tombstone).count()
    }

    /// Drop tombstones whose counter is below `counter`.
    ///
    /// Only safe once every peer is known to have seen those deletes.
    pub fn purge_tombstones_before(&mut self, counter: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| !(e.tombstone && e.timestamp.counter < counter));
        before - self.entries.len()
    }
}
