//! Lamport clock for scalar ordering of operations.
//!
//! The clock gives a total order across nodes once its counter is paired
//! with the node id. It cannot detect concurrency; use
//! [`VectorClock`](crate::VectorClock) for that.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A Lamport timestamp: the counter of the writing node plus its id.
///
/// Ordering rules:
/// 1. Higher counter wins
/// 2. If counters equal, lexicographically higher node_id wins
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LamportTimestamp {
    /// Counter value at the time of the write
    pub counter: u64,
    /// Node that produced the timestamp
    pub node_id: NodeId,
}

impl LamportTimestamp {
    pub fn new(counter: u64, node_id: impl Into<NodeId>) -> Self {
        Self {
            counter,
            node_id: node_id.into(),
        }
    }

    /// The zero timestamp, older than anything a clock can produce.
    pub fn zero() -> Self {
        Self {
            counter: 0,
            node_id: NodeId::new(),
        }
    }

    /// Parse the `counter@node` form. Malformed input yields [`zero`](Self::zero).
    pub fn parse(s: &str) -> Self {
        s.split_once('@')
            .and_then(|(counter, node)| {
                counter
                    .parse::<u64>()
                    .ok()
                    .map(|counter| Self::new(counter, node))
            })
            .unwrap_or_else(Self::zero)
    }
}

impl fmt::Display for LamportTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.node_id)
    }
}

impl Ord for LamportTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.counter.cmp(&other.counter) {
            Ordering::Equal => self.node_id.cmp(&other.node_id),
            other => other,
        }
    }
}

impl PartialOrd for LamportTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A Lamport clock owned by a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LamportClock {
    /// Unique identifier for the node owning the clock
    pub node_id: NodeId,
    /// Monotonically increasing counter
    pub counter: u64,
}

impl LamportClock {
    /// Create a new clock for a node, starting at counter 0.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            counter: 0,
        }
    }

    /// Create a clock with a specific counter value.
    pub fn with_counter(node_id: impl Into<NodeId>, counter: u64) -> Self {
        Self {
            node_id: node_id.into(),
            counter,
        }
    }

    /// Increment the clock and return the new timestamp.
    pub fn tick(&mut self) -> LamportTimestamp {
        self.counter = self.counter.saturating_add(1);
        self.now()
    }

    /// Advance past a remote counter: `local = max(local, remote) + 1`.
    ///
    /// Saturates at `u64::MAX` instead of overflowing.
    pub fn receive(&mut self, remote: u64) -> LamportTimestamp {
        self.counter = self.counter.max(remote).saturating_add(1);
        self.now()
    }

    /// Current timestamp without advancing.
    pub fn now(&self) -> LamportTimestamp {
        LamportTimestamp::new(self.counter, self.node_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clock_starts_at_zero() {
        let clock = LamportClock::new("node-1");
        assert_eq!(clock.counter, 0);
        assert_eq!(clock.node_id, "node-1");
    }

    #[test]
    fn tick_increments_counter() {
        let mut clock = LamportClock::new("node-1");
        assert_eq!(clock.tick().counter, 1);
        assert_eq!(clock.tick().counter, 2);
    }

    #[test]
    fn receive_jumps_past_remote() {
        let mut clock = LamportClock::with_counter("node-1", 3);
        assert_eq!(clock.receive(7).counter, 8);
        // A stale remote still advances the local counter.
        assert_eq!(clock.receive(2).counter, 9);
    }

    #[test]
    fn receive_saturates_at_max() {
        let mut clock = LamportClock::new("node-1");
        assert_eq!(clock.receive(u64::MAX).counter, u64::MAX);
        assert_eq!(clock.tick().counter, u64::MAX);
    }

    #[test]
    fn ordering_by_counter_then_node() {
        let a = LamportTimestamp::new(1, "node-b");
        let b = LamportTimestamp::new(2, "node-a");
        assert!(a < b);

        let a = LamportTimestamp::new(5, "node-a");
        let b = LamportTimestamp::new(5, "node-b");
        assert!(a < b);
    }

    #[test]
    fn string_form_roundtrip() {
        let ts = LamportTimestamp::new(42, "device:7");
        assert_eq!(ts.to_string(), "42@device:7");
        assert_eq!(LamportTimestamp::parse(&ts.to_string()), ts);
    }

    #[test]
    fn malformed_string_is_zero() {
        assert_eq!(LamportTimestamp::parse("garbage"), LamportTimestamp::zero());
        assert_eq!(LamportTimestamp::parse("x@node"), LamportTimestamp::zero());
        assert_eq!(LamportTimestamp::parse(""), LamportTimestamp::zero());
    }

    #[test]
    fn serialization_format() {
        let ts = LamportTimestamp::new(10, "node-1");
        let json = serde_json::to_string(&ts).unwrap();
        assert!(json.contains("nodeId"));
        let parsed: LamportTimestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(ts, parsed);
    }
}
