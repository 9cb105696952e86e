//! Vector clocks for detecting causal order and concurrency.
//!
//! A vector clock maps every node that has written to the number of writes
//! seen from it. Comparison is a partial order: two clocks where each has
//! seen something the other has not are concurrent.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Per-node counter map. Missing nodes count as zero.
///
/// Uses `BTreeMap` so the serialized form is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter recorded for a node.
    pub fn get(&self, node: &str) -> u64 {
        self.entries.get(node).copied().unwrap_or(0)
    }

    /// Set the counter for a node. Zero removes the entry.
    pub fn set(&mut self, node: impl Into<NodeId>, counter: u64) {
        let node = node.into();
        if counter == 0 {
            self.entries.remove(&node);
        } else {
            self.entries.insert(node, counter);
        }
    }

    /// Increment the counter for `node` in place and return the new value.
    pub fn increment(&mut self, node: &str) -> u64 {
        let counter = self.entries.entry(node.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }

    /// Return a copy with `node` incremented.
    pub fn incremented(&self, node: &str) -> Self {
        let mut next = self.clone();
        next.increment(node);
        next
    }

    /// Pointwise max with another clock, in place.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, &counter) in &other.entries {
            let current = self.entries.entry(node.clone()).or_insert(0);
            *current = (*current).max(counter);
        }
    }

    /// Return the pointwise max of two clocks.
    pub fn merged(&self, other: &VectorClock) -> Self {
        let mut next = self.clone();
        next.merge(other);
        next
    }

    /// Compare two clocks.
    ///
    /// Returns `1` if `self` dominates, `-1` if `other` dominates and `0`
    /// when neither does (concurrent or identical).
    pub fn compare(&self, other: &VectorClock) -> i8 {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for node in self.entries.keys().chain(other.entries.keys()) {
            match self.get(node).cmp(&other.get(node)) {
                Ordering::Greater => self_ahead = true,
                Ordering::Less => other_ahead = true,
                Ordering::Equal => {}
            }
        }

        match (self_ahead, other_ahead) {
            (true, false) => 1,
            (false, true) => -1,
            _ => 0,
        }
    }

    /// True when neither clock dominates the other.
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == 0
    }

    /// True iff `self[k] >= other[k]` for every node in `other`, i.e. every
    /// event summarized by `other` has already been seen.
    pub fn descends(&self, other: &VectorClock) -> bool {
        other
            .entries
            .iter()
            .all(|(node, &counter)| self.get(node) >= counter)
    }

    /// Nodes with a non-zero counter, in sorted order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.entries.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Parse the `node:counter,node:counter` form.
    ///
    /// Node ids carry `%` and `,` escaped as `%25` and `%2C`. Any malformed
    /// entry yields an empty clock: losing causal metadata degrades to
    /// "concurrent with everything", never to an error.
    pub fn parse(s: &str) -> Self {
        let mut clock = VectorClock::new();
        if s.trim().is_empty() {
            return clock;
        }

        for part in s.split(',') {
            let Some((node, counter)) = part.rsplit_once(':') else {
                return VectorClock::new();
            };
            let Ok(counter) = counter.trim().parse::<u64>() else {
                return VectorClock::new();
            };
            let Some(node) = unescape_node(node).filter(|n| !n.is_empty()) else {
                return VectorClock::new();
            };
            clock.set(node, counter);
        }

        clock
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (node, counter) in &self.entries {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", escape_node(node), counter)?;
            first = false;
        }
        Ok(())
    }
}

fn escape_node(node: &str) -> String {
    node.replace('%', "%25").replace(',', "%2C")
}

fn unescape_node(node: &str) -> Option<String> {
    let mut out = String::with_capacity(node.len());
    let mut rest = node;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let code = rest.get(at + 1..at + 3)?;
        match code {
            "25" => out.push('%'),
            "2C" | "2c" => out.push(','),
            _ => return None,
        }
        rest = &rest[at + 3..];
    }
    out.push_str(rest);
    Some(out)
}

impl PartialOrd for VectorClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }
        match self.compare(other) {
            1 => Some(Ordering::Greater),
            -1 => Some(Ordering::Less),
            _ => None,
        }
    }
}

impl<N: Into<NodeId>> FromIterator<(N, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (N, u64)>>(iter: I) -> Self {
        let mut clock = VectorClock::new();
        for (node, counter) in iter {
            clock.set(node, counter);
        }
        clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vc(pairs: &[(&str, u64)]) -> VectorClock {
        pairs.iter().map(|(n, c)| (n.to_string(), *c)).collect()
    }

    #[test]
    fn increment_returns_new_clock() {
        let a = VectorClock::new();
        let b = a.incremented("n1");
        assert_eq!(a.get("n1"), 0);
        assert_eq!(b.get("n1"), 1);
    }

    #[test]
    fn merge_is_pointwise_max() {
        let a = vc(&[("n1", 3), ("n2", 1)]);
        let b = vc(&[("n2", 4), ("n3", 2)]);
        assert_eq!(a.merged(&b), vc(&[("n1", 3), ("n2", 4), ("n3", 2)]));
    }

    #[test]
    fn compare_detects_dominance_and_concurrency() {
        let a = vc(&[("n1", 2), ("n2", 1)]);
        let b = vc(&[("n1", 1), ("n2", 1)]);
        assert_eq!(a.compare(&b), 1);
        assert_eq!(b.compare(&a), -1);

        let c = vc(&[("n1", 1), ("n2", 2)]);
        assert_eq!(a.compare(&c), 0);
        assert!(a.is_concurrent_with(&c));
        assert_eq!(a.partial_cmp(&c), None);
        assert_eq!(a.partial_cmp(&b), Some(Ordering::Greater));
    }

    #[test]
    fn missing_nodes_count_as_zero() {
        let a = vc(&[("n1", 1)]);
        let empty = VectorClock::new();
        assert_eq!(a.compare(&empty), 1);
        assert!(a.descends(&empty));
        assert!(!empty.descends(&a));
    }

    #[test]
    fn descends_is_already_seen() {
        let seen = vc(&[("n1", 5), ("n2", 3)]);
        assert!(seen.descends(&vc(&[("n1", 5)])));
        assert!(seen.descends(&seen));
        assert!(!seen.descends(&vc(&[("n2", 4)])));
    }

    #[test]
    fn string_form_is_sorted() {
        let clock = vc(&[("zeta", 1), ("alpha", 7)]);
        assert_eq!(clock.to_string(), "alpha:7,zeta:1");
        assert_eq!(VectorClock::new().to_string(), "");
    }

    #[test]
    fn node_ids_may_contain_colons() {
        let clock = vc(&[("host:9000", 3)]);
        assert_eq!(VectorClock::parse(&clock.to_string()), clock);
    }

    #[test]
    fn node_ids_with_separators_are_escaped() {
        let clock = vc(&[("a,b", 1), ("50%", 2), ("c", 3)]);
        assert_eq!(clock.to_string(), "50%25:2,a%2Cb:1,c:3");
        assert_eq!(VectorClock::parse(&clock.to_string()), clock);
        assert_eq!(VectorClock::parse(&clock.to_string()).get("a,b"), 1);
    }

    #[test]
    fn malformed_input_is_zero_clock() {
        assert!(VectorClock::parse("a%2:1").is_empty());
        assert!(VectorClock::parse("a%zz:1").is_empty());
        assert!(VectorClock::parse("n1").is_empty());
        assert!(VectorClock::parse("n1:x").is_empty());
        assert!(VectorClock::parse("n1:1,:2").is_empty());
        assert!(VectorClock::parse("n1:1,n2").is_empty());
    }

    #[test]
    fn json_is_plain_map() {
        let clock = vc(&[("n1", 2)]);
        assert_eq!(serde_json::to_string(&clock).unwrap(), r#"{"n1":2}"#);
    }

    fn arb_clock() -> impl Strategy<Value = VectorClock> {
        proptest::collection::btree_map("[a-z0-9:,%-]{1,8}", 1u64..1000, 0..6)
            .prop_map(|entries| VectorClock { entries })
    }

    proptest! {
        #[test]
        fn prop_string_roundtrip(clock in arb_clock()) {
            prop_assert_eq!(VectorClock::parse(&clock.to_string()), clock);
        }

        #[test]
        fn prop_compare_antisymmetric(a in arb_clock(), b in arb_clock()) {
            prop_assert_eq!(a.compare(&b), -b.compare(&a));
            prop_assert_eq!(a.compare(&b) == 0, a.is_concurrent_with(&b));
        }

        #[test]
        fn prop_merge_dominates_inputs(a in arb_clock(), b in arb_clock()) {
            let m = a.merged(&b);
            prop_assert!(m.descends(&a));
            prop_assert!(m.descends(&b));
            prop_assert_eq!(m.clone(), b.merged(&a));
            prop_assert_eq!(m.merged(&b), m);
        }
    }
}
