//! Hybrid logical clock.
//!
//! Pairs wall-clock milliseconds with a logical counter so timestamps stay
//! close to physical time while still advancing strictly when the wall
//! clock stalls or runs behind a peer. Wall time is passed in by the
//! caller; the engine never reads the system clock.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A `(physical, logical)` pair. Ordered by physical time, then counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct HlcTimestamp {
    /// Milliseconds since epoch
    pub physical: Timestamp,
    /// Logical counter within the same millisecond
    pub logical: u32,
}

impl HlcTimestamp {
    pub fn new(physical: Timestamp, logical: u32) -> Self {
        Self { physical, logical }
    }

    /// Parse the `physical:logical` form. Malformed input yields zero.
    pub fn parse(s: &str) -> Self {
        s.split_once(':')
            .and_then(|(pt, lc)| Some(Self::new(pt.parse().ok()?, lc.parse().ok()?)))
            .unwrap_or_default()
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.physical, self.logical)
    }
}

/// Hybrid logical clock state for one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridLogicalClock {
    last: HlcTimestamp,
}

impl HybridLogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last issued timestamp.
    pub fn current(&self) -> HlcTimestamp {
        self.last
    }

    /// Issue a timestamp for a local event at wall time `now`.
    ///
    /// The counter resets when wall time advances and increments otherwise.
    pub fn tick(&mut self, now: Timestamp) -> HlcTimestamp {
        if now > self.last.physical {
            self.last = HlcTimestamp::new(now, 0);
        } else {
            self.last.logical = self.last.logical.saturating_add(1);
        }
        self.last
    }

    /// Merge a remote timestamp observed at wall time `now`.
    ///
    /// The result's physical part is the max of local, remote and wall
    /// time; when that max is shared with an input the counter strictly
    /// advances past it. Counters saturate at `u32::MAX`.
    pub fn receive(
        &mut self,
        now: Timestamp,
        remote_physical: Timestamp,
        remote_logical: u32,
    ) -> HlcTimestamp {
        let local = self.last;
        let physical = now.max(local.physical).max(remote_physical);

        let logical = if physical == local.physical && physical == remote_physical {
            local.logical.max(remote_logical).saturating_add(1)
        } else if physical == local.physical {
            local.logical.saturating_add(1)
        } else if physical == remote_physical {
            remote_logical.saturating_add(1)
        } else {
            0
        };

        self.last = HlcTimestamp::new(physical, logical);
        self.last
    }

    /// Convenience wrapper over [`receive`](Self::receive) for a whole timestamp.
    pub fn receive_timestamp(&mut self, now: Timestamp, remote: HlcTimestamp) -> HlcTimestamp {
        self.receive(now, remote.physical, remote.logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tick_resets_counter_when_wall_time_advances() {
        let mut hlc = HybridLogicalClock::new();
        assert_eq!(hlc.tick(100), HlcTimestamp::new(100, 0));
        assert_eq!(hlc.tick(100), HlcTimestamp::new(100, 1));
        assert_eq!(hlc.tick(101), HlcTimestamp::new(101, 0));
    }

    #[test]
    fn tick_increments_when_wall_clock_goes_backwards() {
        let mut hlc = HybridLogicalClock::new();
        hlc.tick(500);
        assert_eq!(hlc.tick(400), HlcTimestamp::new(500, 1));
    }

    #[test]
    fn receive_from_future_peer() {
        let mut hlc = HybridLogicalClock::new();
        hlc.tick(100);
        assert_eq!(hlc.receive(100, 200, 3), HlcTimestamp::new(200, 4));
    }

    #[test]
    fn receive_tie_advances_past_both() {
        let mut hlc = HybridLogicalClock::new();
        hlc.tick(100);
        hlc.tick(100);
        assert_eq!(hlc.receive(50, 100, 7), HlcTimestamp::new(100, 8));
    }

    #[test]
    fn receive_wall_clock_ahead_resets() {
        let mut hlc = HybridLogicalClock::new();
        hlc.tick(100);
        assert_eq!(hlc.receive(300, 200, 9), HlcTimestamp::new(300, 0));
    }

    #[test]
    fn counters_saturate_instead_of_overflowing() {
        let mut hlc = HybridLogicalClock::new();
        assert_eq!(hlc.receive(0, 5, u32::MAX), HlcTimestamp::new(5, u32::MAX));
        assert_eq!(hlc.tick(5), HlcTimestamp::new(5, u32::MAX));
        assert_eq!(hlc.receive(0, 5, u32::MAX), HlcTimestamp::new(5, u32::MAX));
    }

    #[test]
    fn string_form() {
        let ts = HlcTimestamp::new(1706745600000, 3);
        assert_eq!(ts.to_string(), "1706745600000:3");
        assert_eq!(HlcTimestamp::parse(&ts.to_string()), ts);
        assert_eq!(HlcTimestamp::parse("nope"), HlcTimestamp::default());
    }

    proptest! {
        #[test]
        fn prop_receive_dominates_inputs(
            local in 0u64..1000,
            now in 0u64..1000,
            remote_pt in 0u64..1000,
            remote_lc in 0u32..50,
        ) {
            let mut hlc = HybridLogicalClock::new();
            let before = hlc.tick(local);
            let remote = HlcTimestamp::new(remote_pt, remote_lc);
            let after = hlc.receive_timestamp(now, remote);
            prop_assert!(after > before);
            prop_assert!(after > remote);
            prop_assert!(after.physical >= now);
        }

        #[test]
        fn prop_tick_is_monotonic(times in proptest::collection::vec(0u64..100, 1..20)) {
            let mut hlc = HybridLogicalClock::new();
            let mut prev = HlcTimestamp::default();
            for t in times {
                let next = hlc.tick(t);
                prop_assert!(next > prev);
                prev = next;
            }
        }
    }
}
