//! The `$clusterTime` gossip token (§4.6, §4.8, §4.10) and the `max(known, received)` rule used
//! to advance it monotonically.

use std::sync::{Arc, Mutex};

use bson::{Document, Timestamp};

/// An opaque `$clusterTime` document. Comparison looks only at the embedded `clusterTime`
/// timestamp, per the server's gossip protocol; the rest of the document (`signature`) is
/// preserved verbatim and forwarded as-is.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterTime(pub Document);

impl ClusterTime {
    fn timestamp(&self) -> Option<Timestamp> {
        self.0.get_timestamp("clusterTime").ok()
    }

    /// Returns whichever of `self` and `other` carries the later `clusterTime` timestamp,
    /// per the standard `max(known, received)` gossip rule. A side lacking a parseable
    /// timestamp never wins.
    pub fn max(self, other: ClusterTime) -> ClusterTime {
        match (self.timestamp(), other.timestamp()) {
            (Some(a), Some(b)) if b > a => other,
            (None, Some(_)) => other,
            _ => self,
        }
    }

    /// Advances `slot` to `max(*slot, incoming)` if `incoming` is newer, matching §8's
    /// cluster-time-monotonicity testable property.
    pub fn advance(slot: &mut Option<ClusterTime>, incoming: ClusterTime) {
        *slot = Some(match slot.take() {
            Some(current) => current.max(incoming),
            None => incoming,
        });
    }
}

/// The topology-wide cluster clock: one shared, thread-safe `ClusterTime` slot gossiped into by
/// every command response and `hello` reply (§4.6). Cheaply cloneable; clones share the same
/// underlying slot.
#[derive(Clone, Debug, Default)]
pub struct ClusterClock(Arc<Mutex<Option<ClusterTime>>>);

impl ClusterClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<ClusterTime> {
        self.0.lock().unwrap().clone()
    }

    /// Advances the clock to `max(current, incoming)`, per the standard gossip rule (§8
    /// cluster-time-monotonicity).
    pub fn advance(&self, incoming: ClusterTime) {
        let mut slot = self.0.lock().unwrap();
        ClusterTime::advance(&mut slot, incoming);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    fn ct(seconds: u32) -> ClusterTime {
        ClusterTime(doc! { "clusterTime": Timestamp { time: seconds, increment: 1 } })
    }

    #[test]
    fn max_picks_later_timestamp() {
        let a = ct(10);
        let b = ct(20);
        assert_eq!(a.clone().max(b.clone()), b.clone());
        assert_eq!(b.clone().max(a), b);
    }

    #[test]
    fn advance_never_regresses() {
        let mut slot = Some(ct(20));
        ClusterTime::advance(&mut slot, ct(10));
        assert_eq!(slot.unwrap().timestamp().unwrap().time, 20);
    }

    #[test]
    fn cluster_clock_shares_state_across_clones() {
        let clock = ClusterClock::new();
        let clone = clock.clone();
        clock.advance(ct(15));
        assert_eq!(clone.current().unwrap().timestamp().unwrap().time, 15);
    }

    #[test]
    fn advance_from_empty_accepts_any_value() {
        let mut slot: Option<ClusterTime> = None;
        ClusterTime::advance(&mut slot, ct(5));
        assert_eq!(slot.unwrap().timestamp().unwrap().time, 5);
    }
}
