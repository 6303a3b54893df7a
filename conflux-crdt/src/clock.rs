//! Vector clocks for causal version tracking.
//!
//! Each replica owns one counter and only ever increments its own entry.
//! Merging two clocks takes the element-wise maximum, which makes the merge
//! commutative, associative, and idempotent — the properties that let
//! replicas exchange operations in any order and still agree on causality.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Result of comparing two vector clocks.
///
/// Vector clocks induce a *partial* order: two clocks that each contain an
/// entry the other hasn't seen are `Concurrent`, not ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// Every entry of the left clock is ≤ the right, and at least one is <.
    Before,
    /// Every entry of the right clock is ≤ the left, and at least one is <.
    After,
    /// Each side has seen something the other hasn't.
    Concurrent,
    /// Identical entries.
    Equal,
}

/// Per-replica monotone counters.
///
/// Absent entries are treated as zero, so a fresh clock compares `Equal`
/// to an explicit all-zero clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: HashMap<String, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a replica (0 if the replica has never been seen).
    pub fn get(&self, replica_id: &str) -> u64 {
        self.entries.get(replica_id).copied().unwrap_or(0)
    }

    /// Increment this replica's own counter, returning the new value.
    pub fn increment(&mut self, replica_id: &str) -> u64 {
        let counter = self.entries.entry(replica_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Record that `counter` operations from `replica_id` have been seen.
    ///
    /// Never moves an entry backwards.
    pub fn observe(&mut self, replica_id: &str, counter: u64) {
        let entry = self.entries.entry(replica_id.to_string()).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
    }

    /// Element-wise maximum merge.
    pub fn merge(&mut self, other: &VectorClock) {
        for (replica, &counter) in &other.entries {
            self.observe(replica, counter);
        }
    }

    /// Compare two clocks under the causal partial order.
    pub fn compare(a: &VectorClock, b: &VectorClock) -> CausalOrder {
        let mut a_ahead = false;
        let mut b_ahead = false;

        for (replica, &counter) in &a.entries {
            match counter.cmp(&b.get(replica)) {
                std::cmp::Ordering::Greater => a_ahead = true,
                std::cmp::Ordering::Less => b_ahead = true,
                std::cmp::Ordering::Equal => {}
            }
        }
        for (replica, &counter) in &b.entries {
            if counter > a.get(replica) {
                b_ahead = true;
            }
        }

        match (a_ahead, b_ahead) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// Number of replicas tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over (replica, counter) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_clock_is_zero() {
        let clock = VectorClock::new();
        assert_eq!(clock.get("a"), 0);
        assert!(clock.is_empty());
    }

    #[test]
    fn test_increment_own_counter() {
        let mut clock = VectorClock::new();
        assert_eq!(clock.increment("a"), 1);
        assert_eq!(clock.increment("a"), 2);
        assert_eq!(clock.get("a"), 2);
        assert_eq!(clock.get("b"), 0);
    }

    #[test]
    fn test_observe_never_regresses() {
        let mut clock = VectorClock::new();
        clock.observe("a", 5);
        clock.observe("a", 3);
        assert_eq!(clock.get("a"), 5);
    }

    #[test]
    fn test_merge_elementwise_max() {
        let mut a = VectorClock::new();
        a.observe("x", 3);
        a.observe("y", 1);

        let mut b = VectorClock::new();
        b.observe("x", 2);
        b.observe("z", 7);

        a.merge(&b);
        assert_eq!(a.get("x"), 3);
        assert_eq!(a.get("y"), 1);
        assert_eq!(a.get("z"), 7);
    }

    #[test]
    fn test_merge_commutative() {
        let mut a = VectorClock::new();
        a.observe("x", 3);
        a.observe("y", 1);

        let mut b = VectorClock::new();
        b.observe("x", 2);
        b.observe("z", 7);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_compare_equal() {
        let mut a = VectorClock::new();
        a.observe("x", 2);
        let b = a.clone();
        assert_eq!(VectorClock::compare(&a, &b), CausalOrder::Equal);
    }

    #[test]
    fn test_compare_before_after() {
        let mut a = VectorClock::new();
        a.observe("x", 1);

        let mut b = a.clone();
        b.observe("x", 2);

        assert_eq!(VectorClock::compare(&a, &b), CausalOrder::Before);
        assert_eq!(VectorClock::compare(&b, &a), CausalOrder::After);
    }

    #[test]
    fn test_compare_concurrent() {
        let mut a = VectorClock::new();
        a.observe("x", 1);

        let mut b = VectorClock::new();
        b.observe("y", 1);

        assert_eq!(VectorClock::compare(&a, &b), CausalOrder::Concurrent);
    }

    #[test]
    fn test_zero_entries_compare_equal() {
        let a = VectorClock::new();
        let mut b = VectorClock::new();
        b.observe("x", 0);
        assert_eq!(VectorClock::compare(&a, &b), CausalOrder::Equal);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut clock = VectorClock::new();
        clock.observe("node-1", 4);
        clock.observe("node-2", 9);

        let json = serde_json::to_string(&clock).unwrap();
        let back: VectorClock = serde_json::from_str(&json).unwrap();
        assert_eq!(clock, back);
    }
}
