//! Vector clocks and the per-group delivery clock.
//!
//! A [`VectorClock`] maps every peer that ever originated an event in a
//! stream to the number of such events. Absent entries read as zero and are
//! never stored, so two clocks describing the same history are equal
//! regardless of how they were built.
//!
//! A [`Clock`] is the state a node keeps for one stream of one group:
//!
//! - `delivered`: the events already appended to the delivery log. Outgoing
//!   events are stamped from it and deliverability is decided against it.
//! - `seen`: the element-wise maximum of every clock received so far. The
//!   difference `seen - delivered` is what this node knows it is missing.
//!
//! # Delivery condition
//!
//! ```text
//! deliverable(m, V) ⇔ m.clock[origin] = V[origin] + 1
//!                   ∧ ∀q ≠ origin: m.clock[q] ≤ V[q]
//! ```
//!
//! The message is the next event expected from its sender and depends on
//! nothing the receiver has not already delivered.

use crate::ids::PeerId;
use crate::lattice::Lattice;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Causal relationship of one clock to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CausalOrder {
    Before,
    After,
    Concurrent,
    Equal,
}

/// Per-peer event counters for one stream of one group.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<PeerId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (PeerId, u64)>) -> Self {
        Self {
            entries: entries.into_iter().filter(|(_, n)| *n > 0).collect(),
        }
    }

    pub fn get(&self, peer: &PeerId) -> u64 {
        self.entries.get(peer).copied().unwrap_or(0)
    }

    /// Raise `peer`'s entry to `counter`. Never lowers it.
    pub fn observe(&mut self, peer: &PeerId, counter: u64) {
        if counter == 0 {
            return;
        }
        let entry = self.entries.entry(peer.clone()).or_insert(0);
        *entry = (*entry).max(counter);
    }

    /// Bump `peer`'s own entry, returning the new counter.
    pub fn increment(&mut self, peer: &PeerId) -> u64 {
        let entry = self.entries.entry(peer.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Element-wise maximum, in place.
    pub fn merge(&mut self, other: &VectorClock) {
        for (peer, &counter) in &other.entries {
            self.observe(peer, counter);
        }
    }

    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        compare(self, other)
    }

    /// `self[p] >= other[p]` for every peer.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .entries
            .iter()
            .all(|(peer, &counter)| self.get(peer) >= counter)
    }

    /// Whether the event `(peer, counter)` is covered by this clock.
    pub fn contains(&self, peer: &PeerId, counter: u64) -> bool {
        self.get(peer) >= counter
    }

    /// Ranges `(peer, first, last)` present here but not in `other`.
    pub fn diff(&self, other: &VectorClock) -> Vec<(PeerId, u64, u64)> {
        self.entries
            .iter()
            .filter_map(|(peer, &counter)| {
                let theirs = other.get(peer);
                (counter > theirs).then(|| (peer.clone(), theirs + 1, counter))
            })
            .collect()
    }

    /// Total number of events covered. Grows along causal order and
    /// saturates at `u64::MAX`.
    pub fn weight(&self) -> u64 {
        self.entries
            .values()
            .fold(0u64, |total, &counter| total.saturating_add(counter))
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &u64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Decoded clocks may carry explicit zeros; they compare equal to absent ones.
impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        compare(self, other) == CausalOrder::Equal
    }
}

impl Eq for VectorClock {}

impl Lattice for VectorClock {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        self.merged(other)
    }
}

/// Partial-order comparison of `a` against `b`.
pub fn compare(a: &VectorClock, b: &VectorClock) -> CausalOrder {
    let peers: BTreeSet<&PeerId> = a.entries.keys().chain(b.entries.keys()).collect();

    let mut a_less = false;
    let mut b_less = false;
    for peer in peers {
        let (x, y) = (a.get(peer), b.get(peer));
        if x < y {
            a_less = true;
        }
        if y < x {
            b_less = true;
        }
    }

    match (a_less, b_less) {
        (false, false) => CausalOrder::Equal,
        (true, false) => CausalOrder::Before,
        (false, true) => CausalOrder::After,
        (true, true) => CausalOrder::Concurrent,
    }
}

/// The causal delivery condition for an event from `origin` stamped with
/// `candidate`, evaluated against the receiver's delivered clock `current`.
pub fn is_deliverable(candidate: &VectorClock, origin: &PeerId, current: &VectorClock) -> bool {
    if candidate.get(origin) != current.get(origin) + 1 {
        return false;
    }
    candidate
        .iter()
        .filter(|(peer, _)| *peer != origin)
        .all(|(peer, &counter)| counter <= current.get(peer))
}

/// Delivery clock of one stream of one group.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Clock {
    delivered: VectorClock,
    seen: VectorClock,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted delivered vector.
    pub fn restore(delivered: VectorClock) -> Self {
        Self {
            seen: delivered.clone(),
            delivered,
        }
    }

    /// Stamp a locally originated event.
    ///
    /// The returned snapshot is the delivered clock with `self_peer` bumped,
    /// so the event depends on exactly what this node has delivered.
    pub fn increment(&mut self, self_peer: &PeerId) -> VectorClock {
        self.delivered.increment(self_peer);
        self.seen.merge(&self.delivered);
        self.delivered.clone()
    }

    /// Fold a received stamp into the max-seen vector.
    pub fn merge(&mut self, incoming: &VectorClock) {
        self.seen.merge(incoming);
    }

    pub fn is_deliverable(&self, origin: &PeerId, candidate: &VectorClock) -> bool {
        is_deliverable(candidate, origin, &self.delivered)
    }

    /// Whether `(origin, seq)` was already delivered.
    pub fn has_delivered(&self, origin: &PeerId, seq: u64) -> bool {
        self.delivered.contains(origin, seq)
    }

    /// Advance the delivered vector after an append.
    pub fn record_delivery(&mut self, origin: &PeerId, seq: u64) {
        self.delivered.observe(origin, seq);
        self.seen.observe(origin, seq);
    }

    pub fn delivered(&self) -> &VectorClock {
        &self.delivered
    }

    pub fn seen(&self) -> &VectorClock {
        &self.seen
    }

    /// Events known to exist but not delivered yet.
    pub fn missing(&self) -> Vec<(PeerId, u64, u64)> {
        self.seen.diff(&self.delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vc(entries: &[(&str, u64)]) -> VectorClock {
        VectorClock::from_entries(entries.iter().map(|(p, n)| (PeerId::new(*p), *n)))
    }

    #[test]
    fn test_compare_orders() {
        let a = vc(&[("x", 1)]);
        let b = vc(&[("x", 2)]);
        let c = vc(&[("y", 1)]);

        assert_eq!(compare(&a, &b), CausalOrder::Before);
        assert_eq!(compare(&b, &a), CausalOrder::After);
        assert_eq!(compare(&a, &c), CausalOrder::Concurrent);
        assert_eq!(compare(&a, &a.clone()), CausalOrder::Equal);
        assert_eq!(compare(&VectorClock::new(), &a), CausalOrder::Before);
    }

    #[test]
    fn test_explicit_zero_equals_absent() {
        let json = r#"{"entries":{"x":1,"y":0}}"#;
        let decoded: VectorClock = serde_json::from_str(json).unwrap();
        assert_eq!(decoded, vc(&[("x", 1)]));
    }

    #[test]
    fn test_merge_takes_max() {
        let mut a = vc(&[("x", 3), ("y", 1)]);
        a.merge(&vc(&[("x", 1), ("y", 4), ("z", 2)]));
        assert_eq!(a, vc(&[("x", 3), ("y", 4), ("z", 2)]));
    }

    #[test]
    fn test_deliverable_next_from_sender() {
        let x = PeerId::new("x");
        let current = vc(&[("x", 1), ("y", 2)]);

        assert!(is_deliverable(&vc(&[("x", 2), ("y", 2)]), &x, &current));
        assert!(is_deliverable(&vc(&[("x", 2)]), &x, &current));
        // skips x:2
        assert!(!is_deliverable(&vc(&[("x", 3)]), &x, &current));
        // already delivered
        assert!(!is_deliverable(&vc(&[("x", 1)]), &x, &current));
        // depends on y:3
        assert!(!is_deliverable(&vc(&[("x", 2), ("y", 3)]), &x, &current));
    }

    #[test]
    fn test_second_message_not_deliverable_on_empty_clock() {
        let x = PeerId::new("x");
        assert!(!is_deliverable(&vc(&[("x", 2)]), &x, &VectorClock::new()));
        assert!(is_deliverable(&vc(&[("x", 1)]), &x, &VectorClock::new()));
    }

    #[test]
    fn test_clock_increment_stamps_delivered_history() {
        let me = PeerId::new("me");
        let mut clock = Clock::new();
        clock.record_delivery(&PeerId::new("other"), 1);

        let stamp = clock.increment(&me);
        assert_eq!(stamp, vc(&[("me", 1), ("other", 1)]));
        assert_eq!(clock.delivered(), &stamp);
    }

    #[test]
    fn test_clock_merge_only_touches_seen() {
        let x = PeerId::new("x");
        let mut clock = Clock::new();
        clock.merge(&vc(&[("x", 2)]));

        assert!(clock.delivered().is_empty());
        assert_eq!(clock.seen().get(&x), 2);
        assert_eq!(clock.missing(), vec![(x.clone(), 1, 2)]);
        assert!(clock.is_deliverable(&x, &vc(&[("x", 1)])));

        clock.record_delivery(&x, 1);
        clock.record_delivery(&x, 2);
        assert!(clock.missing().is_empty());
        assert!(clock.has_delivered(&x, 2));
    }

    #[test]
    fn test_diff_and_weight() {
        let a = vc(&[("x", 5), ("y", 2)]);
        let b = vc(&[("x", 3), ("y", 2)]);
        assert_eq!(a.diff(&b), vec![(PeerId::new("x"), 4, 5)]);
        assert!(b.diff(&a).is_empty());
        assert_eq!(a.weight(), 7);
    }

    #[test]
    fn test_weight_saturates() {
        let huge = vc(&[("x", u64::MAX), ("y", u64::MAX), ("z", 1)]);
        assert_eq!(huge.weight(), u64::MAX);
    }

    #[test]
    fn test_lattice_order_matches_compare() {
        let a = vc(&[("x", 1)]);
        let b = vc(&[("x", 1), ("y", 1)]);
        assert!(a.leq(&b));
        assert!(!b.leq(&a));
        assert_eq!(a.join(&VectorClock::bottom()), a);
    }
}
