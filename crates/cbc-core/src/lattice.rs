//! Join-semilattice abstraction.
//!
//! Vector clocks and LWW registers both merge by a least-upper-bound that is
//! commutative, associative and idempotent. Replicas that have seen the same
//! set of updates therefore hold the same value, whatever the order.

use std::cmp::Ordering;

pub trait Lattice: Clone + PartialEq {
    /// Identity element for [`join`](Lattice::join).
    fn bottom() -> Self;

    /// Least upper bound of `self` and `other`.
    fn join(&self, other: &Self) -> Self;

    /// Order induced by join: `a <= b` iff `a ⊔ b == b`. `None` when the two
    /// values are incomparable.
    fn partial_cmp_lattice(&self, other: &Self) -> Option<Ordering> {
        let joined = self.join(other);
        match (&joined == self, &joined == other) {
            (true, true) => Some(Ordering::Equal),
            (false, true) => Some(Ordering::Less),
            (true, false) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }

    fn leq(&self, other: &Self) -> bool {
        matches!(
            self.partial_cmp_lattice(other),
            Some(Ordering::Less) | Some(Ordering::Equal)
        )
    }

    fn join_assign(&mut self, other: &Self) {
        *self = self.join(other);
    }
}
