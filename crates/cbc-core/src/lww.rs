//! Last-Writer-Wins register ordered by vector-clock stamps.
//!
//! A write replaces the stored one when its stamp is causally after it. For
//! concurrent stamps the one with the larger `(weight, actor)` wins, where
//! weight is the number of events the clock covers. Short of saturating at
//! `u64::MAX`, weight strictly grows along causal order, so `(weight, actor)` is a total order that extends
//! causality and every replica keeps the same winner whatever order the
//! writes arrive in. For two concurrent first writes the weights tie and the
//! lexicographically greater [`PeerId`] wins.

use crate::clock::{CausalOrder, VectorClock};
use crate::ids::PeerId;
use crate::lattice::Lattice;
use serde::{Deserialize, Serialize};

/// Causal stamp of a directory write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: VectorClock,
    pub actor: PeerId,
}

impl Stamp {
    pub fn new(clock: VectorClock, actor: PeerId) -> Self {
        Self { clock, actor }
    }

    /// Whether a write stamped `self` replaces one stamped `other`.
    pub fn supersedes(&self, other: &Stamp) -> bool {
        match self.clock.compare(&other.clock) {
            CausalOrder::After => true,
            CausalOrder::Before => false,
            CausalOrder::Equal | CausalOrder::Concurrent => {
                (self.clock.weight(), &self.actor) > (other.clock.weight(), &other.actor)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    value: Option<T>,
    stamp: Option<Stamp>,
}

impl<T: Clone + PartialEq> LwwRegister<T> {
    pub fn new() -> Self {
        Self {
            value: None,
            stamp: None,
        }
    }

    /// Write `value` if `stamp` supersedes the current one. Returns whether
    /// the register changed.
    pub fn set(&mut self, value: T, stamp: Stamp) -> bool {
        let wins = match &self.stamp {
            None => true,
            Some(current) => stamp.supersedes(current),
        };
        if wins {
            self.value = Some(value);
            self.stamp = Some(stamp);
        }
        wins
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn stamp(&self) -> Option<&Stamp> {
        self.stamp.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }
}

impl<T: Clone + PartialEq> Default for LwwRegister<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + PartialEq> Lattice for LwwRegister<T> {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        match (&self.stamp, &other.stamp) {
            (_, None) => self.clone(),
            (None, Some(_)) => other.clone(),
            (Some(ours), Some(theirs)) => {
                if theirs.supersedes(ours) {
                    other.clone()
                } else {
                    self.clone()
                }
            }
        }
    }
}
