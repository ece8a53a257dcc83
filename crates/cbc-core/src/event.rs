//! Stamped events exchanged between nodes.
//!
//! Each group carries two independent causal streams: chat [`Message`]s and
//! [`MembershipEvent`]s. They share the [`CausalEvent`] interface so the same
//! delivery machinery orders both, but their clocks and sequence numbers
//! never mix.

use crate::clock::{is_deliverable, VectorClock};
use crate::ids::{GroupId, PeerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event that can be causally ordered within one stream of one group.
pub trait CausalEvent: Clone + std::fmt::Debug {
    fn group(&self) -> &GroupId;

    /// The peer that originated the event.
    fn origin(&self) -> &PeerId;

    /// Position of the event among its origin's events in this stream.
    fn seq(&self) -> u64;

    /// Snapshot of the origin's delivered clock when it produced the event.
    fn clock(&self) -> &VectorClock;

    /// Identity within a stream.
    fn id(&self) -> (PeerId, u64) {
        (self.origin().clone(), self.seq())
    }

    fn is_deliverable_at(&self, current: &VectorClock) -> bool {
        is_deliverable(self.clock(), self.origin(), current)
    }
}

/// A chat message. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub group: GroupId,
    pub origin: PeerId,
    pub seq: u64,
    pub clock: VectorClock,
    pub payload: String,
    /// Wall-clock send time, for display only.
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// Build a message from a freshly incremented clock.
    pub fn new(group: GroupId, origin: PeerId, clock: VectorClock, payload: impl Into<String>) -> Self {
        Self {
            seq: clock.get(&origin),
            group,
            origin,
            clock,
            payload: payload.into(),
            sent_at: Utc::now(),
        }
    }
}

impl CausalEvent for Message {
    fn group(&self) -> &GroupId {
        &self.group
    }

    fn origin(&self) -> &PeerId {
        &self.origin
    }

    fn seq(&self) -> u64 {
        self.seq
    }

    fn clock(&self) -> &VectorClock {
        &self.clock
    }
}

/// What a membership event does to the directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MembershipChange {
    /// Group formed; the actor becomes its first member.
    Create { name: String },
    Join,
    Leave,
    Rename { name: String },
    /// The actor's own display name. Carried on the lobby group.
    Profile { display_name: String },
}

/// A directory update, causally ordered within its group's membership stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub group: GroupId,
    pub actor: PeerId,
    pub seq: u64,
    pub clock: VectorClock,
    pub change: MembershipChange,
    pub sent_at: DateTime<Utc>,
}

impl MembershipEvent {
    pub fn new(group: GroupId, actor: PeerId, clock: VectorClock, change: MembershipChange) -> Self {
        Self {
            seq: clock.get(&actor),
            group,
            actor,
            clock,
            change,
            sent_at: Utc::now(),
        }
    }
}

impl CausalEvent for MembershipEvent {
    fn group(&self) -> &GroupId {
        &self.group
    }

    fn origin(&self) -> &PeerId {
        &self.actor
    }

    fn seq(&self) -> u64 {
        self.seq
    }

    fn clock(&self) -> &VectorClock {
        &self.clock
    }
}
