//! Notifications for the application layer.

use crate::peers::ConnectionState;
use cbc_core::clock::VectorClock;
use cbc_core::event::{MembershipEvent, Message};
use cbc_core::ids::{GroupId, PeerId};
use std::collections::BTreeSet;

/// Events published on [`Engine::subscribe`](crate::Engine::subscribe).
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// A chat message reached the delivery log of a group this node is in.
    Delivered { group: GroupId, message: Message },
    /// A membership or profile event was applied to the directory.
    Directory { event: MembershipEvent },
    PeerState { peer: PeerId, state: ConnectionState },
    /// Chat is known to exist that has not been delivered yet.
    HistoryIncomplete {
        group: GroupId,
        missing: Vec<(PeerId, u64, u64)>,
    },
}

/// Delivery bookkeeping of one group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupStatus {
    pub group: GroupId,
    pub active: bool,
    pub members: BTreeSet<PeerId>,
    pub delivered: VectorClock,
    pub seen: VectorClock,
    pub pending: usize,
    pub membership_pending: usize,
    /// `(peer, first, last)` ranges of chat seen but not delivered.
    pub missing: Vec<(PeerId, u64, u64)>,
}

impl GroupStatus {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.pending == 0
    }
}
