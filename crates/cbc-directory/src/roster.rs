//! Replicated records the directory is built from.

use cbc_core::clock::VectorClock;
use cbc_core::ids::{GroupId, PeerId};
use cbc_core::lww::{LwwRegister, Stamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Display name a peer chose for itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProfile {
    pub peer: PeerId,
    pub display_name: String,
}

impl PeerProfile {
    pub fn new(peer: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            peer,
            display_name: display_name.into(),
        }
    }
}

/// Read-only view of one group's roster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group: GroupId,
    pub name: String,
    pub members: BTreeSet<PeerId>,
    /// Merge of every applied event's clock.
    pub version: VectorClock,
}

/// Mutable replicated state of a group: an LWW name and one LWW presence
/// flag per peer that ever touched the roster.
#[derive(Clone, Debug, Default)]
pub(crate) struct GroupRecord {
    pub(crate) name: LwwRegister<String>,
    pub(crate) presence: BTreeMap<PeerId, LwwRegister<bool>>,
    pub(crate) version: VectorClock,
}

impl GroupRecord {
    pub(crate) fn set_present(&mut self, peer: &PeerId, present: bool, stamp: Stamp) -> bool {
        self.presence
            .entry(peer.clone())
            .or_default()
            .set(present, stamp)
    }

    pub(crate) fn members(&self) -> BTreeSet<PeerId> {
        self.presence
            .iter()
            .filter(|(_, flag)| flag.get().copied().unwrap_or(false))
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    pub(crate) fn has_member(&self, peer: &PeerId) -> bool {
        self.presence
            .get(peer)
            .and_then(|flag| flag.get().copied())
            .unwrap_or(false)
    }

    pub(crate) fn snapshot(&self, group: &GroupId) -> GroupMembership {
        GroupMembership {
            group: group.clone(),
            name: self
                .name
                .get()
                .cloned()
                .unwrap_or_else(|| group.as_str().to_string()),
            members: self.members(),
            version: self.version.clone(),
        }
    }
}
