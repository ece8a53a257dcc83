//! The directory service.

use crate::roster::{GroupMembership, GroupRecord, PeerProfile};
use cbc_core::clock::VectorClock;
use cbc_core::event::{MembershipChange, MembershipEvent};
use cbc_core::ids::{GroupId, PeerId};
use cbc_core::lww::{LwwRegister, Stamp};
use std::collections::{BTreeSet, HashMap};
use tracing::trace;

/// Locally converged knowledge of peer names and group rosters.
///
/// Every update is an LWW write ordered by [`Stamp::supersedes`], so two
/// directories that applied the same set of events agree on every query
/// whatever order the events arrived in. Queries never leave the node.
#[derive(Clone, Debug, Default)]
pub struct Directory {
    profiles: HashMap<PeerId, LwwRegister<String>>,
    groups: HashMap<GroupId, GroupRecord>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer's display name. Returns whether the stored name changed.
    pub fn apply_profile_update(&mut self, profile: PeerProfile, stamp: Stamp) -> bool {
        let changed = self
            .profiles
            .entry(profile.peer)
            .or_default()
            .set(profile.display_name, stamp);
        if !changed {
            trace!("stale profile update ignored");
        }
        changed
    }

    /// Apply one roster change made by `actor` at `clock`.
    pub fn apply_membership_event(
        &mut self,
        group: &GroupId,
        change: &MembershipChange,
        actor: &PeerId,
        clock: &VectorClock,
    ) -> bool {
        let stamp = Stamp::new(clock.clone(), actor.clone());

        if let MembershipChange::Profile { display_name } = change {
            return self.apply_profile_update(PeerProfile::new(actor.clone(), display_name.clone()), stamp);
        }

        let record = self.groups.entry(group.clone()).or_default();
        record.version.merge(clock);
        let changed = match change {
            MembershipChange::Create { name } => {
                let named = record.name.set(name.clone(), stamp.clone());
                let joined = record.set_present(actor, true, stamp);
                named || joined
            }
            MembershipChange::Join => record.set_present(actor, true, stamp),
            MembershipChange::Leave => record.set_present(actor, false, stamp),
            MembershipChange::Rename { name } => record.name.set(name.clone(), stamp),
            MembershipChange::Profile { .. } => false,
        };
        trace!(group = %group, actor = %actor, ?change, changed, "applied membership change");
        changed
    }

    /// Convenience over [`Directory::apply_membership_event`].
    pub fn apply(&mut self, event: &MembershipEvent) -> bool {
        self.apply_membership_event(&event.group, &event.change, &event.actor, &event.clock)
    }

    pub fn profile(&self, peer: &PeerId) -> Option<PeerProfile> {
        self.profiles
            .get(peer)
            .and_then(|reg| reg.get())
            .map(|name| PeerProfile::new(peer.clone(), name.clone()))
    }

    /// Display name of `peer`, falling back to its id.
    pub fn display_name(&self, peer: &PeerId) -> String {
        self.profile(peer)
            .map(|p| p.display_name)
            .unwrap_or_else(|| peer.to_string())
    }

    /// Every peer with a known profile, sorted by name then id.
    pub fn list_users(&self) -> Vec<PeerProfile> {
        let mut users: Vec<PeerProfile> = self
            .profiles
            .keys()
            .filter_map(|peer| self.profile(peer))
            .collect();
        users.sort_by(|a, b| {
            (a.display_name.to_lowercase(), &a.peer).cmp(&(b.display_name.to_lowercase(), &b.peer))
        });
        users
    }

    /// Case-insensitive substring search over display names.
    pub fn search_users(&self, query: &str) -> Vec<PeerProfile> {
        let needle = query.to_lowercase();
        self.list_users()
            .into_iter()
            .filter(|p| p.display_name.to_lowercase().contains(&needle))
            .collect()
    }

    /// Snapshot of a group. Direct-message groups always resolve to their
    /// two participants.
    pub fn group(&self, group: &GroupId) -> Option<GroupMembership> {
        if let Some((a, b)) = group.direct_participants() {
            return Some(GroupMembership {
                group: group.clone(),
                name: format!("{} & {}", self.display_name(&a), self.display_name(&b)),
                members: [a, b].into_iter().collect(),
                version: self
                    .groups
                    .get(group)
                    .map(|r| r.version.clone())
                    .unwrap_or_default(),
            });
        }
        self.groups.get(group).map(|record| record.snapshot(group))
    }

    /// Named groups with at least one member, sorted by name then id.
    pub fn list_groups(&self) -> Vec<GroupMembership> {
        let mut groups: Vec<GroupMembership> = self
            .groups
            .iter()
            .filter(|(id, record)| !id.is_direct() && !record.members().is_empty())
            .map(|(id, record)| record.snapshot(id))
            .collect();
        groups.sort_by(|a, b| (a.name.to_lowercase(), &a.group).cmp(&(b.name.to_lowercase(), &b.group)));
        groups
    }

    /// Case-insensitive substring search over group names.
    pub fn search_groups(&self, query: &str) -> Vec<GroupMembership> {
        let needle = query.to_lowercase();
        self.list_groups()
            .into_iter()
            .filter(|g| g.name.to_lowercase().contains(&needle))
            .collect()
    }

    /// First visible group whose name matches `name` ignoring case.
    pub fn find_group_by_name(&self, name: &str) -> Option<GroupMembership> {
        let wanted = name.to_lowercase();
        self.list_groups()
            .into_iter()
            .find(|g| g.name.to_lowercase() == wanted)
    }

    pub fn list_members(&self, group: &GroupId) -> BTreeSet<PeerId> {
        self.group(group).map(|g| g.members).unwrap_or_default()
    }

    pub fn is_member(&self, group: &GroupId, peer: &PeerId) -> bool {
        if let Some((a, b)) = group.direct_participants() {
            return &a == peer || &b == peer;
        }
        self.groups
            .get(group)
            .map_or(false, |record| record.has_member(peer))
    }

    /// Visible groups `peer` currently belongs to.
    pub fn groups_of(&self, peer: &PeerId) -> Vec<GroupId> {
        self.list_groups()
            .into_iter()
            .filter(|g| g.members.contains(peer))
            .map(|g| g.group)
            .collect()
    }

    /// Every group with a record, hidden ones included.
    pub fn known_groups(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self.groups.keys().cloned().collect();
        ids.sort();
        ids
    }
}
