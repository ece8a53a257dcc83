//! Directory replicas converge whatever order membership events arrive in.

use cbc_core::clock::Clock;
use cbc_core::event::{MembershipChange, MembershipEvent};
use cbc_core::ids::{GroupId, PeerId};
use cbc_directory::Directory;
use proptest::prelude::*;

/// A roster history for one group where three peers act concurrently after
/// a shared create.
fn history() -> Vec<MembershipEvent> {
    let group = GroupId::new("g1");
    let lobby = GroupId::lobby();
    let (a, b, c) = (PeerId::new("a"), PeerId::new("b"), PeerId::new("c"));

    let mut events = Vec::new();
    let mut emit = |clock: &mut Clock, group: &GroupId, actor: &PeerId, change| {
        let stamp = clock.increment(actor);
        let event = MembershipEvent::new(group.clone(), actor.clone(), stamp, change);
        events.push(event.clone());
        event
    };

    let mut ca = Clock::new();
    let create = emit(&mut ca, &group, &a, MembershipChange::Create { name: "general".into() });

    // b and c both saw the create, then acted independently
    let mut cb = Clock::new();
    cb.record_delivery(&create.actor, create.seq);
    let mut cc = cb.clone();

    emit(&mut cb, &group, &b, MembershipChange::Join);
    emit(&mut cc, &group, &c, MembershipChange::Join);
    emit(&mut cb, &group, &b, MembershipChange::Rename { name: "Bees".into() });
    emit(&mut cc, &group, &c, MembershipChange::Rename { name: "Sea".into() });
    emit(&mut ca, &group, &a, MembershipChange::Leave);
    emit(&mut cc, &group, &c, MembershipChange::Leave);

    let mut lobby_b = Clock::new();
    let mut lobby_c = Clock::new();
    emit(&mut lobby_b, &lobby, &b, MembershipChange::Profile { display_name: "Bea".into() });
    emit(&mut lobby_c, &lobby, &c, MembershipChange::Profile { display_name: "Cy".into() });
    emit(&mut lobby_b, &lobby, &b, MembershipChange::Profile { display_name: "Beatrix".into() });

    events
}

fn replay(events: &[MembershipEvent]) -> Directory {
    let mut dir = Directory::new();
    for event in events {
        dir.apply(event);
    }
    dir
}

#[test]
fn test_reference_outcome() {
    let dir = replay(&history());
    let g = dir.group(&GroupId::new("g1")).unwrap();

    // Rename by c wins the tie on weight by peer id
    assert_eq!(g.name, "Sea");
    assert_eq!(g.members, [PeerId::new("b")].into_iter().collect());
    assert_eq!(dir.display_name(&PeerId::new("b")), "Beatrix");
    assert_eq!(dir.search_users("y").len(), 1);
}

proptest! {
    #[test]
    fn directory_converges_under_permutation(events in Just(history()).prop_shuffle()) {
        let reference = replay(&history());
        let shuffled = replay(&events);

        prop_assert_eq!(shuffled.list_groups(), reference.list_groups());
        prop_assert_eq!(shuffled.list_users(), reference.list_users());
        prop_assert_eq!(
            shuffled.group(&GroupId::new("g1")),
            reference.group(&GroupId::new("g1"))
        );
    }
}
