//! End-to-end behavior of several engines on one in-memory network.

use cbc_core::clock::CausalOrder;
use cbc_engine::{
    Body, ConnectionState, Engine, EngineConfig, EngineConfigBuilder, Frame, GroupId, LinkEvent,
    MemoryLink, MemoryNetwork, MembershipChange, MembershipEvent, Message, NetworkConfig, PeerId,
    PeerLink, VectorClock,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn peer(id: &str) -> PeerId {
    PeerId::new(id)
}

fn config(id: &str, bootstrap: &[&str]) -> EngineConfigBuilder {
    let mut builder = EngineConfig::builder()
        .peer_id(id)
        .display_name(id.to_uppercase())
        .reconnect_backoff(Duration::from_millis(10), Duration::from_millis(100));
    for other in bootstrap {
        builder = builder.bootstrap(*other, "memory");
    }
    builder
}

async fn start(net: &MemoryNetwork, config: EngineConfigBuilder) -> Engine<MemoryLink> {
    let config = config.build();
    let id = config.peer_id.clone().unwrap();
    Engine::start(config, Arc::new(net.endpoint(id))).await.unwrap()
}

async fn node(net: &MemoryNetwork, id: &str, bootstrap: &[&str]) -> Engine<MemoryLink> {
    start(net, config(id, bootstrap)).await
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

fn ids(history: &[Message]) -> BTreeSet<(PeerId, u64)> {
    history.iter().map(|m| (m.origin.clone(), m.seq)).collect()
}

/// No entry may be causally preceded by a later one.
fn assert_causal(history: &[Message]) {
    for (i, first) in history.iter().enumerate() {
        for second in &history[i + 1..] {
            assert_ne!(
                second.clock.compare(&first.clock),
                CausalOrder::Before,
                "{}:{} delivered before its predecessor {}:{}",
                first.origin,
                first.seq,
                second.origin,
                second.seq
            );
        }
    }
}

async fn all_live(engines: &[&Engine<MemoryLink>]) {
    for engine in engines {
        for other in engines {
            if engine.local_id() == other.local_id() {
                continue;
            }
            let target = other.local_id().clone();
            eventually("peers to go live", || engine.peer_state(&target) == ConnectionState::Live).await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_are_delivered_everywhere() {
    let net = MemoryNetwork::new(NetworkConfig::default());
    let x = node(&net, "x", &[]).await;
    let y = node(&net, "y", &["x"]).await;
    all_live(&[&x, &y]).await;

    let group = x.create_group("g").await.unwrap();
    eventually("y to learn of g", || y.group_info(&group).is_some()).await;
    y.join_group(&group).await.unwrap();
    eventually("x to see y join", || x.list_members(&group).len() == 2).await;

    // neither has seen the other's message when sending
    net.partition(&[peer("x")], &[peer("y")]).await;
    let hi = x.send_message(&group, "hi").await.unwrap();
    let hello = y.send_message(&group, "hello").await.unwrap();
    assert_eq!(hi.clock.compare(&hello.clock), CausalOrder::Concurrent);
    net.heal_all();

    eventually("x to receive hello", || x.history(&group).unwrap().len() == 2).await;
    eventually("y to receive hi", || y.history(&group).unwrap().len() == 2).await;

    let on_x = x.history(&group).unwrap();
    let on_y = y.history(&group).unwrap();
    assert_eq!(ids(&on_x), ids(&on_y));
    assert_causal(&on_x);
    assert_causal(&on_y);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reordered_frames_are_held_back() {
    let net = MemoryNetwork::new(NetworkConfig::default());
    let x = node(&net, "x", &[]).await;
    let z = node(&net, "z", &["x"]).await;
    all_live(&[&x, &z]).await;

    net.set_config(NetworkConfig::reordering(0.5).seed(7));
    let lobby = GroupId::lobby();
    for i in 0..20 {
        x.send_message(&lobby, format!("m{}", i)).await.unwrap();
    }

    let deadline = Instant::now() + WAIT;
    while z.history(&lobby).unwrap().len() < 20 {
        assert!(Instant::now() < deadline, "z never delivered all twenty");
        // the last frame of a burst can stay held back
        net.flush().await;
        sleep(Duration::from_millis(10)).await;
    }
    assert!(net.stats().reordered > 0);
    let texts: Vec<String> = z.history(&lobby).unwrap().into_iter().map(|m| m.payload).collect();
    let expected: Vec<String> = (0..20).map(|i| format!("m{}", i)).collect();
    assert_eq!(texts, expected);
    assert!(z.group_status(&lobby).unwrap().is_complete());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnect_backfills_the_gap() {
    let net = MemoryNetwork::new(NetworkConfig::default());
    let a = node(&net, "a", &[]).await;
    let b = node(&net, "b", &["a"]).await;
    let c = node(&net, "c", &["a", "b"]).await;
    all_live(&[&a, &b, &c]).await;

    let lobby = GroupId::lobby();
    a.send_message(&lobby, "before").await.unwrap();
    eventually("c to see the first message", || c.history(&lobby).unwrap().len() == 1).await;

    net.partition(&[peer("c")], &[peer("a"), peer("b")]).await;
    eventually("c to notice", || c.peer_state(&peer("a")) == ConnectionState::Disconnected).await;

    for i in 0..5 {
        a.send_message(&lobby, format!("a{}", i)).await.unwrap();
        b.send_message(&lobby, format!("b{}", i)).await.unwrap();
    }
    eventually("b to catch up with a", || b.history(&lobby).unwrap().len() == 11).await;
    assert_eq!(c.history(&lobby).unwrap().len(), 1);

    net.heal_all();
    eventually("c to backfill", || c.history(&lobby).unwrap().len() == 11).await;

    let reference = ids(&a.history(&lobby).unwrap());
    for engine in [&b, &c] {
        let history = engine.history(&lobby).unwrap();
        assert_eq!(ids(&history), reference);
        assert_causal(&history);
    }
    assert_eq!(
        c.group_status(&lobby).unwrap().delivered,
        a.group_status(&lobby).unwrap().delivered
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaotic_network_converges_once_healed() {
    let net = MemoryNetwork::new(NetworkConfig::chaotic().seed(42));
    let repair = Some(Duration::from_millis(50));
    let a = start(&net, config("a", &[]).anti_entropy(repair)).await;
    let b = start(&net, config("b", &["a"]).anti_entropy(repair)).await;
    let c = start(&net, config("c", &["a", "b"]).anti_entropy(repair)).await;
    let engines = [&a, &b, &c];
    for engine in engines {
        for other in engines {
            if engine.local_id() != other.local_id() {
                let target = other.local_id().clone();
                eventually("link up", || engine.peer_state(&target).is_connected()).await;
            }
        }
    }

    let lobby = GroupId::lobby();
    for round in 0..10 {
        for engine in engines {
            engine
                .send_message(&lobby, format!("{}-{}", engine.local_id(), round))
                .await
                .unwrap();
        }
    }

    // heal the links and leave the rest to the engines
    net.set_config(NetworkConfig::default());
    net.flush().await;
    eventually("histories to converge", || {
        engines.iter().all(|e| e.history(&lobby).unwrap().len() == 30)
    })
    .await;

    let reference = ids(&a.history(&lobby).unwrap());
    for engine in engines {
        let history = engine.history(&lobby).unwrap();
        assert_eq!(ids(&history), reference);
        assert_causal(&history);
        assert!(engine.group_status(&lobby).unwrap().is_complete());
    }
    assert!(net.stats().dropped > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gap_is_filled_by_a_peer_that_is_not_the_origin() {
    // a - b - c in a line; c never talks to a
    let net = MemoryNetwork::new(NetworkConfig::default());
    let a = start(&net, config("a", &[]).anti_entropy(None)).await;
    let b = start(&net, config("b", &["a"]).anti_entropy(None)).await;
    let c = start(&net, config("c", &["b"]).anti_entropy(None)).await;
    all_live(&[&a, &b]).await;
    all_live(&[&b, &c]).await;

    let lobby = GroupId::lobby();
    eventually("b to list every lobby member", || b.list_members(&lobby).len() == 3).await;

    let m1 = a.send_message(&lobby, "m1").await.unwrap();
    eventually("b to deliver m1", || b.history(&lobby).unwrap().len() == 1).await;
    let m2 = b.send_message(&lobby, "m2").await.unwrap();
    assert_eq!(m1.clock.compare(&m2.clock), CausalOrder::Before);

    // m2 reaches c directly, m1 only through b's answer to c's gap request
    eventually("c to deliver both", || c.history(&lobby).unwrap().len() == 2).await;
    let texts: Vec<String> = c.history(&lobby).unwrap().into_iter().map(|m| m.payload).collect();
    assert_eq!(texts, vec!["m1", "m2"]);
    let status = c.group_status(&lobby).unwrap();
    assert!(status.is_complete());
    assert_eq!(status.pending, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_member_does_not_block_anyone() {
    let net = MemoryNetwork::new(NetworkConfig::default());
    let repair = Some(Duration::from_millis(100));
    let ann = start(&net, config("ann", &[]).outbound_queue(32).anti_entropy(repair)).await;
    let bob = start(&net, config("bob", &["ann"]).outbound_queue(32).anti_entropy(repair)).await;
    all_live(&[&ann, &bob]).await;

    // a member whose inbox fills up and is never read
    net.set_config(NetworkConfig::default().capacity(16));
    let rogue = net.endpoint(peer("rogue"));
    let _unread = rogue.events().unwrap();
    rogue.connect(&peer("ann"), "memory").await.unwrap();
    eventually("ann to attach rogue", || ann.peer_state(&peer("rogue")).is_connected()).await;

    let lobby = GroupId::lobby();
    let join = MembershipEvent::new(
        lobby.clone(),
        peer("rogue"),
        VectorClock::from_entries([(peer("rogue"), 1)]),
        MembershipChange::Join,
    );
    let frame = Frame::new(Body::MembershipEvent { event: join });
    rogue.send(&peer("ann"), frame.encode().unwrap()).await.unwrap();
    eventually("rogue to join the lobby", || ann.list_members(&lobby).contains(&peer("rogue"))).await;

    let sends = timeout(Duration::from_secs(5), async {
        for i in 0..500 {
            ann.send_message(&lobby, format!("m{}", i)).await.unwrap();
        }
    })
    .await;
    assert!(sends.is_ok(), "send_message waited on a stalled peer");

    // ann still routes inbound frames and bob recovers whatever was dropped
    bob.send_message(&lobby, "still there?").await.unwrap();
    eventually("ann to hear from bob", || ann.history(&lobby).unwrap().len() == 501).await;
    eventually("bob to hold everything", || bob.history(&lobby).unwrap().len() == 501).await;
    assert_causal(&bob.history(&lobby).unwrap());
    assert_eq!(ids(&bob.history(&lobby).unwrap()), ids(&ann.history(&lobby).unwrap()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn directory_replicates_groups_and_profiles() {
    let net = MemoryNetwork::new(NetworkConfig::default());
    let ann = node(&net, "ann", &[]).await;
    let bob = node(&net, "bob", &["ann"]).await;
    all_live(&[&ann, &bob]).await;

    eventually("bob to know ann", || !bob.search_users("ANN").is_empty()).await;
    assert!(bob.search_users("zzz").is_empty());

    let group = ann.create_group("Rust Club").await.unwrap();
    ann.send_message(&group, "first").await.unwrap();
    ann.send_message(&group, "second").await.unwrap();

    eventually("bob to find the group", || bob.search_groups("rust").len() == 1).await;
    assert_eq!(bob.find_group("rust club").map(|g| g.group), Some(group.clone()));

    bob.join_group(&group).await.unwrap();
    eventually("bob to catch up on join", || {
        bob.history(&group).map(|h| h.len() == 2).unwrap_or(false)
    })
    .await;
    eventually("ann to see bob", || ann.list_members(&group).contains(&peer("bob"))).await;

    bob.rename_group(&group, "Rustaceans").await.unwrap();
    eventually("rename to reach ann", || {
        ann.group_info(&group).map(|g| g.name == "Rustaceans").unwrap_or(false)
    })
    .await;

    ann.rename_self("Annie").await.unwrap();
    eventually("profile to reach bob", || {
        bob.search_users("annie").iter().any(|p| p.peer == peer("ann"))
    })
    .await;

    bob.leave_group(&group).await.unwrap();
    eventually("ann to see bob leave", || !ann.list_members(&group).contains(&peer("bob"))).await;
    ann.send_message(&group, "after").await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(bob.history(&group).unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn direct_messages_reach_the_other_participant() {
    let net = MemoryNetwork::new(NetworkConfig::default());
    let ann = node(&net, "ann", &[]).await;
    let bob = node(&net, "bob", &["ann"]).await;
    all_live(&[&ann, &bob]).await;

    let sent = ann.send_direct(&peer("bob"), "psst").await.unwrap();
    let dm = sent.group.clone();
    assert!(dm.is_direct());

    eventually("bob to get the dm", || {
        bob.history(&dm).map(|h| h.len() == 1).unwrap_or(false)
    })
    .await;
    bob.send_direct(&peer("ann"), "hi back").await.unwrap();
    eventually("ann to get the reply", || ann.history(&dm).unwrap().len() == 2).await;

    // direct groups are not listed
    assert!(ann.list_groups().iter().all(|g| !g.group.is_direct()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn version_mismatch_drops_the_link() {
    let net = MemoryNetwork::new(NetworkConfig::default());
    let ann = node(&net, "ann", &[]).await;

    let rogue = net.endpoint(peer("rogue"));
    let mut events = rogue.events().unwrap();
    rogue.connect(&peer("ann"), "memory").await.unwrap();
    eventually("ann to attach rogue", || ann.peer_state(&peer("rogue")).is_connected()).await;

    let mut frame = Frame::new(Body::Hello {
        peer: peer("rogue"),
        display_name: "Rogue".to_string(),
    });
    frame.version = 99;
    rogue.send(&peer("ann"), frame.encode().unwrap()).await.unwrap();

    let dropped = timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if event == LinkEvent::Disconnected(peer("ann")) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(dropped);
    eventually("ann to mark rogue gone", || {
        ann.peer_state(&peer("rogue")) == ConnectionState::Disconnected
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_restores_history_and_identity() {
    let dir = tempfile::TempDir::new().unwrap();
    let build = || {
        EngineConfig::builder()
            .display_name("Ann")
            .data_dir(dir.path())
            .build()
    };

    let (id, group) = {
        let net = MemoryNetwork::new(NetworkConfig::default());
        let mut config = build();
        let id = config.resolve_peer_id().unwrap();
        let engine = Engine::start(config, Arc::new(net.endpoint(id.clone()))).await.unwrap();
        let group = engine.create_group("journal").await.unwrap();
        engine.send_message(&group, "one").await.unwrap();
        engine.send_message(&group, "two").await.unwrap();
        engine.shutdown();
        (id, group)
    };

    let net = MemoryNetwork::new(NetworkConfig::default());
    let mut config = build();
    assert_eq!(config.resolve_peer_id().unwrap(), id);
    let engine = Engine::start(config, Arc::new(net.endpoint(id.clone()))).await.unwrap();

    assert_eq!(engine.local_id(), &id);
    assert_eq!(engine.display_name(), "Ann");
    assert!(engine.my_groups().contains(&group));
    assert_eq!(engine.find_group("journal").map(|g| g.group), Some(group.clone()));

    let texts: Vec<String> = engine.history(&group).unwrap().into_iter().map(|m| m.payload).collect();
    assert_eq!(texts, vec!["one", "two"]);

    let third = engine.send_message(&group, "three").await.unwrap();
    assert_eq!(third.seq, 3);
}
