use anyhow::{bail, Context};
use async_stream::stream;
use cbc_core::clock::CausalOrder;
use cbc_engine::{
    ConnectionState, Engine, EngineConfig, GroupId, MemoryLink, MemoryNetwork, Message, NetworkConfig,
    NetworkStats, PeerId,
};
use colored::*;
use futures::stream::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(20);
const POLL: Duration = Duration::from_millis(20);
const ANTI_ENTROPY: Duration = Duration::from_millis(200);

/// Summary of a chaos run
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub peers: usize,
    pub messages: usize,
    pub network: NetworkStats,
    pub polls: usize,
    pub converged_in: Duration,
    pub causal: bool,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Chaos Simulation Statistics                   ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Peers:                     {:>30} ║", self.peers);
        println!("║  Messages sent:             {:>30} ║", self.messages);
        println!("║  Frames sent:               {:>30} ║", self.network.sent);
        println!("║  Frames dropped:            {:>30} ║", self.network.dropped);
        println!("║  Frames duplicated:         {:>30} ║", self.network.duplicated);
        println!("║  Frames reordered:          {:>30} ║", self.network.reordered);
        println!("║  Convergence polls:         {:>30} ║", self.polls);
        println!("║  Converged in:              {:>29}s ║", format!("{:.3}", self.converged_in.as_secs_f64()));
        println!(
            "║  Causal order held:         {:>30} ║",
            if self.causal { "yes" } else { "NO" }
        );
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

// ─── Pretty printing ──────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

fn show_history(engine: &Engine<MemoryLink>, group: &GroupId) -> anyhow::Result<()> {
    let history = engine.history(group)?;
    println!(
        "  {} {}",
        engine.local_id().to_string().bright_magenta(),
        format!("({} delivered)", history.len()).dimmed()
    );
    for message in &history {
        println!(
            "    {}#{:<3} {}",
            message.origin.to_string().bright_yellow(),
            message.seq,
            message.payload
        );
    }
    Ok(())
}

// ─── Cluster ──────────────────────────────────────────────────────────────

/// Engines on one in-memory network, every pair connected.
struct Cluster {
    net: MemoryNetwork,
    engines: Vec<Engine<MemoryLink>>,
}

impl Cluster {
    async fn start(names: &[&str], network: NetworkConfig) -> anyhow::Result<Self> {
        let net = MemoryNetwork::new(network);
        let mut engines = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let mut builder = EngineConfig::builder()
                .peer_id(*name)
                .display_name(*name)
                .reconnect_backoff(Duration::from_millis(20), Duration::from_millis(200))
                .anti_entropy(Some(ANTI_ENTROPY));
            for earlier in &names[..i] {
                builder = builder.bootstrap(*earlier, "memory");
            }
            let link = Arc::new(net.endpoint(PeerId::new(*name)));
            let engine = Engine::start(builder.build(), link)
                .await
                .with_context(|| format!("starting {}", name))?;
            engines.push(engine);
        }
        Ok(Self { net, engines })
    }

    fn ids(&self) -> Vec<PeerId> {
        self.engines.iter().map(|e| e.local_id().clone()).collect()
    }

    async fn wait_until(&self, what: &str, check: impl Fn(&Self) -> bool) -> anyhow::Result<()> {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        while !check(self) {
            if Instant::now() > deadline {
                bail!("timed out waiting for {}", what);
            }
            tokio::time::sleep(POLL).await;
        }
        Ok(())
    }

    async fn wait_connected(&self) -> anyhow::Result<()> {
        self.wait_until("every link to come up", |cluster| {
            cluster.engines.iter().all(|engine| {
                cluster
                    .ids()
                    .iter()
                    .filter(|id| *id != engine.local_id())
                    .all(|id| engine.peer_state(id).is_connected())
            })
        })
        .await
    }

    fn delivered_everywhere(&self, group: &GroupId, expected: usize) -> bool {
        self.engines
            .iter()
            .all(|e| e.history(group).map(|h| h.len() == expected).unwrap_or(false))
    }

    /// Release held frames and wait for the engines' own repair rounds to
    /// bring every node to `expected` messages. Returns how many polls it took.
    async fn converge(&self, group: &GroupId, expected: usize) -> anyhow::Result<usize> {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        self.net.flush().await;
        let mut polls = 0;
        while !self.delivered_everywhere(group, expected) {
            if Instant::now() > deadline {
                bail!("histories did not converge on {} messages", expected);
            }
            polls += 1;
            tokio::time::sleep(POLL).await;
        }
        Ok(polls)
    }
}

fn is_causal(history: &[Message]) -> bool {
    history.iter().enumerate().all(|(i, first)| {
        history[i + 1..]
            .iter()
            .all(|second| second.clock.compare(&first.clock) != CausalOrder::Before)
    })
}

/// Random `(sender, text)` pairs.
fn send_schedule(peers: usize, messages: usize, seed: u64) -> impl Stream<Item = (usize, String)> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        for i in 0..messages {
            let sender = rng.gen_range(0..peers);
            yield (sender, format!("msg-{}", i));
        }
    }
}

// ─── Scenarios ────────────────────────────────────────────────────────────

pub async fn demo() -> anyhow::Result<()> {
    header("Concurrent sends");
    let cluster = Cluster::start(&["x", "y"], NetworkConfig::default()).await?;
    cluster.wait_connected().await?;
    let (x, y) = (&cluster.engines[0], &cluster.engines[1]);
    let lobby = GroupId::lobby();

    section("x and y lose contact, then both speak");
    cluster.net.partition(&[PeerId::new("x")], &[PeerId::new("y")]).await;
    let hi = x.send_message(&lobby, "hi").await?;
    let hello = y.send_message(&lobby, "hello").await?;
    step(&format!("x sent \"hi\"    with clock {:?}", hi.clock));
    step(&format!("y sent \"hello\" with clock {:?}", hello.clock));
    step(&format!("compare: {:?}", hi.clock.compare(&hello.clock)));

    section("Link restored");
    cluster.net.heal_all();
    cluster
        .wait_until("both messages everywhere", |c| c.delivered_everywhere(&lobby, 2))
        .await?;
    for engine in &cluster.engines {
        show_history(engine, &lobby)?;
    }
    step(&"Both nodes delivered both messages".bright_green().to_string());
    Ok(())
}

pub async fn reorder(messages: usize) -> anyhow::Result<()> {
    header("Out-of-order arrival");
    let cluster = Cluster::start(&["x", "z"], NetworkConfig::default()).await?;
    cluster
        .wait_until("z to go live", |c| {
            c.engines[1].peer_state(&PeerId::new("x")) == ConnectionState::Live
        })
        .await?;
    let lobby = GroupId::lobby();

    section(&format!("x sends {} messages over a reordering link", messages));
    cluster.net.set_config(NetworkConfig::reordering(0.5).seed(7));
    for i in 0..messages {
        cluster.engines[0].send_message(&lobby, format!("m{}", i)).await?;
    }

    let z = &cluster.engines[1];
    let status = z.group_status(&lobby)?;
    step(&format!(
        "z holds {} back, missing {:?}",
        status.pending, status.missing
    ));

    let rounds = cluster.converge(&lobby, messages).await?;
    step(&format!(
        "{} frames reordered, settled after {} flushes",
        cluster.net.stats().reordered,
        rounds
    ));
    show_history(z, &lobby)?;

    let in_order = z
        .history(&lobby)?
        .iter()
        .enumerate()
        .all(|(i, m)| m.seq == i as u64 + 1);
    if !in_order {
        bail!("z delivered x's messages out of order");
    }
    step(&"Delivered in send order".bright_green().to_string());
    Ok(())
}

pub async fn partition(messages: usize) -> anyhow::Result<()> {
    header("Partition and heal");
    let cluster = Cluster::start(&["a", "b", "c", "d"], NetworkConfig::default()).await?;
    cluster.wait_connected().await?;
    let ids = cluster.ids();
    let (left, right) = ids.split_at(2);
    let group = cluster.engines[0].create_group("expedition").await?;
    cluster
        .wait_until("everyone to see the group", |c| {
            c.engines.iter().all(|e| e.group_info(&group).is_some())
        })
        .await?;
    for engine in &cluster.engines[1..] {
        engine.join_group(&group).await?;
    }
    cluster
        .wait_until("all four members", |c| {
            c.engines.iter().all(|e| e.list_members(&group).len() == 4)
        })
        .await?;

    section("Split {a, b} | {c, d}");
    cluster.net.partition(left, right).await;
    for round in 0..messages {
        for engine in &cluster.engines {
            engine
                .send_message(&group, format!("{} says {}", engine.local_id(), round))
                .await?;
        }
    }
    let half = messages * 2;
    cluster
        .wait_until("each side to agree internally", |c| c.delivered_everywhere(&group, half))
        .await?;
    for engine in &cluster.engines {
        let status = engine.group_status(&group)?;
        step(&format!(
            "{} has {} messages, {} pending",
            engine.local_id(),
            engine.history(&group)?.len(),
            status.pending
        ));
    }

    section("Heal");
    cluster.net.heal_all();
    let total = messages * cluster.engines.len();
    cluster
        .wait_until("backfill", |c| c.delivered_everywhere(&group, total))
        .await?;
    for engine in &cluster.engines {
        let history = engine.history(&group)?;
        step(&format!(
            "{} has {} messages, causal: {}",
            engine.local_id(),
            history.len(),
            is_causal(&history)
        ));
    }
    step(&"Every node caught up".bright_green().to_string());
    Ok(())
}

pub async fn chaos(peers: usize, messages: usize, seed: u64) -> anyhow::Result<SimulationStats> {
    if peers < 2 {
        bail!("chaos needs at least two peers");
    }
    header(&format!("Chaos: {} peers, {} messages, seed {}", peers, messages, seed));
    let names: Vec<String> = (0..peers).map(|i| format!("p{}", i)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let cluster = Cluster::start(&refs, NetworkConfig::default()).await?;
    cluster.wait_connected().await?;
    let lobby = GroupId::lobby();

    section("Sending over a lossy network");
    cluster.net.set_config(NetworkConfig::chaotic().seed(seed));
    let start = Instant::now();
    let mut schedule = Box::pin(send_schedule(peers, messages, seed));
    let mut sent = 0;
    while let Some((sender, text)) = schedule.next().await {
        cluster.engines[sender].send_message(&lobby, text).await?;
        sent += 1;
        if sent % 10 == 0 {
            println!("  Messages sent: {}/{}", sent, messages);
        }
    }

    section("Network repaired, waiting for repair rounds");
    let network = cluster.net.stats();
    cluster.net.set_config(NetworkConfig::default());
    let polls = cluster.converge(&lobby, messages).await?;
    let converged_in = start.elapsed();

    let mut causal = true;
    for engine in &cluster.engines {
        causal &= is_causal(&engine.history(&lobby)?);
    }

    Ok(SimulationStats {
        peers,
        messages,
        network,
        polls,
        converged_in,
        causal,
    })
}
