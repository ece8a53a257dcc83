//! In-process links over a shared hub, for tests and simulations.
//!
//! The hub can lose, duplicate and reorder frames according to a
//! [`NetworkConfig`], and can sever pairs of peers to model partitions.
//! Randomness comes from a seeded generator so a run can be repeated.

use super::{LinkEvent, PeerLink};
use crate::error::LinkError;
use async_trait::async_trait;
use bytes::Bytes;
use cbc_core::ids::PeerId;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Fault injection settings for a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Probability of frame loss (0.0 - 1.0)
    pub loss_rate: f64,
    /// Probability of frame duplication (0.0 - 1.0)
    pub dup_rate: f64,
    /// Probability a frame is held back behind the next one (0.0 - 1.0)
    pub reorder_rate: f64,
    pub seed: u64,
    /// Events an endpoint buffers before the hub waits on it.
    pub capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            dup_rate: 0.0,
            reorder_rate: 0.0,
            seed: 12345,
            capacity: 4096,
        }
    }
}

impl NetworkConfig {
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            ..Default::default()
        }
    }

    pub fn with_dups(dup_rate: f64) -> Self {
        Self {
            dup_rate,
            ..Default::default()
        }
    }

    pub fn reordering(reorder_rate: f64) -> Self {
        Self {
            reorder_rate,
            ..Default::default()
        }
    }

    /// All problems at once.
    pub fn chaotic() -> Self {
        Self {
            loss_rate: 0.1,
            dup_rate: 0.2,
            reorder_rate: 0.3,
            ..Default::default()
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Frame counters, for simulation summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
}

struct NetState {
    config: NetworkConfig,
    rng: StdRng,
    endpoints: HashMap<PeerId, mpsc::Sender<LinkEvent>>,
    links: HashSet<(PeerId, PeerId)>,
    severed: HashSet<(PeerId, PeerId)>,
    /// One held-back frame per direction.
    held: HashMap<(PeerId, PeerId), Bytes>,
    stats: NetworkStats,
}

impl NetState {
    fn roll(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.gen::<f64>() < rate
    }

    fn unlink(&mut self, a: &PeerId, b: &PeerId) -> Vec<(mpsc::Sender<LinkEvent>, LinkEvent)> {
        if !self.links.remove(&pair(a, b)) {
            return Vec::new();
        }
        self.held.remove(&(a.clone(), b.clone()));
        self.held.remove(&(b.clone(), a.clone()));
        let mut out = Vec::new();
        if let Some(tx) = self.endpoints.get(a) {
            out.push((tx.clone(), LinkEvent::Disconnected(b.clone())));
        }
        if let Some(tx) = self.endpoints.get(b) {
            out.push((tx.clone(), LinkEvent::Disconnected(a.clone())));
        }
        out
    }
}

fn pair(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

async fn dispatch(events: Vec<(mpsc::Sender<LinkEvent>, LinkEvent)>) {
    for (tx, event) in events {
        if tx.send(event).await.is_err() {
            trace!("endpoint closed, event dropped");
        }
    }
}

/// Shared hub every [`MemoryLink`] of a simulation is attached to.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

impl MemoryNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetState {
                rng: StdRng::seed_from_u64(config.seed),
                config,
                endpoints: HashMap::new(),
                links: HashSet::new(),
                severed: HashSet::new(),
                held: HashMap::new(),
                stats: NetworkStats::default(),
            })),
        }
    }

    /// Attach a peer to the hub.
    pub fn endpoint(&self, peer: PeerId) -> MemoryLink {
        let mut state = self.state.lock();
        let (tx, rx) = mpsc::channel(state.config.capacity.max(1));
        state.endpoints.insert(peer.clone(), tx);
        drop(state);
        MemoryLink {
            local: peer,
            network: self.clone(),
            events: Mutex::new(Some(rx)),
        }
    }

    /// Replace the fault settings. The random stream is reseeded.
    pub fn set_config(&self, config: NetworkConfig) {
        let mut state = self.state.lock();
        state.rng = StdRng::seed_from_u64(config.seed);
        state.config = config;
    }

    pub fn stats(&self) -> NetworkStats {
        self.state.lock().stats
    }

    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state.lock().links.contains(&pair(a, b))
    }

    /// Cut `a` off from `b` until [`MemoryNetwork::heal`].
    pub async fn sever(&self, a: &PeerId, b: &PeerId) {
        let events = {
            let mut state = self.state.lock();
            state.severed.insert(pair(a, b));
            state.unlink(a, b)
        };
        debug!(%a, %b, "severed");
        dispatch(events).await;
    }

    /// Sever every pair across two sides.
    pub async fn partition(&self, left: &[PeerId], right: &[PeerId]) {
        for a in left {
            for b in right {
                self.sever(a, b).await;
            }
        }
    }

    /// Allow `a` and `b` to connect again. Does not connect them.
    pub fn heal(&self, a: &PeerId, b: &PeerId) {
        self.state.lock().severed.remove(&pair(a, b));
    }

    pub fn heal_all(&self) {
        self.state.lock().severed.clear();
    }

    /// Release every held-back frame.
    pub async fn flush(&self) {
        let events = {
            let mut state = self.state.lock();
            let held: Vec<((PeerId, PeerId), Bytes)> = state.held.drain().collect();
            let mut out = Vec::new();
            for ((from, to), frame) in held {
                if let Some(tx) = state.endpoints.get(&to) {
                    out.push((tx.clone(), LinkEvent::Received(from, frame)));
                }
            }
            state.stats.delivered += out.len() as u64;
            out
        };
        dispatch(events).await;
    }

    async fn transmit(&self, from: &PeerId, to: &PeerId, frame: Bytes) -> Result<(), LinkError> {
        let events = {
            let mut state = self.state.lock();
            if !state.links.contains(&pair(from, to)) {
                return Err(LinkError::NotConnected(to.clone()));
            }
            let tx = state
                .endpoints
                .get(to)
                .cloned()
                .ok_or_else(|| LinkError::UnknownPeer(to.clone()))?;
            state.stats.sent += 1;

            let (loss, dup, reorder) = (
                state.config.loss_rate,
                state.config.dup_rate,
                state.config.reorder_rate,
            );
            if state.roll(loss) {
                state.stats.dropped += 1;
                trace!(%from, %to, "frame lost");
                return Ok(());
            }

            let direction = (from.clone(), to.clone());
            let mut frames = Vec::new();
            if state.roll(reorder) && !state.held.contains_key(&direction) {
                state.stats.reordered += 1;
                state.held.insert(direction, frame.clone());
            } else {
                frames.push(frame.clone());
                if let Some(held) = state.held.remove(&direction) {
                    frames.push(held);
                }
            }
            if state.roll(dup) {
                state.stats.duplicated += 1;
                frames.push(frame);
            }
            state.stats.delivered += frames.len() as u64;
            frames
                .into_iter()
                .map(|f| (tx.clone(), LinkEvent::Received(from.clone(), f)))
                .collect::<Vec<_>>()
        };
        dispatch(events).await;
        Ok(())
    }
}

/// One peer's attachment to a [`MemoryNetwork`].
pub struct MemoryLink {
    local: PeerId,
    network: MemoryNetwork,
    events: Mutex<Option<mpsc::Receiver<LinkEvent>>>,
}

impl MemoryLink {
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn connect(&self, peer: &PeerId, _address: &str) -> Result<(), LinkError> {
        let events = {
            let mut state = self.network.state.lock();
            let key = pair(&self.local, peer);
            if state.severed.contains(&key) {
                return Err(LinkError::Unreachable(peer.clone()));
            }
            let remote = state
                .endpoints
                .get(peer)
                .cloned()
                .ok_or_else(|| LinkError::UnknownPeer(peer.clone()))?;
            if !state.links.insert(key) {
                return Ok(());
            }
            let local = state
                .endpoints
                .get(&self.local)
                .cloned()
                .ok_or_else(|| LinkError::UnknownPeer(self.local.clone()))?;
            vec![
                (local, LinkEvent::Connected(peer.clone())),
                (remote, LinkEvent::Connected(self.local.clone())),
            ]
        };
        dispatch(events).await;
        Ok(())
    }

    async fn send(&self, peer: &PeerId, frame: Bytes) -> Result<(), LinkError> {
        self.network.transmit(&self.local, peer, frame).await
    }

    async fn disconnect(&self, peer: &PeerId) -> Result<(), LinkError> {
        let events = self.network.state.lock().unlink(&self.local, peer);
        dispatch(events).await;
        Ok(())
    }

    fn events(&self) -> Result<mpsc::Receiver<LinkEvent>, LinkError> {
        self.events.lock().take().ok_or(LinkError::EventsTaken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id)
    }

    #[tokio::test]
    async fn test_connect_reports_both_sides() {
        let net = MemoryNetwork::new(NetworkConfig::default());
        let a = net.endpoint(peer("a"));
        let b = net.endpoint(peer("b"));
        let mut a_events = a.events().unwrap();
        let mut b_events = b.events().unwrap();

        a.connect(&peer("b"), "").await.unwrap();
        assert_eq!(a_events.recv().await, Some(LinkEvent::Connected(peer("b"))));
        assert_eq!(b_events.recv().await, Some(LinkEvent::Connected(peer("a"))));

        // second connect is a no-op
        b.connect(&peer("a"), "").await.unwrap();
        assert!(a_events.try_recv().is_err());

        a.send(&peer("b"), Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(
            b_events.recv().await,
            Some(LinkEvent::Received(peer("a"), Bytes::from_static(b"ping")))
        );
        assert!(a.events().is_err());
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let net = MemoryNetwork::new(NetworkConfig::default());
        let a = net.endpoint(peer("a"));
        let _b = net.endpoint(peer("b"));
        assert!(matches!(
            a.send(&peer("b"), Bytes::new()).await,
            Err(LinkError::NotConnected(_))
        ));
        assert!(matches!(
            a.connect(&peer("zed"), "").await,
            Err(LinkError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_sever_and_heal() {
        let net = MemoryNetwork::new(NetworkConfig::default());
        let a = net.endpoint(peer("a"));
        let b = net.endpoint(peer("b"));
        let mut b_events = b.events().unwrap();
        a.connect(&peer("b"), "").await.unwrap();
        b_events.recv().await;

        net.sever(&peer("a"), &peer("b")).await;
        assert_eq!(b_events.recv().await, Some(LinkEvent::Disconnected(peer("a"))));
        assert!(matches!(
            a.connect(&peer("b"), "").await,
            Err(LinkError::Unreachable(_))
        ));

        net.heal(&peer("a"), &peer("b"));
        a.connect(&peer("b"), "").await.unwrap();
        assert!(net.is_linked(&peer("a"), &peer("b")));
    }

    #[tokio::test]
    async fn test_lossy_network_drops_everything_at_full_rate() {
        let net = MemoryNetwork::new(NetworkConfig::lossy(1.0));
        let a = net.endpoint(peer("a"));
        let b = net.endpoint(peer("b"));
        let mut b_events = b.events().unwrap();
        a.connect(&peer("b"), "").await.unwrap();
        b_events.recv().await;

        for _ in 0..10 {
            a.send(&peer("b"), Bytes::from_static(b"x")).await.unwrap();
        }
        assert!(b_events.try_recv().is_err());
        assert_eq!(net.stats().dropped, 10);
    }

    #[tokio::test]
    async fn test_reordering_holds_one_frame_back() {
        let net = MemoryNetwork::new(NetworkConfig::reordering(1.0));
        let a = net.endpoint(peer("a"));
        let b = net.endpoint(peer("b"));
        let mut b_events = b.events().unwrap();
        a.connect(&peer("b"), "").await.unwrap();
        b_events.recv().await;

        a.send(&peer("b"), Bytes::from_static(b"1")).await.unwrap();
        a.send(&peer("b"), Bytes::from_static(b"2")).await.unwrap();

        assert_eq!(
            b_events.recv().await,
            Some(LinkEvent::Received(peer("a"), Bytes::from_static(b"2")))
        );
        assert_eq!(
            b_events.recv().await,
            Some(LinkEvent::Received(peer("a"), Bytes::from_static(b"1")))
        );
    }
}
