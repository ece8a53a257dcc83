//! Per-peer connection state.
//!
//! ```text
//! Disconnected ──dial──▶ Connecting ──link up──▶ Synchronizing ──backfill done──▶ Live
//!      ▲                     │                                                      │
//!      └──────failure────────┴──────────────────────link down───────────────────────┘
//! ```
//!
//! A peer that dials us skips `Connecting`.

use bytes::Bytes;
use cbc_core::ids::{GroupId, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Link is up; backfill requests are outstanding.
    Synchronizing,
    Live,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Synchronizing | ConnectionState::Live)
    }
}

/// Public view of one peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer: PeerId,
    pub state: ConnectionState,
    pub address: Option<String>,
}

/// Exponential reconnect delay.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// The delay to wait now. Doubles the following one, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

struct Outbound {
    queue: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
    /// Frames are being dropped because the queue is full.
    congested: bool,
}

/// What became of a frame handed to [`PeerTable::enqueue`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued,
    /// The queue is full. `first` is set on the first drop after a
    /// successful send.
    Dropped { first: bool },
    NotConnected,
}

struct PeerEntry {
    state: ConnectionState,
    address: Option<String>,
    outbound: Option<Outbound>,
    outstanding: HashSet<GroupId>,
    wake: Arc<Notify>,
}

impl PeerEntry {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            address: None,
            outbound: None,
            outstanding: HashSet::new(),
            wake: Arc::new(Notify::new()),
        }
    }
}

/// Every peer this node knows how to reach or is connected to.
#[derive(Default)]
pub(crate) struct PeerTable {
    entries: HashMap<PeerId, PeerEntry>,
}

impl PeerTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, peer: &PeerId) -> &mut PeerEntry {
        self.entries.entry(peer.clone()).or_insert_with(PeerEntry::new)
    }

    pub(crate) fn set_address(&mut self, peer: &PeerId, address: String) {
        self.entry(peer).address = Some(address);
    }

    pub(crate) fn state(&self, peer: &PeerId) -> ConnectionState {
        self.entries
            .get(peer)
            .map_or(ConnectionState::Disconnected, |e| e.state)
    }

    /// Returns whether the state changed.
    pub(crate) fn set_state(&mut self, peer: &PeerId, state: ConnectionState) -> bool {
        let entry = self.entry(peer);
        let changed = entry.state != state;
        entry.state = state;
        changed
    }

    /// Link came up: install the outbound queue and enter `Synchronizing`.
    pub(crate) fn attach(
        &mut self,
        peer: &PeerId,
        queue: mpsc::Sender<Bytes>,
        task: JoinHandle<()>,
    ) {
        let entry = self.entry(peer);
        if let Some(old) = entry.outbound.replace(Outbound {
            queue,
            task,
            congested: false,
        }) {
            old.task.abort();
        }
        entry.outstanding.clear();
        entry.state = ConnectionState::Synchronizing;
    }

    /// Link went down. Returns whether the peer was connected.
    pub(crate) fn detach(&mut self, peer: &PeerId) -> bool {
        let entry = self.entry(peer);
        let was_connected = entry.state.is_connected();
        if let Some(old) = entry.outbound.take() {
            old.task.abort();
        }
        entry.outstanding.clear();
        entry.state = ConnectionState::Disconnected;
        entry.wake.notify_one();
        was_connected
    }

    /// Queue a frame without waiting. A full queue drops the frame; the
    /// receiver recovers it through backfill.
    pub(crate) fn enqueue(&mut self, peer: &PeerId, frame: Bytes) -> Enqueued {
        let Some(outbound) = self.entries.get_mut(peer).and_then(|e| e.outbound.as_mut()) else {
            return Enqueued::NotConnected;
        };
        match outbound.queue.try_send(frame) {
            Ok(()) => {
                outbound.congested = false;
                Enqueued::Queued
            }
            Err(TrySendError::Full(_)) => {
                let first = !outbound.congested;
                outbound.congested = true;
                Enqueued::Dropped { first }
            }
            Err(TrySendError::Closed(_)) => Enqueued::NotConnected,
        }
    }

    pub(crate) fn connected(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state.is_connected())
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        peers
    }

    pub(crate) fn expect_backfill(&mut self, peer: &PeerId, group: GroupId) {
        self.entry(peer).outstanding.insert(group);
    }

    /// Record a backfill response. Returns `true` when it was the last one
    /// outstanding and the peer just became `Live`.
    pub(crate) fn complete_backfill(&mut self, peer: &PeerId, group: &GroupId) -> bool {
        let entry = self.entry(peer);
        entry.outstanding.remove(group);
        if entry.state == ConnectionState::Synchronizing && entry.outstanding.is_empty() {
            entry.state = ConnectionState::Live;
            return true;
        }
        false
    }

    pub(crate) fn wake_handle(&mut self, peer: &PeerId) -> Arc<Notify> {
        self.entry(peer).wake.clone()
    }

    pub(crate) fn snapshot(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .entries
            .iter()
            .map(|(peer, e)| PeerInfo {
                peer: peer.clone(),
                state: e.state,
                address: e.address.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer.cmp(&b.peer));
        peers
    }

    pub(crate) fn shutdown(&mut self) {
        for entry in self.entries.values_mut() {
            if let Some(old) = entry.outbound.take() {
                old.task.abort();
            }
            entry.state = ConnectionState::Disconnected;
        }
    }
}
