//! The causal broadcast engine.
//!
//! One engine runs per node. It owns every group's clocks and logs, the
//! directory, and the per-peer connection state, and exchanges frames with
//! peers through a [`PeerLink`].
//!
//! # Locking
//!
//! Each group's chat and membership streams sit behind one mutex, so a
//! local send, a remote receipt and the drain that follows never interleave
//! for the same group. The directory has its own lock and is only written
//! while the owning group's lock is held; no code takes a group lock while
//! holding the directory. No lock is held across an `.await`.
//!
//! # Gaps
//!
//! Frames are queued per peer without waiting; a peer whose queue is full
//! misses them. A receiver that buffers an event with a known gap asks its
//! connected peers for the group at once, and every
//! `anti_entropy_interval` it asks again for every group, which also
//! recovers losses nobody has noticed yet.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result, WireError};
use crate::events::{EngineEvent, GroupStatus};
use crate::group::GroupState;
use crate::link::{LinkEvent, PeerLink};
use crate::peers::{Backoff, ConnectionState, Enqueued, PeerInfo, PeerTable};
use crate::wire::{Body, Frame};
use bytes::Bytes;
use cbc_core::event::{MembershipChange, MembershipEvent, Message};
use cbc_core::ids::{GroupId, PeerId};
use cbc_directory::{Directory, GroupMembership, PeerProfile};
use cbc_log::{FileLogStorage, HistoryPage, LogError, LogStorage, MemoryLogStorage};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

const MAX_NAME_LEN: usize = 64;

type SharedGroup = Arc<Mutex<GroupState>>;

struct Inner<L: PeerLink> {
    local: PeerId,
    config: EngineConfig,
    link: Arc<L>,
    groups: RwLock<HashMap<GroupId, SharedGroup>>,
    directory: RwLock<Directory>,
    peers: Mutex<PeerTable>,
    storage: Arc<dyn LogStorage>,
    events: broadcast::Sender<EngineEvent>,
}

/// A running node.
///
/// # Example
///
/// ```rust,no_run
/// use cbc_engine::{Engine, EngineConfig, MemoryNetwork, NetworkConfig};
/// use std::sync::Arc;
///
/// # async fn run() -> cbc_engine::Result<()> {
/// let network = MemoryNetwork::new(NetworkConfig::default());
/// let config = EngineConfig::builder().peer_id("ann").display_name("Ann").build();
/// let link = Arc::new(network.endpoint("ann".into()));
///
/// let engine = Engine::start(config, link).await?;
/// let group = engine.create_group("rust").await?;
/// engine.send_message(&group, "hello").await?;
/// # Ok(())
/// # }
/// ```
pub struct Engine<L: PeerLink> {
    inner: Arc<Inner<L>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<L: PeerLink> Engine<L> {
    /// Start an engine, persisting to `config.data_dir` when set.
    pub async fn start(config: EngineConfig, link: Arc<L>) -> Result<Self> {
        let storage: Arc<dyn LogStorage> = match &config.data_dir {
            Some(dir) => Arc::new(FileLogStorage::open(dir.join("log"))?),
            None => Arc::new(MemoryLogStorage::new()),
        };
        Self::start_with_storage(config, link, storage).await
    }

    /// Start an engine on explicit storage.
    ///
    /// Stored groups are restored before any peer is contacted, then the
    /// node joins the lobby (if it has not already) and dials every
    /// bootstrap peer.
    pub async fn start_with_storage(
        mut config: EngineConfig,
        link: Arc<L>,
        storage: Arc<dyn LogStorage>,
    ) -> Result<Self> {
        let local = config.resolve_peer_id().map_err(LogError::from)?;
        let link_events = link.events()?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let inner = Arc::new(Inner {
            local,
            config,
            link,
            groups: RwLock::new(HashMap::new()),
            directory: RwLock::new(Directory::new()),
            peers: Mutex::new(PeerTable::new()),
            storage,
            events,
        });

        inner.restore()?;
        inner.ensure_lobby()?;

        let mut tasks = vec![tokio::spawn(route(inner.clone(), link_events))];
        if let Some(period) = inner.config.anti_entropy_interval {
            tasks.push(tokio::spawn(anti_entropy(inner.clone(), period)));
        }
        let engine = Self {
            tasks: Mutex::new(tasks),
            inner,
        };
        for peer in engine.inner.config.bootstrap.clone() {
            engine.connect(peer.peer, peer.address);
        }
        info!(peer = %engine.inner.local, name = %engine.inner.config.display_name, "engine started");
        Ok(engine)
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local
    }

    pub fn display_name(&self) -> String {
        self.inner.directory.read().display_name(&self.inner.local)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Keep a connection to `peer` at `address`, redialing with backoff.
    pub fn connect(&self, peer: PeerId, address: String) {
        if peer == self.inner.local {
            return;
        }
        self.inner.peers.lock().set_address(&peer, address.clone());
        let task = tokio::spawn(supervise(self.inner.clone(), peer, address));
        self.tasks.lock().push(task);
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Stamp, self-deliver and fan out a chat message.
    pub async fn send_message(&self, group: &GroupId, payload: impl Into<String>) -> Result<Message> {
        self.inner.send_message(group, payload.into())
    }

    /// Send on the direct-message group shared with `peer`.
    pub async fn send_direct(&self, peer: &PeerId, payload: impl Into<String>) -> Result<Message> {
        if peer == &self.inner.local {
            return Err(EngineError::SelfTarget);
        }
        let group = GroupId::direct(&self.inner.local, peer);
        self.inner.activate(&group);
        self.inner.send_message(&group, payload.into())
    }

    /// Form a new group with this node as its first member.
    pub async fn create_group(&self, name: &str) -> Result<GroupId> {
        let name = validate_name(name)?;
        let group = GroupId::generate();
        self.inner.emit_membership(&group, MembershipChange::Create { name })?;
        Ok(group)
    }

    /// Join a known group and ask its members for the history so far.
    pub async fn join_group(&self, group: &GroupId) -> Result<()> {
        if group.is_direct() {
            return Err(EngineError::AlreadyMember(group.clone()));
        }
        let known = self.inner.group(group).is_some();
        {
            let directory = self.inner.directory.read();
            if !known && directory.group(group).is_none() {
                return Err(EngineError::UnknownGroup(group.clone()));
            }
            if directory.is_member(group, &self.inner.local) {
                return Err(EngineError::AlreadyMember(group.clone()));
            }
        }
        self.inner.emit_membership(group, MembershipChange::Join)?;
        self.inner.request_catch_up(group);
        Ok(())
    }

    /// Leave a group. Buffered chat is dropped; the log is kept.
    pub async fn leave_group(&self, group: &GroupId) -> Result<()> {
        self.inner.require_member(group)?;
        if group.is_direct() {
            return Err(EngineError::UnknownGroup(group.clone()));
        }
        self.inner.emit_membership(group, MembershipChange::Leave)?;
        Ok(())
    }

    pub async fn rename_group(&self, group: &GroupId, name: &str) -> Result<()> {
        let name = validate_name(name)?;
        self.inner.require_member(group)?;
        if group.is_direct() {
            return Err(EngineError::UnknownGroup(group.clone()));
        }
        self.inner.emit_membership(group, MembershipChange::Rename { name })?;
        Ok(())
    }

    /// Change this node's display name.
    pub async fn rename_self(&self, name: &str) -> Result<()> {
        let display_name = validate_name(name)?;
        self.inner
            .emit_membership(&GroupId::lobby(), MembershipChange::Profile { display_name })?;
        Ok(())
    }

    /// Ask every connected peer for whatever this node is missing in every
    /// known group. Runs on its own every `anti_entropy_interval`.
    pub fn resync(&self) {
        self.inner.resync();
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Process a chat message from the transport. Returns what was
    /// delivered as a result, in delivery order.
    pub fn on_message_received(&self, message: Message) -> Vec<Message> {
        self.inner.on_message_received(message)
    }

    /// Process a membership event from the transport.
    pub fn on_membership_event_received(&self, event: MembershipEvent) -> Vec<MembershipEvent> {
        self.inner.on_membership_event_received(event)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn history(&self, group: &GroupId) -> Result<Vec<Message>> {
        let state = self.inner.existing_group(group)?;
        let guard = state.lock();
        Ok(guard.chat.store.history().to_vec())
    }

    pub fn history_page(&self, group: &GroupId, offset: usize, limit: usize) -> Result<HistoryPage<Message>> {
        let state = self.inner.existing_group(group)?;
        let guard = state.lock();
        Ok(guard.chat.store.history_page(offset, limit))
    }

    pub fn group_status(&self, group: &GroupId) -> Result<GroupStatus> {
        let state = self.inner.existing_group(group)?;
        let members = self.inner.directory.read().list_members(group);
        let guard = state.lock();
        Ok(GroupStatus {
            group: group.clone(),
            active: guard.is_active(),
            members,
            delivered: guard.chat.clock.delivered().clone(),
            seen: guard.chat.clock.seen().clone(),
            pending: guard.chat.store.pending_len(),
            membership_pending: guard.membership.store.pending_len(),
            missing: guard.chat.clock.missing(),
        })
    }

    pub fn search_users(&self, query: &str) -> Vec<PeerProfile> {
        self.inner.directory.read().search_users(query)
    }

    pub fn search_groups(&self, query: &str) -> Vec<GroupMembership> {
        self.inner.directory.read().search_groups(query)
    }

    pub fn list_members(&self, group: &GroupId) -> BTreeSet<PeerId> {
        self.inner.directory.read().list_members(group)
    }

    pub fn list_groups(&self) -> Vec<GroupMembership> {
        self.inner.directory.read().list_groups()
    }

    pub fn list_users(&self) -> Vec<PeerProfile> {
        self.inner.directory.read().list_users()
    }

    pub fn group_info(&self, group: &GroupId) -> Option<GroupMembership> {
        self.inner.directory.read().group(group)
    }

    pub fn find_group(&self, name: &str) -> Option<GroupMembership> {
        self.inner.directory.read().find_group_by_name(name)
    }

    /// Groups this node currently belongs to, lobby included.
    pub fn my_groups(&self) -> Vec<GroupId> {
        let groups: Vec<(GroupId, SharedGroup)> = self
            .inner
            .groups
            .read()
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect();
        let mut mine: Vec<GroupId> = groups
            .into_iter()
            .filter(|(_, state)| state.lock().is_active())
            .map(|(id, _)| id)
            .collect();
        mine.sort();
        mine
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner.peers.lock().snapshot()
    }

    pub fn peer_state(&self, peer: &PeerId) -> ConnectionState {
        self.inner.peers.lock().state(peer)
    }

    /// Stop every background task. Logs and clocks stay readable.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.peers.lock().shutdown();
        if let Err(e) = self.inner.storage.sync() {
            warn!(error = %e, "storage sync failed on shutdown");
        }
        info!(peer = %self.inner.local, "engine stopped");
    }
}

impl<L: PeerLink> Drop for Engine<L> {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.peers.lock().shutdown();
    }
}

fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_NAME_LEN || trimmed.chars().any(char::is_control) {
        return Err(EngineError::InvalidName(name.to_string()));
    }
    Ok(trimmed.to_string())
}

impl<L: PeerLink> Inner<L> {
    fn emit(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn group(&self, group: &GroupId) -> Option<SharedGroup> {
        self.groups.read().get(group).cloned()
    }

    fn existing_group(&self, group: &GroupId) -> Result<SharedGroup> {
        self.group(group)
            .ok_or_else(|| EngineError::UnknownGroup(group.clone()))
    }

    fn group_entry(&self, group: &GroupId) -> SharedGroup {
        if let Some(state) = self.group(group) {
            return state;
        }
        self.groups
            .write()
            .entry(group.clone())
            .or_insert_with(|| Arc::new(Mutex::new(GroupState::new(group.clone()))))
            .clone()
    }

    fn activate(&self, group: &GroupId) {
        self.group_entry(group).lock().activate(&self.events);
    }

    fn known_groups(&self) -> Vec<GroupId> {
        let mut groups: Vec<GroupId> = self.groups.read().keys().cloned().collect();
        groups.sort();
        groups
    }

    fn is_direct_with_me(&self, group: &GroupId) -> bool {
        group
            .direct_participants()
            .map_or(false, |(a, b)| a == self.local || b == self.local)
    }

    fn require_member(&self, group: &GroupId) -> Result<()> {
        self.existing_group(group)?;
        if !self.directory.read().is_member(group, &self.local) {
            return Err(EngineError::NotMember(group.clone()));
        }
        Ok(())
    }

    fn restore(&self) -> Result<()> {
        let stored_groups = self.storage.groups()?;
        for id in stored_groups {
            let stored = self.storage.load(&id)?;
            let state = GroupState::restore(id.clone(), stored);
            {
                let mut directory = self.directory.write();
                for event in state.membership.store.history() {
                    directory.apply(event);
                }
            }
            debug!(
                group = %id,
                messages = state.chat.store.len(),
                membership = state.membership.store.len(),
                "restored group"
            );
            self.groups.write().insert(id, Arc::new(Mutex::new(state)));
        }

        for id in self.known_groups() {
            let member = self.directory.read().is_member(&id, &self.local);
            if member || self.is_direct_with_me(&id) {
                self.activate(&id);
            }
        }
        Ok(())
    }

    fn ensure_lobby(&self) -> Result<()> {
        let lobby = GroupId::lobby();
        let current = self.directory.read().profile(&self.local).map(|p| p.display_name);
        if current.as_deref() != Some(self.config.display_name.as_str()) {
            let display_name = validate_name(&self.config.display_name)?;
            self.emit_membership(&lobby, MembershipChange::Profile { display_name })?;
        }
        if !self.directory.read().is_member(&lobby, &self.local) {
            self.emit_membership(&lobby, MembershipChange::Join)?;
        }
        self.activate(&lobby);
        Ok(())
    }

    fn persist_message(&self, message: &Message) {
        if let Err(e) = self.storage.append_message(message) {
            warn!(group = %message.group, error = %e, "failed to persist message");
        }
    }

    fn persist_membership(&self, event: &MembershipEvent) {
        if let Err(e) = self.storage.append_membership(event) {
            warn!(group = %event.group, error = %e, "failed to persist membership event");
        }
    }

    /// Bookkeeping for a membership event that reached the log. Runs with
    /// the group's lock held.
    fn membership_delivered(&self, state: &mut GroupState, event: &MembershipEvent) {
        self.persist_membership(event);
        self.directory.write().apply(event);
        if event.actor == self.local {
            match event.change {
                MembershipChange::Create { .. } | MembershipChange::Join => state.activate(&self.events),
                MembershipChange::Leave => {
                    let dropped = state.deactivate();
                    debug!(group = %event.group, dropped, "left group");
                }
                _ => {}
            }
        }
        self.emit(EngineEvent::Directory {
            event: event.clone(),
        });
    }

    fn emit_membership(&self, group: &GroupId, change: MembershipChange) -> Result<MembershipEvent> {
        let state = self.group_entry(group);
        let event = {
            let mut guard = state.lock();
            let stamp = guard.membership.stamp(&self.local);
            let event = MembershipEvent::new(group.clone(), self.local.clone(), stamp, change);
            guard.membership.append_local(event.clone());
            self.membership_delivered(&mut guard, &event);
            event
        };
        debug!(%group, seq = event.seq, change = ?event.change, "membership event");

        // directory knowledge is global
        let peers = self.peers.lock().connected();
        self.send_frames(&peers, Body::MembershipEvent { event: event.clone() });
        Ok(event)
    }

    fn send_message(&self, group: &GroupId, payload: String) -> Result<Message> {
        let state = self.existing_group(group)?;
        if !self.directory.read().is_member(group, &self.local) {
            return Err(EngineError::NotMember(group.clone()));
        }
        let message = {
            let mut guard = state.lock();
            if !guard.is_active() {
                return Err(EngineError::NotMember(group.clone()));
            }
            let stamp = guard.chat.stamp(&self.local);
            let message = Message::new(group.clone(), self.local.clone(), stamp, payload);
            guard.chat.append_local(message.clone());
            self.persist_message(&message);
            guard.deliver(message.clone());
            message
        };
        trace!(%group, seq = message.seq, "sent");

        let members = self.directory.read().list_members(group);
        let targets: Vec<PeerId> = self
            .peers
            .lock()
            .connected()
            .into_iter()
            .filter(|p| members.contains(p))
            .collect();
        self.send_frames(&targets, Body::ChatEvent { message: message.clone() });
        Ok(message)
    }

    fn on_message_received(&self, message: Message) -> Vec<Message> {
        let group = message.group.clone();
        let state = match self.group(&group) {
            Some(state) => state,
            None if self.is_direct_with_me(&group) => self.group_entry(&group),
            None => {
                trace!(%group, "chat for unknown group dropped");
                return Vec::new();
            }
        };

        let (delivered, ask) = {
            let mut guard = state.lock();
            if !guard.is_active() {
                if self.is_direct_with_me(&group) {
                    guard.activate(&self.events);
                } else {
                    trace!(%group, "chat for inactive group dropped");
                    return Vec::new();
                }
            }

            let receipt = guard.chat.receive(message);
            for delivered in &receipt.delivered {
                self.persist_message(delivered);
                guard.deliver(delivered.clone());
            }
            let mut ask = false;
            if receipt.buffered {
                let missing = guard.chat.clock.missing();
                debug!(%group, pending = guard.chat.store.pending_len(), "message buffered");
                if !missing.is_empty() {
                    self.emit(EngineEvent::HistoryIncomplete {
                        group: group.clone(),
                        missing,
                    });
                }
                ask = guard.should_request_gap();
            }
            (receipt.delivered, ask)
        };
        if ask && !self.request_catch_up(&group) {
            // nobody to ask yet; the next buffered event tries again
            state.lock().rearm_gap_request();
        }
        delivered
    }

    fn on_membership_event_received(&self, event: MembershipEvent) -> Vec<MembershipEvent> {
        let group = event.group.clone();
        let state = self.group_entry(&group);
        let (delivered, ask) = {
            let mut guard = state.lock();
            let receipt = guard.membership.receive(event);
            for delivered in &receipt.delivered {
                self.membership_delivered(&mut guard, delivered);
            }
            let mut ask = false;
            if receipt.buffered {
                debug!(
                    %group,
                    pending = guard.membership.store.pending_len(),
                    "membership event buffered"
                );
                ask = guard.should_request_gap();
            }
            (receipt.delivered, ask)
        };
        if ask && !self.request_catch_up(&group) {
            // nobody to ask yet; the next buffered event tries again
            state.lock().rearm_gap_request();
        }
        delivered
    }

    /// Ask the connected members of `group` (any connected peer when no
    /// member is connected) for what this node has not delivered. Returns
    /// whether anyone was asked.
    fn request_catch_up(&self, group: &GroupId) -> bool {
        let members = self.directory.read().list_members(group);
        let connected = self.peers.lock().connected();
        let mut targets: Vec<PeerId> = connected
            .iter()
            .filter(|p| members.contains(*p))
            .cloned()
            .collect();
        if targets.is_empty() {
            targets = connected;
        }
        if targets.is_empty() {
            return false;
        }
        debug!(%group, peers = targets.len(), "requesting catch-up");
        let request = self.backfill_request(group);
        self.send_frames(&targets, request);
        true
    }

    fn resync(&self) {
        let peers = self.peers.lock().connected();
        if peers.is_empty() {
            return;
        }
        let groups = self.known_groups();
        trace!(peers = peers.len(), groups = groups.len(), "anti-entropy round");
        for group in groups {
            if let Some(state) = self.group(&group) {
                state.lock().rearm_gap_request();
            }
            let request = self.backfill_request(&group);
            self.send_frames(&peers, request);
        }
    }

    fn backfill_request(&self, group: &GroupId) -> Body {
        let (chat, membership) = match self.group(group) {
            Some(state) => {
                let guard = state.lock();
                (
                    guard.chat.clock.delivered().clone(),
                    guard.membership.clock.delivered().clone(),
                )
            }
            None => Default::default(),
        };
        Body::BackfillRequest {
            group: group.clone(),
            chat,
            membership,
        }
    }

    fn answer_backfill(
        &self,
        peer: &PeerId,
        group: GroupId,
        chat_have: cbc_core::clock::VectorClock,
        membership_have: cbc_core::clock::VectorClock,
    ) {
        let existing = self.group(&group);
        let unknown = existing.is_none();
        let (chat, membership) = match existing {
            Some(state) => {
                let guard = state.lock();
                (
                    guard.chat.store.since(&chat_have),
                    guard.membership.store.since(&membership_have),
                )
            }
            None => {
                self.group_entry(&group);
                (Vec::new(), Vec::new())
            }
        };
        debug!(%peer, %group, chat = chat.len(), membership = membership.len(), "answering backfill");
        self.send_frame(
            peer,
            Body::BackfillResponse {
                group: group.clone(),
                chat,
                membership,
            },
        );

        if unknown {
            debug!(%peer, %group, "learned of group, requesting it back");
            let request = self.backfill_request(&group);
            self.send_frame(peer, request);
        }
    }

    fn apply_backfill(
        &self,
        peer: &PeerId,
        group: &GroupId,
        chat: Vec<Message>,
        membership: Vec<MembershipEvent>,
    ) {
        let mut delivered = 0;
        for event in membership {
            delivered += self.on_membership_event_received(event).len();
        }
        for message in chat {
            delivered += self.on_message_received(message).len();
        }
        debug!(%peer, %group, delivered, "backfill applied");
        if let Some(state) = self.group(group) {
            state.lock().rearm_gap_request();
        }

        let live = self.peers.lock().complete_backfill(peer, group);
        if live {
            info!(%peer, "peer live");
            self.emit(EngineEvent::PeerState {
                peer: peer.clone(),
                state: ConnectionState::Live,
            });
        }
    }

    /// Move `peer` from `from` to `to`. Does nothing if the peer is in any
    /// other state, since the router may have attached it meanwhile.
    fn transition(&self, peer: &PeerId, from: ConnectionState, to: ConnectionState) -> bool {
        {
            let mut peers = self.peers.lock();
            if peers.state(peer) != from {
                return false;
            }
            peers.set_state(peer, to);
        }
        debug!(%peer, state = ?to, "peer state");
        self.emit(EngineEvent::PeerState {
            peer: peer.clone(),
            state: to,
        });
        true
    }

    fn on_connected(&self, peer: PeerId) {
        let (queue, mut rx) = mpsc::channel::<Bytes>(self.config.outbound_queue.max(1));
        let link = self.link.clone();
        let target = peer.clone();
        let task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = link.send(&target, frame).await {
                    warn!(peer = %target, error = %e, "send failed");
                }
            }
        });

        let groups = self.known_groups();
        {
            let mut peers = self.peers.lock();
            peers.attach(&peer, queue, task);
            for group in &groups {
                peers.expect_backfill(&peer, group.clone());
            }
        }
        info!(%peer, groups = groups.len(), "peer connected, synchronizing");
        self.emit(EngineEvent::PeerState {
            peer: peer.clone(),
            state: ConnectionState::Synchronizing,
        });

        self.send_frame(
            &peer,
            Body::Hello {
                peer: self.local.clone(),
                display_name: self.config.display_name.clone(),
            },
        );
        for group in groups {
            let request = self.backfill_request(&group);
            self.send_frame(&peer, request);
        }
    }

    fn on_disconnected(&self, peer: PeerId) {
        let was_connected = self.peers.lock().detach(&peer);
        if was_connected {
            info!(%peer, "peer disconnected");
            self.emit(EngineEvent::PeerState {
                peer,
                state: ConnectionState::Disconnected,
            });
        }
    }

    async fn on_frame(&self, peer: PeerId, bytes: Bytes) {
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(WireError::VersionMismatch { expected, found }) => {
                warn!(%peer, expected, found, "protocol version mismatch, dropping link");
                if let Err(e) = self.link.disconnect(&peer).await {
                    warn!(%peer, error = %e, "disconnect failed");
                }
                return;
            }
            Err(e) => {
                warn!(%peer, error = %e, "ignoring malformed frame");
                return;
            }
        };
        trace!(%peer, kind = frame.body.kind(), "frame");

        match frame.body {
            Body::Hello { peer: claimed, display_name } => {
                if claimed != peer {
                    warn!(%peer, %claimed, "hello identity does not match link");
                }
                debug!(%peer, %display_name, "hello");
            }
            Body::ChatEvent { message } => {
                self.on_message_received(message);
            }
            Body::MembershipEvent { event } => {
                self.on_membership_event_received(event);
            }
            Body::BackfillRequest {
                group,
                chat,
                membership,
            } => self.answer_backfill(&peer, group, chat, membership),
            Body::BackfillResponse {
                group,
                chat,
                membership,
            } => self.apply_backfill(&peer, &group, chat, membership),
        }
    }

    fn send_frame(&self, peer: &PeerId, body: Body) {
        self.send_frames(std::slice::from_ref(peer), body);
    }

    /// Queue one frame for each peer without waiting. Peers without a live
    /// queue are skipped and peers with a full one miss the frame.
    fn send_frames(&self, peers: &[PeerId], body: Body) {
        if peers.is_empty() {
            return;
        }
        let bytes = match Frame::new(body).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode frame");
                return;
            }
        };
        let mut table = self.peers.lock();
        for peer in peers {
            if peer == &self.local {
                continue;
            }
            match table.enqueue(peer, bytes.clone()) {
                Enqueued::Queued => {}
                Enqueued::Dropped { first: true } => {
                    warn!(%peer, "outbound queue full, dropping frames until it drains")
                }
                Enqueued::Dropped { first: false } => trace!(%peer, "frame dropped"),
                Enqueued::NotConnected => trace!(%peer, "no connection, frame skipped"),
            }
        }
    }
}

/// Consume the link's events for the lifetime of the engine.
async fn route<L: PeerLink>(inner: Arc<Inner<L>>, mut events: mpsc::Receiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Connected(peer) => inner.on_connected(peer),
            LinkEvent::Received(peer, bytes) => inner.on_frame(peer, bytes).await,
            LinkEvent::Disconnected(peer) => inner.on_disconnected(peer),
        }
    }
    debug!("link event stream ended");
}

/// Keep `peer` connected while the engine runs.
async fn supervise<L: PeerLink>(inner: Arc<Inner<L>>, peer: PeerId, address: String) {
    let mut backoff = Backoff::new(inner.config.reconnect_base, inner.config.reconnect_max);
    let wake = inner.peers.lock().wake_handle(&peer);
    loop {
        if inner.transition(&peer, ConnectionState::Disconnected, ConnectionState::Connecting) {
            match inner.link.connect(&peer, &address).await {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(%peer, %address, error = %e, retry_in = ?delay, "connect failed");
                    inner.transition(&peer, ConnectionState::Connecting, ConnectionState::Disconnected);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
        }
        wake.notified().await;
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

/// Periodically ask every connected peer for what this node lacks.
async fn anti_entropy<L: PeerLink>(inner: Arc<Inner<L>>, period: Duration) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately; connect time already backfills
    ticker.tick().await;
    loop {
        ticker.tick().await;
        inner.resync();
    }
}
