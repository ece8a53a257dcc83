//! TCP peer link.
//!
//! Streams are framed with a length-delimited codec. The first frame in
//! each direction carries the sender's [`PeerId`] as UTF-8; everything after
//! it is handed to the engine untouched.
//!
//! When two peers dial each other at the same time both ends keep the
//! connection initiated by the smaller id, so exactly one survives.

use super::{LinkEvent, PeerLink};
use crate::error::LinkError;
use async_trait::async_trait;
use bytes::Bytes;
use cbc_core::ids::PeerId;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

type FramedTcp = Framed<TcpStream, LengthDelimitedCodec>;

const EVENT_CAPACITY: usize = 4096;
const WRITE_QUEUE: usize = 1024;

struct Connection {
    id: u64,
    initiator: PeerId,
    writer: mpsc::Sender<Bytes>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn close(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

struct Shared {
    local: PeerId,
    connections: Mutex<HashMap<PeerId, Connection>>,
    events_tx: mpsc::Sender<LinkEvent>,
    next_id: AtomicU64,
}

/// Peer link over TCP.
pub struct TcpLink {
    shared: Arc<Shared>,
    events_rx: Mutex<Option<mpsc::Receiver<LinkEvent>>>,
    local_addr: SocketAddr,
    acceptor: JoinHandle<()>,
}

impl TcpLink {
    /// Listen on `addr` and accept peers in the background.
    pub async fn bind(local: PeerId, addr: &str) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            local,
            connections: Mutex::new(HashMap::new()),
            events_tx,
            next_id: AtomicU64::new(1),
        });

        info!(addr = %local_addr, peer = %shared.local, "listening");
        let acceptor = tokio::spawn(accept_loop(listener, shared.clone()));

        Ok(Self {
            shared,
            events_rx: Mutex::new(Some(events_rx)),
            local_addr,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_id(&self) -> &PeerId {
        &self.shared.local
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.acceptor.abort();
        let connections: Vec<Connection> = self.shared.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in connections {
            conn.close();
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_one(stream, shared).await {
                        warn!(%remote, error = %e, "inbound handshake failed");
                    }
                });
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

async fn accept_one(stream: TcpStream, shared: Arc<Shared>) -> Result<(), LinkError> {
    let mut framed = LengthDelimitedCodec::builder().new_framed(stream);
    let remote = read_identity(&mut framed).await?;
    write_identity(&mut framed, &shared.local).await?;
    register(shared, remote.clone(), remote, framed).await;
    Ok(())
}

async fn read_identity(framed: &mut FramedTcp) -> Result<PeerId, LinkError> {
    let frame = framed
        .next()
        .await
        .ok_or_else(|| LinkError::Handshake("stream closed before identity".into()))??;
    let id = std::str::from_utf8(&frame).map_err(|e| LinkError::Handshake(e.to_string()))?;
    if id.is_empty() {
        return Err(LinkError::Handshake("empty peer id".into()));
    }
    Ok(PeerId::new(id))
}

async fn write_identity(framed: &mut FramedTcp, local: &PeerId) -> Result<(), LinkError> {
    framed
        .send(Bytes::copy_from_slice(local.as_str().as_bytes()))
        .await?;
    Ok(())
}

/// Install a handshaken stream as the connection to `peer`.
async fn register(shared: Arc<Shared>, peer: PeerId, initiator: PeerId, framed: FramedTcp) {
    let (sink, stream) = framed.split();
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let (writer, queue) = mpsc::channel(WRITE_QUEUE);

    let announce = {
        let mut connections = shared.connections.lock();
        let preferred = std::cmp::min(&shared.local, &peer).clone();
        let supersedes = connections
            .get(&peer)
            .map(|existing| existing.initiator != preferred && initiator == preferred);
        let replaced = match supersedes {
            None => None,
            Some(true) => connections.remove(&peer),
            Some(false) => {
                debug!(%peer, "keeping existing connection");
                return;
            }
        };
        let announce = replaced.is_none();
        if let Some(old) = replaced {
            debug!(%peer, "replacing duplicate connection");
            old.close();
        }
        let write_task = tokio::spawn(write_loop(sink, queue));
        connections.insert(
            peer.clone(),
            Connection {
                id,
                initiator,
                writer,
                tasks: vec![write_task],
            },
        );
        announce
    };

    if announce && shared.events_tx.send(LinkEvent::Connected(peer.clone())).await.is_err() {
        return;
    }

    let read_task = tokio::spawn(read_loop(shared.clone(), peer.clone(), id, stream));
    match shared.connections.lock().get_mut(&peer) {
        Some(conn) if conn.id == id => conn.tasks.push(read_task),
        _ => read_task.abort(),
    }
}

async fn write_loop(mut sink: SplitSink<FramedTcp, Bytes>, mut queue: mpsc::Receiver<Bytes>) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, "write failed");
            break;
        }
    }
}

async fn read_loop(shared: Arc<Shared>, peer: PeerId, id: u64, mut stream: SplitStream<FramedTcp>) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(bytes) => {
                if shared
                    .events_tx
                    .send(LinkEvent::Received(peer.clone(), bytes.freeze()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                warn!(%peer, error = %e, "read failed");
                break;
            }
        }
    }

    let current = {
        let mut connections = shared.connections.lock();
        match connections.get(&peer) {
            Some(conn) if conn.id == id => connections.remove(&peer),
            _ => None,
        }
    };
    if let Some(conn) = current {
        debug!(%peer, "connection closed");
        // the read task is this one; only the writer needs stopping
        for task in conn.tasks.into_iter().take(1) {
            task.abort();
        }
        let _ = shared.events_tx.send(LinkEvent::Disconnected(peer)).await;
    }
}

#[async_trait]
impl PeerLink for TcpLink {
    async fn connect(&self, peer: &PeerId, address: &str) -> Result<(), LinkError> {
        if self.shared.connections.lock().contains_key(peer) {
            return Ok(());
        }
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let mut framed = LengthDelimitedCodec::builder().new_framed(stream);
        write_identity(&mut framed, &self.shared.local).await?;
        let remote = read_identity(&mut framed).await?;
        if &remote != peer {
            return Err(LinkError::Handshake(format!(
                "expected {} at {}, found {}",
                peer, address, remote
            )));
        }
        register(self.shared.clone(), remote, self.shared.local.clone(), framed).await;
        Ok(())
    }

    async fn send(&self, peer: &PeerId, frame: Bytes) -> Result<(), LinkError> {
        let writer = self
            .shared
            .connections
            .lock()
            .get(peer)
            .map(|conn| conn.writer.clone())
            .ok_or_else(|| LinkError::NotConnected(peer.clone()))?;
        writer
            .send(frame)
            .await
            .map_err(|_| LinkError::NotConnected(peer.clone()))
    }

    async fn disconnect(&self, peer: &PeerId) -> Result<(), LinkError> {
        let removed = self.shared.connections.lock().remove(peer);
        if let Some(conn) = removed {
            conn.close();
            let _ = self
                .shared
                .events_tx
                .send(LinkEvent::Disconnected(peer.clone()))
                .await;
        }
        Ok(())
    }

    fn events(&self) -> Result<mpsc::Receiver<LinkEvent>, LinkError> {
        self.events_rx.lock().take().ok_or(LinkError::EventsTaken)
    }
}
