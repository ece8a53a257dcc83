//! Peer link abstraction.
//!
//! A link moves opaque frames between this node and its peers and reports
//! connection changes. It knows nothing about groups or clocks.

pub mod memory;
pub mod tcp;

use crate::error::LinkError;
use async_trait::async_trait;
use bytes::Bytes;
use cbc_core::ids::PeerId;
use tokio::sync::mpsc;

pub use memory::{MemoryLink, MemoryNetwork, NetworkConfig, NetworkStats};
pub use tcp::TcpLink;

/// Something that happened on a link.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkEvent {
    Connected(PeerId),
    Received(PeerId, Bytes),
    Disconnected(PeerId),
}

/// Abstract transport between engines.
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    /// Open a connection. Returns once the connection is usable; the
    /// matching [`LinkEvent::Connected`] is reported on the event stream.
    async fn connect(&self, peer: &PeerId, address: &str) -> Result<(), LinkError>;

    /// Send one frame. Delivery is best effort.
    async fn send(&self, peer: &PeerId, frame: Bytes) -> Result<(), LinkError>;

    /// Drop the connection to `peer`, if any.
    async fn disconnect(&self, peer: &PeerId) -> Result<(), LinkError>;

    /// The event stream. Can be taken once.
    fn events(&self) -> Result<mpsc::Receiver<LinkEvent>, LinkError>;
}
