//! Causeway engine - causal broadcast for decentralized group chat
//!
//! Every node runs one [`Engine`]. It stamps outgoing messages with the
//! group's vector clock, holds back incoming ones until everything they
//! depend on has been delivered, and catches up with peers after a
//! reconnect by exchanging clocks and filling the gaps.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cbc_engine::{Engine, EngineConfig, EngineEvent, MemoryNetwork, NetworkConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> cbc_engine::Result<()> {
//! let network = MemoryNetwork::new(NetworkConfig::default());
//! let ann = Engine::start(
//!     EngineConfig::builder().peer_id("ann").display_name("Ann").build(),
//!     Arc::new(network.endpoint("ann".into())),
//! )
//! .await?;
//!
//! let mut events = ann.subscribe();
//! ann.send_message(&cbc_core::GroupId::lobby(), "hi all").await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let EngineEvent::Delivered { message, .. } = event {
//!         println!("{}: {}", message.origin, message.payload);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`engine`] - The orchestrator: send, receive, join, leave, backfill
//! - [`group`] - Per-group clocks, logs and the delivery task
//! - [`peers`] - Connection lifecycle and reconnect backoff
//! - [`wire`] - Versioned frames exchanged between engines
//! - [`link`] - Transport abstraction with in-memory and TCP implementations
//! - [`config`] - Engine configuration
//! - [`events`] - Notifications for the application layer
//! - [`error`] - Error types

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
mod group;
pub mod link;
pub mod peers;
pub mod wire;

pub use config::{BootstrapPeer, EngineConfig, EngineConfigBuilder};
pub use engine::Engine;
pub use error::{EngineError, LinkError, Result, WireError};
pub use events::{EngineEvent, GroupStatus};
pub use link::{LinkEvent, MemoryLink, MemoryNetwork, NetworkConfig, NetworkStats, PeerLink, TcpLink};
pub use peers::{Backoff, ConnectionState, PeerInfo};
pub use wire::{Body, Frame, PROTOCOL_VERSION};

pub use cbc_core::{GroupId, MembershipChange, MembershipEvent, Message, PeerId, VectorClock};
pub use cbc_directory::{GroupMembership, PeerProfile};
pub use cbc_log::HistoryPage;
