//! Error types for the engine, the wire codec and peer links.

use cbc_core::ids::{GroupId, PeerId};
use cbc_log::LogError;
use thiserror::Error;

/// Failures of a peer link. Always scoped to one peer.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Not connected to peer {0}")]
    NotConnected(PeerId),

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Peer {0} is unreachable")]
    Unreachable(PeerId),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Link event stream already taken")]
    EventsTaken,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures decoding a frame received from a peer.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Protocol version mismatch: expected {expected}, got {found}")]
    VersionMismatch { expected: u16, found: u16 },

    #[error("Malformed frame: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for WireError {
    fn from(err: serde_json::Error) -> Self {
        WireError::Malformed(err.to_string())
    }
}

/// Errors returned by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unknown group: {0}")]
    UnknownGroup(GroupId),

    #[error("Not a member of group {0}")]
    NotMember(GroupId),

    #[error("Already a member of group {0}")]
    AlreadyMember(GroupId),

    #[error("Cannot send a direct message to self")]
    SelfTarget,

    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Storage error: {0}")]
    Storage(#[from] LogError),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
