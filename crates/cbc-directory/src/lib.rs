//! Causeway directory: who is called what, and who belongs to which group.
//!
//! The directory is fed only by delivered membership events, so it sees each
//! group's roster changes in causal order. Concurrent writes are settled by
//! the LWW stamp order from `cbc_core::lww`.

pub mod directory;
pub mod roster;

pub use directory::Directory;
pub use roster::{GroupMembership, PeerProfile};
