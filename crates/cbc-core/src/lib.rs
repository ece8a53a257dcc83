//! Causeway core types.
//!
//! Everything in this crate is pure data and pure functions: identifiers,
//! the vector clock used to stamp and compare events, the per-group [`Clock`]
//! that decides deliverability, the last-writer-wins register the directory
//! builds on, and the two stamped event kinds that travel between nodes.
//!
//! [`Clock`]: clock::Clock

pub mod clock;
pub mod event;
pub mod ids;
pub mod lattice;
pub mod lww;

pub use clock::{compare, is_deliverable, CausalOrder, Clock, VectorClock};
pub use event::{CausalEvent, MembershipChange, MembershipEvent, Message};
pub use ids::{GroupId, PeerId};
pub use lattice::Lattice;
pub use lww::{LwwRegister, Stamp};
