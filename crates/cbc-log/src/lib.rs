//! Causeway delivery log.
//!
//! [`MessageStore`] owns one stream of one group: the append-only delivery
//! log and the buffer of events that arrived before their causal
//! predecessors. [`LogStorage`] persists delivered entries so a restarted
//! node gets its own history back.
//!
//! # Delivery
//!
//! ```text
//! on receive e:
//!   if delivered(e)            drop            // duplicate
//!   elif deliverable(e, V)     append e; drain
//!   else                       pending += e
//!
//! drain:
//!   repeat
//!     for p in pending ordered by (origin, seq):
//!       if deliverable(p, V)   append p        // V advances immediately
//!   until a pass appends nothing
//! ```

pub mod error;
pub mod storage;
pub mod store;

pub use error::{LogError, Result};
pub use storage::{FileLogStorage, LogStorage, MemoryLogStorage, StoredGroup};
pub use store::{HistoryPage, MessageStore};
