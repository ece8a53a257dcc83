//! Delivery log and pending buffer for one stream of one group.

use cbc_core::clock::{Clock, VectorClock};
use cbc_core::event::CausalEvent;
use cbc_core::ids::{GroupId, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A window of the delivery log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage<E> {
    pub entries: Vec<E>,
    /// Index of the first entry in the full log.
    pub offset: usize,
    /// Length of the full log when the page was taken.
    pub total: usize,
}

impl<E> HistoryPage<E> {
    pub fn has_more(&self) -> bool {
        self.offset + self.entries.len() < self.total
    }
}

/// Delivered events in delivery order plus events still waiting on causal
/// predecessors.
///
/// The store never decides deliverability on its own state; every mutating
/// call takes the stream's [`Clock`] and advances its delivered vector as
/// entries are appended, so log and clock cannot drift apart.
#[derive(Clone, Debug)]
pub struct MessageStore<E: CausalEvent> {
    group: GroupId,
    log: Vec<E>,
    /// Keyed by identity so iteration follows the `(origin, seq)` tie-break.
    pending: BTreeMap<(PeerId, u64), E>,
}

impl<E: CausalEvent> MessageStore<E> {
    pub fn new(group: GroupId) -> Self {
        Self {
            group,
            log: Vec::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Rebuild from persisted entries, already in delivery order.
    pub fn restore(group: GroupId, entries: Vec<E>, clock: &mut Clock) -> Self {
        let mut store = Self::new(group);
        for entry in entries {
            if clock.has_delivered(entry.origin(), entry.seq()) {
                continue;
            }
            store.append(entry, clock);
        }
        store
    }

    pub fn group(&self) -> &GroupId {
        &self.group
    }

    /// Append an event that passed the delivery condition.
    pub fn append(&mut self, event: E, clock: &mut Clock) {
        clock.record_delivery(event.origin(), event.seq());
        self.log.push(event);
    }

    /// Buffer an event whose predecessors have not been delivered.
    ///
    /// Returns `false` when the event is already pending or delivered; such
    /// duplicates are dropped.
    pub fn enqueue(&mut self, event: E, clock: &Clock) -> bool {
        let id = event.id();
        if clock.has_delivered(&id.0, id.1) || self.pending.contains_key(&id) {
            return false;
        }
        self.pending.insert(id, event);
        true
    }

    /// Move every event that became deliverable into the log.
    ///
    /// Each pass walks the buffer in `(origin, seq)` order and appends what
    /// is deliverable against the continuously advancing clock. Passes repeat
    /// until one appends nothing. The result depends only on the buffered set
    /// and the clock, never on arrival order.
    pub fn drain_deliverable(&mut self, clock: &mut Clock) -> Vec<E> {
        let mut drained = Vec::new();
        loop {
            let mut progressed = false;
            let keys: Vec<(PeerId, u64)> = self.pending.keys().cloned().collect();
            for key in keys {
                if clock.has_delivered(&key.0, key.1) {
                    self.pending.remove(&key);
                    continue;
                }
                let ready = self
                    .pending
                    .get(&key)
                    .map_or(false, |event| event.is_deliverable_at(clock.delivered()));
                if !ready {
                    continue;
                }
                if let Some(event) = self.pending.remove(&key) {
                    self.append(event.clone(), clock);
                    drained.push(event);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        drained
    }

    /// The full delivery log.
    pub fn history(&self) -> &[E] {
        &self.log
    }

    pub fn history_page(&self, offset: usize, limit: usize) -> HistoryPage<E> {
        let total = self.log.len();
        let start = offset.min(total);
        let end = start.saturating_add(limit).min(total);
        HistoryPage {
            entries: self.log[start..end].to_vec(),
            offset: start,
            total,
        }
    }

    /// Log entries not covered by `have`, in log order.
    ///
    /// The log is causally closed, so replaying the result in order on a
    /// node whose delivered clock is `have` delivers every entry.
    pub fn since(&self, have: &VectorClock) -> Vec<E> {
        self.log
            .iter()
            .filter(|e| !have.contains(e.origin(), e.seq()))
            .cloned()
            .collect()
    }

    pub fn contains(&self, origin: &PeerId, seq: u64) -> bool {
        self.pending.contains_key(&(origin.clone(), seq))
            || self.log.iter().any(|e| e.origin() == origin && e.seq() == seq)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &E> {
        self.pending.values()
    }

    /// Drop every buffered event.
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}
