//! Per-group state: two causal streams and the delivery task.

use crate::events::EngineEvent;
use cbc_core::clock::{Clock, VectorClock};
use cbc_core::event::{CausalEvent, MembershipEvent, Message};
use cbc_core::ids::{GroupId, PeerId};
use cbc_log::{MessageStore, StoredGroup};
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

/// Outcome of handing one received event to a stream.
#[derive(Debug)]
pub(crate) struct Receipt<E> {
    /// Events appended to the log, in delivery order.
    pub delivered: Vec<E>,
    /// The event is waiting on a predecessor.
    pub buffered: bool,
}

/// Clock and store of one stream, always mutated together.
#[derive(Debug)]
pub(crate) struct Stream<E: CausalEvent> {
    pub clock: Clock,
    pub store: MessageStore<E>,
}

impl<E: CausalEvent> Stream<E> {
    pub(crate) fn new(group: GroupId) -> Self {
        Self {
            clock: Clock::new(),
            store: MessageStore::new(group),
        }
    }

    pub(crate) fn restore(group: GroupId, entries: Vec<E>) -> Self {
        let mut clock = Clock::new();
        let store = MessageStore::restore(group, entries, &mut clock);
        Self { clock, store }
    }

    /// Stamp for a new local event.
    pub(crate) fn stamp(&mut self, local: &PeerId) -> VectorClock {
        self.clock.increment(local)
    }

    pub(crate) fn append_local(&mut self, event: E) {
        self.store.append(event, &mut self.clock);
    }

    pub(crate) fn receive(&mut self, event: E) -> Receipt<E> {
        self.clock.merge(event.clock());
        if self.clock.has_delivered(event.origin(), event.seq()) {
            trace!(origin = %event.origin(), seq = event.seq(), "duplicate dropped");
            return Receipt {
                delivered: Vec::new(),
                buffered: false,
            };
        }
        if event.is_deliverable_at(self.clock.delivered()) {
            self.store.append(event.clone(), &mut self.clock);
            let mut delivered = vec![event];
            delivered.extend(self.store.drain_deliverable(&mut self.clock));
            Receipt {
                delivered,
                buffered: false,
            }
        } else {
            let buffered = self.store.enqueue(event, &self.clock);
            Receipt {
                delivered: Vec::new(),
                buffered,
            }
        }
    }
}

/// Everything a node keeps for one group.
pub(crate) struct GroupState {
    pub id: GroupId,
    pub chat: Stream<Message>,
    pub membership: Stream<MembershipEvent>,
    /// Feeds the delivery task. Present while this node is a member.
    delivery: Option<mpsc::UnboundedSender<Message>>,
    /// A gap request is in flight and no response has come back yet.
    gap_requested: bool,
}

impl GroupState {
    pub(crate) fn new(id: GroupId) -> Self {
        Self {
            chat: Stream::new(id.clone()),
            membership: Stream::new(id.clone()),
            id,
            delivery: None,
            gap_requested: false,
        }
    }

    pub(crate) fn restore(id: GroupId, stored: StoredGroup) -> Self {
        Self {
            chat: Stream::restore(id.clone(), stored.messages),
            membership: Stream::restore(id.clone(), stored.membership),
            id,
            delivery: None,
            gap_requested: false,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.delivery.is_some()
    }

    /// Start the delivery task that forwards this group's delivered chat to
    /// the application, in order.
    pub(crate) fn activate(&mut self, events: &broadcast::Sender<EngineEvent>) {
        if self.delivery.is_some() {
            return;
        }
        let (queue, mut rx) = mpsc::unbounded_channel::<Message>();
        let events = events.clone();
        // exits once the sender is dropped and the queue is drained
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let _ = events.send(EngineEvent::Delivered {
                    group: message.group.clone(),
                    message,
                });
            }
        });
        self.delivery = Some(queue);
    }

    /// Stop delivering and drop buffered chat. Messages already handed to
    /// the delivery task are still announced. The log and clocks stay so
    /// sequence numbers are never reused. Returns how many buffered messages
    /// were dropped.
    pub(crate) fn deactivate(&mut self) -> usize {
        self.delivery = None;
        self.chat.store.discard_pending()
    }

    /// Hand a delivered message to the delivery task.
    pub(crate) fn deliver(&self, message: Message) {
        if let Some(queue) = &self.delivery {
            if queue.send(message).is_err() {
                trace!(group = %self.id, "delivery task gone");
            }
        }
    }

    /// Whether to ask peers for this group's missing events now. At most one
    /// request is outstanding until a response arrives or [`rearm_gap_request`]
    /// is called.
    ///
    /// [`rearm_gap_request`]: GroupState::rearm_gap_request
    pub(crate) fn should_request_gap(&mut self) -> bool {
        if self.gap_requested {
            return false;
        }
        if self.chat.clock.missing().is_empty() && self.membership.clock.missing().is_empty() {
            return false;
        }
        self.gap_requested = true;
        true
    }

    pub(crate) fn rearm_gap_request(&mut self) {
        self.gap_requested = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(origin: &str, entries: &[(&str, u64)], text: &str) -> Message {
        let clock = VectorClock::from_entries(entries.iter().map(|(p, n)| (PeerId::new(*p), *n)));
        Message::new(GroupId::lobby(), PeerId::new(origin), clock, text)
    }

    #[test]
    fn test_out_of_order_pair_delivered_in_one_pass() {
        let mut stream: Stream<Message> = Stream::new(GroupId::lobby());
        let m1 = msg("x", &[("x", 1)], "M1");
        let m2 = msg("x", &[("x", 2)], "M2");

        let first = stream.receive(m2);
        assert!(first.delivered.is_empty());
        assert!(first.buffered);
        assert_eq!(stream.clock.missing(), vec![(PeerId::new("x"), 1, 2)]);

        let second = stream.receive(m1);
        let texts: Vec<&str> = second.delivered.iter().map(|m| m.payload.as_str()).collect();
        assert_eq!(texts, vec!["M1", "M2"]);
        assert!(stream.clock.missing().is_empty());
        assert_eq!(stream.store.pending_len(), 0);
    }

    #[test]
    fn test_duplicate_receipt_is_ignored() {
        let mut stream: Stream<Message> = Stream::new(GroupId::lobby());
        let m1 = msg("x", &[("x", 1)], "M1");
        assert_eq!(stream.receive(m1.clone()).delivered.len(), 1);
        let again = stream.receive(m1);
        assert!(again.delivered.is_empty());
        assert!(!again.buffered);
        assert_eq!(stream.store.len(), 1);
    }

    #[test]
    fn test_local_stamp_follows_delivered() {
        let mut stream: Stream<Message> = Stream::new(GroupId::lobby());
        stream.receive(msg("x", &[("x", 1)], "from x"));

        let me = PeerId::new("me");
        let stamp = stream.stamp(&me);
        let mine = Message::new(GroupId::lobby(), me.clone(), stamp, "reply");
        assert_eq!(mine.seq, 1);
        assert_eq!(mine.clock.get(&PeerId::new("x")), 1);
        stream.append_local(mine);
        assert_eq!(stream.clock.delivered().get(&me), 1);
        assert_eq!(stream.store.len(), 2);
    }

    #[tokio::test]
    async fn test_deactivate_discards_pending_keeps_log() {
        let (events, mut rx) = broadcast::channel(16);
        let mut state = GroupState::new(GroupId::new("g"));
        state.activate(&events);
        assert!(state.is_active());

        let delivered = state.chat.receive(msg("x", &[("x", 1)], "kept"));
        for m in delivered.delivered {
            state.deliver(m);
        }
        match rx.recv().await.unwrap() {
            EngineEvent::Delivered { message, .. } => assert_eq!(message.payload, "kept"),
            other => panic!("unexpected event {:?}", other),
        }

        state.chat.receive(msg("x", &[("x", 3)], "orphan"));
        assert_eq!(state.deactivate(), 1);
        assert!(!state.is_active());
        assert_eq!(state.chat.store.len(), 1);
        assert_eq!(state.chat.clock.delivered().get(&PeerId::new("x")), 1);
    }

    #[tokio::test]
    async fn test_deactivate_still_announces_queued_deliveries() {
        let (events, mut rx) = broadcast::channel(16);
        let mut state = GroupState::new(GroupId::new("g"));
        state.activate(&events);

        let receipt = state.chat.receive(msg("x", &[("x", 1)], "last words"));
        for m in receipt.delivered {
            state.deliver(m);
        }
        // leave before the delivery task had a chance to run
        state.deactivate();

        match rx.recv().await.unwrap() {
            EngineEvent::Delivered { message, .. } => assert_eq!(message.payload, "last words"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_gap_request_is_debounced() {
        let mut state = GroupState::new(GroupId::lobby());
        assert!(!state.should_request_gap());

        state.chat.receive(msg("x", &[("x", 2)], "M2"));
        assert!(state.should_request_gap());
        state.chat.receive(msg("x", &[("x", 3)], "M3"));
        assert!(!state.should_request_gap());

        state.rearm_gap_request();
        assert!(state.should_request_gap());

        state.rearm_gap_request();
        state.chat.receive(msg("x", &[("x", 1)], "M1"));
        assert!(!state.should_request_gap());
    }
}
