use std::collections::{BTreeMap, VecDeque};
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::ReliableDefaults;
use crate::protocol::frame::Frame;
use crate::protocol::message_id::MessageId;
use crate::util::clock::Clock;

struct TxContext {
    /// id for the next message submitted by the application
    next_id: MessageId,
    /// all messages that were submitted but not acknowledged yet. The first entry is the 'head'
    ///  message, and it is the only one that is actually sent - the others wait for their turn.
    pending: BTreeMap<MessageId, Bytes>,
    /// serialized frames ready to go on the wire: ACKs for received data and (re-)sends of
    ///  the head message
    outbox: VecDeque<Bytes>,
}

struct RxContext {
    /// id of the next message to be delivered - no message with a higher id can be delivered
    ///  before this one
    next_id: MessageId,
    /// received messages that can not be delivered yet because some earlier message is missing
    pending: FxHashMap<MessageId, Bytes>,
    /// in-order, gap-free messages ready to be read by the application
    deliverable: VecDeque<Bytes>,
}

/// This is the state machine for reliable, in-order delivery of messages over an unreliable
///  datagram channel. It does no I/O, all interaction is through byte buffers:
///
/// * [ReliableProtocol::send] accepts a message from the application, and
///   [ReliableProtocol::pop_send_ready] produces frames that should be put on the wire
/// * [ReliableProtocol::feed] accepts frames from the wire, and [ReliableProtocol::read_chunk]
///   produces messages for the application, in the order in which they were sent
/// * [ReliableProtocol::update] notifies the state machine that time has passed, triggering
///   re-sends of messages that were not acknowledged in time
///
/// The protocol is stop-and-wait: There is at most one unacknowledged message on the wire at
///  any given time, and messages submitted while another one is in flight are queued until
///  all previous messages are acknowledged.
///
/// Loss, duplication and reordering of frames are all tolerated: every received DATA frame is
///  ACK'ed (including duplicates, so that a lost ACK is replaced when the data is re-sent), and
///  the receive side uses message ids to suppress duplicates and restore order.
pub struct ReliableProtocol {
    clock: Arc<dyn Clock>,
    retry_interval: Duration,
    next_retry_deadline: Instant,
    tx: TxContext,
    rx: RxContext,
}

impl ReliableProtocol {
    pub fn new(clock: Arc<dyn Clock>) -> ReliableProtocol {
        Self::with_retry_interval(clock, ReliableDefaults::RETRY_INTERVAL)
    }

    pub fn with_retry_interval(clock: Arc<dyn Clock>, retry_interval: Duration) -> ReliableProtocol {
        let next_retry_deadline = clock.now() + retry_interval;
        ReliableProtocol {
            clock,
            retry_interval,
            next_retry_deadline,
            tx: TxContext {
                next_id: MessageId::ZERO,
                pending: Default::default(),
                outbox: Default::default(),
            },
            rx: RxContext {
                next_id: MessageId::ZERO,
                pending: Default::default(),
                deliverable: Default::default(),
            },
        }
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// number of frames that are ready to be sent
    pub fn send_ready_count(&self) -> usize {
        self.tx.outbox.len()
    }

    /// number of messages that were submitted by the application and are not acknowledged yet
    pub fn waiting_send_count(&self) -> usize {
        self.tx.pending.len()
    }

    pub fn is_readable(&self) -> bool {
        !self.rx.deliverable.is_empty()
    }

    pub fn pop_send_ready(&mut self) -> Option<Bytes> {
        self.tx.outbox.pop_front()
    }

    pub fn read_chunk(&mut self) -> Option<Bytes> {
        self.rx.deliverable.pop_front()
    }

    /// Queue a message for sending, returning the id assigned to it. The message goes on the
    ///  wire right away if no other message is waiting for acknowledgement, otherwise it is
    ///  sent after all previous messages were acknowledged.
    pub fn send(&mut self, payload: impl Into<Bytes>) -> MessageId {
        let payload = payload.into();
        if payload.is_empty() {
            warn!("sending an empty message - this is indistinguishable from an ACK on the wire and will never be acknowledged");
        }

        let id = self.tx.next_id;
        self.tx.next_id = id.next();
        trace!("queueing message {} with {} bytes", id, payload.len());
        self.tx.pending.insert(id, payload);

        if self.tx.pending.len() == 1 {
            self.send_head();
        }
        id
    }

    /// Process a single datagram received from the peer.
    pub fn feed(&mut self, datagram: impl Into<Bytes>) {
        let frame = match Frame::deser(datagram.into()) {
            Ok(frame) => frame,
            Err(e) => {
                trace!("dropping malformed frame: {}", e);
                return;
            }
        };

        match frame {
            Frame::Ack(id) => self.on_ack(id),
            Frame::Data(id, payload) => self.on_data(id, payload),
        }
    }

    /// Notify the protocol that time has passed. If the retry deadline is reached, the head
    ///  message (if any) is queued for re-sending.
    ///
    /// Returns the time until the next deadline, i.e. the point in time when this method should
    ///  be called next.
    pub fn update(&mut self) -> Duration {
        let now = self.clock.now();

        if now < self.next_retry_deadline {
            return self.next_retry_deadline - now;
        }

        if let Some((&id, _)) = self.tx.pending.first_key_value() {
            debug!("message {} was not acknowledged in time - re-sending", id);
            self.queue_head_frame();
        }
        self.next_retry_deadline = now + self.retry_interval;
        self.retry_interval
    }

    fn on_ack(&mut self, id: MessageId) {
        match self.tx.pending.first_key_value() {
            Some((&head, _)) if head == id => {
                trace!("message {} was acknowledged", id);
                self.tx.pending.pop_first();
                self.send_head();
            }
            Some((&head, _)) => {
                trace!("ignoring ACK for {} - waiting for ACK of {}", id, head);
            }
            None => {
                trace!("ignoring ACK for {} - no message is waiting for an ACK", id);
            }
        }
    }

    fn on_data(&mut self, id: MessageId, payload: Bytes) {
        // ACK unconditionally, even for duplicates: the ACK for the previous copy may have been lost
        self.tx.outbox.push_back(Frame::Ack(id).to_bytes());

        if id < self.rx.next_id {
            debug!("received message {} which was already delivered - ACKing but not buffering", id);
            return;
        }

        match self.rx.pending.entry(id) {
            Entry::Occupied(_) => {
                debug!("received duplicate of message {} - already buffered", id);
            }
            Entry::Vacant(e) => {
                trace!("received message {} with {} bytes", id, payload.len());
                e.insert(payload);
            }
        }

        while let Some(payload) = self.rx.pending.remove(&self.rx.next_id) {
            trace!("message {} is ready for delivery", self.rx.next_id);
            self.rx.deliverable.push_back(payload);
            self.rx.next_id = self.rx.next_id.next();
        }
    }

    /// puts a new head message on the wire, giving it a full retry interval before re-sending
    fn send_head(&mut self) {
        if self.queue_head_frame() {
            self.next_retry_deadline = self.clock.now() + self.retry_interval;
        }
    }

    fn queue_head_frame(&mut self) -> bool {
        match self.tx.pending.first_key_value() {
            Some((&id, payload)) => {
                self.tx.outbox.push_back(Frame::Data(id, payload.clone()).to_bytes());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::{ManualClock, MockClock};
    use rstest::rstest;

    fn protocol(clock: &ManualClock) -> ReliableProtocol {
        ReliableProtocol::new(Arc::new(clock.clone()))
    }

    fn ack(id: u32) -> Bytes {
        Frame::Ack(MessageId::from_raw(id)).to_bytes()
    }

    fn data(id: u32, payload: &'static [u8]) -> Bytes {
        Frame::Data(MessageId::from_raw(id), Bytes::from_static(payload)).to_bytes()
    }

    #[test]
    fn test_empty_is_unreadable() {
        let mut proto = protocol(&ManualClock::new());
        assert!(!proto.is_readable());
        assert_eq!(proto.read_chunk(), None);
    }

    #[test]
    fn test_empty_has_nothing_to_send() {
        let mut proto = protocol(&ManualClock::new());
        assert_eq!(proto.send_ready_count(), 0);
        assert_eq!(proto.waiting_send_count(), 0);
        assert_eq!(proto.pop_send_ready(), None);
    }

    #[test]
    fn test_send_enqueues_message() {
        let mut proto = protocol(&ManualClock::new());
        let id = proto.send(vec![1u8, 2, 3, 4]);

        assert_eq!(id, MessageId::ZERO);
        assert_eq!(proto.waiting_send_count(), 1);
        assert_eq!(proto.send_ready_count(), 1);
    }

    #[test]
    fn test_send_enqueued_message_value() {
        let mut proto = protocol(&ManualClock::new());
        proto.send(&b"abcd"[..]);

        assert_eq!(proto.pop_send_ready().unwrap().as_ref(), &[0, 0, 0, 0, b'a', b'b', b'c', b'd']);
        assert_eq!(proto.pop_send_ready(), None);
    }

    #[test]
    fn test_second_send_after_ack() {
        let mut proto = protocol(&ManualClock::new());
        proto.send(&b"abcd"[..]);
        proto.pop_send_ready();
        proto.feed(ack(0));

        let id = proto.send(&b"hello"[..]);

        assert_eq!(id, MessageId::from_raw(1));
        assert_eq!(proto.pop_send_ready().unwrap().as_ref(), &[0, 0, 0, 1, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_at_most_one_message_in_flight() {
        let mut proto = protocol(&ManualClock::new());
        proto.send(&b"first"[..]);
        proto.send(&b"second"[..]);

        assert_eq!(proto.waiting_send_count(), 2);
        assert_eq!(proto.send_ready_count(), 1);
        assert_eq!(proto.pop_send_ready(), Some(data(0, b"first")));
        assert_eq!(proto.pop_send_ready(), None);

        proto.feed(ack(0));
        assert_eq!(proto.waiting_send_count(), 1);
        assert_eq!(proto.pop_send_ready(), Some(data(1, b"second")));

        proto.feed(ack(1));
        assert_eq!(proto.waiting_send_count(), 0);
        assert_eq!(proto.send_ready_count(), 0);
    }

    #[rstest]
    #[case::next(1)]
    #[case::far_ahead(5)]
    #[case::max(u32::MAX)]
    fn test_ack_for_other_than_head_is_ignored(#[case] ack_id: u32) {
        let mut proto = protocol(&ManualClock::new());
        proto.send(&b"first"[..]);
        proto.send(&b"second"[..]);

        proto.feed(ack(ack_id));

        assert_eq!(proto.waiting_send_count(), 2);
        assert_eq!(proto.send_ready_count(), 1);
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let mut proto = protocol(&ManualClock::new());
        proto.send(&b"first"[..]);
        proto.send(&b"second"[..]);
        proto.pop_send_ready();
        proto.feed(ack(0));
        proto.pop_send_ready();

        proto.feed(ack(0));

        assert_eq!(proto.waiting_send_count(), 1);
        assert_eq!(proto.send_ready_count(), 0);
    }

    #[test]
    fn test_ack_without_pending_messages_is_ignored() {
        let mut proto = protocol(&ManualClock::new());
        proto.feed(ack(0));

        assert_eq!(proto.waiting_send_count(), 0);
        assert_eq!(proto.send_ready_count(), 0);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::short(vec![0, 0, 0])]
    fn test_malformed_frame_is_dropped(#[case] raw: Vec<u8>) {
        let mut proto = protocol(&ManualClock::new());
        proto.send(&b"abcd"[..]);

        proto.feed(raw);

        assert_eq!(proto.waiting_send_count(), 1);
        assert_eq!(proto.send_ready_count(), 1);
        assert!(!proto.is_readable());
    }

    #[test]
    fn test_data_is_acked_and_delivered() {
        let mut proto = protocol(&ManualClock::new());
        proto.feed(data(0, b"abcd"));

        assert_eq!(proto.pop_send_ready(), Some(ack(0)));
        assert!(proto.is_readable());
        assert_eq!(proto.read_chunk(), Some(Bytes::from_static(b"abcd")));
        assert!(!proto.is_readable());
    }

    #[test]
    fn test_out_of_order_data_is_buffered() {
        let mut proto = protocol(&ManualClock::new());
        proto.feed(data(2, b"c"));
        proto.feed(data(1, b"b"));

        assert!(!proto.is_readable());
        assert_eq!(proto.send_ready_count(), 2);

        proto.feed(data(0, b"a"));

        assert_eq!(proto.read_chunk(), Some(Bytes::from_static(b"a")));
        assert_eq!(proto.read_chunk(), Some(Bytes::from_static(b"b")));
        assert_eq!(proto.read_chunk(), Some(Bytes::from_static(b"c")));
        assert_eq!(proto.read_chunk(), None);

        assert_eq!(proto.pop_send_ready(), Some(ack(2)));
        assert_eq!(proto.pop_send_ready(), Some(ack(1)));
        assert_eq!(proto.pop_send_ready(), Some(ack(0)));
    }

    #[test]
    fn test_duplicate_data_is_acked_but_delivered_once() {
        let mut proto = protocol(&ManualClock::new());
        proto.feed(data(1, b"b"));
        proto.feed(data(1, b"x"));
        proto.feed(data(0, b"a"));
        proto.feed(data(0, b"a"));

        assert_eq!(proto.send_ready_count(), 4);
        assert_eq!(proto.read_chunk(), Some(Bytes::from_static(b"a")));
        assert_eq!(proto.read_chunk(), Some(Bytes::from_static(b"b")));
        assert_eq!(proto.read_chunk(), None);
    }

    #[test]
    fn test_duplicate_of_delivered_data_is_not_retained() {
        let mut proto = protocol(&ManualClock::new());
        proto.feed(data(0, b"a"));
        proto.read_chunk();
        proto.pop_send_ready();

        proto.feed(data(0, b"a"));

        assert_eq!(proto.pop_send_ready(), Some(ack(0)));
        assert!(proto.rx.pending.is_empty());
        assert!(!proto.is_readable());
    }

    #[test]
    fn test_update_causes_retransmission() {
        let clock = ManualClock::new();
        let mut proto = protocol(&clock);
        proto.send(&b"abcd"[..]);
        let message = proto.pop_send_ready();
        assert!(message.is_some());

        clock.advance(Duration::from_secs(2));
        proto.update();

        assert_eq!(proto.send_ready_count(), 1);
        assert_eq!(proto.pop_send_ready(), message);
    }

    #[test]
    fn test_update_before_deadline_does_nothing() {
        let clock = ManualClock::new();
        let mut proto = protocol(&clock);
        proto.send(&b"abcd"[..]);
        proto.pop_send_ready();

        clock.advance(Duration::from_millis(400));

        assert_eq!(proto.update(), Duration::from_millis(600));
        assert_eq!(proto.send_ready_count(), 0);
    }

    #[test]
    fn test_update_returns_interval_after_retransmission() {
        let clock = ManualClock::new();
        let mut proto = ReliableProtocol::with_retry_interval(Arc::new(clock.clone()), Duration::from_millis(250));
        assert_eq!(proto.retry_interval(), Duration::from_millis(250));
        proto.send(&b"abcd"[..]);
        proto.pop_send_ready();

        clock.advance(Duration::from_millis(250));
        assert_eq!(proto.update(), Duration::from_millis(250));
        assert_eq!(proto.send_ready_count(), 1);

        clock.advance(Duration::from_millis(100));
        assert_eq!(proto.update(), Duration::from_millis(150));
        assert_eq!(proto.send_ready_count(), 1);
    }

    #[test]
    fn test_only_head_is_retransmitted() {
        let clock = ManualClock::new();
        let mut proto = protocol(&clock);
        proto.send(&b"first"[..]);
        proto.send(&b"second"[..]);
        proto.pop_send_ready();

        clock.advance(Duration::from_secs(1));
        proto.update();

        assert_eq!(proto.pop_send_ready(), Some(data(0, b"first")));
        assert_eq!(proto.pop_send_ready(), None);
    }

    #[test]
    fn test_new_head_gets_full_retry_interval() {
        let clock = ManualClock::new();
        let mut proto = protocol(&clock);
        proto.send(&b"first"[..]);
        proto.send(&b"second"[..]);
        proto.pop_send_ready();

        clock.advance(Duration::from_millis(900));
        proto.feed(ack(0));
        proto.pop_send_ready();

        clock.advance(Duration::from_millis(200));
        assert_eq!(proto.update(), Duration::from_millis(800));
        assert_eq!(proto.send_ready_count(), 0);
    }

    #[test]
    fn test_update_reads_injected_clock() {
        let start = Instant::now();
        let mut num_calls = 0;
        let mut clock = MockClock::new();
        clock.expect_now()
            .returning(move || {
                num_calls += 1;
                if num_calls == 1 { start } else { start + Duration::from_secs(5) }
            });

        let mut proto = ReliableProtocol::new(Arc::new(clock));
        assert_eq!(proto.update(), Duration::from_secs(1));
    }

    struct Conversation {
        clock: ManualClock,
        sender: ReliableProtocol,
        receiver: ReliableProtocol,
    }
    impl Conversation {
        fn new() -> Conversation {
            let clock = ManualClock::new();
            Conversation {
                sender: protocol(&clock),
                receiver: protocol(&clock),
                clock,
            }
        }

        fn pass_message_and_ack(&mut self) {
            self.receiver.feed(self.sender.pop_send_ready().unwrap());
            self.sender.feed(self.receiver.pop_send_ready().unwrap());
        }

        fn assert_idle(&self) {
            assert_eq!(self.sender.send_ready_count(), 0);
            assert_eq!(self.receiver.send_ready_count(), 0);
        }
    }

    #[test]
    fn test_conversation_single_message() {
        let mut c = Conversation::new();
        c.sender.send(&b"abcd"[..]);
        // pass the message
        c.receiver.feed(c.sender.pop_send_ready().unwrap());
        // pass the ack
        c.sender.feed(c.receiver.pop_send_ready().unwrap());

        assert_eq!(c.receiver.read_chunk(), Some(Bytes::from_static(b"abcd")));
        assert_eq!(c.sender.waiting_send_count(), 0);
        c.assert_idle();
    }

    #[test]
    fn test_conversation_multiple_messages() {
        let messages: [&'static [u8]; 3] = [b"hello", b"world", b"zinc is a simple-stupid protocol"];

        let mut c = Conversation::new();
        for message in messages {
            c.sender.send(message);
        }
        for _ in messages {
            c.pass_message_and_ack();
        }
        for message in messages {
            assert_eq!(c.receiver.read_chunk(), Some(Bytes::from_static(message)));
        }

        c.assert_idle();
    }

    #[test]
    fn test_conversation_idle_after_send_and_ack() {
        let mut c = Conversation::new();
        c.sender.send(&b"abcd"[..]);
        c.pass_message_and_ack();
        c.receiver.read_chunk();

        c.clock.advance(Duration::from_secs(2));
        c.sender.update();
        c.receiver.update();

        c.assert_idle();
    }

    #[test]
    fn test_conversation_with_drop() {
        let mut c = Conversation::new();
        c.sender.send(&b"abcd"[..]);

        // drop the message
        c.sender.pop_send_ready();

        c.clock.advance(Duration::from_secs(2));
        c.sender.update();
        c.pass_message_and_ack();

        assert_eq!(c.receiver.read_chunk(), Some(Bytes::from_static(b"abcd")));

        c.sender.update();
        c.receiver.update();
        c.assert_idle();
    }

    #[test]
    fn test_conversation_idle_after_drop_and_pass() {
        let mut c = Conversation::new();
        c.sender.send(&b"abcd"[..]);

        // drop the message
        c.sender.pop_send_ready();

        c.clock.advance(Duration::from_secs(2));
        c.sender.update();
        c.pass_message_and_ack();
        assert!(c.receiver.read_chunk().is_some());

        c.clock.advance(Duration::from_secs(2));
        c.sender.update();
        c.receiver.update();
        c.assert_idle();
    }

    #[test]
    fn test_conversation_lost_ack_is_replaced() {
        let mut c = Conversation::new();
        c.sender.send(&b"abcd"[..]);
        c.receiver.feed(c.sender.pop_send_ready().unwrap());

        // drop the ack
        c.receiver.pop_send_ready();

        c.clock.advance(Duration::from_secs(1));
        c.sender.update();
        c.pass_message_and_ack();

        assert_eq!(c.receiver.read_chunk(), Some(Bytes::from_static(b"abcd")));
        assert_eq!(c.receiver.read_chunk(), None);
        assert_eq!(c.sender.waiting_send_count(), 0);
        c.assert_idle();
    }
}
