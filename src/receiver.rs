//! The receive engine: reordering, message reassembly, loss detection and ACK/NAK
//! bookkeeping.
//!
//! Arriving data packets land in a sparse buffer keyed by sequence number. The contiguous
//! prefix is drained in order into per-message builders; completed messages are handed to
//! the delivery layer. Gaps between the drain point and the highest received sequence are
//! reported to the peer as NAKs.

use std::collections::VecDeque;

use ahash::AHashMap;
use bytes::{BufMut, Bytes, BytesMut};

use crate::metrics::Counter;
use crate::packet::{DataPacket, PacketPosition, SequenceNumbers, Timestamp};
use crate::utils::message::MessageNumber;
use crate::utils::sequence::Sequence;

/// The verdict on an arriving data packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted,
    /// Already acknowledged or already buffered.
    Duplicate,
    /// Beyond the high edge of the receive window.
    Overflow,
}

/// A fully reassembled user-level message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub number: MessageNumber,
    /// Sequence number of the first packet of the message.
    pub sequence: Sequence,
    /// Origin timestamp of the first packet of the message.
    pub timestamp: Timestamp,
    pub data: Bytes,
}

/// Accumulates the fragments of one message from `First` through `Last`.
#[derive(Clone, Debug)]
struct MessageBuilder {
    number: MessageNumber,
    first_sequence: Sequence,
    last_sequence: Sequence,
    timestamp: Timestamp,
    fragments: Vec<Bytes>,
}

impl MessageBuilder {
    fn new(packet: &DataPacket) -> Self {
        Self {
            number: packet.message_number(),
            first_sequence: packet.packet_sequence_number(),
            last_sequence: packet.packet_sequence_number(),
            timestamp: packet.header.timestamp,
            fragments: vec![packet.data.clone()],
        }
    }

    fn append(&mut self, packet: &DataPacket) {
        self.last_sequence = packet.packet_sequence_number();
        self.fragments.push(packet.data.clone());
    }

    /// `true` once every sequence from first to last is present.
    fn is_contiguous(&self) -> bool {
        self.last_sequence.distance(self.first_sequence) as usize + 1 == self.fragments.len()
    }

    fn assemble(self) -> Message {
        let total = self.fragments.iter().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(total);
        for fragment in &self.fragments {
            data.put_slice(fragment);
        }

        Message {
            number: self.number,
            sequence: self.first_sequence,
            timestamp: self.timestamp,
            data: data.freeze(),
        }
    }
}

/// A copyable snapshot of the receive engine counters.
#[derive(Copy, Clone, Debug, Default)]
pub struct RecvStats {
    pub packets_received: Counter,
    pub duplicates: Counter,
    pub out_of_order: Counter,
    pub window_overflow: Counter,
    pub messages_completed: Counter,
    /// Fragments whose message builder no longer exists, e.g. after a peer drop request.
    pub orphan_fragments: Counter,
    pub acks_emitted: Counter,
    pub naks_emitted: Counter,
    /// Packets discarded on behalf of a peer drop request.
    pub peer_dropped: Counter,
}

/// The receiving half of the reliable delivery engine.
#[derive(Clone, Debug)]
pub struct ReceiveEngine {
    /// The next sequence the contiguous drain is waiting for.
    expected: Sequence,
    /// The drain position covered by the last emitted cumulative ACK.
    last_ack_next: Sequence,
    /// Highest sequence observed so far.
    max_received: Option<Sequence>,
    window: u32,
    ack_frequency: u32,
    accepted_since_ack: u32,
    buffer: AHashMap<u32, DataPacket>,
    builders: AHashMap<u32, MessageBuilder>,
    /// Ranges discarded by peer drop requests, skipped by drain and loss detection.
    dropped_ranges: Vec<(Sequence, Sequence)>,
    completed: VecDeque<Message>,
    stats: RecvStats,
}

impl ReceiveEngine {
    pub fn new(initial_sequence: Sequence, window: u32, ack_frequency: u32) -> Self {
        Self {
            expected: initial_sequence,
            last_ack_next: initial_sequence,
            max_received: None,
            window: window.max(1),
            ack_frequency: ack_frequency.max(1),
            accepted_since_ack: 0,
            buffer: AHashMap::new(),
            builders: AHashMap::new(),
            dropped_ranges: Vec::new(),
            completed: VecDeque::new(),
            stats: RecvStats::default(),
        }
    }

    /// Accepts an arriving data packet into the reorder buffer and drains the contiguous
    /// prefix into message reassembly.
    pub fn handle_data(&mut self, packet: DataPacket) -> AcceptOutcome {
        let seq = packet.packet_sequence_number();

        if seq < self.expected || self.buffer.contains_key(&seq.get()) {
            self.stats.duplicates.inc();
            return AcceptOutcome::Duplicate;
        }

        if seq.distance(self.expected) >= self.window {
            self.stats.window_overflow.inc();
            tracing::debug!("Packet {} beyond the receive window, rejecting", seq);
            return AcceptOutcome::Overflow;
        }

        if seq != self.expected {
            self.stats.out_of_order.inc();
        }

        self.max_received = match self.max_received {
            Some(max) if max > seq => Some(max),
            _ => Some(seq),
        };

        self.buffer.insert(seq.get(), packet);
        self.stats.packets_received.inc();
        self.accepted_since_ack += 1;

        self.drain();

        AcceptOutcome::Accepted
    }

    /// Emits a cumulative ACK value if the drain point advanced since the last one.
    ///
    /// Without `force`, an ACK is only due once `ack_frequency` packets have been
    /// accepted; the periodic ACK timer passes `force` to flush regardless. The emitted
    /// value acknowledges everything below the drain point and never decreases.
    pub fn ack_due(&mut self, force: bool) -> Option<Sequence> {
        if self.expected == self.last_ack_next {
            return None;
        }

        if !force && self.accepted_since_ack < self.ack_frequency {
            return None;
        }

        self.last_ack_next = self.expected;
        self.accepted_since_ack = 0;
        self.stats.acks_emitted.inc();

        // The cumulative value covers up to, and including, the packet before the drain
        // point.
        Some(self.expected + Sequence::MAX)
    }

    /// The sequences between the drain point and the highest received sequence that are
    /// still missing.
    pub fn loss_list(&self) -> SequenceNumbers {
        let mut missing = SequenceNumbers::new();

        let Some(max_received) = self.max_received else {
            return missing;
        };
        if max_received < self.expected {
            return missing;
        }

        let span = max_received.distance(self.expected).min(self.window);

        for offset in 0..span {
            let seq = self.expected + offset;

            if !self.buffer.contains_key(&seq.get()) && !self.is_dropped(seq) {
                missing.push(seq);
            }
        }

        missing
    }

    /// Records a NAK emission for statistics.
    pub fn note_nak(&mut self) {
        self.stats.naks_emitted.inc();
    }

    /// Honors a peer drop request: the range is abandoned, its fragments discarded and
    /// the drain point moved past it if it was stuck inside.
    pub fn handle_drop(&mut self, message: MessageNumber, first: Sequence, last: Sequence) {
        if last < first {
            return;
        }

        self.builders.remove(&message.get());

        let count = last.distance(first) + 1;
        for offset in 0..count {
            let seq = first + offset;
            self.buffer.remove(&seq.get());
        }
        self.stats.peer_dropped.add(count as u64);

        if self.expected >= first && self.expected <= last {
            self.expected = last + 1;
            self.drain();
        } else if self.expected < first {
            self.dropped_ranges.push((first, last));
        }

        self.max_received = match self.max_received {
            Some(max) if max > last => Some(max),
            _ => Some(last),
        };
    }

    /// Removes and returns the completed messages in drain order.
    pub fn take_messages(&mut self) -> Vec<Message> {
        self.completed.drain(..).collect()
    }

    /// The next sequence the drain is waiting for.
    #[inline]
    pub fn expected(&self) -> Sequence {
        self.expected
    }

    pub fn stats(&self) -> RecvStats {
        self.stats
    }

    fn is_dropped(&self, seq: Sequence) -> bool {
        self.dropped_ranges
            .iter()
            .any(|&(first, last)| seq >= first && seq <= last)
    }

    fn drain(&mut self) {
        loop {
            if let Some(packet) = self.buffer.remove(&self.expected.get()) {
                self.expected += 1;
                self.reassemble(packet);
                continue;
            }

            // Jump over ranges the peer asked us to abandon.
            if let Some(index) = self
                .dropped_ranges
                .iter()
                .position(|&(first, _)| first == self.expected)
            {
                let (_, last) = self.dropped_ranges.swap_remove(index);
                self.expected = last + 1;
                continue;
            }

            break;
        }
    }

    fn reassemble(&mut self, packet: DataPacket) {
        match packet.packet_position() {
            PacketPosition::Only => {
                self.completed.push_back(
                    MessageBuilder::new(&packet).assemble(),
                );
                self.stats.messages_completed.inc();
            }
            PacketPosition::First => {
                let builder = MessageBuilder::new(&packet);
                if self
                    .builders
                    .insert(packet.message_number().get(), builder)
                    .is_some()
                {
                    self.stats.orphan_fragments.inc();
                }
            }
            PacketPosition::Middle => {
                match self.builders.get_mut(&packet.message_number().get()) {
                    Some(builder) => builder.append(&packet),
                    None => self.stats.orphan_fragments.inc(),
                }
            }
            PacketPosition::Last => {
                let Some(mut builder) = self.builders.remove(&packet.message_number().get())
                else {
                    self.stats.orphan_fragments.inc();
                    return;
                };

                builder.append(&packet);

                if builder.is_contiguous() {
                    self.completed.push_back(builder.assemble());
                    self.stats.messages_completed.inc();
                } else {
                    // A fragment is still outstanding; keep waiting for it.
                    self.builders.insert(builder.number.get(), builder);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use bytes::Bytes;

    use crate::packet::{DataPacket, PacketPosition, Timestamp};
    use crate::sender::{RetransmitOutcome, SendEngine};
    use crate::utils::message::MessageNumber;
    use crate::utils::sequence::Sequence;

    use super::{AcceptOutcome, ReceiveEngine};

    fn data_packet(seq: u32, position: PacketPosition, message: u32, body: &'static [u8]) -> DataPacket {
        DataPacket::builder()
            .sequence_number(Sequence::new(seq))
            .message_number(MessageNumber::new(message))
            .packet_position(position)
            .ordered(true)
            .body(Bytes::from_static(body))
            .build()
    }

    fn engine() -> ReceiveEngine {
        ReceiveEngine::new(Sequence::new(1), 8192, 10)
    }

    #[test]
    fn test_in_order_only_packets() {
        let mut recv = engine();

        for seq in 1..=3u32 {
            assert_eq!(
                recv.handle_data(data_packet(seq, PacketPosition::Only, seq, b"x")),
                AcceptOutcome::Accepted
            );
        }

        let messages = recv.take_messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(recv.expected(), Sequence::new(4));
        assert_eq!(recv.stats().out_of_order.get(), 0);
    }

    #[test]
    fn test_reorder_and_reassemble() {
        let mut recv = engine();

        // Arrival order 2, 1, 3 for a three-fragment message.
        recv.handle_data(data_packet(2, PacketPosition::Middle, 7, b"bb"));
        assert!(recv.take_messages().is_empty());

        recv.handle_data(data_packet(1, PacketPosition::First, 7, b"aa"));
        // The last fragment has not arrived; nothing is delivered yet.
        assert!(recv.take_messages().is_empty());

        recv.handle_data(data_packet(3, PacketPosition::Last, 7, b"cc"));

        let messages = recv.take_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0].data[..], b"aabbcc");
        assert_eq!(messages[0].number, MessageNumber::new(7));
        assert_eq!(messages[0].sequence, Sequence::new(1));

        assert_eq!(recv.stats().out_of_order.get(), 1);
        assert_eq!(recv.stats().messages_completed.get(), 1);
    }

    #[test]
    fn test_duplicates_never_delivered_twice() {
        let mut recv = engine();

        assert_eq!(
            recv.handle_data(data_packet(1, PacketPosition::Only, 1, b"x")),
            AcceptOutcome::Accepted
        );
        // Same sequence again after delivery.
        assert_eq!(
            recv.handle_data(data_packet(1, PacketPosition::Only, 1, b"x")),
            AcceptOutcome::Duplicate
        );

        // A buffered but undrained sequence also rejects duplicates.
        assert_eq!(
            recv.handle_data(data_packet(5, PacketPosition::Only, 2, b"y")),
            AcceptOutcome::Accepted
        );
        assert_eq!(
            recv.handle_data(data_packet(5, PacketPosition::Only, 2, b"y")),
            AcceptOutcome::Duplicate
        );

        assert_eq!(recv.take_messages().len(), 1);
        assert_eq!(recv.stats().duplicates.get(), 2);
    }

    #[test]
    fn test_window_overflow_rejected() {
        let mut recv = ReceiveEngine::new(Sequence::new(1), 16, 10);

        assert_eq!(
            recv.handle_data(data_packet(17, PacketPosition::Only, 1, b"x")),
            AcceptOutcome::Overflow
        );
        assert_eq!(recv.stats().window_overflow.get(), 1);
    }

    #[test]
    fn test_loss_detection() {
        let mut recv = engine();

        recv.handle_data(data_packet(1, PacketPosition::Only, 1, b"x"));
        recv.handle_data(data_packet(2, PacketPosition::Only, 2, b"x"));
        recv.handle_data(data_packet(5, PacketPosition::Only, 3, b"x"));

        let missing: Vec<u32> = recv.loss_list().iter().map(Sequence::get).collect();
        assert_eq!(missing, [3, 4]);
    }

    #[test]
    fn test_ack_frequency_and_monotonicity() {
        let mut recv = ReceiveEngine::new(Sequence::new(1), 8192, 3);

        recv.handle_data(data_packet(1, PacketPosition::Only, 1, b"x"));
        recv.handle_data(data_packet(2, PacketPosition::Only, 2, b"x"));
        assert_eq!(recv.ack_due(false), None);

        recv.handle_data(data_packet(3, PacketPosition::Only, 3, b"x"));
        assert_eq!(recv.ack_due(false), Some(Sequence::new(3)));

        // Nothing new: even a forced ACK stays silent.
        assert_eq!(recv.ack_due(true), None);

        recv.handle_data(data_packet(4, PacketPosition::Only, 4, b"x"));
        // The timer path flushes below the frequency threshold.
        assert_eq!(recv.ack_due(true), Some(Sequence::new(4)));
    }

    #[test]
    fn test_peer_drop_unblocks_drain() {
        let mut recv = engine();

        recv.handle_data(data_packet(1, PacketPosition::First, 1, b"a"));
        recv.handle_data(data_packet(4, PacketPosition::Only, 2, b"b"));
        assert!(recv.take_messages().is_empty());

        // The sender gave up on message 1 covering sequences 2..=3.
        recv.handle_drop(MessageNumber::new(1), Sequence::new(2), Sequence::new(3));

        let messages = recv.take_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0].data[..], b"b");
        assert_eq!(recv.expected(), Sequence::new(5));
        assert!(recv.loss_list().is_empty());
    }

    // Loss, NAK and retransmission across both engines: sequences 4 and 7 of ten are
    // dropped in transit, NAKed, retransmitted and finally acknowledged.
    #[test]
    fn test_loss_nak_retransmit_cycle() {
        let now = Instant::now();
        let rto = Duration::from_millis(100);
        let max_rto = Duration::from_secs(60);

        let mut send = SendEngine::new(Sequence::new(1), 16, 5);
        let mut recv = ReceiveEngine::new(Sequence::new(1), 8192, 10);

        let mut packets = Vec::new();
        for _ in 0..10 {
            packets.extend(send.fragment(
                Bytes::from_static(b"payload"),
                true,
                Timestamp::from_micros(0),
            ));
        }
        assert_eq!(packets.len(), 10);

        for packet in &packets {
            send.register(packet.clone(), now, rto);
        }

        // Sequences 4 and 7 are lost in transit.
        for packet in &packets {
            let seq = packet.packet_sequence_number().get();
            if seq != 4 && seq != 7 {
                assert_eq!(recv.handle_data(packet.clone()), AcceptOutcome::Accepted);
            }
        }

        // The receiver acknowledges the contiguous prefix and NAKs the gaps.
        assert_eq!(recv.ack_due(true), Some(Sequence::new(3)));
        let missing = recv.loss_list();
        assert_eq!(missing.iter().map(Sequence::get).collect::<Vec<_>>(), [4, 7]);

        let acked = send.handle_ack(Sequence::new(3));
        assert_eq!(acked.len(), 3);

        // The sender retransmits both with the retransmission flag set.
        for seq in missing.iter() {
            let RetransmitOutcome::Resend(packet, _) = send.retransmit(seq, rto, max_rto, now)
            else {
                panic!("expected resend for {}", seq);
            };
            assert!(packet.header.is_retransmitted());
            assert_eq!(recv.handle_data(packet), AcceptOutcome::Accepted);
        }

        // Everything is now delivered and acknowledged through sequence 10.
        assert_eq!(recv.take_messages().len(), 10);
        assert_eq!(recv.ack_due(true), Some(Sequence::new(10)));
        assert_eq!(send.handle_ack(Sequence::new(10)).len(), 7);
        assert_eq!(send.unacked_len(), 0);
    }
}
