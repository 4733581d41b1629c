//! The send engine: fragmentation, acknowledgement tracking and retransmission.
//!
//! Every transmitted data packet is held as an [`UnackedEntry`] until a cumulative ACK
//! covers its sequence number or its retransmission budget is exhausted. Retransmissions
//! reuse the original sequence number so the receiver can slot them into the same gap.

use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;

use crate::metrics::Counter;
use crate::packet::{DataPacket, PacketPosition, Timestamp};
use crate::utils::message::MessageNumber;
use crate::utils::sequence::Sequence;

/// Backoff multiplier applied per retransmission attempt.
const BACKOFF_FACTOR: f64 = 1.5;

/// A sent but not yet acknowledged packet.
#[derive(Clone, Debug)]
pub struct UnackedEntry {
    pub packet: DataPacket,
    pub first_send_time: Instant,
    pub retransmit_count: u32,
    pub next_retransmit_due: Instant,
}

/// The outcome of a retransmission request for one sequence.
#[derive(Clone, Debug)]
pub enum RetransmitOutcome {
    /// Resend this packet and re-arm its timer after the given delay.
    Resend(DataPacket, Duration),
    /// The retransmission budget is spent; the packet was dropped from the window.
    Exhausted {
        message: MessageNumber,
        sequence: Sequence,
    },
    /// The sequence is no longer tracked, typically because an ACK arrived first.
    AlreadyAcked,
}

/// A copyable snapshot of the send engine counters.
#[derive(Copy, Clone, Debug, Default)]
pub struct SendStats {
    pub messages_fragmented: Counter,
    pub packets_fragmented: Counter,
    pub packets_acked: Counter,
    pub retransmissions: Counter,
    /// Packets given up after exhausting their retransmission budget.
    pub send_losses: Counter,
}

/// The sending half of the reliable delivery engine.
#[derive(Clone, Debug)]
pub struct SendEngine {
    next_sequence: Sequence,
    next_message: MessageNumber,
    max_payload: usize,
    max_retransmits: u32,
    unacked: AHashMap<u32, UnackedEntry>,
    stats: SendStats,
}

impl SendEngine {
    pub fn new(initial_sequence: Sequence, max_payload: usize, max_retransmits: u32) -> Self {
        Self {
            next_sequence: initial_sequence,
            next_message: MessageNumber::new(1),
            max_payload: max_payload.max(1),
            max_retransmits,
            unacked: AHashMap::new(),
            stats: SendStats::default(),
        }
    }

    /// The number of packets awaiting acknowledgement.
    #[inline]
    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// The number of packets `payload` will fragment into.
    pub fn fragment_count(&self, payload_len: usize) -> usize {
        payload_len.div_ceil(self.max_payload).max(1)
    }

    /// Splits `payload` into sequenced packets sharing one message number.
    ///
    /// Single-chunk messages are flagged [`PacketPosition::Only`]; multi-chunk messages
    /// run from [`PacketPosition::First`] through [`PacketPosition::Last`].
    pub fn fragment(
        &mut self,
        payload: Bytes,
        ordered: bool,
        timestamp: Timestamp,
    ) -> Vec<DataPacket> {
        let message = self.next_message.fetch_next();
        let count = self.fragment_count(payload.len());

        let mut packets = Vec::with_capacity(count);

        for index in 0..count {
            let start = index * self.max_payload;
            let end = (start + self.max_payload).min(payload.len());

            let position = match (index, count) {
                (_, 1) => PacketPosition::Only,
                (0, _) => PacketPosition::First,
                (i, n) if i == n - 1 => PacketPosition::Last,
                _ => PacketPosition::Middle,
            };

            let mut packet = DataPacket::builder()
                .sequence_number(self.next_sequence.fetch_next())
                .message_number(message)
                .packet_position(position)
                .ordered(ordered)
                .body(payload.slice(start..end))
                .build();
            packet.header.timestamp = timestamp;

            packets.push(packet);
        }

        self.stats.messages_fragmented.inc();
        self.stats.packets_fragmented.add(count as u64);

        packets
    }

    /// Records a freshly transmitted packet for retransmission tracking.
    pub fn register(&mut self, packet: DataPacket, now: Instant, rto: Duration) {
        let seq = packet.packet_sequence_number();

        self.unacked.insert(
            seq.get(),
            UnackedEntry {
                packet,
                first_send_time: now,
                retransmit_count: 0,
                next_retransmit_due: now + rto,
            },
        );
    }

    /// Removes every entry covered by the cumulative ACK `upto` and returns their
    /// sequence numbers, so the caller can disarm the matching timers.
    pub fn handle_ack(&mut self, upto: Sequence) -> Vec<Sequence> {
        let mut acked: Vec<Sequence> = self
            .unacked
            .keys()
            .map(|&seq| Sequence::new(seq))
            .filter(|&seq| seq <= upto)
            .collect();
        acked.sort();

        for seq in &acked {
            self.unacked.remove(&seq.get());
        }

        self.stats.packets_acked.add(acked.len() as u64);
        acked
    }

    /// Attempts to retransmit `seq`, from a NAK or a retransmission timeout.
    ///
    /// The retransmitted packet keeps its original sequence number and timestamp; the
    /// retransmission flag is set and the timer backoff grows by half per attempt,
    /// bounded by `max_rto`.
    pub fn retransmit(
        &mut self,
        seq: Sequence,
        base_rto: Duration,
        max_rto: Duration,
        now: Instant,
    ) -> RetransmitOutcome {
        let Some(entry) = self.unacked.get_mut(&seq.get()) else {
            return RetransmitOutcome::AlreadyAcked;
        };

        if entry.retransmit_count >= self.max_retransmits {
            let message = entry.packet.message_number();
            self.unacked.remove(&seq.get());
            self.stats.send_losses.inc();

            tracing::debug!("Giving up on packet {} after retransmission limit", seq);

            return RetransmitOutcome::Exhausted {
                message,
                sequence: seq,
            };
        }

        entry.retransmit_count += 1;
        entry.packet.header.set_retransmitted(true);

        let backoff = base_rto
            .mul_f64(BACKOFF_FACTOR.powi(entry.retransmit_count as i32 - 1))
            .min(max_rto);
        entry.next_retransmit_due = now + backoff;

        self.stats.retransmissions.inc();

        RetransmitOutcome::Resend(entry.packet.clone(), backoff)
    }

    pub fn stats(&self) -> SendStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use bytes::Bytes;

    use crate::packet::{PacketPosition, Timestamp};
    use crate::utils::sequence::Sequence;

    use super::{RetransmitOutcome, SendEngine};

    const RTO: Duration = Duration::from_millis(100);
    const MAX_RTO: Duration = Duration::from_secs(60);

    fn engine() -> SendEngine {
        SendEngine::new(Sequence::new(1), 8, 5)
    }

    #[test]
    fn test_fragment_single_chunk() {
        let mut send = engine();

        let packets = send.fragment(Bytes::from_static(b"hi"), true, Timestamp::from_micros(0));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_position(), PacketPosition::Only);
        assert_eq!(packets[0].packet_sequence_number(), Sequence::new(1));
    }

    #[test]
    fn test_fragment_multi_chunk() {
        let mut send = engine();

        // 20 bytes over a max payload of 8: three chunks.
        let packets = send.fragment(
            Bytes::from_static(b"01234567890123456789"),
            true,
            Timestamp::from_micros(0),
        );

        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].packet_position(), PacketPosition::First);
        assert_eq!(packets[1].packet_position(), PacketPosition::Middle);
        assert_eq!(packets[2].packet_position(), PacketPosition::Last);

        // Consecutive sequences, shared message number.
        assert_eq!(packets[0].packet_sequence_number(), Sequence::new(1));
        assert_eq!(packets[2].packet_sequence_number(), Sequence::new(3));
        assert!(packets
            .iter()
            .all(|p| p.message_number() == packets[0].message_number()));
        assert_eq!(&packets[1].data[..], b"89012345");

        // The next message gets a new number.
        let next = send.fragment(Bytes::from_static(b"x"), true, Timestamp::from_micros(0));
        assert_eq!(next[0].message_number(), packets[0].message_number() + 1);
    }

    #[test]
    fn test_cumulative_ack_clears_entries() {
        let mut send = engine();
        let now = Instant::now();

        let packets = send.fragment(
            Bytes::from_static(b"0123456789012345678901234567890123456789"),
            true,
            Timestamp::from_micros(0),
        );
        assert_eq!(packets.len(), 5);

        for packet in packets {
            send.register(packet, now, RTO);
        }
        assert_eq!(send.unacked_len(), 5);

        let acked = send.handle_ack(Sequence::new(3));
        assert_eq!(
            acked,
            [Sequence::new(1), Sequence::new(2), Sequence::new(3)]
        );
        assert_eq!(send.unacked_len(), 2);

        // ACKs are cumulative; re-acking is a no-op.
        assert!(send.handle_ack(Sequence::new(3)).is_empty());
    }

    #[test]
    fn test_retransmit_marks_flag_and_backs_off() {
        let mut send = engine();
        let now = Instant::now();

        let packets = send.fragment(Bytes::from_static(b"hello"), true, Timestamp::from_micros(0));
        send.register(packets[0].clone(), now, RTO);

        let RetransmitOutcome::Resend(first, backoff) =
            send.retransmit(Sequence::new(1), RTO, MAX_RTO, now)
        else {
            panic!("expected resend");
        };
        assert!(first.header.is_retransmitted());
        assert_eq!(first.packet_sequence_number(), Sequence::new(1));
        assert_eq!(backoff, RTO);

        let RetransmitOutcome::Resend(_, backoff) =
            send.retransmit(Sequence::new(1), RTO, MAX_RTO, now)
        else {
            panic!("expected resend");
        };
        assert_eq!(backoff, RTO.mul_f64(1.5));
    }

    #[test]
    fn test_retransmit_exhaustion() {
        let mut send = engine();
        let now = Instant::now();

        let packets = send.fragment(Bytes::from_static(b"hello"), true, Timestamp::from_micros(0));
        send.register(packets[0].clone(), now, RTO);

        for _ in 0..5 {
            assert!(matches!(
                send.retransmit(Sequence::new(1), RTO, MAX_RTO, now),
                RetransmitOutcome::Resend(..)
            ));
        }

        assert!(matches!(
            send.retransmit(Sequence::new(1), RTO, MAX_RTO, now),
            RetransmitOutcome::Exhausted { .. }
        ));
        assert_eq!(send.unacked_len(), 0);
        assert_eq!(send.stats().send_losses.get(), 1);

        // The entry is gone; further requests report it as acknowledged.
        assert!(matches!(
            send.retransmit(Sequence::new(1), RTO, MAX_RTO, now),
            RetransmitOutcome::AlreadyAcked
        ));
    }

    #[test]
    fn test_backoff_bounded_by_max_rto() {
        let mut send = engine();
        let now = Instant::now();

        let packets = send.fragment(Bytes::from_static(b"hello"), true, Timestamp::from_micros(0));
        send.register(packets[0].clone(), now, RTO);

        let max = Duration::from_millis(120);
        let mut last = Duration::ZERO;
        for _ in 0..5 {
            if let RetransmitOutcome::Resend(_, backoff) =
                send.retransmit(Sequence::new(1), RTO, max, now)
            {
                last = backoff;
            }
        }
        assert_eq!(last, max);
    }
}
