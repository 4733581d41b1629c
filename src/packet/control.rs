//! Control packet bodies.

use std::io::{self, Write};

use bytes::Buf;

use crate::proto::{Decode, Encode};
use crate::utils::message::MessageNumber;
use crate::utils::sequence::Sequence;

use super::builder::{
    AckAckBuilder, AckBuilder, DropRequestBuilder, KeepAliveBuilder, NakBuilder, ShutdownBuilder,
};
use super::{DecodeError, Header, HEADER_SIZE};

/// A keep-alive probe. Carries no body.
#[derive(Clone, Debug, Default)]
pub struct KeepAlive {
    pub header: Header,
}

impl KeepAlive {
    pub fn builder() -> KeepAliveBuilder {
        KeepAliveBuilder::new()
    }
}

impl Encode for KeepAlive {
    type Error = io::Error;

    fn encode<W>(&self, writer: W) -> Result<(), Self::Error>
    where
        W: Write,
    {
        self.header.encode(writer)
    }

    #[inline]
    fn size_hint(&self) -> usize {
        HEADER_SIZE
    }
}

/// A cumulative acknowledgement.
///
/// The acknowledged-through sequence number travels in the type-specific-information word
/// of the header. The body optionally carries a 4-byte echo of the sender's timestamp from
/// the most recently received data packet, used by the peer for RTT measurement. A minimal
/// ACK omits the body.
#[derive(Clone, Debug, Default)]
pub struct Ack {
    pub header: Header,
    pub timestamp_echo: Option<u32>,
}

impl Ack {
    pub fn builder() -> AckBuilder {
        AckBuilder::new()
    }

    /// The cumulative sequence number: all packets with sequence numbers up to and
    /// including this value are acknowledged.
    #[inline]
    pub fn last_acknowledged_sequence_number(&self) -> Sequence {
        Sequence::from(self.header.type_specific_info())
    }

    pub fn set_last_acknowledged_sequence_number(&mut self, seq: Sequence) {
        self.header.set_type_specific_info(seq.get());
    }

    pub(crate) fn decode_body<B>(header: Header, buf: &mut B) -> Result<Self, DecodeError>
    where
        B: Buf,
    {
        let timestamp_echo = if buf.remaining() >= 4 {
            Some(u32::decode(buf)?)
        } else {
            None
        };

        Ok(Self {
            header,
            timestamp_echo,
        })
    }
}

impl Encode for Ack {
    type Error = io::Error;

    fn encode<W>(&self, mut writer: W) -> Result<(), Self::Error>
    where
        W: Write,
    {
        self.header.encode(&mut writer)?;
        if let Some(echo) = self.timestamp_echo {
            echo.encode(&mut writer)?;
        }
        Ok(())
    }

    #[inline]
    fn size_hint(&self) -> usize {
        HEADER_SIZE + if self.timestamp_echo.is_some() { 4 } else { 0 }
    }
}

/// An acknowledgement of an ACK, echoing the cumulative sequence number back to the
/// receiver so it can measure the RTT of the feedback path.
#[derive(Clone, Debug, Default)]
pub struct AckAck {
    pub header: Header,
}

impl AckAck {
    pub fn builder() -> AckAckBuilder {
        AckAckBuilder::new()
    }

    #[inline]
    pub fn acknowledged_sequence_number(&self) -> Sequence {
        Sequence::from(self.header.type_specific_info())
    }
}

impl Encode for AckAck {
    type Error = io::Error;

    fn encode<W>(&self, writer: W) -> Result<(), Self::Error>
    where
        W: Write,
    {
        self.header.encode(writer)
    }

    #[inline]
    fn size_hint(&self) -> usize {
        HEADER_SIZE
    }
}

/// A single entry of a NAK loss list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LossEntry {
    Single(Sequence),
    Range { first: Sequence, last: Sequence },
}

impl LossEntry {
    fn first(&self) -> Sequence {
        match self {
            Self::Single(seq) => *seq,
            Self::Range { first, .. } => *first,
        }
    }

    fn last(&self) -> Sequence {
        match self {
            Self::Single(seq) => *seq,
            Self::Range { last, .. } => *last,
        }
    }
}

/// A coalesced list of lost sequence numbers.
///
/// On the wire each entry is either a single 31-bit sequence number (most significant bit
/// clear) or a range: a first sequence with the most significant bit set, followed by the
/// last sequence of the range.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceNumbers {
    entries: Vec<LossEntry>,
}

impl SequenceNumbers {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends a lost sequence number, merging it into the previous entry when adjacent.
    ///
    /// Sequences must be pushed in increasing serial order.
    pub fn push(&mut self, seq: Sequence) {
        if let Some(last) = self.entries.last_mut() {
            debug_assert!(last.last() < seq, "SequenceNumbers::push out of order");

            if last.last() + 1 == seq {
                *last = LossEntry::Range {
                    first: last.first(),
                    last: seq,
                };
                return;
            }
        }

        self.entries.push(LossEntry::Single(seq));
    }

    /// The wire entries of the list.
    pub fn entries(&self) -> &[LossEntry] {
        &self.entries
    }

    /// The number of individual lost sequences, ranges expanded.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.last().distance(entry.first()) as usize + 1)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first(&self) -> Option<Sequence> {
        self.entries.first().map(LossEntry::first)
    }

    pub fn last(&self) -> Option<Sequence> {
        self.entries.last().map(LossEntry::last)
    }

    /// Iterates over all lost sequence numbers in increasing serial order.
    pub fn iter(&self) -> impl Iterator<Item = Sequence> + '_ {
        self.entries.iter().flat_map(|entry| {
            let first = entry.first();
            let count = entry.last().distance(first) + 1;
            (0..count).map(move |offset| first + offset)
        })
    }

    /// Splits the list into chunks of at most `max_entries` wire entries each.
    pub fn chunks(&self, max_entries: usize) -> Vec<SequenceNumbers> {
        self.entries
            .chunks(max_entries.max(1))
            .map(|chunk| SequenceNumbers {
                entries: chunk.to_vec(),
            })
            .collect()
    }
}

impl FromIterator<Sequence> for SequenceNumbers {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Sequence>,
    {
        let mut numbers = Self::new();
        for seq in iter {
            numbers.push(seq);
        }
        numbers
    }
}

/// A negative acknowledgement listing lost sequence numbers.
#[derive(Clone, Debug, Default)]
pub struct Nak {
    pub header: Header,
    pub lost_packet_sequence_numbers: SequenceNumbers,
}

impl Nak {
    pub fn builder() -> NakBuilder {
        NakBuilder::new()
    }

    pub(crate) fn decode_body<B>(header: Header, buf: &mut B) -> Result<Self, DecodeError>
    where
        B: Buf,
    {
        let mut entries = Vec::new();

        while buf.remaining() >= 4 {
            let word = u32::decode(buf)?;

            if word & 0x8000_0000 == 0 {
                entries.push(LossEntry::Single(Sequence::from(word)));
            } else {
                let first = Sequence::from(word & 0x7FFF_FFFF);

                if buf.remaining() < 4 {
                    return Err(DecodeError::ShortPacket {
                        size: 0,
                        expected: 4,
                    });
                }

                let last = Sequence::from(u32::decode(buf)?);

                if last < first {
                    return Err(DecodeError::OutOfRange {
                        field: "loss range end",
                        value: last.get() as u64,
                    });
                }

                entries.push(LossEntry::Range { first, last });
            }
        }

        Ok(Self {
            header,
            lost_packet_sequence_numbers: SequenceNumbers { entries },
        })
    }
}

impl Encode for Nak {
    type Error = io::Error;

    fn encode<W>(&self, mut writer: W) -> Result<(), Self::Error>
    where
        W: Write,
    {
        self.header.encode(&mut writer)?;

        for entry in self.lost_packet_sequence_numbers.entries() {
            match entry {
                LossEntry::Single(seq) => seq.get().encode(&mut writer)?,
                LossEntry::Range { first, last } => {
                    (first.get() | 0x8000_0000).encode(&mut writer)?;
                    last.get().encode(&mut writer)?;
                }
            }
        }

        Ok(())
    }

    fn size_hint(&self) -> usize {
        let words: usize = self
            .lost_packet_sequence_numbers
            .entries()
            .iter()
            .map(|entry| match entry {
                LossEntry::Single(_) => 1,
                LossEntry::Range { .. } => 2,
            })
            .sum();

        HEADER_SIZE + words * 4
    }
}

/// A connection teardown notification. Carries no body.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    pub header: Header,
}

impl Shutdown {
    pub fn builder() -> ShutdownBuilder {
        ShutdownBuilder::new()
    }
}

impl Encode for Shutdown {
    type Error = io::Error;

    fn encode<W>(&self, writer: W) -> Result<(), Self::Error>
    where
        W: Write,
    {
        self.header.encode(writer)
    }

    #[inline]
    fn size_hint(&self) -> usize {
        HEADER_SIZE
    }
}

/// A request to give up on a message whose retransmission was exhausted.
///
/// The message number travels in the type-specific-information word; the body carries the
/// first and last sequence number of the dropped message.
#[derive(Clone, Debug, Default)]
pub struct DropRequest {
    pub header: Header,
    pub first_packet_sequence_number: Sequence,
    pub last_packet_sequence_number: Sequence,
}

impl DropRequest {
    pub fn builder() -> DropRequestBuilder {
        DropRequestBuilder::new()
    }

    #[inline]
    pub fn message_number(&self) -> MessageNumber {
        MessageNumber::from(self.header.type_specific_info())
    }

    pub fn set_message_number(&mut self, num: MessageNumber) {
        self.header.set_type_specific_info(num.get());
    }

    pub(crate) fn decode_body<B>(header: Header, buf: &mut B) -> Result<Self, DecodeError>
    where
        B: Buf,
    {
        if buf.remaining() < 8 {
            return Err(DecodeError::ShortPacket {
                size: buf.remaining(),
                expected: 8,
            });
        }

        let first_packet_sequence_number = Sequence::from(u32::decode(buf)?);
        let last_packet_sequence_number = Sequence::from(u32::decode(buf)?);

        Ok(Self {
            header,
            first_packet_sequence_number,
            last_packet_sequence_number,
        })
    }
}

impl Encode for DropRequest {
    type Error = io::Error;

    fn encode<W>(&self, mut writer: W) -> Result<(), Self::Error>
    where
        W: Write,
    {
        self.header.encode(&mut writer)?;
        self.first_packet_sequence_number.get().encode(&mut writer)?;
        self.last_packet_sequence_number.get().encode(&mut writer)?;
        Ok(())
    }

    #[inline]
    fn size_hint(&self) -> usize {
        HEADER_SIZE + 8
    }
}
