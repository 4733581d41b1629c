//! Builders for packet values.
//!
//! Packets are immutable once built; the orchestrator stamps the header timestamp and
//! destination socket id at send time.

use bytes::Bytes;

use crate::utils::message::MessageNumber;
use crate::utils::sequence::Sequence;

use super::control::{Ack, AckAck, DropRequest, KeepAlive, Nak, SequenceNumbers, Shutdown};
use super::{ControlPacketType, DataPacket, Header, KeyFlag, PacketPosition, PacketType};

/// A builder for a [`DataPacket`].
#[derive(Clone, Debug, Default)]
pub struct DataPacketBuilder(DataPacket);

impl DataPacketBuilder {
    pub fn new() -> Self {
        let mut packet = DataPacket::default();
        packet.header.set_packet_type(PacketType::Data);
        Self(packet)
    }

    pub fn sequence_number(mut self, seq: Sequence) -> Self {
        self.0.header.set_packet_sequence_number(seq);
        self
    }

    pub fn message_number(mut self, num: MessageNumber) -> Self {
        self.0.header.set_message_number(num);
        self
    }

    pub fn packet_position(mut self, position: PacketPosition) -> Self {
        self.0.header.set_packet_position(position);
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.0.header.set_ordered(ordered);
        self
    }

    pub fn key_flag(mut self, flag: KeyFlag) -> Self {
        self.0.header.set_key_flag(flag);
        self
    }

    pub fn retransmitted(mut self, retransmitted: bool) -> Self {
        self.0.header.set_retransmitted(retransmitted);
        self
    }

    pub fn body<T>(mut self, body: T) -> Self
    where
        T: Into<Bytes>,
    {
        self.0.data = body.into();
        self
    }

    #[inline]
    pub fn build(self) -> DataPacket {
        self.0
    }
}

/// A builder for a [`KeepAlive`] packet.
#[derive(Clone, Debug)]
pub struct KeepAliveBuilder(KeepAlive);

impl KeepAliveBuilder {
    pub fn new() -> Self {
        Self(KeepAlive {
            header: Header::control(ControlPacketType::KeepAlive),
        })
    }

    #[inline]
    pub fn build(self) -> KeepAlive {
        self.0
    }
}

impl Default for KeepAliveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A builder for an [`Ack`] packet.
#[derive(Clone, Debug)]
pub struct AckBuilder(Ack);

impl AckBuilder {
    pub fn new() -> Self {
        Self(Ack {
            header: Header::control(ControlPacketType::Ack),
            timestamp_echo: None,
        })
    }

    pub fn last_acknowledged_sequence_number(mut self, seq: Sequence) -> Self {
        self.0.set_last_acknowledged_sequence_number(seq);
        self
    }

    pub fn timestamp_echo(mut self, echo: u32) -> Self {
        self.0.timestamp_echo = Some(echo);
        self
    }

    #[inline]
    pub fn build(self) -> Ack {
        self.0
    }
}

impl Default for AckBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A builder for an [`AckAck`] packet.
#[derive(Clone, Debug)]
pub struct AckAckBuilder(AckAck);

impl AckAckBuilder {
    pub fn new() -> Self {
        Self(AckAck {
            header: Header::control(ControlPacketType::AckAck),
        })
    }

    pub fn acknowledged_sequence_number(mut self, seq: Sequence) -> Self {
        self.0.header.set_type_specific_info(seq.get());
        self
    }

    #[inline]
    pub fn build(self) -> AckAck {
        self.0
    }
}

impl Default for AckAckBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A builder for a [`Nak`] packet.
#[derive(Clone, Debug)]
pub struct NakBuilder(Nak);

impl NakBuilder {
    pub fn new() -> Self {
        Self(Nak {
            header: Header::control(ControlPacketType::Nak),
            lost_packet_sequence_numbers: SequenceNumbers::new(),
        })
    }

    pub fn lost_packet_sequence_number(mut self, seq: Sequence) -> Self {
        self.0.lost_packet_sequence_numbers.push(seq);
        self
    }

    pub fn lost_packet_sequence_numbers(mut self, numbers: SequenceNumbers) -> Self {
        self.0.lost_packet_sequence_numbers = numbers;
        self
    }

    #[inline]
    pub fn build(self) -> Nak {
        self.0
    }
}

impl Default for NakBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A builder for a [`Shutdown`] packet.
#[derive(Clone, Debug)]
pub struct ShutdownBuilder(Shutdown);

impl ShutdownBuilder {
    pub fn new() -> Self {
        Self(Shutdown {
            header: Header::control(ControlPacketType::Shutdown),
        })
    }

    #[inline]
    pub fn build(self) -> Shutdown {
        self.0
    }
}

impl Default for ShutdownBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A builder for a [`DropRequest`] packet.
#[derive(Clone, Debug)]
pub struct DropRequestBuilder(DropRequest);

impl DropRequestBuilder {
    pub fn new() -> Self {
        Self(DropRequest {
            header: Header::control(ControlPacketType::DropRequest),
            first_packet_sequence_number: Sequence::new(0),
            last_packet_sequence_number: Sequence::new(0),
        })
    }

    pub fn message_number(mut self, num: MessageNumber) -> Self {
        self.0.set_message_number(num);
        self
    }

    pub fn first_packet_sequence_number(mut self, seq: Sequence) -> Self {
        self.0.first_packet_sequence_number = seq;
        self
    }

    pub fn last_packet_sequence_number(mut self, seq: Sequence) -> Self {
        self.0.last_packet_sequence_number = seq;
        self
    }

    #[inline]
    pub fn build(self) -> DropRequest {
        self.0
    }
}

impl Default for DropRequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}
