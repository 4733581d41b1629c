//! SRT packet types and the 16-byte header codec.
//!
//! Every SRT packet starts with a 16-byte header. The most significant bit of the first
//! word discriminates between data packets (`0`) and control packets (`1`); the remaining
//! fields are packed into the two leading words as described in
//! https://datatracker.ietf.org/doc/html/draft-sharabayko-srt-01#section-3

pub mod builder;
pub mod control;
pub mod handshake;
pub mod timestamp;

use std::io::{self, Write};

use bytes::{Buf, Bytes};

use crate::proto::{Bits, Decode, Encode};
use crate::utils::message::MessageNumber;
use crate::utils::sequence::Sequence;

pub use self::builder::DataPacketBuilder;
pub use self::control::{Ack, AckAck, DropRequest, KeepAlive, Nak, SequenceNumbers, Shutdown};
pub use self::handshake::{HandshakePacket, HandshakeType};
pub use self::timestamp::Timestamp;

/// Size of the SRT packet header in bytes.
pub const HEADER_SIZE: usize = 16;

/// A typed error describing why a datagram could not be decoded.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("short packet: got {size} bytes, expected at least {expected}")]
    ShortPacket { size: usize, expected: usize },
    /// The header's packet-type bit does not match the context, e.g. a control header
    /// where a data packet was required.
    #[error("unexpected packet type")]
    UnexpectedPacketType,
    #[error("invalid control type: {0}")]
    InvalidControlType(u16),
    #[error("invalid handshake type: {0:#010x}")]
    InvalidHandshakeType(u32),
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: u64 },
}

impl From<io::Error> for DecodeError {
    fn from(err: io::Error) -> Self {
        // The only io failure a `Buf` based decoder produces is running out of input.
        debug_assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        Self::ShortPacket {
            size: 0,
            expected: 4,
        }
    }
}

/// The two packet shapes, discriminated by the most significant header bit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    Data,
    Control,
}

/// The position of a data packet within its message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PacketPosition {
    /// A middle packet of a multi-packet message (`0b00`).
    Middle,
    /// The last packet of a multi-packet message (`0b01`).
    Last,
    /// The first packet of a multi-packet message (`0b10`).
    First,
    /// A message consisting of a single packet (`0b11`).
    Only,
}

impl PacketPosition {
    pub const fn to_bits(self) -> u32 {
        match self {
            Self::Middle => 0b00,
            Self::Last => 0b01,
            Self::First => 0b10,
            Self::Only => 0b11,
        }
    }

    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => Self::Middle,
            0b01 => Self::Last,
            0b10 => Self::First,
            _ => Self::Only,
        }
    }
}

/// The key-encryption flag of a data packet, identifying which session key encrypted it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyFlag {
    /// The payload is not encrypted (`0b00`).
    None,
    /// The payload is encrypted with the even key (`0b01`).
    Even,
    /// The payload is encrypted with the odd key (`0b10`).
    Odd,
    /// Both keys are announced, used during key rotation overlap (`0b11`).
    Both,
}

impl KeyFlag {
    pub const fn to_bits(self) -> u32 {
        match self {
            Self::None => 0b00,
            Self::Even => 0b01,
            Self::Odd => 0b10,
            Self::Both => 0b11,
        }
    }

    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => Self::None,
            0b01 => Self::Even,
            0b10 => Self::Odd,
            _ => Self::Both,
        }
    }
}

/// The type of a control packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ControlPacketType {
    Handshake,
    KeepAlive,
    Ack,
    Nak,
    CongestionWarning,
    Shutdown,
    AckAck,
    DropRequest,
    PeerError,
}

impl ControlPacketType {
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::Handshake => 0x0000,
            Self::KeepAlive => 0x0001,
            Self::Ack => 0x0002,
            Self::Nak => 0x0003,
            Self::CongestionWarning => 0x0004,
            Self::Shutdown => 0x0005,
            Self::AckAck => 0x0006,
            Self::DropRequest => 0x0007,
            Self::PeerError => 0x0008,
        }
    }

    pub const fn from_u16(val: u16) -> Result<Self, DecodeError> {
        match val {
            0x0000 => Ok(Self::Handshake),
            0x0001 => Ok(Self::KeepAlive),
            0x0002 => Ok(Self::Ack),
            0x0003 => Ok(Self::Nak),
            0x0004 => Ok(Self::CongestionWarning),
            0x0005 => Ok(Self::Shutdown),
            0x0006 => Ok(Self::AckAck),
            0x0007 => Ok(Self::DropRequest),
            0x0008 => Ok(Self::PeerError),
            n => Err(DecodeError::InvalidControlType(n)),
        }
    }
}

/// The 16-byte SRT packet header.
///
/// The header stores its two leading words raw; the field accessors extract and pack the
/// bit ranges. Data and control accessors must only be used on a header of the matching
/// [`PacketType`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Header {
    w0: Bits,
    w1: Bits,
    pub timestamp: Timestamp,
    pub destination_socket_id: u32,
}

impl Header {
    pub fn packet_type(&self) -> PacketType {
        if self.w0.bits(0..1) == 0 {
            PacketType::Data
        } else {
            PacketType::Control
        }
    }

    pub fn set_packet_type(&mut self, packet_type: PacketType) {
        let bit = match packet_type {
            PacketType::Data => 0,
            PacketType::Control => 1,
        };

        self.w0.set_bits(0..1, bit);
    }

    //
    // ----- Data packet fields -----
    //

    pub fn packet_sequence_number(&self) -> Sequence {
        Sequence::new(self.w0.bits(1..32))
    }

    pub fn set_packet_sequence_number(&mut self, seq: Sequence) {
        self.w0.set_bits(1..32, seq.get());
    }

    pub fn packet_position(&self) -> PacketPosition {
        PacketPosition::from_bits(self.w1.bits(0..2))
    }

    pub fn set_packet_position(&mut self, position: PacketPosition) {
        self.w1.set_bits(0..2, position.to_bits());
    }

    pub fn is_ordered(&self) -> bool {
        self.w1.bits(2..3) != 0
    }

    pub fn set_ordered(&mut self, ordered: bool) {
        self.w1.set_bits(2..3, ordered as u32);
    }

    pub fn key_flag(&self) -> KeyFlag {
        KeyFlag::from_bits(self.w1.bits(3..5))
    }

    pub fn set_key_flag(&mut self, flag: KeyFlag) {
        self.w1.set_bits(3..5, flag.to_bits());
    }

    pub fn is_retransmitted(&self) -> bool {
        self.w1.bits(5..6) != 0
    }

    pub fn set_retransmitted(&mut self, retransmitted: bool) {
        self.w1.set_bits(5..6, retransmitted as u32);
    }

    pub fn message_number(&self) -> MessageNumber {
        MessageNumber::new(self.w1.bits(6..32))
    }

    pub fn set_message_number(&mut self, num: MessageNumber) {
        self.w1.set_bits(6..32, num.get());
    }

    //
    // ----- Control packet fields -----
    //

    pub fn control_type(&self) -> Result<ControlPacketType, DecodeError> {
        ControlPacketType::from_u16(self.w0.bits(1..16) as u16)
    }

    pub fn set_control_type(&mut self, control_type: ControlPacketType) {
        self.w0.set_bits(1..16, control_type.to_u16() as u32);
    }

    pub fn subtype(&self) -> u16 {
        self.w0.bits(16..32) as u16
    }

    pub fn set_subtype(&mut self, subtype: u16) {
        self.w0.set_bits(16..32, subtype as u32);
    }

    pub fn type_specific_info(&self) -> u32 {
        self.w1.0
    }

    pub fn set_type_specific_info(&mut self, info: u32) {
        self.w1.0 = info;
    }

    /// Creates a control header of the given type.
    pub fn control(control_type: ControlPacketType) -> Self {
        let mut header = Self::default();
        header.set_packet_type(PacketType::Control);
        header.set_control_type(control_type);
        header
    }
}

impl Encode for Header {
    type Error = io::Error;

    fn encode<W>(&self, mut writer: W) -> Result<(), Self::Error>
    where
        W: Write,
    {
        self.w0.encode(&mut writer)?;
        self.w1.encode(&mut writer)?;
        self.timestamp.encode(&mut writer)?;
        self.destination_socket_id.encode(&mut writer)?;

        Ok(())
    }

    #[inline]
    fn size_hint(&self) -> usize {
        HEADER_SIZE
    }
}

impl Decode for Header {
    type Error = DecodeError;

    fn decode<B>(buf: &mut B) -> Result<Self, Self::Error>
    where
        B: Buf,
    {
        if buf.remaining() < HEADER_SIZE {
            return Err(DecodeError::ShortPacket {
                size: buf.remaining(),
                expected: HEADER_SIZE,
            });
        }

        let w0 = Bits::decode(buf)?;
        let w1 = Bits::decode(buf)?;
        let timestamp = Timestamp::decode(buf)?;
        let destination_socket_id = u32::decode(buf)?;

        Ok(Self {
            w0,
            w1,
            timestamp,
            destination_socket_id,
        })
    }
}

/// A data packet: a data header followed by the (possibly encrypted) payload.
#[derive(Clone, Debug, Default)]
pub struct DataPacket {
    pub header: Header,
    pub data: Bytes,
}

impl DataPacket {
    pub fn builder() -> DataPacketBuilder {
        DataPacketBuilder::new()
    }

    #[inline]
    pub fn packet_sequence_number(&self) -> Sequence {
        self.header.packet_sequence_number()
    }

    #[inline]
    pub fn message_number(&self) -> MessageNumber {
        self.header.message_number()
    }

    #[inline]
    pub fn packet_position(&self) -> PacketPosition {
        self.header.packet_position()
    }

    /// Total wire size of the packet, header included.
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }

    pub(crate) fn decode_body<B>(header: Header, buf: &mut B) -> Result<Self, DecodeError>
    where
        B: Buf,
    {
        if header.packet_type() != PacketType::Data {
            return Err(DecodeError::UnexpectedPacketType);
        }

        let data = buf.copy_to_bytes(buf.remaining());

        Ok(Self { header, data })
    }
}

impl Encode for DataPacket {
    type Error = io::Error;

    fn encode<W>(&self, mut writer: W) -> Result<(), Self::Error>
    where
        W: Write,
    {
        self.header.encode(&mut writer)?;
        writer.write_all(&self.data)?;
        Ok(())
    }

    #[inline]
    fn size_hint(&self) -> usize {
        self.size()
    }
}

/// A packet value with mutable access to its header.
///
/// The connection stamps the timestamp and destination socket id on outgoing packets at
/// send time; everything else about a built packet is immutable.
pub trait IsPacket: Encode<Error = io::Error> {
    fn header_mut(&mut self) -> &mut Header;
}

macro_rules! impl_is_packet {
    ($($t:ty),*$(,)?) => {
        $(
            impl IsPacket for $t {
                #[inline]
                fn header_mut(&mut self) -> &mut Header {
                    &mut self.header
                }
            }
        )*
    };
}

impl_is_packet! {
    DataPacket,
    HandshakePacket,
    KeepAlive,
    Ack,
    AckAck,
    Nak,
    Shutdown,
    DropRequest,
}

/// Any SRT packet, decoded from a single UDP datagram.
#[derive(Clone, Debug)]
pub enum Packet {
    Data(DataPacket),
    Handshake(HandshakePacket),
    KeepAlive(KeepAlive),
    Ack(Ack),
    Nak(Nak),
    CongestionWarning(Header),
    Shutdown(Shutdown),
    AckAck(AckAck),
    DropRequest(DropRequest),
    PeerError(Header),
}

impl Packet {
    pub fn header(&self) -> &Header {
        match self {
            Self::Data(p) => &p.header,
            Self::Handshake(p) => &p.header,
            Self::KeepAlive(p) => &p.header,
            Self::Ack(p) => &p.header,
            Self::Nak(p) => &p.header,
            Self::CongestionWarning(h) => h,
            Self::Shutdown(p) => &p.header,
            Self::AckAck(p) => &p.header,
            Self::DropRequest(p) => &p.header,
            Self::PeerError(h) => h,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.header().packet_type()
    }
}

impl Decode for Packet {
    type Error = DecodeError;

    fn decode<B>(buf: &mut B) -> Result<Self, Self::Error>
    where
        B: Buf,
    {
        let header = Header::decode(buf)?;

        match header.packet_type() {
            PacketType::Data => Ok(Self::Data(DataPacket::decode_body(header, buf)?)),
            PacketType::Control => match header.control_type()? {
                ControlPacketType::Handshake => {
                    Ok(Self::Handshake(HandshakePacket::decode_body(header, buf)?))
                }
                ControlPacketType::KeepAlive => Ok(Self::KeepAlive(KeepAlive { header })),
                ControlPacketType::Ack => Ok(Self::Ack(Ack::decode_body(header, buf)?)),
                ControlPacketType::Nak => Ok(Self::Nak(Nak::decode_body(header, buf)?)),
                ControlPacketType::CongestionWarning => Ok(Self::CongestionWarning(header)),
                ControlPacketType::Shutdown => Ok(Self::Shutdown(Shutdown { header })),
                ControlPacketType::AckAck => Ok(Self::AckAck(AckAck { header })),
                ControlPacketType::DropRequest => {
                    Ok(Self::DropRequest(DropRequest::decode_body(header, buf)?))
                }
                ControlPacketType::PeerError => Ok(Self::PeerError(header)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::proto::{Decode, Encode};
    use crate::utils::message::MessageNumber;
    use crate::utils::sequence::Sequence;

    use super::{
        ControlPacketType, DataPacket, DecodeError, Header, KeyFlag, Packet, PacketPosition,
        PacketType, Timestamp, HEADER_SIZE,
    };

    #[test]
    fn test_data_header_roundtrip() {
        let mut header = Header::default();
        header.set_packet_type(PacketType::Data);
        header.set_packet_sequence_number(Sequence::new(1234));
        header.set_packet_position(PacketPosition::Only);
        header.set_ordered(true);
        header.set_key_flag(KeyFlag::Even);
        header.set_retransmitted(false);
        header.set_message_number(MessageNumber::new(5678));
        header.timestamp = Timestamp::from_micros(1000);
        header.destination_socket_id = 999;

        let buf = header.encode_to_vec().unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let parsed = Header::decode(&mut &buf[..]).unwrap();
        assert_eq!(parsed.packet_type(), PacketType::Data);
        assert_eq!(parsed.packet_sequence_number(), Sequence::new(1234));
        assert_eq!(parsed.packet_position(), PacketPosition::Only);
        assert!(parsed.is_ordered());
        assert_eq!(parsed.key_flag(), KeyFlag::Even);
        assert!(!parsed.is_retransmitted());
        assert_eq!(parsed.message_number(), MessageNumber::new(5678));
        assert_eq!(parsed.timestamp.as_micros(), 1000);
        assert_eq!(parsed.destination_socket_id, 999);
    }

    #[test]
    fn test_control_header_roundtrip() {
        let mut header = Header::control(ControlPacketType::Ack);
        header.set_subtype(0);
        header.set_type_specific_info(12345);
        header.timestamp = Timestamp::from_micros(2000);
        header.destination_socket_id = 888;

        let buf = header.encode_to_vec().unwrap();
        let parsed = Header::decode(&mut &buf[..]).unwrap();

        assert_eq!(parsed.packet_type(), PacketType::Control);
        assert_eq!(parsed.control_type().unwrap(), ControlPacketType::Ack);
        assert_eq!(parsed.subtype(), 0);
        assert_eq!(parsed.type_specific_info(), 12345);
        assert_eq!(parsed.timestamp.as_micros(), 2000);
        assert_eq!(parsed.destination_socket_id, 888);
    }

    #[test]
    fn test_short_header_rejected() {
        let buf = [0u8; 8];
        assert_eq!(
            Header::decode(&mut &buf[..]).unwrap_err(),
            DecodeError::ShortPacket {
                size: 8,
                expected: HEADER_SIZE
            }
        );
    }

    #[test]
    fn test_invalid_control_type_rejected() {
        let mut header = Header::default();
        header.set_packet_type(PacketType::Control);
        // 0x1234 is not an assigned control type.
        header.w0.set_bits(1..16, 0x1234);

        let buf = header.encode_to_vec().unwrap();
        assert_eq!(
            Packet::decode(&mut &buf[..]).unwrap_err(),
            DecodeError::InvalidControlType(0x1234)
        );
    }

    #[test]
    fn test_data_packet_roundtrip() {
        let packet = DataPacket::builder()
            .sequence_number(Sequence::new(77))
            .message_number(MessageNumber::new(3))
            .packet_position(PacketPosition::First)
            .ordered(true)
            .body(Bytes::from_static(b"hello"))
            .build();

        let buf = packet.encode_to_vec().unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 5);

        match Packet::decode(&mut &buf[..]).unwrap() {
            Packet::Data(parsed) => {
                assert_eq!(parsed.packet_sequence_number(), Sequence::new(77));
                assert_eq!(parsed.packet_position(), PacketPosition::First);
                assert_eq!(&parsed.data[..], b"hello");
            }
            other => panic!("expected data packet, got {:?}", other),
        }
    }
}
