//! Handshake packet body and extension records.
//!
//! See https://datatracker.ietf.org/doc/html/draft-sharabayko-srt-01#section-3.2.1

use std::io::{self, Write};

use bytes::{Buf, Bytes};

use crate::proto::{Decode, Encode};
use crate::utils::sequence::Sequence;

use super::{DecodeError, Header, HEADER_SIZE};

/// Value of the extension field once SRT extensions are present.
pub const SRT_MAGIC: u16 = 0x4A17;

/// Bit 0 of the `SRT_FLAGS` extension: payload encryption is enabled.
pub const SRT_FLAG_ENCRYPT: u32 = 1 << 0;

/// Size of the fixed handshake body, extensions excluded.
pub const HANDSHAKE_BODY_SIZE: usize = 48;

/// The handshake phase carried by a [`HandshakePacket`].
///
/// Encoded as a signed 32-bit integer: `+1` for Induction, `0` for a Response, `-1` for
/// Conclusion and values below `-1` for rejections.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum HandshakeType {
    #[default]
    Induction,
    Response,
    Conclusion,
    Rejection(RejectReason),
}

impl HandshakeType {
    pub const fn is_rejection(self) -> bool {
        matches!(self, Self::Rejection(_))
    }

    pub const fn to_u32(self) -> u32 {
        match self {
            Self::Induction => 1,
            Self::Response => 0,
            Self::Conclusion => -1i32 as u32,
            Self::Rejection(reason) => reason.to_i32() as u32,
        }
    }

    pub const fn from_u32(val: u32) -> Result<Self, DecodeError> {
        match val as i32 {
            1 => Ok(Self::Induction),
            0 => Ok(Self::Response),
            -1 => Ok(Self::Conclusion),
            -2 => Ok(Self::Rejection(RejectReason::Version)),
            -3 => Ok(Self::Rejection(RejectReason::Encryption)),
            -4 => Ok(Self::Rejection(RejectReason::Latency)),
            -5 => Ok(Self::Rejection(RejectReason::Passphrase)),
            -6 => Ok(Self::Rejection(RejectReason::Cookie)),
            _ => Err(DecodeError::InvalidHandshakeType(val)),
        }
    }
}

/// Why a listener refused a handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Peer version below the supported minimum.
    Version,
    /// One side requires encryption the other does not offer.
    Encryption,
    /// Requested TSBPD latency outside the accepted range.
    Latency,
    /// Passphrase length invalid.
    Passphrase,
    /// SYN cookie mismatch between Induction and Conclusion.
    Cookie,
}

impl RejectReason {
    pub const fn to_i32(self) -> i32 {
        match self {
            Self::Version => -2,
            Self::Encryption => -3,
            Self::Latency => -4,
            Self::Passphrase => -5,
            Self::Cookie => -6,
        }
    }
}

/// The type code of a handshake extension record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExtensionType {
    /// SRT version of the sender (`1`).
    Version,
    /// SRT capability flags (`2`).
    Flags,
    /// Requested TSBPD delay in microseconds (`3`).
    TsbpdDelay,
    /// Latency the sender will apply towards the peer, in microseconds (`4`).
    PeerLatency,
    /// Key material: the PBKDF2 salt for session key derivation (`5`).
    Encryption,
}

impl ExtensionType {
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::Version => 1,
            Self::Flags => 2,
            Self::TsbpdDelay => 3,
            Self::PeerLatency => 4,
            Self::Encryption => 5,
        }
    }

    pub const fn from_u16(val: u16) -> Option<Self> {
        match val {
            1 => Some(Self::Version),
            2 => Some(Self::Flags),
            3 => Some(Self::TsbpdDelay),
            4 => Some(Self::PeerLatency),
            5 => Some(Self::Encryption),
            _ => None,
        }
    }
}

/// A single handshake extension record.
///
/// On the wire: a 16-bit type, a 16-bit length in 4-byte units and the value padded to a
/// 4-byte multiple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeExtension {
    pub extension_type: ExtensionType,
    pub content: Bytes,
}

/// The extension section of a handshake packet, keyed by [`ExtensionType`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Extensions(Vec<HandshakeExtension>);

impl Extensions {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push_u32(&mut self, extension_type: ExtensionType, val: u32) {
        self.0.push(HandshakeExtension {
            extension_type,
            content: Bytes::copy_from_slice(&val.to_be_bytes()),
        });
    }

    pub fn push_bytes(&mut self, extension_type: ExtensionType, content: Bytes) {
        self.0.push(HandshakeExtension {
            extension_type,
            content,
        });
    }

    pub fn get(&self, extension_type: ExtensionType) -> Option<&HandshakeExtension> {
        self.0.iter().find(|ext| ext.extension_type == extension_type)
    }

    pub fn get_u32(&self, extension_type: ExtensionType) -> Option<u32> {
        let ext = self.get(extension_type)?;
        let bytes: [u8; 4] = ext.content.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn version(&self) -> Option<u32> {
        self.get_u32(ExtensionType::Version)
    }

    pub fn flags(&self) -> Option<u32> {
        self.get_u32(ExtensionType::Flags)
    }

    pub fn tsbpd_delay_us(&self) -> Option<u32> {
        self.get_u32(ExtensionType::TsbpdDelay)
    }

    pub fn peer_latency_us(&self) -> Option<u32> {
        self.get_u32(ExtensionType::PeerLatency)
    }

    pub fn encryption_salt(&self) -> Option<&Bytes> {
        self.get(ExtensionType::Encryption).map(|ext| &ext.content)
    }

    fn decode_section<B>(buf: &mut B) -> Result<Self, DecodeError>
    where
        B: Buf,
    {
        let mut extensions = Vec::new();

        while buf.remaining() >= 4 {
            let type_code = u16::decode(buf)?;
            let length = u16::decode(buf)? as usize * 4;

            if buf.remaining() < length {
                return Err(DecodeError::ShortPacket {
                    size: buf.remaining(),
                    expected: length,
                });
            }

            let content = buf.copy_to_bytes(length);

            // Unknown extension types are skipped rather than rejected so that newer
            // peers can attach extensions we do not understand.
            if let Some(extension_type) = ExtensionType::from_u16(type_code) {
                extensions.push(HandshakeExtension {
                    extension_type,
                    content,
                });
            }
        }

        Ok(Self(extensions))
    }
}

impl Encode for Extensions {
    type Error = io::Error;

    fn encode<W>(&self, mut writer: W) -> Result<(), Self::Error>
    where
        W: Write,
    {
        for ext in &self.0 {
            let words = (ext.content.len() + 3) / 4;

            ext.extension_type.to_u16().encode(&mut writer)?;
            (words as u16).encode(&mut writer)?;
            writer.write_all(&ext.content)?;

            let padding = words * 4 - ext.content.len();
            writer.write_all(&[0u8; 3][..padding])?;
        }

        Ok(())
    }

    fn size_hint(&self) -> usize {
        self.0
            .iter()
            .map(|ext| 4 + (ext.content.len() + 3) / 4 * 4)
            .sum()
    }
}

/// A handshake control packet.
#[derive(Clone, Debug, Default)]
pub struct HandshakePacket {
    pub header: Header,
    /// Protocol version of the sender, e.g. `0x010405` for 1.4.5.
    pub version: u32,
    /// Advertised cipher: `0` for none, see [`crate::crypto::CipherKind`] for the rest.
    pub encryption_field: u16,
    /// [`SRT_MAGIC`] once SRT extensions are present, `0` otherwise.
    pub extension_field: u16,
    /// The sequence number of the very first data packet to be sent.
    pub initial_packet_sequence_number: Sequence,
    pub maximum_transmission_unit_size: u32,
    /// The maximum number of data packets allowed to be in flight.
    pub maximum_flow_window_size: u32,
    pub handshake_type: HandshakeType,
    /// The SRT socket id of the packet's sender.
    pub srt_socket_id: u32,
    /// Randomized value handed out by the listener during Induction and echoed back by
    /// the caller in its Conclusion.
    pub syn_cookie: u32,
    /// IPv4 address of the packet's sender, zero-extended to 16 bytes.
    pub peer_ip_address: u128,
    pub extensions: Extensions,
}

impl HandshakePacket {
    pub(crate) fn decode_body<B>(header: Header, buf: &mut B) -> Result<Self, DecodeError>
    where
        B: Buf,
    {
        if buf.remaining() < HANDSHAKE_BODY_SIZE {
            return Err(DecodeError::ShortPacket {
                size: buf.remaining(),
                expected: HANDSHAKE_BODY_SIZE,
            });
        }

        let version = u32::decode(buf)?;
        let encryption_field = u16::decode(buf)?;
        let extension_field = u16::decode(buf)?;
        let initial_packet_sequence_number = Sequence::from(u32::decode(buf)?);
        let maximum_transmission_unit_size = u32::decode(buf)?;
        let maximum_flow_window_size = u32::decode(buf)?;
        let handshake_type = HandshakeType::from_u32(u32::decode(buf)?)?;
        let srt_socket_id = u32::decode(buf)?;
        let syn_cookie = u32::decode(buf)?;
        let peer_ip_address = u128::decode(buf)?;
        let extensions = Extensions::decode_section(buf)?;

        Ok(Self {
            header,
            version,
            encryption_field,
            extension_field,
            initial_packet_sequence_number,
            maximum_transmission_unit_size,
            maximum_flow_window_size,
            handshake_type,
            srt_socket_id,
            syn_cookie,
            peer_ip_address,
            extensions,
        })
    }
}

impl Encode for HandshakePacket {
    type Error = io::Error;

    fn encode<W>(&self, mut writer: W) -> Result<(), Self::Error>
    where
        W: Write,
    {
        self.header.encode(&mut writer)?;
        self.version.encode(&mut writer)?;
        self.encryption_field.encode(&mut writer)?;
        self.extension_field.encode(&mut writer)?;
        self.initial_packet_sequence_number.get().encode(&mut writer)?;
        self.maximum_transmission_unit_size.encode(&mut writer)?;
        self.maximum_flow_window_size.encode(&mut writer)?;
        self.handshake_type.to_u32().encode(&mut writer)?;
        self.srt_socket_id.encode(&mut writer)?;
        self.syn_cookie.encode(&mut writer)?;
        self.peer_ip_address.encode(&mut writer)?;
        self.extensions.encode(&mut writer)?;

        Ok(())
    }

    fn size_hint(&self) -> usize {
        HEADER_SIZE + HANDSHAKE_BODY_SIZE + self.extensions.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::packet::{ControlPacketType, Header, Packet};
    use crate::proto::{Decode, Encode};
    use crate::utils::sequence::Sequence;

    use super::{
        ExtensionType, Extensions, HandshakePacket, HandshakeType, RejectReason, SRT_MAGIC,
    };

    #[test]
    fn test_handshake_type_codes() {
        assert_eq!(HandshakeType::Induction.to_u32(), 1);
        assert_eq!(HandshakeType::Response.to_u32(), 0);
        assert_eq!(HandshakeType::Conclusion.to_u32(), 0xFFFF_FFFF);
        assert_eq!(
            HandshakeType::from_u32(-3i32 as u32).unwrap(),
            HandshakeType::Rejection(RejectReason::Encryption)
        );
        assert!(HandshakeType::from_u32(9).is_err());
    }

    #[test]
    fn test_handshake_roundtrip() {
        let mut extensions = Extensions::new();
        extensions.push_u32(ExtensionType::Version, 0x010405);
        extensions.push_u32(ExtensionType::TsbpdDelay, 120_000);
        extensions.push_bytes(ExtensionType::Encryption, Bytes::from_static(&[7u8; 16]));

        let packet = HandshakePacket {
            header: Header::control(ControlPacketType::Handshake),
            version: 0x010405,
            encryption_field: 2,
            extension_field: SRT_MAGIC,
            initial_packet_sequence_number: Sequence::new(1_000_000),
            maximum_transmission_unit_size: 1500,
            maximum_flow_window_size: 8192,
            handshake_type: HandshakeType::Conclusion,
            srt_socket_id: 0xDEAD,
            syn_cookie: 0xBEEF,
            peer_ip_address: u32::from_be_bytes([127, 0, 0, 1]) as u128,
            extensions,
        };

        let buf = packet.encode_to_vec().unwrap();

        match Packet::decode(&mut &buf[..]).unwrap() {
            Packet::Handshake(parsed) => {
                assert_eq!(parsed.version, 0x010405);
                assert_eq!(parsed.encryption_field, 2);
                assert_eq!(parsed.extension_field, SRT_MAGIC);
                assert_eq!(
                    parsed.initial_packet_sequence_number,
                    Sequence::new(1_000_000)
                );
                assert_eq!(parsed.handshake_type, HandshakeType::Conclusion);
                assert_eq!(parsed.srt_socket_id, 0xDEAD);
                assert_eq!(parsed.syn_cookie, 0xBEEF);
                assert_eq!(parsed.extensions.version(), Some(0x010405));
                assert_eq!(parsed.extensions.tsbpd_delay_us(), Some(120_000));
                assert_eq!(
                    parsed.extensions.encryption_salt().map(|salt| salt.len()),
                    Some(16)
                );
            }
            other => panic!("expected handshake, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_extension_skipped() {
        let mut extensions = Extensions::new();
        extensions.push_u32(ExtensionType::Version, 0x010405);

        let mut packet = HandshakePacket {
            header: Header::control(ControlPacketType::Handshake),
            extensions,
            ..Default::default()
        };
        packet.extension_field = SRT_MAGIC;

        let mut buf = packet.encode_to_vec().unwrap();
        // Append an extension record with an unassigned type code.
        buf.extend_from_slice(&0x7F00u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&[0xAA; 4]);

        match Packet::decode(&mut &buf[..]).unwrap() {
            Packet::Handshake(parsed) => {
                assert_eq!(parsed.extensions.version(), Some(0x010405));
                assert!(parsed.extensions.get(ExtensionType::Flags).is_none());
            }
            other => panic!("expected handshake, got {:?}", other),
        }
    }
}
