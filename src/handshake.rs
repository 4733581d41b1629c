//! The Caller-Listener handshake.
//!
//! Two phases: Induction discovers the peer and hands out the listener's SYN cookie,
//! Conclusion negotiates versions, encryption, latency and window sizes through the SRT
//! extension section. The negotiation itself is a pure state machine
//! ([`CallerHandshake`], [`ListenerHandshake`]); the async drivers at the bottom move its
//! packets over the socket with retry and deadline timers.
//!
//! The Rendezvous variant is not supported.
//!
//! See https://datatracker.ietf.org/doc/html/draft-sharabayko-srt-01#section-4.3

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::{Config, Encryption};
use crate::crypto::{SessionCrypto, SALT_SIZE};
use crate::packet::handshake::{
    ExtensionType, Extensions, HandshakePacket, HandshakeType, RejectReason, SRT_FLAG_ENCRYPT,
    SRT_MAGIC,
};
use crate::packet::{ControlPacketType, Header, Packet};
use crate::proto::{Decode, Encode};
use crate::socket::UdpTransport;
use crate::timer::{TimerKind, TimerSet};
use crate::utils::sequence::Sequence;
use crate::Error;

/// Our protocol version, 1.4.5.
pub const SRT_VERSION: u32 = 0x010405;

/// The lowest peer version accepted, 1.3.0.
pub const MIN_PEER_VERSION: u32 = 0x010300;

/// Interval between handshake packet retries.
const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Total time budget for a handshake before it fails.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const LATENCY_MIN: Duration = Duration::from_millis(20);
const LATENCY_MAX: Duration = Duration::from_millis(8000);

/// The handshake phase a timer belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HandshakeStage {
    Induction,
    Conclusion,
}

/// A typed handshake failure. All of these are fatal for the connection attempt; no
/// partial state survives.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("peer version {0:#08x} below supported minimum")]
    VersionTooOld(u32),
    #[error("encryption configuration mismatch")]
    EncryptionMismatch,
    #[error("latency {0} ms outside 20..=8000")]
    LatencyOutOfRange(u64),
    #[error("handshake timed out")]
    Timeout,
    #[error("rejected by peer: {0:?}")]
    Rejected(RejectReason),
    #[error("peer omitted required extensions")]
    MissingExtensions,
    #[error("syn cookie mismatch")]
    CookieMismatch,
}

impl HandshakeError {
    /// The rejection code a listener answers with for this failure, if any.
    fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::VersionTooOld(_) => Some(RejectReason::Version),
            Self::EncryptionMismatch => Some(RejectReason::Encryption),
            Self::LatencyOutOfRange(_) => Some(RejectReason::Latency),
            Self::MissingExtensions => Some(RejectReason::Passphrase),
            Self::CookieMismatch => Some(RejectReason::Cookie),
            Self::Timeout | Self::Rejected(_) => None,
        }
    }
}

/// Everything both sides agree on once the handshake concludes.
#[derive(Clone, Debug)]
pub struct Negotiated {
    pub local_socket_id: u32,
    pub peer_socket_id: u32,
    /// First sequence number of our outgoing data.
    pub initial_send_seq: Sequence,
    /// First sequence number the peer will send.
    pub initial_recv_seq: Sequence,
    /// The agreed TSBPD delay: the maximum of both sides' configured latency.
    pub latency: Duration,
    pub encryption: Encryption,
    /// Key derivation salt, present when encryption is on.
    pub salt: Option<[u8; SALT_SIZE]>,
    /// The peer's advertised receive window in packets.
    pub peer_flow_window: u32,
    pub peer_mtu: u32,
    /// The listener's conclusion response, kept so a retried Conclusion can be answered
    /// again if the first response is lost. `None` on the caller side.
    pub conclusion_response: Option<HandshakePacket>,
}

/// What the caller state machine wants done after processing a packet.
#[derive(Clone, Debug)]
pub enum CallerAction {
    /// Transmit this packet (and keep retrying it).
    Send(HandshakePacket),
    /// The handshake concluded.
    Established(Box<Negotiated>),
    /// Not a packet we care about right now.
    Ignore,
}

/// Caller-side handshake state.
#[derive(Debug)]
pub struct CallerHandshake {
    config: Config,
    stage: HandshakeStage,
    local_socket_id: u32,
    /// ISN of our data stream, announced in the Conclusion.
    data_isn: Sequence,
    salt: Option<[u8; SALT_SIZE]>,
    syn_cookie: u32,
    peer_socket_id: u32,
}

impl CallerHandshake {
    pub fn new(config: Config) -> Self {
        let salt = config
            .encryption
            .is_enabled()
            .then(SessionCrypto::generate_salt);

        Self {
            config,
            stage: HandshakeStage::Induction,
            local_socket_id: random_socket_id(),
            data_isn: random_sequence(),
            salt,
            syn_cookie: 0,
            peer_socket_id: 0,
        }
    }

    #[inline]
    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    /// The opening Induction packet. Encryption and extensions are not announced yet.
    pub fn induction(&self) -> HandshakePacket {
        HandshakePacket {
            header: Header::control(ControlPacketType::Handshake),
            version: SRT_VERSION,
            encryption_field: 0,
            extension_field: 0,
            initial_packet_sequence_number: random_sequence(),
            maximum_transmission_unit_size: self.config.mss_bytes,
            maximum_flow_window_size: self.config.recv_window_packets,
            handshake_type: HandshakeType::Induction,
            srt_socket_id: self.local_socket_id,
            syn_cookie: 0,
            peer_ip_address: 0,
            extensions: Extensions::new(),
        }
    }

    pub fn handle(&mut self, packet: HandshakePacket) -> Result<CallerAction, HandshakeError> {
        if let HandshakeType::Rejection(reason) = packet.handshake_type {
            return Err(HandshakeError::Rejected(reason));
        }

        match self.stage {
            HandshakeStage::Induction => self.handle_induction_response(packet),
            HandshakeStage::Conclusion => self.handle_conclusion_response(packet),
        }
    }

    fn handle_induction_response(
        &mut self,
        packet: HandshakePacket,
    ) -> Result<CallerAction, HandshakeError> {
        if packet.handshake_type != HandshakeType::Response {
            tracing::trace!(
                "Ignoring handshake type {:?} while awaiting induction response",
                packet.handshake_type
            );
            return Ok(CallerAction::Ignore);
        }

        if packet.version < MIN_PEER_VERSION {
            return Err(HandshakeError::VersionTooOld(packet.version));
        }

        self.syn_cookie = packet.syn_cookie;
        self.peer_socket_id = packet.srt_socket_id;
        self.stage = HandshakeStage::Conclusion;

        tracing::debug!(
            "Induction done, peer socket id {}, sending conclusion",
            self.peer_socket_id
        );

        Ok(CallerAction::Send(self.conclusion()))
    }

    fn conclusion(&self) -> HandshakePacket {
        let latency_us = self.config.playback_delay_ms * 1_000;

        let mut extensions = Extensions::new();
        extensions.push_u32(ExtensionType::Version, SRT_VERSION);
        extensions.push_u32(
            ExtensionType::Flags,
            if self.config.encryption.is_enabled() {
                SRT_FLAG_ENCRYPT
            } else {
                0
            },
        );
        extensions.push_u32(ExtensionType::TsbpdDelay, latency_us);
        extensions.push_u32(ExtensionType::PeerLatency, latency_us);

        if let Some(salt) = &self.salt {
            extensions.push_bytes(ExtensionType::Encryption, Bytes::copy_from_slice(salt));
        }

        HandshakePacket {
            header: Header::control(ControlPacketType::Handshake),
            version: SRT_VERSION,
            encryption_field: self.config.encryption.field_code(),
            extension_field: SRT_MAGIC,
            initial_packet_sequence_number: self.data_isn,
            maximum_transmission_unit_size: self.config.mss_bytes,
            maximum_flow_window_size: self.config.recv_window_packets,
            handshake_type: HandshakeType::Conclusion,
            srt_socket_id: self.local_socket_id,
            syn_cookie: self.syn_cookie,
            peer_ip_address: 0,
            extensions,
        }
    }

    fn handle_conclusion_response(
        &mut self,
        packet: HandshakePacket,
    ) -> Result<CallerAction, HandshakeError> {
        if packet.handshake_type != HandshakeType::Response {
            tracing::trace!(
                "Ignoring handshake type {:?} while awaiting conclusion response",
                packet.handshake_type
            );
            return Ok(CallerAction::Ignore);
        }

        if packet.version < MIN_PEER_VERSION {
            return Err(HandshakeError::VersionTooOld(packet.version));
        }

        if packet.encryption_field != self.config.encryption.field_code() {
            return Err(HandshakeError::EncryptionMismatch);
        }

        // The listener answers with the negotiated latency; it can only be at or above
        // what we asked for.
        let peer_latency_us = packet
            .extensions
            .tsbpd_delay_us()
            .ok_or(HandshakeError::MissingExtensions)?;
        let latency = Duration::from_micros(peer_latency_us as u64)
            .max(Duration::from_millis(self.config.playback_delay_ms as u64));

        validate_latency(latency)?;

        let negotiated = Negotiated {
            local_socket_id: self.local_socket_id,
            peer_socket_id: self.peer_socket_id,
            initial_send_seq: self.data_isn,
            initial_recv_seq: packet.initial_packet_sequence_number,
            latency,
            encryption: self.config.encryption,
            salt: self.salt,
            peer_flow_window: packet.maximum_flow_window_size,
            peer_mtu: packet.maximum_transmission_unit_size,
            conclusion_response: None,
        };

        tracing::debug!(
            "Handshake established: latency {:?}, encryption {:?}",
            negotiated.latency,
            negotiated.encryption
        );

        Ok(CallerAction::Established(Box::new(negotiated)))
    }
}

/// What the listener state machine wants done after processing a packet.
#[derive(Clone, Debug)]
pub enum ListenerAction {
    Send(HandshakePacket),
    Established {
        negotiated: Box<Negotiated>,
        response: HandshakePacket,
    },
    Ignore,
}

/// Listener-side handshake state.
#[derive(Debug)]
pub struct ListenerHandshake {
    config: Config,
    stage: HandshakeStage,
    local_socket_id: u32,
    data_isn: Sequence,
    syn_cookie: u32,
    peer_socket_id: u32,
}

impl ListenerHandshake {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            stage: HandshakeStage::Induction,
            local_socket_id: random_socket_id(),
            data_isn: random_sequence(),
            syn_cookie: OsRng.next_u32(),
            peer_socket_id: 0,
        }
    }

    #[inline]
    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    pub fn handle(
        &mut self,
        packet: HandshakePacket,
        peer_addr: SocketAddr,
    ) -> Result<ListenerAction, HandshakeError> {
        match packet.handshake_type {
            HandshakeType::Induction => Ok(self.handle_induction(packet, peer_addr)),
            HandshakeType::Conclusion if self.stage == HandshakeStage::Conclusion => {
                self.handle_conclusion(packet)
            }
            other => {
                tracing::trace!("Ignoring handshake type {:?} in stage {:?}", other, self.stage);
                Ok(ListenerAction::Ignore)
            }
        }
    }

    fn handle_induction(
        &mut self,
        packet: HandshakePacket,
        peer_addr: SocketAddr,
    ) -> ListenerAction {
        self.peer_socket_id = packet.srt_socket_id;
        self.stage = HandshakeStage::Conclusion;

        tracing::debug!("Induction from {}, socket id {}", peer_addr, self.peer_socket_id);

        let peer_ip_address = match peer_addr.ip() {
            IpAddr::V4(ip) => u32::from_be_bytes(ip.octets()) as u128,
            IpAddr::V6(ip) => u128::from_be_bytes(ip.octets()),
        };

        let mut response = HandshakePacket {
            header: Header::control(ControlPacketType::Handshake),
            version: SRT_VERSION,
            encryption_field: 0,
            extension_field: SRT_MAGIC,
            initial_packet_sequence_number: self.data_isn,
            maximum_transmission_unit_size: self.config.mss_bytes,
            maximum_flow_window_size: self.config.recv_window_packets,
            handshake_type: HandshakeType::Response,
            srt_socket_id: self.local_socket_id,
            syn_cookie: self.syn_cookie,
            peer_ip_address,
            extensions: Extensions::new(),
        };
        response.header.destination_socket_id = self.peer_socket_id;

        ListenerAction::Send(response)
    }

    fn handle_conclusion(
        &mut self,
        packet: HandshakePacket,
    ) -> Result<ListenerAction, HandshakeError> {
        if packet.syn_cookie != self.syn_cookie {
            return Err(HandshakeError::CookieMismatch);
        }

        let version = packet.extensions.version().unwrap_or(packet.version);
        if version < MIN_PEER_VERSION {
            return Err(HandshakeError::VersionTooOld(version));
        }

        if packet.encryption_field != self.config.encryption.field_code() {
            return Err(HandshakeError::EncryptionMismatch);
        }

        let peer_latency_us = packet
            .extensions
            .tsbpd_delay_us()
            .ok_or(HandshakeError::MissingExtensions)?;
        let peer_latency = Duration::from_micros(peer_latency_us as u64);
        validate_latency(peer_latency)?;

        let latency =
            peer_latency.max(Duration::from_millis(self.config.playback_delay_ms as u64));

        let salt = if self.config.encryption.is_enabled() {
            let salt = packet
                .extensions
                .encryption_salt()
                .ok_or(HandshakeError::MissingExtensions)?;
            let salt: [u8; SALT_SIZE] = salt
                .get(..SALT_SIZE)
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or(HandshakeError::MissingExtensions)?;
            Some(salt)
        } else {
            None
        };

        let latency_us = latency.as_micros() as u32;

        let mut extensions = Extensions::new();
        extensions.push_u32(ExtensionType::Version, SRT_VERSION);
        extensions.push_u32(
            ExtensionType::Flags,
            if self.config.encryption.is_enabled() {
                SRT_FLAG_ENCRYPT
            } else {
                0
            },
        );
        extensions.push_u32(ExtensionType::TsbpdDelay, latency_us);
        extensions.push_u32(ExtensionType::PeerLatency, latency_us);
        if let Some(salt) = &salt {
            extensions.push_bytes(ExtensionType::Encryption, Bytes::copy_from_slice(salt));
        }

        let mut response = HandshakePacket {
            header: Header::control(ControlPacketType::Handshake),
            version: SRT_VERSION,
            encryption_field: self.config.encryption.field_code(),
            extension_field: SRT_MAGIC,
            initial_packet_sequence_number: self.data_isn,
            maximum_transmission_unit_size: self.config.mss_bytes,
            maximum_flow_window_size: self.config.recv_window_packets,
            handshake_type: HandshakeType::Response,
            srt_socket_id: self.local_socket_id,
            syn_cookie: 0,
            peer_ip_address: 0,
            extensions,
        };
        response.header.destination_socket_id = self.peer_socket_id;

        let negotiated = Negotiated {
            local_socket_id: self.local_socket_id,
            peer_socket_id: packet.srt_socket_id,
            initial_send_seq: self.data_isn,
            initial_recv_seq: packet.initial_packet_sequence_number,
            latency,
            encryption: self.config.encryption,
            salt,
            peer_flow_window: packet.maximum_flow_window_size,
            peer_mtu: packet.maximum_transmission_unit_size,
            conclusion_response: Some(response.clone()),
        };

        tracing::debug!(
            "Conclusion accepted: latency {:?}, encryption {:?}",
            negotiated.latency,
            negotiated.encryption
        );

        Ok(ListenerAction::Established {
            negotiated: Box::new(negotiated),
            response,
        })
    }

    /// The rejection packet answering a refused conclusion.
    fn rejection(&self, reason: RejectReason) -> HandshakePacket {
        let mut packet = HandshakePacket {
            header: Header::control(ControlPacketType::Handshake),
            version: SRT_VERSION,
            handshake_type: HandshakeType::Rejection(reason),
            srt_socket_id: self.local_socket_id,
            ..Default::default()
        };
        packet.header.destination_socket_id = self.peer_socket_id;
        packet
    }
}

fn validate_latency(latency: Duration) -> Result<(), HandshakeError> {
    if latency < LATENCY_MIN || latency > LATENCY_MAX {
        Err(HandshakeError::LatencyOutOfRange(latency.as_millis() as u64))
    } else {
        Ok(())
    }
}

fn random_socket_id() -> u32 {
    // Socket id 0 addresses the handshake itself and must not be allocated.
    OsRng.next_u32().max(1)
}

fn random_sequence() -> Sequence {
    Sequence::from(OsRng.next_u32())
}

async fn send_handshake(
    socket: &UdpTransport,
    packet: &HandshakePacket,
    addr: SocketAddr,
) -> Result<(), Error> {
    let buf = packet.encode_to_vec()?;
    socket.send_to(&buf, addr).await?;
    Ok(())
}

/// Runs the caller side of the handshake against `peer`.
///
/// The current phase's packet is retried every 250 ms; the whole exchange is bounded by a
/// 5 second deadline.
pub(crate) async fn connect(
    socket: &UdpTransport,
    peer: SocketAddr,
    config: &Config,
) -> Result<Negotiated, Error> {
    let mut handshake = CallerHandshake::new(config.clone());
    let mut current = handshake.induction();

    let now = Instant::now();
    let mut timers = TimerSet::new();
    timers.schedule(
        "handshake-retry",
        TimerKind::Handshake(handshake.stage()),
        RETRY_INTERVAL,
        now,
    );
    timers.schedule(
        "handshake-deadline",
        TimerKind::Handshake(handshake.stage()),
        HANDSHAKE_TIMEOUT,
        now,
    );

    send_handshake(socket, &current, peer).await?;

    let mut buf = vec![0u8; 65536];

    loop {
        let now = Instant::now();
        let timeout = timers
            .time_until_next(now)
            .unwrap_or(RETRY_INTERVAL);

        if let Some((len, addr)) = socket.recv_from_timeout(&mut buf, timeout).await? {
            if addr == peer {
                match Packet::decode(&mut &buf[..len]) {
                    Ok(Packet::Handshake(packet)) => match handshake.handle(packet)? {
                        CallerAction::Send(packet) => {
                            current = packet;
                            send_handshake(socket, &current, peer).await?;
                            timers.schedule(
                                "handshake-retry",
                                TimerKind::Handshake(handshake.stage()),
                                RETRY_INTERVAL,
                                Instant::now(),
                            );
                        }
                        CallerAction::Established(negotiated) => return Ok(*negotiated),
                        CallerAction::Ignore => (),
                    },
                    Ok(_) => tracing::trace!("Ignoring non-handshake packet during handshake"),
                    Err(err) => tracing::debug!("Failed to decode handshake datagram: {}", err),
                }
            }
        }

        for expired in timers.tick(Instant::now()) {
            match expired.id.as_str() {
                "handshake-deadline" => return Err(HandshakeError::Timeout.into()),
                _ => {
                    send_handshake(socket, &current, peer).await?;
                    timers.schedule(
                        "handshake-retry",
                        TimerKind::Handshake(handshake.stage()),
                        RETRY_INTERVAL,
                        Instant::now(),
                    );
                }
            }
        }
    }
}

/// Runs the listener side of the handshake: waits for an Induction, then concludes with
/// that same peer. The conclusion phase is bounded by the 5 second deadline.
pub(crate) async fn accept(
    socket: &UdpTransport,
    config: &Config,
) -> Result<(Negotiated, SocketAddr), Error> {
    let mut handshake = ListenerHandshake::new(config.clone());
    let mut peer: Option<SocketAddr> = None;

    let mut timers = TimerSet::new();
    let mut buf = vec![0u8; 65536];

    loop {
        let received = match peer {
            // Still listening: block until the first caller shows up.
            None => {
                let (len, addr) = socket.recv_from(&mut buf).await?;
                Some((len, addr))
            }
            Some(_) => {
                let timeout = timers
                    .time_until_next(Instant::now())
                    .unwrap_or(RETRY_INTERVAL);
                socket.recv_from_timeout(&mut buf, timeout).await?
            }
        };

        if let Some((len, addr)) = received {
            if peer.is_none() || peer == Some(addr) {
                match Packet::decode(&mut &buf[..len]) {
                    Ok(Packet::Handshake(packet)) => {
                        match handshake.handle(packet, addr) {
                            Ok(ListenerAction::Send(response)) => {
                                if peer.is_none() {
                                    peer = Some(addr);
                                    timers.schedule(
                                        "handshake-deadline",
                                        TimerKind::Handshake(handshake.stage()),
                                        HANDSHAKE_TIMEOUT,
                                        Instant::now(),
                                    );
                                }
                                send_handshake(socket, &response, addr).await?;
                            }
                            Ok(ListenerAction::Established {
                                negotiated,
                                response,
                            }) => {
                                send_handshake(socket, &response, addr).await?;
                                return Ok((*negotiated, addr));
                            }
                            Ok(ListenerAction::Ignore) => (),
                            Err(err) => {
                                if let Some(reason) = err.reject_reason() {
                                    let rejection = handshake.rejection(reason);
                                    send_handshake(socket, &rejection, addr).await?;
                                }
                                return Err(err.into());
                            }
                        }
                    }
                    Ok(_) => tracing::trace!("Ignoring non-handshake packet during accept"),
                    Err(err) => tracing::debug!("Failed to decode handshake datagram: {}", err),
                }
            }
        }

        for expired in timers.tick(Instant::now()) {
            if expired.id == "handshake-deadline" {
                return Err(HandshakeError::Timeout.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::{Config, Encryption};
    use crate::packet::handshake::{HandshakeType, RejectReason};

    use super::{
        CallerAction, CallerHandshake, HandshakeError, ListenerAction, ListenerHandshake,
    };

    fn caller_config(latency_ms: u32, passphrase: Option<&str>) -> Config {
        Config {
            encryption: if passphrase.is_some() {
                Encryption::Aes256
            } else {
                Encryption::Off
            },
            passphrase: passphrase.map(String::from),
            playback_delay_ms: latency_ms,
            ..Default::default()
        }
    }

    fn peer_addr() -> std::net::SocketAddr {
        "198.51.100.7:9000".parse().unwrap()
    }

    /// Shuttles packets between the two state machines until both sides are done.
    fn negotiate(
        caller_cfg: Config,
        listener_cfg: Config,
    ) -> Result<(super::Negotiated, super::Negotiated), HandshakeError> {
        let mut caller = CallerHandshake::new(caller_cfg);
        let mut listener = ListenerHandshake::new(listener_cfg);

        let induction = caller.induction();

        let ListenerAction::Send(induction_response) = listener.handle(induction, peer_addr())?
        else {
            panic!("listener should answer the induction");
        };

        let CallerAction::Send(conclusion) = caller.handle(induction_response)? else {
            panic!("caller should send a conclusion");
        };
        assert_eq!(conclusion.handshake_type, HandshakeType::Conclusion);

        let ListenerAction::Established {
            negotiated: listener_negotiated,
            response,
        } = listener.handle(conclusion, peer_addr())?
        else {
            panic!("listener should conclude");
        };

        let CallerAction::Established(caller_negotiated) = caller.handle(response)? else {
            panic!("caller should conclude");
        };

        Ok((*caller_negotiated, *listener_negotiated))
    }

    #[test]
    fn test_latency_negotiation_takes_maximum() {
        let (caller, listener) = negotiate(
            caller_config(150, Some("my_secret_passphrase")),
            caller_config(120, Some("my_secret_passphrase")),
        )
        .unwrap();

        assert_eq!(caller.latency, Duration::from_millis(150));
        assert_eq!(listener.latency, Duration::from_millis(150));
        assert_eq!(caller.encryption, Encryption::Aes256);
        assert_eq!(listener.encryption, Encryption::Aes256);
        assert_eq!(caller.salt, listener.salt);
        assert!(caller.salt.is_some());

        // Each side receives from the other's announced ISN.
        assert_eq!(caller.initial_send_seq, listener.initial_recv_seq);
        assert_eq!(listener.initial_send_seq, caller.initial_recv_seq);
        assert_eq!(caller.peer_socket_id, listener.local_socket_id);
    }

    #[test]
    fn test_encryption_mismatch_rejected() {
        let err = negotiate(
            caller_config(120, Some("my_secret_passphrase")),
            caller_config(120, None),
        )
        .unwrap_err();

        assert_eq!(err, HandshakeError::EncryptionMismatch);
    }

    #[test]
    fn test_cookie_mismatch_rejected() {
        let mut caller = CallerHandshake::new(caller_config(120, None));
        let mut listener = ListenerHandshake::new(caller_config(120, None));

        let ListenerAction::Send(response) =
            listener.handle(caller.induction(), peer_addr()).unwrap()
        else {
            panic!("listener should answer the induction");
        };

        let CallerAction::Send(mut conclusion) = caller.handle(response).unwrap() else {
            panic!("caller should send a conclusion");
        };

        conclusion.syn_cookie ^= 1;
        assert_eq!(
            listener.handle(conclusion, peer_addr()).unwrap_err(),
            HandshakeError::CookieMismatch
        );
    }

    #[test]
    fn test_caller_surfaces_peer_rejection() {
        let mut caller = CallerHandshake::new(caller_config(120, None));
        let listener = ListenerHandshake::new(caller_config(120, None));

        let rejection = listener.rejection(RejectReason::Encryption);
        assert_eq!(
            caller.handle(rejection).unwrap_err(),
            HandshakeError::Rejected(RejectReason::Encryption)
        );
    }
}
