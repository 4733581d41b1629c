//! The connection orchestrator.
//!
//! A [`Connection`] is a single-task reactor driving one SRT stream: it owns the UDP
//! socket and every protocol component, polls the socket with a deadline derived from the
//! timer set and the TSBPD queue, routes arriving packets, drains timers and delivers
//! reassembled payloads. Components never perform I/O themselves; they return values the
//! reactor turns into packets.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::config::Config;
use crate::crypto::{CipherKind, SessionCrypto};
use crate::flow::{Admission, FlowControl};
use crate::handshake::{self, HandshakeError, Negotiated};
use crate::metrics::{ConnectionMetrics, Snapshot};
use crate::congestion::CongestionControl;
use crate::packet::{
    Ack, AckAck, DataPacket, DropRequest, HandshakePacket, HandshakeType, IsPacket, KeepAlive,
    KeyFlag, Nak, Packet, PacketType, Shutdown, Timestamp,
};
use crate::proto::{Decode, Encode};
use crate::receiver::ReceiveEngine;
use crate::rtt::RttEstimator;
use crate::sender::{RetransmitOutcome, SendEngine};
use crate::socket::UdpTransport;
use crate::timer::{Expired, TimerKind, TimerSet};
use crate::tsbpd::Tsbpd;
use crate::utils::message::MessageNumber;
use crate::utils::sequence::Sequence;
use crate::Error;

/// Fallback poll timeout when nothing else is scheduled.
const DEFAULT_POLL: Duration = Duration::from_millis(10);

/// Interval of the periodic cumulative ACK.
const ACK_INTERVAL: Duration = Duration::from_millis(10);

/// Interval of the keep-alive probe.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// The connection is dropped when the peer stays silent this long.
const PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// NAK lists larger than this are split across packets.
const MAX_NAK_ENTRIES: usize = 100;

/// Lifecycle of a connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Induction,
    Conclusion,
    Established,
    Shutdown,
}

/// Which side of the handshake this endpoint took.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Caller,
    Listener,
}

/// An asynchronous notification surfaced to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A packet exhausted its retransmission budget and was dropped from the send window.
    SendLoss {
        message: MessageNumber,
        sequence: Sequence,
    },
    /// The peer sent a Shutdown.
    PeerShutdown,
    /// The peer stayed silent past the liveness bound.
    PeerTimeout,
}

/// ACKs we emitted and for which an AckAck is still outstanding, with their send times.
#[derive(Clone, Debug, Default)]
struct AckQueue {
    inner: VecDeque<(Sequence, Instant)>,
}

impl AckQueue {
    fn push_back(&mut self, seq: Sequence, sent_at: Instant) {
        self.inner.push_back((seq, sent_at));
    }

    fn front(&self) -> Option<(Sequence, Instant)> {
        self.inner.front().copied()
    }

    fn pop_front(&mut self) -> Option<(Sequence, Instant)> {
        self.inner.pop_front()
    }
}

/// A listening endpoint producing one connection per accept.
///
/// Multiplexing several SRT streams over one UDP socket is not supported; `accept`
/// consumes the listener and hands its socket to the connection.
#[derive(Debug)]
pub struct Listener {
    socket: UdpTransport,
    config: Config,
}

impl Listener {
    pub fn bind(addr: SocketAddr, config: Config) -> Result<Self, Error> {
        config.validate()?;

        let socket = UdpTransport::bind(addr)?;
        tracing::debug!("Srt listener bound on {:?}", socket.local_addr());

        Ok(Self { socket, config })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for a caller, runs the handshake and returns the established connection.
    pub async fn accept(self) -> Result<Connection, Error> {
        let (negotiated, peer_addr) = handshake::accept(&self.socket, &self.config).await?;

        Connection::establish(self.socket, peer_addr, self.config, Role::Listener, negotiated)
    }
}

/// A single established SRT connection driven by its own reactor.
pub struct Connection {
    socket: UdpTransport,
    peer_addr: SocketAddr,
    config: Config,
    role: Role,
    state: ConnectionState,

    local_socket_id: u32,
    peer_socket_id: u32,

    /// Session origin; all packet timestamps are relative to it.
    start_time: Instant,
    latency: Duration,
    live: bool,

    send_engine: SendEngine,
    recv_engine: ReceiveEngine,
    crypto: Option<SessionCrypto>,
    tsbpd: Tsbpd,
    rtt: RttEstimator,
    congestion: CongestionControl,
    flow: FlowControl,
    timers: TimerSet,

    /// Admitted packets awaiting a pacing slot.
    transmit_queue: VecDeque<DataPacket>,
    /// Payloads ready for the application.
    delivered: VecDeque<Bytes>,
    events: VecDeque<Event>,
    inflight_acks: AckQueue,

    /// Origin timestamp of the latest accepted data packet, echoed in ACKs for the
    /// peer's RTT measurement.
    last_data_timestamp: Option<Timestamp>,
    last_arrival: Instant,

    /// Listener side only: the conclusion response, re-sent if the caller retries its
    /// Conclusion because the first response was lost.
    conclusion_response: Option<HandshakePacket>,

    recv_buf: Vec<u8>,
    metrics: ConnectionMetrics,
}

impl Connection {
    /// Dials `addr` as a caller: binds an ephemeral UDP socket, performs the handshake
    /// and returns the established connection.
    pub async fn connect(addr: SocketAddr, config: Config) -> Result<Self, Error> {
        config.validate()?;

        let bind_addr = match addr {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpTransport::bind(bind_addr)?;

        let negotiated = handshake::connect(&socket, addr, &config).await?;

        Self::establish(socket, addr, config, Role::Caller, negotiated)
    }

    fn establish(
        socket: UdpTransport,
        peer_addr: SocketAddr,
        config: Config,
        role: Role,
        negotiated: Negotiated,
    ) -> Result<Self, Error> {
        let now = Instant::now();

        let crypto = match CipherKind::from_encryption(negotiated.encryption) {
            Some(kind) => {
                let (Some(passphrase), Some(salt)) = (&config.passphrase, negotiated.salt) else {
                    return Err(HandshakeError::MissingExtensions.into());
                };

                Some(SessionCrypto::new(
                    kind,
                    passphrase,
                    salt,
                    config.key_refresh_packets,
                )?)
            }
            None => None,
        };

        let rtt = RttEstimator::new(config.min_rto(), config.max_rto());
        let congestion =
            CongestionControl::new(config.mss_bytes as usize, 80_000, config.max_bandwidth_bps);
        let initial_rate = congestion.sending_rate_bps(rtt.srtt_us()) as f64 / 8.0;
        let flow = FlowControl::new(
            config.send_window_packets,
            negotiated.peer_flow_window,
            initial_rate,
            now,
        );

        let mut timers = TimerSet::new();
        timers.schedule("ack", TimerKind::Ack, ACK_INTERVAL, now);
        timers.schedule("keepalive", TimerKind::KeepAlive, KEEPALIVE_INTERVAL, now);

        tracing::debug!(
            "Connection established with {} as {:?}, latency {:?}",
            peer_addr,
            role,
            negotiated.latency
        );

        Ok(Self {
            socket,
            peer_addr,
            live: config.live,
            send_engine: SendEngine::new(
                negotiated.initial_send_seq,
                config.max_payload(),
                config.max_retransmits,
            ),
            recv_engine: ReceiveEngine::new(
                negotiated.initial_recv_seq,
                config.recv_window_packets,
                config.ack_frequency_packets,
            ),
            tsbpd: Tsbpd::new(negotiated.latency, true),
            rtt,
            congestion,
            flow,
            timers,
            crypto,
            role,
            state: ConnectionState::Established,
            local_socket_id: negotiated.local_socket_id,
            peer_socket_id: negotiated.peer_socket_id,
            start_time: now,
            latency: negotiated.latency,
            transmit_queue: VecDeque::new(),
            delivered: VecDeque::new(),
            events: VecDeque::new(),
            inflight_acks: AckQueue::default(),
            last_data_timestamp: None,
            last_arrival: now,
            conclusion_response: negotiated.conclusion_response,
            recv_buf: vec![0; 65536],
            metrics: ConnectionMetrics::new(),
            config,
        })
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn local_socket_id(&self) -> u32 {
        self.local_socket_id
    }

    #[inline]
    pub fn peer_socket_id(&self) -> u32 {
        self.peer_socket_id
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The negotiated TSBPD delay.
    #[inline]
    pub fn latency(&self) -> Duration {
        self.latency
    }

    #[inline]
    pub fn encryption_enabled(&self) -> bool {
        self.crypto.is_some()
    }

    /// Microseconds since the session origin, as stamped on outgoing packets.
    fn timestamp(&self) -> Timestamp {
        Timestamp::from_duration(self.start_time.elapsed())
    }

    /// Queues `payload` as one message for transmission.
    ///
    /// Returns the number of bytes accepted, [`Error::WouldBlock`] when flow or
    /// congestion control refuse more data, and [`Error::Closed`] after shutdown.
    pub fn send(&mut self, payload: &[u8]) -> Result<usize, Error> {
        if self.state != ConnectionState::Established {
            return Err(Error::Closed);
        }

        if payload.is_empty() {
            return Ok(0);
        }

        let queued = self.transmit_queue.len() as u32 + self.flow.in_flight();
        let count = self.send_engine.fragment_count(payload.len()) as u32;

        if queued + count > self.flow.window() || !self.congestion.permits(queued) {
            return Err(Error::WouldBlock);
        }

        let timestamp = self.timestamp();
        let mut packets =
            self.send_engine
                .fragment(Bytes::copy_from_slice(payload), true, timestamp);

        if let Some(crypto) = &mut self.crypto {
            for packet in &mut packets {
                let mut data = BytesMut::from(&packet.data[..]);
                let flag = crypto.encrypt(packet.packet_sequence_number(), &mut data)?;
                packet.data = data.freeze();
                packet.header.set_key_flag(flag);
            }
        }

        self.transmit_queue.extend(packets);
        Ok(payload.len())
    }

    /// Removes the next delivered payload, if any. Yields [`Error::Closed`] once the
    /// connection is shut down and everything pending has been drained.
    pub fn try_recv(&mut self) -> Result<Option<Bytes>, Error> {
        match self.delivered.pop_front() {
            Some(data) => Ok(Some(data)),
            None if self.state == ConnectionState::Shutdown => Err(Error::Closed),
            None => Ok(None),
        }
    }

    /// Waits for the next delivered payload, driving the reactor in the meantime.
    pub async fn recv(&mut self) -> Result<Bytes, Error> {
        loop {
            if let Some(data) = self.try_recv()? {
                return Ok(data);
            }

            self.drive_once().await?;
        }
    }

    /// Removes and returns the pending asynchronous notifications.
    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// Runs one reactor iteration: poll the socket with a deadline, route the datagram,
    /// fire due timers, release due TSBPD packets and flush pending sends.
    pub async fn drive_once(&mut self) -> Result<(), Error> {
        if self.state == ConnectionState::Shutdown {
            return Err(Error::Closed);
        }

        self.flush_transmit().await?;

        let now = Instant::now();
        let mut timeout = DEFAULT_POLL;

        if let Some(next) = self.timers.time_until_next(now) {
            timeout = timeout.min(next);
        }
        if self.live {
            if let Some(release) = self.tsbpd.next_release() {
                timeout = timeout.min(release.saturating_duration_since(now));
            }
        }
        if let Some(front) = self.transmit_queue.front() {
            if let Some(wait) = self.flow.time_until_admission(front.size(), now) {
                timeout = timeout.min(wait);
            }
        }

        let received = self
            .socket
            .recv_from_timeout(&mut self.recv_buf, timeout)
            .await?;

        if let Some((len, addr)) = received {
            if addr == self.peer_addr {
                let packet = Packet::decode(&mut &self.recv_buf[..len]);
                match packet {
                    Ok(packet) => {
                        match packet.packet_type() {
                            PacketType::Data => {
                                self.metrics.data_packets_recv.inc();
                                self.metrics.data_bytes_recv.add(len as u64);
                            }
                            PacketType::Control => {
                                self.metrics.ctrl_packets_recv.inc();
                                self.metrics.ctrl_bytes_recv.add(len as u64);
                            }
                        }

                        self.handle_packet(packet).await?;
                    }
                    Err(err) => {
                        self.metrics.decode_errors.inc();
                        tracing::debug!("Failed to decode datagram: {}", err);
                    }
                }
            } else {
                tracing::trace!("Ignoring datagram from unknown peer {}", addr);
            }
        }

        let expired = self.timers.tick(Instant::now());
        for entry in expired {
            self.handle_timer(entry).await?;
        }

        if self.live {
            let released = self.tsbpd.release(Instant::now());
            self.delivered.extend(released);
        }

        if self.last_arrival.elapsed() > PEER_TIMEOUT {
            tracing::debug!("Peer silent for {:?}, closing", PEER_TIMEOUT);
            self.events.push_back(Event::PeerTimeout);
            return self.close().await;
        }

        self.flush_transmit().await
    }

    /// Flushes the connection: sends a Shutdown to the peer, cancels every timer and
    /// moves to [`ConnectionState::Shutdown`]. Pending sends are drained for at most
    /// `linger_ms`.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.state == ConnectionState::Shutdown {
            return Ok(());
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.linger_ms);
        while !self.transmit_queue.is_empty() && Instant::now() < deadline {
            self.flush_transmit().await?;

            if !self.transmit_queue.is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        if let Err(err) = self.send_control(Shutdown::builder().build()).await {
            tracing::debug!("Failed to send shutdown: {}", err);
        }

        self.timers.clear();
        self.state = ConnectionState::Shutdown;

        tracing::debug!("Connection with {} shut down", self.peer_addr);

        Ok(())
    }

    /// A flat snapshot of every component's counters.
    pub fn counters(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        self.metrics.fill(&mut snapshot);

        let send = self.send_engine.stats();
        snapshot.insert("send.messages_fragmented", send.messages_fragmented.get());
        snapshot.insert("send.packets_fragmented", send.packets_fragmented.get());
        snapshot.insert("send.packets_acked", send.packets_acked.get());
        snapshot.insert("send.retransmissions", send.retransmissions.get());
        snapshot.insert("send.send_losses", send.send_losses.get());

        let recv = self.recv_engine.stats();
        snapshot.insert("recv.packets_received", recv.packets_received.get());
        snapshot.insert("recv.duplicates", recv.duplicates.get());
        snapshot.insert("recv.out_of_order", recv.out_of_order.get());
        snapshot.insert("recv.window_overflow", recv.window_overflow.get());
        snapshot.insert("recv.messages_completed", recv.messages_completed.get());
        snapshot.insert("recv.orphan_fragments", recv.orphan_fragments.get());
        snapshot.insert("recv.acks_emitted", recv.acks_emitted.get());
        snapshot.insert("recv.naks_emitted", recv.naks_emitted.get());
        snapshot.insert("recv.peer_dropped", recv.peer_dropped.get());

        let tsbpd = self.tsbpd.stats();
        snapshot.insert("tsbpd.delivered", tsbpd.delivered.get());
        snapshot.insert("tsbpd.dropped_late", tsbpd.dropped_late.get());
        snapshot.insert("tsbpd.dropped_early", tsbpd.dropped_early.get());
        snapshot.insert("tsbpd.drift_updates", tsbpd.drift_updates.get());
        snapshot.insert("tsbpd.base_resets", tsbpd.base_resets.get());
        snapshot.insert("tsbpd.avg_delivery_delay_us", tsbpd.avg_delivery_delay_us);
        snapshot.insert("tsbpd.max_delivery_delay_us", tsbpd.max_delivery_delay_us);

        let rtt = self.rtt.stats();
        snapshot.insert("rtt.samples", rtt.samples);
        snapshot.insert("rtt.smoothed_us", rtt.smoothed_us);
        snapshot.insert("rtt.variation_us", rtt.variation_us);
        snapshot.insert("rtt.min_us", rtt.min_us);
        snapshot.insert("rtt.max_us", rtt.max_us);

        let congestion = self.congestion.stats();
        snapshot.insert("congestion.acks_processed", congestion.acks_processed.get());
        snapshot.insert("congestion.loss_events", congestion.loss_events.get());
        snapshot.insert("congestion.packets_sent", congestion.packets_sent);
        snapshot.insert("congestion.packets_lost", congestion.packets_lost);

        let flow = self.flow.stats();
        snapshot.insert("flow.packets_sent", flow.packets_sent.get());
        snapshot.insert("flow.packets_dropped", flow.packets_dropped.get());
        snapshot.insert("flow.bytes_sent", flow.bytes_sent.get());
        snapshot.insert("flow.rate_limited", flow.rate_limited.get());
        snapshot.insert("flow.window_full", flow.window_full.get());
        snapshot.insert("flow.utilisation_pct", flow.utilisation_pct);

        if let Some(crypto) = &self.crypto {
            let crypto = crypto.stats();
            snapshot.insert("crypto.packets_encrypted", crypto.packets_encrypted.get());
            snapshot.insert("crypto.packets_decrypted", crypto.packets_decrypted.get());
            snapshot.insert("crypto.failures", crypto.failures.get());
            snapshot.insert("crypto.key_refreshes", crypto.key_refreshes.get());
        }

        snapshot
    }

    //
    // ----- Packet routing -----
    //

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), Error> {
        self.last_arrival = Instant::now();

        match packet {
            Packet::Data(packet) => self.handle_data(packet).await,
            Packet::Ack(ack) => self.handle_ack(ack).await,
            Packet::Nak(nak) => self.handle_nak(nak).await,
            Packet::AckAck(ackack) => {
                self.handle_ackack(ackack);
                Ok(())
            }
            Packet::KeepAlive(_) => Ok(()),
            Packet::Shutdown(_) => {
                tracing::debug!("Peer {} sent shutdown", self.peer_addr);
                self.events.push_back(Event::PeerShutdown);
                self.timers.clear();
                self.state = ConnectionState::Shutdown;
                Ok(())
            }
            Packet::DropRequest(drop) => {
                self.recv_engine.handle_drop(
                    drop.message_number(),
                    drop.first_packet_sequence_number,
                    drop.last_packet_sequence_number,
                );
                Ok(())
            }
            Packet::Handshake(packet) => {
                // A retried Conclusion means our response never arrived; answer it
                // again. Anything else mid-stream is a protocol violation.
                if packet.handshake_type == HandshakeType::Conclusion {
                    if let Some(response) = self.conclusion_response.clone() {
                        tracing::debug!("Re-answering retried conclusion");
                        return self.send_control(response).await;
                    }
                }

                self.metrics.protocol_violations.inc();
                tracing::debug!("Handshake packet on established connection");
                Ok(())
            }
            Packet::CongestionWarning(_) | Packet::PeerError(_) => {
                self.metrics.protocol_violations.inc();
                tracing::warn!("Unhandled control packet");
                Ok(())
            }
        }
    }

    async fn handle_data(&mut self, mut packet: DataPacket) -> Result<(), Error> {
        let seq = packet.packet_sequence_number();

        match &mut self.crypto {
            Some(crypto) => {
                let flag = packet.header.key_flag();
                let mut data = BytesMut::from(&packet.data[..]);

                if let Err(err) = crypto.decrypt(seq, flag, &mut data) {
                    self.metrics.crypto_drops.inc();
                    tracing::debug!("Dropping packet {}: {}", seq, err);
                    return Ok(());
                }

                packet.data = data.freeze();
            }
            None if packet.header.key_flag() != KeyFlag::None => {
                self.metrics.crypto_drops.inc();
                tracing::debug!("Dropping encrypted packet {} on plaintext session", seq);
                return Ok(());
            }
            None => (),
        }

        self.last_data_timestamp = Some(packet.header.timestamp);

        let now = Instant::now();
        self.recv_engine.handle_data(packet);

        for message in self.recv_engine.take_messages() {
            if self.live {
                self.tsbpd
                    .insert(message.sequence, message.timestamp, message.data, now);
            } else {
                self.delivered.push_back(message.data);
            }
        }

        self.emit_ack(false).await?;

        if !self.timers.contains("nak") {
            self.emit_nak().await?;
        }

        Ok(())
    }

    async fn handle_ack(&mut self, ack: Ack) -> Result<(), Error> {
        let upto = ack.last_acknowledged_sequence_number();
        let acked = self.send_engine.handle_ack(upto);

        if !acked.is_empty() {
            for seq in &acked {
                self.timers.cancel(&retx_id(*seq));
            }

            self.flow.on_acked(acked.len() as u32);
            self.congestion.on_ack();

            if let Some(echo) = ack.timestamp_echo {
                let rtt_us = self.timestamp().delta(Timestamp::from_micros(echo)) as u64;

                // Discard samples from a bogus or reordered echo.
                if rtt_us < 60_000_000 {
                    self.rtt.update(rtt_us);
                }
            }

            let now = Instant::now();
            let rate = self.congestion.sending_rate_bps(self.rtt.srtt_us());
            self.flow.set_rate(rate as f64 / 8.0, now);

            if self.rtt.stats().samples >= 10 {
                let suggested = self.rtt.suggested_window(self.config.max_bandwidth_bps);
                self.flow
                    .set_send_window(suggested.min(self.config.send_window_packets));
            }
        }

        // Answer with an AckAck so the receiver can measure the feedback path.
        self.send_control(
            AckAck::builder()
                .acknowledged_sequence_number(upto)
                .build(),
        )
        .await
    }

    async fn handle_nak(&mut self, nak: Nak) -> Result<(), Error> {
        let lost: Vec<Sequence> = nak.lost_packet_sequence_numbers.iter().collect();
        if lost.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        self.congestion.on_loss(lost.len() as u64, now);
        self.flow.on_loss(now);

        for seq in lost {
            if !self.retransmit(seq, now).await? {
                // The sequence is not in the window anymore; tell the receiver to stop
                // asking for it.
                self.send_control(
                    DropRequest::builder()
                        .message_number(MessageNumber::new(0))
                        .first_packet_sequence_number(seq)
                        .last_packet_sequence_number(seq)
                        .build(),
                )
                .await?;
            }
        }

        Ok(())
    }

    fn handle_ackack(&mut self, ackack: AckAck) {
        let acked = ackack.acknowledged_sequence_number();

        // ACKs are emitted with increasing sequences; drop the superseded entries but do
        // not drain past the acknowledged one, its AckAck may still be on the wire.
        while let Some((seq, sent_at)) = self.inflight_acks.front() {
            if seq > acked {
                break;
            }

            self.inflight_acks.pop_front();

            if seq == acked {
                let rtt = sent_at.elapsed().as_micros() as u64;
                tracing::trace!("AckAck for {} with RTT {}us", seq, rtt);
                self.rtt.update(rtt);
                return;
            }
        }
    }

    //
    // ----- Timer dispatch -----
    //

    async fn handle_timer(&mut self, entry: Expired) -> Result<(), Error> {
        match entry.kind {
            TimerKind::Retransmit(seq) => {
                let now = Instant::now();

                // A timeout is a loss signal of its own, but only if the packet was
                // still outstanding.
                if self.retransmit(seq, now).await? {
                    self.congestion.on_loss(1, now);
                    self.flow.on_loss(now);
                }

                Ok(())
            }
            TimerKind::Ack => {
                self.emit_ack(true).await?;
                self.timers
                    .schedule("ack", TimerKind::Ack, ACK_INTERVAL, Instant::now());
                Ok(())
            }
            TimerKind::Nak => self.emit_nak().await,
            TimerKind::KeepAlive => {
                self.send_control(KeepAlive::builder().build()).await?;
                self.timers.schedule(
                    "keepalive",
                    TimerKind::KeepAlive,
                    KEEPALIVE_INTERVAL,
                    Instant::now(),
                );
                Ok(())
            }
            TimerKind::Handshake(_) => Ok(()),
        }
    }

    //
    // ----- Emission -----
    //

    /// Retransmits `seq` if it is still outstanding. Returns `true` when the sequence was
    /// still tracked, i.e. the request counted as a loss.
    async fn retransmit(&mut self, seq: Sequence, now: Instant) -> Result<bool, Error> {
        let outcome =
            self.send_engine
                .retransmit(seq, self.rtt.rto(), self.config.max_rto(), now);

        match outcome {
            RetransmitOutcome::Resend(packet, backoff) => {
                self.timers
                    .schedule(retx_id(seq), TimerKind::Retransmit(seq), backoff, now);
                self.send_data_packet(packet).await?;
                Ok(true)
            }
            RetransmitOutcome::Exhausted { message, sequence } => {
                self.timers.cancel(&retx_id(sequence));
                self.flow.on_dropped(1);
                self.events.push_back(Event::SendLoss { message, sequence });

                // Tell the receiver to stop waiting for this message.
                self.send_control(
                    DropRequest::builder()
                        .message_number(message)
                        .first_packet_sequence_number(sequence)
                        .last_packet_sequence_number(sequence)
                        .build(),
                )
                .await?;
                Ok(true)
            }
            RetransmitOutcome::AlreadyAcked => Ok(false),
        }
    }

    async fn emit_ack(&mut self, force: bool) -> Result<(), Error> {
        let Some(seq) = self.recv_engine.ack_due(force) else {
            return Ok(());
        };

        let mut builder = Ack::builder().last_acknowledged_sequence_number(seq);
        if let Some(timestamp) = self.last_data_timestamp {
            builder = builder.timestamp_echo(timestamp.as_micros());
        }

        self.inflight_acks.push_back(seq, Instant::now());
        self.send_control(builder.build()).await
    }

    async fn emit_nak(&mut self) -> Result<(), Error> {
        let missing = self.recv_engine.loss_list();
        if missing.is_empty() {
            return Ok(());
        }

        for chunk in missing.chunks(MAX_NAK_ENTRIES) {
            self.recv_engine.note_nak();
            self.send_control(Nak::builder().lost_packet_sequence_numbers(chunk).build())
                .await?;
        }

        // Keep nagging until the gaps close; retransmissions get lost too.
        let interval = self.nak_interval();
        self.timers
            .schedule("nak", TimerKind::Nak, interval, Instant::now());

        Ok(())
    }

    fn nak_interval(&self) -> Duration {
        Duration::from_micros((self.rtt.srtt_us() * 2.0) as u64).max(Duration::from_millis(20))
    }

    async fn flush_transmit(&mut self) -> Result<(), Error> {
        let now = Instant::now();

        while let Some(front) = self.transmit_queue.front() {
            let size = front.size();

            if !self.congestion.permits(self.flow.in_flight()) {
                break;
            }

            match self.flow.admit(1, size, now) {
                Admission::Granted => {
                    // Checked by the loop condition.
                    let packet = self.transmit_queue.pop_front().unwrap();
                    let seq = packet.packet_sequence_number();
                    let rto = self.rtt.rto();

                    self.send_engine.register(packet.clone(), now, rto);
                    self.timers
                        .schedule(retx_id(seq), TimerKind::Retransmit(seq), rto, now);
                    self.flow.on_sent(size);
                    self.congestion.on_sent(1);

                    self.send_data_packet(packet).await?;
                }
                Admission::WindowFull | Admission::RateLimited => break,
            }
        }

        Ok(())
    }

    async fn send_data_packet(&mut self, mut packet: DataPacket) -> Result<(), Error> {
        // The origin timestamp is part of the packet identity and survives
        // retransmission; only the destination is stamped here.
        packet.header.destination_socket_id = self.peer_socket_id;

        let buf = packet.encode_to_vec()?;
        self.metrics.data_packets_sent.inc();
        self.metrics.data_bytes_sent.add(buf.len() as u64);

        self.socket.send_to(&buf, self.peer_addr).await?;
        Ok(())
    }

    async fn send_control<T>(&mut self, mut packet: T) -> Result<(), Error>
    where
        T: IsPacket,
    {
        let header = packet.header_mut();
        header.timestamp = self.timestamp();
        header.destination_socket_id = self.peer_socket_id;

        let buf = packet.encode_to_vec()?;
        self.metrics.ctrl_packets_sent.inc();
        self.metrics.ctrl_bytes_sent.add(buf.len() as u64);

        self.socket.send_to(&buf, self.peer_addr).await?;
        Ok(())
    }
}

fn retx_id(seq: Sequence) -> String {
    format!("retx-{}", seq)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::{Config, Encryption};
    use crate::Error;

    use super::{Connection, ConnectionState, Listener};

    fn config(encrypted: bool) -> Config {
        Config {
            encryption: if encrypted {
                Encryption::Aes256
            } else {
                Encryption::Off
            },
            passphrase: encrypted.then(|| "my_secret_passphrase".to_owned()),
            playback_delay_ms: 120,
            ..Default::default()
        }
    }

    async fn establish_pair(encrypted: bool) -> (Connection, Connection) {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), config(encrypted)).unwrap();
        let addr = listener.local_addr().unwrap();

        let (caller, listener) = tokio::join!(
            Connection::connect(addr, config(encrypted)),
            listener.accept(),
        );

        (caller.unwrap(), listener.unwrap())
    }

    /// Drives both ends until the receiving side delivered a payload or the budget runs
    /// out.
    async fn pump_until_delivery(tx: &mut Connection, rx: &mut Connection) -> bytes::Bytes {
        for _ in 0..500 {
            tx.drive_once().await.unwrap();
            rx.drive_once().await.unwrap();

            if let Some(data) = rx.try_recv().unwrap() {
                return data;
            }
        }

        panic!("no delivery within the drive budget");
    }

    #[tokio::test]
    async fn test_connect_and_deliver() {
        let (mut caller, mut listener) = establish_pair(false).await;

        assert_eq!(caller.state(), ConnectionState::Established);
        assert_eq!(listener.state(), ConnectionState::Established);
        assert_eq!(caller.latency(), Duration::from_millis(120));
        assert_eq!(listener.latency(), Duration::from_millis(120));
        assert_eq!(caller.peer_socket_id(), listener.local_socket_id());

        caller.send(b"hello srt").unwrap();

        let delivered = pump_until_delivery(&mut caller, &mut listener).await;
        assert_eq!(&delivered[..], b"hello srt");

        // Data made it through exactly once.
        assert_eq!(listener.counters()["recv.messages_completed"], 1);
        assert_eq!(listener.counters()["tsbpd.delivered"], 1);
    }

    #[tokio::test]
    async fn test_encrypted_delivery() {
        let (mut caller, mut listener) = establish_pair(true).await;

        assert!(caller.encryption_enabled());
        assert!(listener.encryption_enabled());

        caller.send(b"top secret payload").unwrap();

        let delivered = pump_until_delivery(&mut caller, &mut listener).await;
        assert_eq!(&delivered[..], b"top secret payload");

        let counters = caller.counters();
        assert_eq!(counters["crypto.packets_encrypted"], 1);
    }

    #[tokio::test]
    async fn test_fragmented_message_reassembled() {
        let (mut caller, mut listener) = establish_pair(false).await;

        // Well above one MSS: must fragment and reassemble.
        let payload: Vec<u8> = (0..40_000u32).map(|n| n as u8).collect();
        caller.send(&payload).unwrap();

        let delivered = pump_until_delivery(&mut caller, &mut listener).await;
        assert_eq!(&delivered[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (mut caller, mut listener) = establish_pair(false).await;

        caller.close().await.unwrap();
        assert_eq!(caller.state(), ConnectionState::Shutdown);
        assert!(matches!(caller.send(b"late"), Err(Error::Closed)));

        // The peer observes the shutdown.
        for _ in 0..100 {
            if listener.drive_once().await.is_err() {
                break;
            }
        }
        assert_eq!(listener.state(), ConnectionState::Shutdown);
        assert!(matches!(listener.try_recv(), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_handshake_timeout_without_listener() {
        // Nothing is listening here; the caller must give up after the deadline.
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            Connection::connect("127.0.0.1:9".parse().unwrap(), config(false)),
        )
        .await
        .expect("connect must finish before the outer timeout");

        assert!(result.is_err());
    }
}
