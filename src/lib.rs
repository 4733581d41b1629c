//! Secure Reliable Transport (SRT) over UDP.
//!
//! https://datatracker.ietf.org/doc/html/draft-sharabayko-srt-01
//!
//! This crate implements a single SRT connection: the Caller-Listener handshake with
//! extension negotiation, AES-CTR payload encryption with rotating session keys, reliable
//! delivery through selective retransmission driven by ACK/NAK feedback, and time-based
//! packet delivery (TSBPD) that releases payloads a fixed playback delay after their
//! origin time.
//!
//! Each [`Connection`] is a single-task reactor that exclusively owns its UDP socket and
//! protocol state; independent connections can run on independent tasks. The application
//! talks to the reactor through [`Connection::send`], [`Connection::recv`] and
//! [`Connection::close`].
//!
//! ```no_run
//! use srt_transport::{Config, Connection, Listener};
//!
//! # async fn demo() -> Result<(), srt_transport::Error> {
//! let listener = Listener::bind("0.0.0.0:7000".parse().unwrap(), Config::default())?;
//! let mut incoming = listener.accept().await?;
//!
//! while let Ok(payload) = incoming.recv().await {
//!     println!("{} bytes", payload.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod congestion;
pub mod connection;
pub mod crypto;
pub mod flow;
pub mod handshake;
pub mod metrics;
pub mod packet;
pub mod proto;
pub mod receiver;
pub mod rtt;
pub mod sender;
pub mod socket;
pub mod timer;
pub mod tsbpd;
pub mod utils;

use std::io;

pub use crate::config::{Config, ConfigError, Encryption};
pub use crate::connection::{Connection, ConnectionState, Event, Listener, Role};
pub use crate::crypto::CryptoError;
pub use crate::handshake::HandshakeError;
pub use crate::packet::DecodeError;
pub use crate::utils::message::MessageNumber;
pub use crate::utils::sequence::Sequence;

/// Every failure surfaced by this crate.
///
/// Transient per-packet problems (decode and crypto failures on arriving datagrams) are
/// absorbed and counted by the connection; only stateful failures reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    /// Flow or congestion control refuse more data right now; retry after driving the
    /// connection.
    #[error("operation would block")]
    WouldBlock,
    /// The connection is shut down.
    #[error("connection closed")]
    Closed,
}
