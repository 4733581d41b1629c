//! Connection statistics primitives.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// A monotone non-decreasing counter.
///
/// All connection state is owned by a single reactor, so counters are plain values;
/// statistics are exposed to the application by copy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Counter(u64);

impl Counter {
    /// Creates a new `Counter` initialized to `0`.
    #[inline]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Adds `n` to the `Counter`.
    #[inline]
    pub fn add(&mut self, n: u64) {
        self.0 += n;
    }

    /// Increments the `Counter` by `1`.
    #[inline]
    pub fn inc(&mut self) {
        self.add(1);
    }

    /// Returns the current value of the `Counter`.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for Counter {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A flat snapshot of counters, keyed by documented names.
pub type Snapshot = BTreeMap<&'static str, u64>;

/// Per-connection packet and byte counts.
#[derive(Copy, Clone, Debug, Default)]
pub struct ConnectionMetrics {
    pub data_packets_sent: Counter,
    pub data_packets_recv: Counter,
    pub data_bytes_sent: Counter,
    pub data_bytes_recv: Counter,
    pub ctrl_packets_sent: Counter,
    pub ctrl_packets_recv: Counter,
    pub ctrl_bytes_sent: Counter,
    pub ctrl_bytes_recv: Counter,
    /// Packets that arrived in a state that does not expect them.
    pub protocol_violations: Counter,
    /// Datagrams that failed to decode.
    pub decode_errors: Counter,
    /// Packets dropped because the payload could not be decrypted.
    pub crypto_drops: Counter,
}

impl ConnectionMetrics {
    pub const fn new() -> Self {
        Self {
            data_packets_sent: Counter::new(),
            data_packets_recv: Counter::new(),
            data_bytes_sent: Counter::new(),
            data_bytes_recv: Counter::new(),
            ctrl_packets_sent: Counter::new(),
            ctrl_packets_recv: Counter::new(),
            ctrl_bytes_sent: Counter::new(),
            ctrl_bytes_recv: Counter::new(),
            protocol_violations: Counter::new(),
            decode_errors: Counter::new(),
            crypto_drops: Counter::new(),
        }
    }

    pub fn fill(&self, snapshot: &mut Snapshot) {
        snapshot.insert("conn.data_packets_sent", self.data_packets_sent.get());
        snapshot.insert("conn.data_packets_recv", self.data_packets_recv.get());
        snapshot.insert("conn.data_bytes_sent", self.data_bytes_sent.get());
        snapshot.insert("conn.data_bytes_recv", self.data_bytes_recv.get());
        snapshot.insert("conn.ctrl_packets_sent", self.ctrl_packets_sent.get());
        snapshot.insert("conn.ctrl_packets_recv", self.ctrl_packets_recv.get());
        snapshot.insert("conn.ctrl_bytes_sent", self.ctrl_bytes_sent.get());
        snapshot.insert("conn.ctrl_bytes_recv", self.ctrl_bytes_recv.get());
        snapshot.insert("conn.protocol_violations", self.protocol_violations.get());
        snapshot.insert("conn.decode_errors", self.decode_errors.get());
        snapshot.insert("conn.crypto_drops", self.crypto_drops.get());
    }
}
