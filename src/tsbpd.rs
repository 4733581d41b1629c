//! Time-stamp-based packet delivery.
//!
//! Every data packet carries its origin timestamp relative to the sender's session start.
//! The receiver maps that origin time onto its own clock and releases each packet at
//!
//! ```text
//! release = base_wall + (t_pkt - base_timestamp) + drift_correction + playback_delay
//! ```
//!
//! where `base_wall` is the wall time at which the first packet of the session was
//! observed and `base_timestamp` is that packet's timestamp. Packets that miss their
//! release time are dropped in live mode; packets scheduled absurdly far into the future
//! are treated as clock errors and dropped as well.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::metrics::Counter;
use crate::packet::Timestamp;
use crate::utils::sequence::Sequence;

/// Schedules beyond `now + 10 * playback_delay` are treated as clock errors.
const EARLY_GUARD_FACTOR: u32 = 10;

/// Smoothing factor for the moving-average delivery delay.
const DELAY_ALPHA: f64 = 0.125;

/// The outcome of handing a packet to the scheduler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Queued,
    /// The release time already passed; dropped in live mode.
    DroppedLate,
    /// The release time is implausibly far ahead; dropped as a clock error.
    DroppedEarly,
}

/// A copyable snapshot of the delivery statistics.
#[derive(Copy, Clone, Debug, Default)]
pub struct TsbpdStats {
    pub delivered: Counter,
    pub dropped_late: Counter,
    pub dropped_early: Counter,
    pub drift_updates: Counter,
    pub base_resets: Counter,
    /// Moving average of queue-to-delivery delay, in microseconds.
    pub avg_delivery_delay_us: u64,
    pub max_delivery_delay_us: u64,
}

#[derive(Clone, Debug)]
struct Entry {
    release: Instant,
    seq: Sequence,
    data: Bytes,
}

// Order by release time, ties broken by sequence. `BinaryHeap` is a max-heap, so the
// comparison is reversed to pop the earliest release first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .release
            .cmp(&self.release)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.release == other.release && self.seq == other.seq
    }
}

impl Eq for Entry {}

/// The time-based delivery scheduler.
#[derive(Clone, Debug)]
pub struct Tsbpd {
    playback_delay: Duration,
    /// Wall time and packet timestamp of the first observed packet; `None` until the
    /// next packet re-initializes the base.
    base: Option<(Instant, Timestamp)>,
    drift_rate_ppm: f64,
    clock_offset_us: i64,
    /// Drop packets whose release time has passed instead of releasing them late.
    drop_too_late: bool,
    /// Set once a timestamp near the wrap point has been observed; the next small
    /// timestamp then resets the base.
    wrap_pending: bool,
    queue: BinaryHeap<Entry>,
    avg_delay_us: f64,
    stats: TsbpdStats,
}

impl Tsbpd {
    pub fn new(playback_delay: Duration, drop_too_late: bool) -> Self {
        Self {
            playback_delay,
            base: None,
            drift_rate_ppm: 0.0,
            clock_offset_us: 0,
            drop_too_late,
            wrap_pending: false,
            queue: BinaryHeap::new(),
            avg_delay_us: 0.0,
            stats: TsbpdStats::default(),
        }
    }

    /// Schedules a reassembled payload for delivery.
    pub fn insert(
        &mut self,
        seq: Sequence,
        timestamp: Timestamp,
        data: Bytes,
        now: Instant,
    ) -> InsertOutcome {
        if timestamp.is_wrapping() {
            self.wrap_pending = true;
        } else if self.wrap_pending {
            // The timestamp counter wrapped; restart the base from this packet.
            self.reset_base();
            self.wrap_pending = false;
        }

        let (base_wall, base_timestamp) = *self.base.get_or_insert((now, timestamp));

        let release = self.release_wall(base_wall, base_timestamp, timestamp);

        if self.drop_too_late && release < now {
            self.stats.dropped_late.inc();
            tracing::trace!("Dropping late packet {}", seq);
            return InsertOutcome::DroppedLate;
        }

        if release > now + self.playback_delay * EARLY_GUARD_FACTOR {
            self.stats.dropped_early.inc();
            tracing::debug!("Dropping packet {} scheduled implausibly far ahead", seq);
            return InsertOutcome::DroppedEarly;
        }

        self.queue.push(Entry { release, seq, data });
        InsertOutcome::Queued
    }

    /// Releases every packet whose delivery time has come, in delivery-time order.
    pub fn release(&mut self, now: Instant) -> Vec<Bytes> {
        let mut released = Vec::new();

        while let Some(entry) = self.queue.peek() {
            if entry.release > now {
                break;
            }

            let entry = self.queue.pop().unwrap();

            let mapped_arrival = entry
                .release
                .checked_sub(self.playback_delay)
                .unwrap_or(entry.release);
            let delay = now.saturating_duration_since(mapped_arrival).as_micros() as u64;
            self.avg_delay_us = if self.stats.delivered.get() == 0 {
                delay as f64
            } else {
                (1.0 - DELAY_ALPHA) * self.avg_delay_us + DELAY_ALPHA * delay as f64
            };
            self.stats.max_delivery_delay_us = self.stats.max_delivery_delay_us.max(delay);

            self.stats.delivered.inc();
            released.push(entry.data);
        }

        released
    }

    /// The delivery time of the earliest queued packet.
    pub fn next_release(&self) -> Option<Instant> {
        self.queue.peek().map(|entry| entry.release)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Clears the queue and re-initializes the delivery base on the next packet. Used on
    /// timestamp wrap and forced resync.
    pub fn reset_base(&mut self) {
        self.queue.clear();
        self.base = None;
        self.stats.base_resets.inc();
    }

    /// Applies an externally measured clock drift in parts per million plus a fixed
    /// offset in microseconds.
    pub fn set_drift(&mut self, drift_rate_ppm: f64, clock_offset_us: i64) {
        self.drift_rate_ppm = drift_rate_ppm;
        self.clock_offset_us = clock_offset_us;
        self.stats.drift_updates.inc();
    }

    pub fn stats(&self) -> TsbpdStats {
        TsbpdStats {
            avg_delivery_delay_us: self.avg_delay_us as u64,
            ..self.stats
        }
    }

    fn release_wall(
        &self,
        base_wall: Instant,
        base_timestamp: Timestamp,
        timestamp: Timestamp,
    ) -> Instant {
        // The wrapping delta reinterpreted as signed: timestamps before the base map to
        // a negative elapsed time.
        let elapsed_us = timestamp.delta(base_timestamp) as i32 as i64;

        let drift_us = (elapsed_us as f64 * self.drift_rate_ppm * 1e-6) as i64 + self.clock_offset_us;

        let offset_us = elapsed_us + drift_us + self.playback_delay.as_micros() as i64;

        if offset_us >= 0 {
            base_wall + Duration::from_micros(offset_us as u64)
        } else {
            base_wall - Duration::from_micros(offset_us.unsigned_abs())
        }
    }
}
