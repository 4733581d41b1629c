//! Round-trip time estimation.
//!
//! Standard RFC 6298 smoothing: `SRTT` and `RTTVAR` with alpha 0.125 and beta 0.25, and
//! `RTO = SRTT + max(1 ms, 4 * RTTVAR)` clamped to the configured bounds.

use std::collections::VecDeque;
use std::time::Duration;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;

/// Number of samples kept for jitter computation.
const HISTORY: usize = 100;

/// Window multipliers per network condition.
const WINDOW_FACTORS: [(NetworkCondition, f64); 5] = [
    (NetworkCondition::Excellent, 1.5),
    (NetworkCondition::Good, 1.2),
    (NetworkCondition::Fair, 1.0),
    (NetworkCondition::Poor, 0.8),
    (NetworkCondition::Terrible, 0.5),
];

/// A coarse label of the observed network quality.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NetworkCondition {
    /// No samples yet.
    Unknown,
    Excellent,
    Good,
    Fair,
    Poor,
    Terrible,
}

/// A copyable snapshot of the estimator state, all values in microseconds.
#[derive(Copy, Clone, Debug, Default)]
pub struct RttStats {
    pub current_us: u64,
    pub smoothed_us: u64,
    pub variation_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub samples: u64,
}

/// The RFC 6298 RTT estimator with jitter tracking.
#[derive(Clone, Debug)]
pub struct RttEstimator {
    current: f64,
    srtt: f64,
    rttvar: f64,
    min: f64,
    max: f64,
    history: VecDeque<f64>,
    samples: u64,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(min_rto: Duration, max_rto: Duration) -> Self {
        Self {
            current: 0.0,
            srtt: 0.0,
            rttvar: 0.0,
            min: 0.0,
            max: 0.0,
            history: VecDeque::with_capacity(HISTORY),
            samples: 0,
            min_rto,
            max_rto,
        }
    }

    /// Feeds a new RTT sample in microseconds.
    pub fn update(&mut self, rtt_us: u64) {
        let rtt = rtt_us as f64;
        self.current = rtt;

        if self.samples == 0 {
            self.srtt = rtt;
            self.rttvar = rtt / 2.0;
            self.min = rtt;
            self.max = rtt;
        } else {
            self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (self.srtt - rtt).abs();
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
            self.min = self.min.min(rtt);
            self.max = self.max.max(rtt);
        }

        if self.history.len() == HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(rtt);
        self.samples += 1;
    }

    /// Smoothed RTT in microseconds.
    #[inline]
    pub fn srtt_us(&self) -> f64 {
        self.srtt
    }

    /// The retransmission timeout derived from the current estimate.
    ///
    /// Always within the configured `[min_rto, max_rto]` bounds. Before the first sample
    /// the conservative one second initial RTO of RFC 6298 applies.
    pub fn rto(&self) -> Duration {
        if self.samples == 0 {
            return Duration::from_secs(1).clamp(self.min_rto, self.max_rto);
        }

        let rto_us = self.srtt + (4.0 * self.rttvar).max(1_000.0);

        Duration::from_micros(rto_us as u64).clamp(self.min_rto, self.max_rto)
    }

    /// Mean absolute difference of successive RTT samples, in microseconds.
    pub fn jitter_us(&self) -> f64 {
        if self.history.len() < 2 {
            return 0.0;
        }

        let deltas: f64 = self
            .history
            .iter()
            .zip(self.history.iter().skip(1))
            .map(|(a, b)| (a - b).abs())
            .sum();

        deltas / (self.history.len() - 1) as f64
    }

    /// `RTTVAR` relative to `SRTT`.
    pub fn variability(&self) -> f64 {
        if self.srtt > 0.0 {
            self.rttvar / self.srtt
        } else {
            0.0
        }
    }

    /// Labels the network condition from smoothed RTT, jitter and variability.
    pub fn condition(&self) -> NetworkCondition {
        if self.samples == 0 {
            return NetworkCondition::Unknown;
        }

        let srtt_ms = self.srtt / 1_000.0;
        let jitter_ms = self.jitter_us() / 1_000.0;
        let variability = self.variability();

        if srtt_ms < 20.0 && jitter_ms < 2.0 && variability < 0.1 {
            NetworkCondition::Excellent
        } else if srtt_ms < 50.0 && jitter_ms < 5.0 && variability < 0.2 {
            NetworkCondition::Good
        } else if srtt_ms < 100.0 && jitter_ms < 10.0 && variability < 0.3 {
            NetworkCondition::Fair
        } else if srtt_ms < 200.0 && jitter_ms < 20.0 && variability < 0.5 {
            NetworkCondition::Poor
        } else {
            NetworkCondition::Terrible
        }
    }

    /// A 0 to 100 score of how steady the link is. Defaults to 50 until ten samples
    /// have been observed.
    pub fn stability_score(&self) -> f64 {
        if self.samples < 10 {
            return 50.0;
        }

        let jitter_score = (100.0 - self.jitter_us() / 1_000.0 * 10.0).max(0.0);
        let variability_score = (100.0 - self.variability() * 200.0).max(0.0);

        (jitter_score + variability_score) / 2.0
    }

    /// Suggests a send window in packets from the bandwidth-delay product, scaled by the
    /// network condition and clamped to `[1, 65536]`.
    pub fn suggested_window(&self, bandwidth_bps: u64) -> u32 {
        let bdp_packets = bandwidth_bps as f64 * self.srtt / (8.0 * 1500.0 * 1_000_000.0);

        let factor = WINDOW_FACTORS
            .iter()
            .find(|(condition, _)| *condition == self.condition())
            .map(|(_, factor)| *factor)
            .unwrap_or(1.0);

        ((bdp_packets * factor) as u32).clamp(1, 65_536)
    }

    pub fn stats(&self) -> RttStats {
        RttStats {
            current_us: self.current as u64,
            smoothed_us: self.srtt as u64,
            variation_us: self.rttvar as u64,
            min_us: self.min as u64,
            max_us: self.max as u64,
            samples: self.samples,
        }
    }
}
