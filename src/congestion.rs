//! AIMD congestion control with slow start.
//!
//! The congestion window is real-valued and counted in packets. Slow start grows the
//! window by one packet per ACK until `ssthresh` is reached; congestion avoidance grows it
//! by `1/cwnd`. A loss event halves `ssthresh` and multiplies the window by 0.875 - the
//! classic halving is deliberately not used, live streams recover badly from it.

use std::time::Instant;

use crate::metrics::Counter;
use crate::rtt::NetworkCondition;

const INITIAL_CWND: f64 = 2.0;
const DECREASE_FACTOR: f64 = 0.875;

/// A copyable snapshot of the congestion state.
#[derive(Copy, Clone, Debug, Default)]
pub struct CongestionStats {
    pub acks_processed: Counter,
    pub loss_events: Counter,
    pub packets_sent: u64,
    pub packets_lost: u64,
}

#[derive(Clone, Debug)]
pub struct CongestionControl {
    cwnd: f64,
    ssthresh: f64,
    in_slow_start: bool,
    sent: u64,
    lost: u64,
    last_loss: Option<Instant>,
    mss: usize,
    min_rate_bps: u64,
    max_rate_bps: u64,
    stats: CongestionStats,
}

impl CongestionControl {
    pub fn new(mss: usize, min_rate_bps: u64, max_rate_bps: u64) -> Self {
        Self {
            cwnd: INITIAL_CWND,
            ssthresh: 65_536.0 / 1_500.0,
            in_slow_start: true,
            sent: 0,
            lost: 0,
            last_loss: None,
            mss,
            min_rate_bps,
            max_rate_bps,
            stats: CongestionStats::default(),
        }
    }

    /// The congestion window in packets.
    #[inline]
    pub fn window(&self) -> f64 {
        self.cwnd
    }

    #[inline]
    pub fn in_slow_start(&self) -> bool {
        self.in_slow_start
    }

    /// The slow start threshold in packets.
    #[inline]
    pub fn ssthresh(&self) -> f64 {
        self.ssthresh
    }

    /// Returns `true` if another packet may enter the network.
    #[inline]
    pub fn permits(&self, in_flight: u32) -> bool {
        (in_flight as f64) < self.cwnd
    }

    /// Grows the window in reaction to a cumulative ACK that made progress.
    pub fn on_ack(&mut self) {
        if self.in_slow_start {
            self.cwnd += 1.0;
            if self.cwnd >= self.ssthresh {
                self.in_slow_start = false;
                tracing::debug!("Leaving slow start with cwnd {:.1}", self.cwnd);
            }
        } else {
            self.cwnd += 1.0 / self.cwnd;
        }

        self.stats.acks_processed.inc();
    }

    /// Reacts to a loss event covering `packets` lost packets.
    ///
    /// Any NAK or retransmission timeout is one loss event regardless of how many
    /// sequences it reports.
    pub fn on_loss(&mut self, packets: u64, now: Instant) {
        self.in_slow_start = false;
        self.ssthresh = self.cwnd / 2.0;
        self.cwnd = (self.cwnd * DECREASE_FACTOR).max(1.0);

        self.lost += packets;
        self.last_loss = Some(now);
        self.stats.loss_events.inc();

        tracing::trace!(
            "Loss event ({} packets), cwnd {:.3}, ssthresh {:.3}",
            packets,
            self.cwnd,
            self.ssthresh
        );
    }

    pub fn on_sent(&mut self, packets: u64) {
        self.sent += packets;
    }

    /// The pacing rate implied by the current window and smoothed RTT, in bits per
    /// second, clamped to the configured bounds.
    pub fn sending_rate_bps(&self, srtt_us: f64) -> u64 {
        let rate = self.cwnd * self.mss as f64 * 8.0 * 1_000_000.0 / srtt_us.max(1_000.0);

        (rate as u64).clamp(self.min_rate_bps, self.max_rate_bps)
    }

    /// Fraction of sent packets reported lost.
    pub fn loss_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.lost as f64 / self.sent as f64
        }
    }

    /// Labels the connection from the loss rate alone. Surfaced for observability; window
    /// sizing takes its adaptive input from the RTT estimator.
    pub fn condition(&self) -> NetworkCondition {
        let loss = self.loss_rate();

        if loss < 0.01 {
            NetworkCondition::Excellent
        } else if loss < 0.05 {
            NetworkCondition::Good
        } else if loss < 0.10 {
            NetworkCondition::Fair
        } else {
            NetworkCondition::Poor
        }
    }

    pub fn stats(&self) -> CongestionStats {
        CongestionStats {
            packets_sent: self.sent,
            packets_lost: self.lost,
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use crate::rtt::NetworkCondition;

    use super::CongestionControl;

    fn control() -> CongestionControl {
        CongestionControl::new(1500, 80_000, 800_000_000)
    }

    #[test]
    fn test_slow_start_then_loss() {
        let mut cc = control();
        assert!(cc.in_slow_start());
        assert_eq!(cc.window(), 2.0);

        for _ in 0..5 {
            cc.on_ack();
        }
        assert!(cc.in_slow_start());
        assert_eq!(cc.window(), 7.0);

        cc.on_sent(10);
        cc.on_loss(2, Instant::now());
        assert!(!cc.in_slow_start());
        assert_eq!(cc.stats().packets_lost, 2);
        assert!((cc.ssthresh() - 3.5).abs() < 1e-9);
        assert!((cc.window() - 6.125).abs() < 1e-9);
    }

    #[test]
    fn test_congestion_avoidance_growth() {
        let mut cc = control();
        cc.on_loss(1, Instant::now());
        assert!(!cc.in_slow_start());

        let before = cc.window();
        cc.on_ack();
        assert!((cc.window() - (before + 1.0 / before)).abs() < 1e-9);
    }

    #[test]
    fn test_slow_start_exit_at_ssthresh() {
        let mut cc = control();
        // ssthresh is about 43.7; 42 ACKs push the window past it.
        for _ in 0..42 {
            cc.on_ack();
        }
        assert!(!cc.in_slow_start());
    }

    #[test]
    fn test_sending_rate_clamped() {
        let cc = control();
        // cwnd 2 at 100ms RTT: 2 * 1500 * 8 / 0.1s = 240 kbit/s.
        assert_eq!(cc.sending_rate_bps(100_000.0), 240_000);

        // An absurd RTT floors at min_rate.
        assert_eq!(cc.sending_rate_bps(1e12), 80_000);
    }

    #[test]
    fn test_loss_rate_condition() {
        let mut cc = control();
        cc.on_sent(100);
        assert_eq!(cc.condition(), NetworkCondition::Excellent);

        cc.on_loss(7, Instant::now());
        assert_eq!(cc.condition(), NetworkCondition::Fair);

        cc.on_loss(20, Instant::now());
        assert_eq!(cc.condition(), NetworkCondition::Poor);
    }
}
