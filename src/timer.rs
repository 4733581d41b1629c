//! Named one-shot timers.
//!
//! The timer set holds typed, named timers for the reactor: retransmissions, keep-alives,
//! ACK/NAK emission and handshake retries. Timers carry a tagged [`TimerKind`] instead of
//! callbacks, so all state mutation stays with the orchestrator dispatching the expirations.

use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::handshake::HandshakeStage;
use crate::utils::sequence::Sequence;

/// What to do when a timer fires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// Retransmit the packet at the given sequence unless acknowledged by now.
    Retransmit(Sequence),
    /// Probe the peer for liveness.
    KeepAlive,
    /// Emit a periodic cumulative ACK.
    Ack,
    /// Re-emit NAKs for sequences still missing.
    Nak,
    /// Retry or abort a handshake phase.
    Handshake(HandshakeStage),
}

/// An expired timer handed to the orchestrator by [`TimerSet::tick`].
#[derive(Clone, Debug)]
pub struct Expired {
    pub id: String,
    pub kind: TimerKind,
}

/// A collection of named one-shot timers.
///
/// Each timer fires exactly once per schedule; re-scheduling an id replaces its deadline.
/// Cancellation is idempotent.
#[derive(Clone, Debug, Default)]
pub struct TimerSet {
    entries: AHashMap<String, (TimerKind, Instant)>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self {
            entries: AHashMap::new(),
        }
    }

    /// Arms the timer `id` to fire `timeout` from `now`.
    pub fn schedule<I>(&mut self, id: I, kind: TimerKind, timeout: Duration, now: Instant)
    where
        I: Into<String>,
    {
        self.entries.insert(id.into(), (kind, now + timeout));
    }

    /// Disarms the timer `id`. Returns `true` if it was armed.
    pub fn cancel(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Disarms all timers.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Removes and returns all timers with a deadline at or before `now`, ordered by
    /// deadline.
    pub fn tick(&mut self, now: Instant) -> Vec<Expired> {
        let mut expired: Vec<(String, TimerKind, Instant)> = Vec::new();

        self.entries.retain(|id, (kind, deadline)| {
            if *deadline <= now {
                expired.push((id.clone(), kind.clone(), *deadline));
                false
            } else {
                true
            }
        });

        expired.sort_by_key(|(_, _, deadline)| *deadline);

        expired
            .into_iter()
            .map(|(id, kind, _)| Expired { id, kind })
            .collect()
    }

    /// Time until the earliest armed timer fires, zero if one is already overdue. `None`
    /// when no timer is armed.
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.entries
            .values()
            .map(|(_, deadline)| deadline.saturating_duration_since(now))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::utils::sequence::Sequence;

    use super::{TimerKind, TimerSet};

    #[test]
    fn test_fires_exactly_once() {
        let now = Instant::now();
        let mut timers = TimerSet::new();

        timers.schedule(
            "retx-5",
            TimerKind::Retransmit(Sequence::new(5)),
            Duration::from_millis(10),
            now,
        );

        assert!(timers.tick(now).is_empty());

        let expired = timers.tick(now + Duration::from_millis(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].kind, TimerKind::Retransmit(Sequence::new(5)));

        assert!(timers.tick(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_expirations_ordered_by_deadline() {
        let now = Instant::now();
        let mut timers = TimerSet::new();

        timers.schedule("ack", TimerKind::Ack, Duration::from_millis(30), now);
        timers.schedule("keepalive", TimerKind::KeepAlive, Duration::from_millis(10), now);
        timers.schedule("nak", TimerKind::Nak, Duration::from_millis(20), now);

        let expired = timers.tick(now + Duration::from_millis(50));
        let kinds: Vec<_> = expired.into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            [TimerKind::KeepAlive, TimerKind::Nak, TimerKind::Ack]
        );
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let now = Instant::now();
        let mut timers = TimerSet::new();

        timers.schedule("ack", TimerKind::Ack, Duration::from_millis(5), now);
        assert!(timers.cancel("ack"));
        assert!(!timers.cancel("ack"));

        assert!(timers.tick(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_reschedule_replaces_deadline() {
        let now = Instant::now();
        let mut timers = TimerSet::new();

        timers.schedule("ack", TimerKind::Ack, Duration::from_millis(5), now);
        timers.schedule("ack", TimerKind::Ack, Duration::from_millis(50), now);

        assert!(timers.tick(now + Duration::from_millis(10)).is_empty());
        assert_eq!(timers.tick(now + Duration::from_millis(50)).len(), 1);
    }

    #[test]
    fn test_time_until_next() {
        let now = Instant::now();
        let mut timers = TimerSet::new();

        assert_eq!(timers.time_until_next(now), None);

        timers.schedule("ack", TimerKind::Ack, Duration::from_millis(40), now);
        timers.schedule("nak", TimerKind::Nak, Duration::from_millis(20), now);

        assert_eq!(
            timers.time_until_next(now),
            Some(Duration::from_millis(20))
        );
        assert_eq!(
            timers.time_until_next(now + Duration::from_millis(30)),
            Some(Duration::ZERO)
        );
    }
}
