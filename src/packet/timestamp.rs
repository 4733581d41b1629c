//! Packet timestamps.

use std::cmp::Ordering;
use std::io::Write;
use std::time::Duration;

use bytes::Buf;

use crate::proto::{Decode, Encode};

/// A 32-bit packet timestamp in microseconds since the session origin.
///
/// The timestamp wraps around roughly every 01:11:35 hours. Comparisons are wrap-aware:
/// a timestamp just past the wrap point compares greater than one just before it. Receivers
/// reset their delivery base when a wrap is observed, see
/// [`Tsbpd::reset_base`](crate::tsbpd::Tsbpd::reset_base).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Timestamp {
    micros: u32,
}

impl Timestamp {
    /// Creates a new `Timestamp` from the number of `micros` since the session origin.
    #[inline]
    pub const fn from_micros(micros: u32) -> Self {
        Self { micros }
    }

    /// Creates a new `Timestamp` from a [`Duration`] since the session origin.
    ///
    /// Durations longer than the 32-bit microsecond range wrap, matching the on-wire
    /// behavior of a long-lived session.
    #[inline]
    pub const fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as u32,
        }
    }

    /// Returns the `Timestamp` as microseconds since the session origin.
    #[inline]
    pub const fn as_micros(self) -> u32 {
        self.micros
    }

    /// Returns the wrapping forward distance from `earlier` to `self` in microseconds.
    #[inline]
    pub const fn delta(self, earlier: Self) -> u32 {
        self.micros.wrapping_sub(earlier.micros)
    }

    /// Returns `true` if `self` is earlier than `other` by more than half the timestamp
    /// range, i.e. the pair straddles a wrap point.
    #[inline]
    pub const fn wrapped_since(self, other: Self) -> bool {
        other.micros.wrapping_sub(self.micros) > u32::MAX / 2
    }

    /// Returns `true` if the timestamp is within the 30 second window before the wrap
    /// point.
    #[inline]
    pub fn is_wrapping(self) -> bool {
        const WRAP_PERIOD: u32 = u32::MAX - Duration::from_secs(30).as_micros() as u32;

        self.micros >= WRAP_PERIOD
    }
}

impl PartialOrd for Timestamp {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.micros == other.micros {
            Ordering::Equal
        } else if other.micros.wrapping_sub(self.micros) > u32::MAX / 2 {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }
}

impl From<Duration> for Timestamp {
    #[inline]
    fn from(src: Duration) -> Self {
        Self::from_duration(src)
    }
}

impl Encode for Timestamp {
    type Error = <u32 as Encode>::Error;

    #[inline]
    fn encode<W>(&self, writer: W) -> Result<(), Self::Error>
    where
        W: Write,
    {
        self.micros.encode(writer)
    }

    #[inline]
    fn size_hint(&self) -> usize {
        4
    }
}

impl Decode for Timestamp {
    type Error = <u32 as Decode>::Error;

    #[inline]
    fn decode<B>(buf: &mut B) -> Result<Self, Self::Error>
    where
        B: Buf,
    {
        Ok(Self {
            micros: u32::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Timestamp;

    #[test]
    fn test_timestamp_cmp() {
        assert!(Timestamp::from_micros(10) < Timestamp::from_micros(20));

        // Across the wrap point.
        let before = Timestamp::from_micros(u32::MAX - 5);
        let after = Timestamp::from_micros(3);
        assert!(before < after);
        assert_eq!(after.delta(before), 9);
    }
}
