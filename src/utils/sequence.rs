//! 31-bit packet sequence numbers.
//!
//! Also see https://datatracker.ietf.org/doc/html/rfc1982

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter, LowerHex};
use std::ops::{Add, AddAssign};

use crate::utils::serial;

const BITS: usize = 31;

/// A wrapping 31-bit packet sequence number.
///
/// All arithmetic and comparisons are serial, i.e. wrap-aware: a `Sequence` just past the
/// wrap point compares greater than one just before it. Raw integer comparison must never
/// be used on sequence numbers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Sequence(u32);

impl Sequence {
    /// The highest representable sequence number, `(1 << 31) - 1`.
    pub const MAX: u32 = (1 << BITS) - 1;

    /// Creates a new `Sequence` with the given initial `seq`.
    ///
    /// # Panics
    ///
    /// Panics if the given value exceeds [`Sequence::MAX`].
    #[inline]
    pub const fn new(seq: u32) -> Self {
        assert!(seq <= Self::MAX, "Sequence::new overflow");

        Self(seq)
    }

    /// Returns the current value of the `Sequence`.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the forward distance from `earlier` to `self` in the serial space.
    #[inline]
    pub fn distance(self, earlier: Self) -> u32 {
        serial::sub::<BITS>(self.0, earlier.0)
    }

    /// Advances the `Sequence` by one, returning the value before the increment.
    #[inline]
    pub fn fetch_next(&mut self) -> Self {
        let current = *self;
        self.0 = serial::add::<BITS>(self.0, 1);
        current
    }
}

impl Add<u32> for Sequence {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(serial::add::<BITS>(self.0, rhs))
    }
}

impl AddAssign<u32> for Sequence {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 = serial::add::<BITS>(self.0, rhs);
    }
}

impl PartialEq<u32> for Sequence {
    #[inline]
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd for Sequence {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sequence {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        serial::cmp::<BITS>(self.0, other.0)
    }
}

impl From<Sequence> for u32 {
    #[inline]
    fn from(src: Sequence) -> Self {
        src.0
    }
}

impl From<u32> for Sequence {
    #[inline]
    fn from(src: u32) -> Self {
        Self(src & Self::MAX)
    }
}

impl Display for Sequence {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl LowerHex for Sequence {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::Sequence;

    #[test]
    fn test_sequence_wrap() {
        let mut seq = Sequence::new(Sequence::MAX);
        assert_eq!(seq.fetch_next(), Sequence::MAX);
        assert_eq!(seq.get(), 0);

        assert_eq!(Sequence::new(Sequence::MAX) + 5, Sequence::new(4));
    }

    #[test]
    fn test_sequence_cmp() {
        assert!(Sequence::new(100) > Sequence::new(99));
        assert!(Sequence::new(0) > Sequence::new(Sequence::MAX));
        assert!(Sequence::new(Sequence::MAX) < Sequence::new(10));
    }

    #[test]
    fn test_sequence_distance() {
        assert_eq!(Sequence::new(10).distance(Sequence::new(4)), 6);
        assert_eq!(Sequence::new(3).distance(Sequence::new(Sequence::MAX)), 4);
    }
}
