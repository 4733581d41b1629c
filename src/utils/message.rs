//! 26-bit message numbers.
//!
//! Also see https://datatracker.ietf.org/doc/html/rfc1982

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::ops::{Add, AddAssign};

use crate::utils::serial;

const BITS: usize = 26;

/// A wrapping 26-bit message number shared by all packets of one user-level message.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MessageNumber(u32);

impl MessageNumber {
    /// The highest representable message number, `(1 << 26) - 1`.
    pub const MAX: u32 = (1 << BITS) - 1;

    /// Creates a new `MessageNumber` with the given initial value.
    ///
    /// # Panics
    ///
    /// Panics if the given value exceeds [`MessageNumber::MAX`].
    #[inline]
    pub const fn new(num: u32) -> Self {
        assert!(num <= Self::MAX, "MessageNumber::new overflow");

        Self(num)
    }

    /// Returns the current value as a `u32`.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Advances the `MessageNumber` by one, returning the value before the increment.
    #[inline]
    pub fn fetch_next(&mut self) -> Self {
        let current = *self;
        self.0 = serial::add::<BITS>(self.0, 1);
        current
    }
}

impl Add<u32> for MessageNumber {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(serial::add::<BITS>(self.0, rhs))
    }
}

impl AddAssign<u32> for MessageNumber {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 = serial::add::<BITS>(self.0, rhs);
    }
}

impl PartialOrd for MessageNumber {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MessageNumber {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        serial::cmp::<BITS>(self.0, other.0)
    }
}

impl From<MessageNumber> for u32 {
    #[inline]
    fn from(src: MessageNumber) -> Self {
        src.0
    }
}

impl From<u32> for MessageNumber {
    #[inline]
    fn from(src: u32) -> Self {
        Self(src & Self::MAX)
    }
}

impl Display for MessageNumber {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::MessageNumber;

    #[test]
    fn test_message_number_wrap() {
        let mut num = MessageNumber::new(MessageNumber::MAX);
        num.fetch_next();
        assert_eq!(num.get(), 0);
    }
}
