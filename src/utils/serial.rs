//! Serial Number Arithmetic
//!
//! Also see https://datatracker.ietf.org/doc/html/rfc1982

use std::cmp::Ordering;

/// Adds two serial numbers in the `N`-bit space, wrapping around at `(1 << N) - 1`.
#[inline]
pub fn add<const N: usize>(mut lhs: u32, mut rhs: u32) -> u32 {
    let max = (1 << N) - 1;

    lhs &= max;
    rhs &= max;

    (lhs + rhs) & max
}

/// Subtracts `rhs` from `lhs` in the `N`-bit space, wrapping around at zero.
///
/// The result is the forward distance from `rhs` to `lhs`.
#[inline]
pub fn sub<const N: usize>(mut lhs: u32, mut rhs: u32) -> u32 {
    let max = (1 << N) - 1;

    lhs &= max;
    rhs &= max;

    lhs.wrapping_sub(rhs) & max
}

/// Compares two serial numbers in the `N`-bit space.
///
/// `lhs` is considered greater than `rhs` if the forward distance from `rhs` to `lhs` is
/// less than half of the serial space. Comparing two numbers exactly half the space apart
/// is undefined by RFC 1982; this implementation resolves it towards [`Ordering::Less`].
pub fn cmp<const N: usize>(lhs: u32, rhs: u32) -> Ordering {
    if lhs == rhs {
        return Ordering::Equal;
    }

    let half = 1 << (N - 1);

    if sub::<N>(lhs, rhs) < half {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}
