//! Wire encoding primitives.
//!
//! All multi-byte integers on the wire are big-endian.

use std::io::{self, Write};
use std::mem;
use std::ops::Range;

use bytes::Buf;

/// A type that can be decoded from a byte buffer.
pub trait Decode: Sized {
    type Error;

    fn decode<B>(buf: &mut B) -> Result<Self, Self::Error>
    where
        B: Buf;
}

/// A type that can be encoded into a byte stream.
pub trait Encode {
    type Error;

    fn encode<W>(&self, writer: W) -> Result<(), Self::Error>
    where
        W: Write;

    fn encode_to_vec(&self) -> Result<Vec<u8>, Self::Error> {
        let mut buf = Vec::with_capacity(self.size_hint());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Returns a hint about the number of bytes `self` requires for encoding. The returned
    /// value is purely a hint and not a guarantee.
    #[inline]
    fn size_hint(&self) -> usize {
        0
    }
}

macro_rules! impl_uint_be {
    ($($t:ty),*$(,)?) => {
        $(
            impl Encode for $t {
                type Error = io::Error;

                fn encode<W>(&self, mut writer: W) -> Result<(), Self::Error>
                where
                    W: Write,
                {
                    writer.write_all(&self.to_be_bytes())
                }

                #[inline]
                fn size_hint(&self) -> usize {
                    mem::size_of::<Self>()
                }
            }

            impl Decode for $t {
                type Error = io::Error;

                fn decode<B>(buf: &mut B) -> Result<Self, Self::Error>
                where
                    B: Buf,
                {
                    if buf.remaining() < mem::size_of::<Self>() {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }

                    let mut bytes = [0; mem::size_of::<Self>()];
                    buf.copy_to_slice(&mut bytes);
                    Ok(Self::from_be_bytes(bytes))
                }
            }
        )*
    };
}

impl_uint_be! {
    u8,
    u16,
    u32,
    u64,
    u128,
}

/// A transparent wrapper around a `u32` used to directly manipulate bit ranges.
///
/// Bit indices count from the most significant bit: `bits(0..1)` reads the MSB,
/// `bits(31..32)` the LSB. This matches the left-to-right field order of wire diagrams.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Bits(pub u32);

impl Bits {
    /// Returns the value of the given bit range, shifted down to the low bits.
    pub fn bits<R>(&self, range: R) -> u32
    where
        R: IntoBitRange,
    {
        let range = range.into_bit_range();

        let num = range.len();
        let start = u32::BITS as usize - range.end;

        let mask = (((1u64 << num) - 1) as u32) << start;

        (self.0 & mask) >> start
    }

    /// Overwrites the given bit range with `val`.
    ///
    /// Bits of `val` above the range width are discarded.
    pub fn set_bits<R>(&mut self, range: R, val: u32)
    where
        R: IntoBitRange,
    {
        let range = range.into_bit_range();

        let num = range.len();
        let start = u32::BITS as usize - range.end;

        let mask = (((1u64 << num) - 1) as u32) << start;

        self.0 = (self.0 & !mask) | ((val << start) & mask);
    }
}

impl Encode for Bits {
    type Error = io::Error;

    #[inline]
    fn encode<W>(&self, writer: W) -> Result<(), Self::Error>
    where
        W: Write,
    {
        self.0.encode(writer)
    }

    #[inline]
    fn size_hint(&self) -> usize {
        Encode::size_hint(&self.0)
    }
}

impl Decode for Bits {
    type Error = io::Error;

    #[inline]
    fn decode<B>(buf: &mut B) -> Result<Self, Self::Error>
    where
        B: Buf,
    {
        Ok(Self(u32::decode(buf)?))
    }
}

pub trait IntoBitRange {
    fn into_bit_range(self) -> Range<usize>;
}

impl IntoBitRange for Range<usize> {
    #[inline]
    fn into_bit_range(self) -> Range<usize> {
        self
    }
}

impl IntoBitRange for usize {
    #[inline]
    fn into_bit_range(self) -> Range<usize> {
        self..self + 1
    }
}

#[cfg(test)]
mod tests {
    use super::{Bits, Decode, Encode};

    #[test]
    fn test_bits_read() {
        let bits = Bits(0x8000_0000);
        assert_eq!(bits.bits(0..1), 1);
        assert_eq!(bits.bits(1..32), 0);

        let bits = Bits(0x7FFF_FFFF);
        assert_eq!(bits.bits(0..1), 0);
        assert_eq!(bits.bits(1..32), 0x7FFF_FFFF);

        let bits = Bits(2147876864);
        assert_eq!(bits.bits(0..1), 1);
        assert_eq!(bits.bits(1..8), 0);
        assert_eq!(bits.bits(8..16), 6);
        assert_eq!(bits.bits(16..32), 0);
    }

    #[test]
    fn test_bits_write() {
        let mut bits = Bits(0);
        bits.set_bits(0..1, 1);
        assert_eq!(bits.0, 0x8000_0000);

        bits.set_bits(30..32, 0b11);
        assert_eq!(bits.0, 0x8000_0003);

        bits.set_bits(0..1, 0);
        assert_eq!(bits.0, 0b11);

        // Excess bits of the value are discarded.
        let mut bits = Bits(0);
        bits.set_bits(30..32, 0b111);
        assert_eq!(bits.0, 0b11);

        let mut bits = Bits(0);
        bits.set_bits(0..32, u32::MAX);
        assert_eq!(bits.0, u32::MAX);
    }

    #[test]
    fn test_uint_roundtrip() {
        let buf = 0xDEAD_BEEFu32.encode_to_vec().unwrap();
        assert_eq!(buf, [0xDE, 0xAD, 0xBE, 0xEF]);

        let mut slice = &buf[..];
        assert_eq!(u32::decode(&mut slice).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_uint_short_input() {
        let mut slice = &[0u8, 1][..];
        assert!(u32::decode(&mut slice).is_err());
    }
}
