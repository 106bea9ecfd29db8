// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Packed element access.
//!
//! Every element of a data section or a primitive list lives at some bit offset inside a
//! segment. Elements never straddle a word boundary: whole-byte values are aligned to their
//! own width, and single bits trivially fit. So all reads and writes below work on one word.

use crate::private::endian::WireValue;
use crate::private::layout::ElementSize;
use crate::private::units::*;
use crate::Word;

/// A value that can be stored in a data section field or as a primitive list element.
pub trait PrimitiveElement: Copy + Default {
    const ELEMENT_SIZE: ElementSize;

    /// Width of one element in bits.
    const BITS: BitCount32;

    /// Reads the element that starts `bit` bits into `word`. `bit` is less than 64.
    fn get_from_word(word: &Word, bit: BitCount32) -> Self;

    /// Writes the element that starts `bit` bits into `word`, leaving all other bits alone.
    fn set_in_word(word: &mut Word, bit: BitCount32, value: Self);
}

macro_rules! primitive_impl(
    ($typ:ty, $size:ident) => (
        impl PrimitiveElement for $typ {
            const ELEMENT_SIZE: ElementSize = ElementSize::$size;
            const BITS: BitCount32 = (WireValue::<$typ>::WIDTH * BITS_PER_BYTE) as BitCount32;

            #[inline]
            fn get_from_word(word: &Word, bit: BitCount32) -> $typ {
                let start = (bit as usize) / BITS_PER_BYTE;
                match word.as_bytes().get(start..start + WireValue::<$typ>::WIDTH) {
                    Some(bytes) => WireValue::<$typ>::load(bytes).get(),
                    None => <$typ>::default(),
                }
            }

            #[inline]
            fn set_in_word(word: &mut Word, bit: BitCount32, value: $typ) {
                let start = (bit as usize) / BITS_PER_BYTE;
                match word.as_bytes_mut().get_mut(start..start + WireValue::<$typ>::WIDTH) {
                    Some(bytes) => WireValue::new(value).store(bytes),
                    None => debug_assert!(false, "misaligned element at bit {}", bit),
                }
            }
        }
        );
    );

primitive_impl!(u8, Byte);
primitive_impl!(i8, Byte);
primitive_impl!(u16, TwoBytes);
primitive_impl!(i16, TwoBytes);
primitive_impl!(u32, FourBytes);
primitive_impl!(i32, FourBytes);
primitive_impl!(u64, EightBytes);
primitive_impl!(i64, EightBytes);
primitive_impl!(f32, FourBytes);
primitive_impl!(f64, EightBytes);

impl PrimitiveElement for bool {
    const ELEMENT_SIZE: ElementSize = ElementSize::Bit;
    const BITS: BitCount32 = 1;

    #[inline]
    fn get_from_word(word: &Word, bit: BitCount32) -> bool {
        let byte = word.as_bytes()[(bit as usize % BITS_PER_WORD) / BITS_PER_BYTE];
        (byte >> (bit % 8)) & 1 != 0
    }

    #[inline]
    fn set_in_word(word: &mut Word, bit: BitCount32, value: bool) {
        let byte = &mut word.as_bytes_mut()[(bit as usize % BITS_PER_WORD) / BITS_PER_BYTE];
        let bitnum = bit % 8;
        *byte = (*byte & !(1 << bitnum)) | ((value as u8) << bitnum);
    }
}

impl PrimitiveElement for () {
    const ELEMENT_SIZE: ElementSize = ElementSize::Void;
    const BITS: BitCount32 = 0;

    #[inline]
    fn get_from_word(_word: &Word, _bit: BitCount32) {}

    #[inline]
    fn set_in_word(_word: &mut Word, _bit: BitCount32, _value: ()) {}
}

/// Mask covering the low `width` bits of a word.
#[inline]
pub fn low_bits_mask(width: BitCount32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Copies a `width`-bit element between two words. Used when an old list is re-laid-out
/// with a wider stride.
#[inline]
pub fn copy_bits(
    src: &Word,
    src_bit: BitCount32,
    dst: &mut Word,
    dst_bit: BitCount32,
    width: BitCount32,
) {
    let mask = low_bits_mask(width);
    let value = (u64::from_le_bytes(src.to_bytes()) >> src_bit) & mask;
    let old = u64::from_le_bytes(dst.to_bytes());
    let new = (old & !(mask << dst_bit)) | (value << dst_bit);
    *dst = Word::from_bytes(new.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::{copy_bits, PrimitiveElement};
    use crate::{word, Word};

    #[test]
    fn bool_bits_are_independent() {
        let mut w = Word::ZERO;
        bool::set_in_word(&mut w, 3, true);
        bool::set_in_word(&mut w, 4, true);
        bool::set_in_word(&mut w, 3, false);
        bool::set_in_word(&mut w, 63, true);
        assert_eq!(w, word(0x10, 0, 0, 0, 0, 0, 0, 0x80));
        assert!(bool::get_from_word(&w, 4));
        assert!(!bool::get_from_word(&w, 3));
        assert!(bool::get_from_word(&w, 63));
    }

    #[test]
    fn whole_byte_values() {
        let mut w = word(0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff);
        u16::set_in_word(&mut w, 16, 0x1234);
        assert_eq!(w, word(0xff, 0xff, 0x34, 0x12, 0xff, 0xff, 0xff, 0xff));
        assert_eq!(u16::get_from_word(&w, 16), 0x1234);
        assert_eq!(i8::get_from_word(&w, 56), -1);
        f32::set_in_word(&mut w, 32, 2.5);
        assert_eq!(f32::get_from_word(&w, 32), 2.5);
        assert_eq!(<u64 as PrimitiveElement>::BITS, 64);
        assert_eq!(<() as PrimitiveElement>::BITS, 0);
    }

    #[test]
    fn copy_bits_between_words() {
        let src = word(0, 0x80, 0, 0, 0, 0, 0, 0);
        let mut dst = word(0xfe, 0, 0, 0, 0, 0, 0, 0);
        copy_bits(&src, 15, &mut dst, 0, 1);
        assert_eq!(dst, word(0xff, 0, 0, 0, 0, 0, 0, 0));
        copy_bits(&src, 0, &mut dst, 0, 8);
        assert_eq!(dst, Word::ZERO);
    }
}
