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

//! The scalar wire cell.

use core::fmt;

/// A value stored in its little-endian wire representation. Reading and writing convert
/// to and from host order, so the same bytes mean the same value on any processor.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct WireValue<T>
where
    T: Endian,
{
    raw: T::Raw,
}

impl<T> WireValue<T>
where
    T: Endian,
{
    /// Width of the value on the wire, in bytes.
    pub const WIDTH: usize = core::mem::size_of::<T::Raw>();

    #[inline]
    pub fn new(value: T) -> Self {
        Self {
            raw: value.to_wire(),
        }
    }

    /// Reads the value, swapping bytes on big-endian processors.
    #[inline]
    pub fn get(&self) -> T {
        T::from_wire(self.raw)
    }

    /// Writes the value, swapping bytes on big-endian processors.
    #[inline]
    pub fn set(&mut self, value: T) {
        self.raw = value.to_wire()
    }

    /// Copies a cell out of `bytes`, which must be exactly `WIDTH` long.
    #[inline]
    pub fn load(bytes: &[u8]) -> Self {
        let mut raw = T::Raw::default();
        raw.as_mut().copy_from_slice(bytes);
        Self { raw }
    }

    /// Copies this cell into `bytes`, which must be exactly `WIDTH` long.
    #[inline]
    pub fn store(&self, bytes: &mut [u8]) {
        bytes.copy_from_slice(self.raw.as_ref())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.raw.as_ref()
    }
}

impl<T> fmt::Debug for WireValue<T>
where
    T: Endian + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WireValue").field(&self.get()).finish()
    }
}

/// Something that can appear in a `WireValue`.
pub trait Endian: Sized + Copy {
    /// The little-endian byte representation.
    type Raw: Copy + Default + Eq + AsRef<[u8]> + AsMut<[u8]>;

    fn from_wire(raw: Self::Raw) -> Self;

    fn to_wire(self) -> Self::Raw;
}

macro_rules! endian_impl(
    ($typ:ty, $width:expr) => (
        impl Endian for $typ {
            type Raw = [u8; $width];
            #[inline]
            fn from_wire(raw: [u8; $width]) -> $typ { <$typ>::from_le_bytes(raw) }
            #[inline]
            fn to_wire(self) -> [u8; $width] { self.to_le_bytes() }
        }
        );
    );

endian_impl!(u8, 1);
endian_impl!(i8, 1);
endian_impl!(u16, 2);
endian_impl!(i16, 2);
endian_impl!(u32, 4);
endian_impl!(i32, 4);
endian_impl!(u64, 8);
endian_impl!(i64, 8);
endian_impl!(f32, 4);
endian_impl!(f64, 8);

#[cfg(test)]
mod tests {
    use super::WireValue;

    #[test]
    fn little_endian_bytes() {
        let v = WireValue::<u32>::new(0x0403_0201);
        assert_eq!(v.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(v.get(), 0x0403_0201);

        let mut buf = [0u8; 8];
        WireValue::<i16>::new(-2).store(&mut buf[2..4]);
        assert_eq!(buf, [0, 0, 0xfe, 0xff, 0, 0, 0, 0]);
        assert_eq!(WireValue::<i16>::load(&buf[2..4]).get(), -2);
    }

    #[test]
    fn floats() {
        let mut v = WireValue::<f64>::new(0.0);
        v.set(-1.5);
        assert_eq!(v.get(), -1.5);
        assert_eq!(v.as_bytes(), &(-1.5f64).to_le_bytes());
        assert_eq!(WireValue::<f32>::WIDTH, 4);
    }
}
