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

//! Struct and list cursors over the wire format.
//!
//! Readers carry an [`ArenaRef`] and report every failure as a default value. Builders carry a
//! [`BuilderArena`] and propagate errors. Both address memory as a segment id plus a word or
//! byte offset into that segment.

use crate::private::arena::{ArenaRef, BuilderArena, NullArena, SegmentId};
use crate::private::endian::WireValue;
use crate::private::units::*;
use crate::{Error, MessageSize, Result, Word};

pub use crate::private::primitive::PrimitiveElement;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementSize {
    Void = 0,
    Bit = 1,
    Byte = 2,
    TwoBytes = 3,
    FourBytes = 4,
    EightBytes = 5,
    Pointer = 6,
    InlineComposite = 7,
}

impl ElementSize {
    fn from(val: u8) -> Self {
        match val & 7 {
            0 => Self::Void,
            1 => Self::Bit,
            2 => Self::Byte,
            3 => Self::TwoBytes,
            4 => Self::FourBytes,
            5 => Self::EightBytes,
            6 => Self::Pointer,
            _ => Self::InlineComposite,
        }
    }
}

pub fn data_bits_per_element(size: ElementSize) -> BitCount32 {
    match size {
        ElementSize::Void => 0,
        ElementSize::Bit => 1,
        ElementSize::Byte => 8,
        ElementSize::TwoBytes => 16,
        ElementSize::FourBytes => 32,
        ElementSize::EightBytes => 64,
        ElementSize::Pointer => 0,
        ElementSize::InlineComposite => 0,
    }
}

pub fn pointers_per_element(size: ElementSize) -> WirePointerCount32 {
    match size {
        ElementSize::Pointer => 1,
        _ => 0,
    }
}

/// Field count reported by struct views over a primitive list.
fn primitive_field_count(size: ElementSize) -> u8 {
    match size {
        ElementSize::Void => 0,
        _ => 1,
    }
}

/// Declared shape of a struct: how many fields its schema has, and how large its two sections are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StructSize {
    pub field_count: u8,
    pub data: WordCount8,
    pub pointers: WirePointerCount16,
}

impl StructSize {
    pub const fn new(field_count: u8, data: WordCount8, pointers: WirePointerCount16) -> Self {
        Self {
            field_count,
            data,
            pointers,
        }
    }

    pub fn total(&self) -> WordCount32 {
        u32::from(self.data) + u32::from(self.pointers) * WORDS_PER_POINTER as WordCount32
    }

    fn union(self, other: StructSize) -> StructSize {
        StructSize {
            field_count: self.field_count.max(other.field_count),
            data: self.data.max(other.data),
            pointers: self.pointers.max(other.pointers),
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WirePointerKind {
    Struct = 0,
    List = 1,
    Far = 2,
    Other = 3,
}

impl WirePointerKind {
    fn from(val: u8) -> Self {
        match val & 3 {
            0 => Self::Struct,
            1 => Self::List,
            2 => Self::Far,
            _ => Self::Other,
        }
    }
}

/// One pointer word, decoded lazily from its two little-endian halves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WirePointer {
    offset_and_kind: WireValue<u32>,
    upper32bits: WireValue<u32>,
}

impl WirePointer {
    pub fn null() -> Self {
        Self::from_word(Word::ZERO)
    }

    pub fn from_word(word: Word) -> Self {
        let bytes = word.as_bytes();
        Self {
            offset_and_kind: WireValue::load(&bytes[0..4]),
            upper32bits: WireValue::load(&bytes[4..8]),
        }
    }

    pub fn to_word(self) -> Word {
        let mut word = Word::ZERO;
        let bytes = word.as_bytes_mut();
        self.offset_and_kind.store(&mut bytes[0..4]);
        self.upper32bits.store(&mut bytes[4..8]);
        word
    }

    #[inline]
    pub fn kind(&self) -> WirePointerKind {
        WirePointerKind::from(self.offset_and_kind.get() as u8)
    }

    #[inline]
    pub fn is_positional(&self) -> bool {
        (self.offset_and_kind.get() & 2) == 0 // match Struct and List but not Far and Other.
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.offset_and_kind.get() == 0 && self.upper32bits.get() == 0
    }

    /// Signed distance in words from the end of this pointer to its target.
    #[inline]
    pub fn offset(&self) -> i32 {
        (self.offset_and_kind.get() as i32) >> 2
    }

    /// Target of a pointer that lives at word `location`. Only meaningful for pointers that
    /// this process wrote itself; untrusted pointers go through `ArenaRef::check_offset()`.
    #[inline]
    pub fn target(&self, location: WordCount) -> WordCount {
        (location as i64 + 1 + i64::from(self.offset())) as WordCount
    }

    #[inline]
    pub fn set_kind_and_target(&mut self, kind: WirePointerKind, location: WordCount, target: WordCount) {
        let offset = target as i64 - (location as i64 + 1);
        self.offset_and_kind
            .set(((offset as i32 as u32) << 2) | (kind as u32));
    }

    #[inline]
    pub fn set_kind_with_zero_offset(&mut self, kind: WirePointerKind) {
        self.offset_and_kind.set(kind as u32)
    }

    #[inline]
    pub fn set_kind_and_target_for_empty_struct(&mut self) {
        // Offset -1 points back at the pointer itself, so the zero-sized target never
        // lands outside the segment.
        self.offset_and_kind.set(0xfffffffc);
    }

    #[inline]
    pub fn inline_composite_list_element_count(&self) -> ElementCount32 {
        self.offset_and_kind.get() >> 2
    }

    #[inline]
    pub fn set_kind_and_inline_composite_list_element_count(
        &mut self,
        kind: WirePointerKind,
        element_count: ElementCount32,
    ) {
        self.offset_and_kind
            .set((element_count << 2) | (kind as u32))
    }

    #[inline]
    pub fn far_position_in_segment(&self) -> WordCount32 {
        self.offset_and_kind.get() >> 3
    }

    #[inline]
    pub fn is_double_far(&self) -> bool {
        ((self.offset_and_kind.get() >> 2) & 1) != 0
    }

    #[inline]
    pub fn set_far(&mut self, is_double_far: bool, pos: WordCount32) {
        self.offset_and_kind.set(
            (pos << 3) | (u32::from(is_double_far) << 2) | WirePointerKind::Far as u32,
        );
    }

    #[inline]
    pub fn struct_field_count(&self) -> u8 {
        self.upper32bits.get() as u8
    }

    #[inline]
    pub fn struct_data_size(&self) -> WordCount8 {
        (self.upper32bits.get() >> 8) as WordCount8
    }

    #[inline]
    pub fn struct_ptr_count(&self) -> WirePointerCount16 {
        (self.upper32bits.get() >> 16) as WirePointerCount16
    }

    #[inline]
    pub fn struct_word_size(&self) -> WordCount32 {
        u32::from(self.struct_data_size())
            + u32::from(self.struct_ptr_count()) * WORDS_PER_POINTER as WordCount32
    }

    #[inline]
    pub fn struct_size(&self) -> StructSize {
        StructSize::new(
            self.struct_field_count(),
            self.struct_data_size(),
            self.struct_ptr_count(),
        )
    }

    #[inline]
    pub fn set_struct_size(&mut self, size: StructSize) {
        self.upper32bits.set(
            u32::from(size.field_count)
                | (u32::from(size.data) << 8)
                | (u32::from(size.pointers) << 16),
        )
    }

    #[inline]
    pub fn list_element_size(&self) -> ElementSize {
        ElementSize::from(self.upper32bits.get() as u8)
    }

    #[inline]
    pub fn list_element_count(&self) -> ElementCount32 {
        self.upper32bits.get() >> 3
    }

    #[inline]
    pub fn list_inline_composite_word_count(&self) -> WordCount32 {
        self.list_element_count()
    }

    #[inline]
    pub fn set_list_size_and_count(&mut self, es: ElementSize, ec: ElementCount32) {
        debug_assert!(ec <= MAX_LIST_ELEMENTS, "element count out of range");
        self.upper32bits.set((ec << 3) | (es as u32))
    }

    #[inline]
    pub fn set_list_inline_composite(&mut self, wc: WordCount32) {
        debug_assert!(wc <= MAX_LIST_ELEMENTS, "inline composite word count out of range");
        self.upper32bits
            .set((wc << 3) | (ElementSize::InlineComposite as u32))
    }

    #[inline]
    pub fn far_segment_id(&self) -> SegmentId {
        self.upper32bits.get() as SegmentId
    }

    #[inline]
    pub fn set_far_segment_id(&mut self, si: SegmentId) {
        self.upper32bits.set(si)
    }

    #[inline]
    fn upper32bits(&self) -> u32 {
        self.upper32bits.get()
    }

    #[inline]
    fn set_upper32bits(&mut self, value: u32) {
        self.upper32bits.set(value)
    }
}

/// Reads the element that starts at absolute bit `bit` of a segment. Anything unreadable,
/// including a zero-width element, comes back as `T::default()`.
#[inline]
fn read_element<T: PrimitiveElement>(arena: ArenaRef<'_>, segment_id: SegmentId, bit: BitCount64) -> T {
    if T::BITS == 0 {
        return T::default();
    }
    let index = (bit / BITS_PER_WORD as u64) as WordCount;
    match arena.read_word(segment_id, index) {
        Ok(word) => T::get_from_word(&word, (bit % BITS_PER_WORD as u64) as BitCount32),
        Err(_) => T::default(),
    }
}

#[inline]
fn get_builder_element<T: PrimitiveElement>(
    arena: &dyn BuilderArena,
    segment_id: SegmentId,
    bit: BitCount64,
) -> T {
    if T::BITS == 0 {
        return T::default();
    }
    let word = arena.get_word(segment_id, (bit / BITS_PER_WORD as u64) as WordCount);
    T::get_from_word(&word, (bit % BITS_PER_WORD as u64) as BitCount32)
}

#[inline]
fn set_builder_element<T: PrimitiveElement>(
    arena: &dyn BuilderArena,
    segment_id: SegmentId,
    bit: BitCount64,
    value: T,
) {
    if T::BITS == 0 {
        return;
    }
    let index = (bit / BITS_PER_WORD as u64) as WordCount;
    let mut word = arena.get_word(segment_id, index);
    T::set_in_word(&mut word, (bit % BITS_PER_WORD as u64) as BitCount32, value);
    arena.set_word(segment_id, index, word);
}

mod wire_helpers {
    use tracing::{debug, trace};

    use crate::private::arena::{ArenaRef, BuilderArena, SegmentId};
    use crate::private::layout::ElementSize::*;
    use crate::private::layout::{
        data_bits_per_element, pointers_per_element, primitive_field_count, read_element,
        ElementSize, ListBuilder, ListReader, StructBuilder, StructReader, StructSize,
        WirePointer, WirePointerKind,
    };
    use crate::private::primitive::{copy_bits, low_bits_mask, PrimitiveElement};
    use crate::private::units::*;
    use crate::{Error, ErrorKind, MessageSize, Result, Word};

    pub struct Allocation {
        pub segment_id: SegmentId,
        /// First word of the object.
        pub ptr: WordCount,
        /// Word holding the pointer whose target is the object. Differs from the pointer the
        /// caller passed when the object went into another segment behind a landing pad.
        pub reff: WordCount,
    }

    #[inline]
    fn read_pointer(arena: &dyn BuilderArena, segment_id: SegmentId, index: WordCount) -> WirePointer {
        WirePointer::from_word(arena.get_word(segment_id, index))
    }

    #[inline]
    fn write_pointer(
        arena: &dyn BuilderArena,
        segment_id: SegmentId,
        index: WordCount,
        pointer: WirePointer,
    ) {
        arena.set_word(segment_id, index, pointer.to_word())
    }

    #[inline]
    fn update_pointer(
        arena: &dyn BuilderArena,
        segment_id: SegmentId,
        index: WordCount,
        f: impl FnOnce(&mut WirePointer),
    ) {
        let mut pointer = read_pointer(arena, segment_id, index);
        f(&mut pointer);
        write_pointer(arena, segment_id, index, pointer);
    }

    /// True for a default value that encodes a null pointer, including the empty slice.
    pub fn is_null_default(default: &[Word]) -> bool {
        default
            .first()
            .map_or(true, |word| WirePointer::from_word(*word).is_null())
    }

    fn list_too_long() -> Error {
        Error::from_kind(ErrorKind::ListTooLong)
    }

    /// Word count of a list's content, checked against the largest encodable list.
    fn checked_list_words(words: u64) -> Result<WordCount32> {
        if words > u64::from(MAX_LIST_ELEMENTS) {
            Err(list_too_long())
        } else {
            Ok(words as WordCount32)
        }
    }

    pub fn allocate(
        arena: &dyn BuilderArena,
        segment_id: SegmentId,
        reff: WordCount,
        amount: WordCount32,
        kind: WirePointerKind,
    ) -> Result<Allocation> {
        let existing = read_pointer(arena, segment_id, reff);
        if !existing.is_null() {
            zero_object(arena, segment_id, reff);
            arena.set_word(segment_id, reff, Word::ZERO);
        }

        if amount == 0 && kind == WirePointerKind::Struct {
            let mut pointer = WirePointer::null();
            pointer.set_kind_and_target_for_empty_struct();
            write_pointer(arena, segment_id, reff, pointer);
            return Ok(Allocation {
                segment_id,
                ptr: reff,
                reff,
            });
        }

        match arena.allocate(segment_id, amount) {
            Some(ptr) => {
                let mut pointer = WirePointer::null();
                pointer.set_kind_and_target(kind, reff, ptr);
                write_pointer(arena, segment_id, reff, pointer);
                Ok(Allocation {
                    segment_id,
                    ptr,
                    reff,
                })
            }
            None => {
                // The object goes elsewhere, preceded by a one-word landing pad.
                let amount_plus_pad = amount
                    .checked_add(POINTER_SIZE_IN_WORDS as WordCount32)
                    .ok_or_else(|| Error::from_kind(ErrorKind::SegmentTooLarge))?;
                let (pad_segment_id, pad) = arena.allocate_anywhere(amount_plus_pad)?;
                trace!(
                    from_segment = segment_id,
                    to_segment = pad_segment_id,
                    words = amount,
                    "object placed behind far pointer"
                );

                let mut far = WirePointer::null();
                far.set_far(false, pad as WordCount32);
                far.set_far_segment_id(pad_segment_id);
                write_pointer(arena, segment_id, reff, far);

                let ptr = pad + POINTER_SIZE_IN_WORDS;
                let mut landing_pad = WirePointer::null();
                landing_pad.set_kind_and_target(kind, pad, ptr);
                write_pointer(arena, pad_segment_id, pad, landing_pad);

                Ok(Allocation {
                    segment_id: pad_segment_id,
                    ptr,
                    reff: pad,
                })
            }
        }
    }

    /// Resolves a pointer written by this builder, returning its tag and the location of its
    /// target. The tag of a null pointer is the null pointer itself.
    pub fn follow_builder_fars(
        arena: &dyn BuilderArena,
        segment_id: SegmentId,
        reff: WordCount,
    ) -> (WirePointer, SegmentId, WordCount) {
        let pointer = read_pointer(arena, segment_id, reff);
        if pointer.kind() != WirePointerKind::Far {
            return (pointer, segment_id, pointer.target(reff));
        }

        let pad_segment_id = pointer.far_segment_id();
        let pad = pointer.far_position_in_segment() as WordCount;
        let pad_pointer = read_pointer(arena, pad_segment_id, pad);
        if pointer.is_double_far() {
            let tag = read_pointer(arena, pad_segment_id, pad + 1);
            (
                tag,
                pad_pointer.far_segment_id(),
                pad_pointer.far_position_in_segment() as WordCount,
            )
        } else {
            (pad_pointer, pad_segment_id, pad_pointer.target(pad))
        }
    }

    /// Resolves a possibly-far pointer found at `location` in untrusted data. Returns the
    /// target word, the tag describing it, and the segment it lives in.
    pub fn follow_fars(
        arena: ArenaRef<'_>,
        pointer: WirePointer,
        location: WordCount,
        segment_id: SegmentId,
    ) -> Result<(WordCount, WirePointer, SegmentId)> {
        if pointer.kind() != WirePointerKind::Far {
            let target = arena.check_offset(segment_id, location + 1, pointer.offset())?;
            return Ok((target, pointer, segment_id));
        }

        let pad_segment_id = pointer.far_segment_id();
        let pad = pointer.far_position_in_segment() as WordCount;
        let pad_words = if pointer.is_double_far() { 2 } else { 1 };
        arena.contains_interval(pad_segment_id, pad, pad_words)?;
        let pad_pointer = WirePointer::from_word(arena.read_word(pad_segment_id, pad)?);

        if !pointer.is_double_far() {
            if pad_pointer.kind() == WirePointerKind::Far {
                return Err(Error::failed(
                    "far pointer landing pad is another far pointer".to_string(),
                ));
            }
            let target = arena.check_offset(pad_segment_id, pad + 1, pad_pointer.offset())?;
            Ok((target, pad_pointer, pad_segment_id))
        } else {
            if pad_pointer.kind() != WirePointerKind::Far || pad_pointer.is_double_far() {
                return Err(Error::from_kind(ErrorKind::MalformedDoubleFarPointer));
            }
            let tag = WirePointer::from_word(arena.read_word(pad_segment_id, pad + 1)?);
            let target_segment_id = pad_pointer.far_segment_id();
            let target = pad_pointer.far_position_in_segment() as WordCount;
            arena.check_offset(target_segment_id, target, 0)?;
            Ok((target, tag, target_segment_id))
        }
    }

    /// Zeroes the object the pointer at `reff` refers to, recursively, together with any
    /// landing pads on the way. The pointer itself is left alone.
    pub fn zero_object(arena: &dyn BuilderArena, segment_id: SegmentId, reff: WordCount) {
        let pointer = read_pointer(arena, segment_id, reff);
        match pointer.kind() {
            WirePointerKind::Struct | WirePointerKind::List => {
                zero_object_helper(arena, segment_id, pointer, pointer.target(reff))
            }
            WirePointerKind::Far => {
                let pad_segment_id = pointer.far_segment_id();
                let pad = pointer.far_position_in_segment() as WordCount;
                if pointer.is_double_far() {
                    let pad_pointer = read_pointer(arena, pad_segment_id, pad);
                    let tag = read_pointer(arena, pad_segment_id, pad + 1);
                    zero_object_helper(
                        arena,
                        pad_pointer.far_segment_id(),
                        tag,
                        pad_pointer.far_position_in_segment() as WordCount,
                    );
                    arena.zero_words(pad_segment_id, pad, 2);
                } else {
                    zero_object(arena, pad_segment_id, pad);
                    arena.zero_words(pad_segment_id, pad, 1);
                }
            }
            WirePointerKind::Other => {}
        }
    }

    pub fn zero_object_helper(
        arena: &dyn BuilderArena,
        segment_id: SegmentId,
        tag: WirePointer,
        ptr: WordCount,
    ) {
        match tag.kind() {
            WirePointerKind::Struct => {
                let pointer_section = ptr + tag.struct_data_size() as WordCount;
                for i in 0..tag.struct_ptr_count() as WordCount {
                    zero_object(arena, segment_id, pointer_section + i);
                }
                arena.zero_words(segment_id, ptr, tag.struct_word_size() as WordCount);
            }
            WirePointerKind::List => match tag.list_element_size() {
                Void => {}
                Bit | Byte | TwoBytes | FourBytes | EightBytes => {
                    let bits = u64::from(tag.list_element_count())
                        * u64::from(data_bits_per_element(tag.list_element_size()));
                    arena.zero_words(segment_id, ptr, round_bits_up_to_words(bits) as WordCount);
                }
                Pointer => {
                    let count = tag.list_element_count() as WordCount;
                    for i in 0..count {
                        zero_object(arena, segment_id, ptr + i);
                    }
                    arena.zero_words(segment_id, ptr, count);
                }
                InlineComposite => {
                    let element_tag = read_pointer(arena, segment_id, ptr);
                    let data_size = element_tag.struct_data_size() as WordCount;
                    let pointer_count = element_tag.struct_ptr_count() as WordCount;
                    let count = element_tag.inline_composite_list_element_count() as WordCount;
                    let step = data_size + pointer_count;
                    if pointer_count > 0 {
                        for e in 0..count {
                            let pointer_section = ptr + POINTER_SIZE_IN_WORDS + e * step + data_size;
                            for j in 0..pointer_count {
                                zero_object(arena, segment_id, pointer_section + j);
                            }
                        }
                    }
                    arena.zero_words(segment_id, ptr, POINTER_SIZE_IN_WORDS + step * count);
                }
            },
            WirePointerKind::Far | WirePointerKind::Other => {}
        }
    }

    /// Nulls the pointer at `reff` and clears any landing pad it uses, without touching the
    /// object it points to.
    pub fn zero_pointer_and_fars(arena: &dyn BuilderArena, segment_id: SegmentId, reff: WordCount) {
        let pointer = read_pointer(arena, segment_id, reff);
        if pointer.kind() == WirePointerKind::Far {
            let pad_words = if pointer.is_double_far() { 2 } else { 1 };
            arena.zero_words(
                pointer.far_segment_id(),
                pointer.far_position_in_segment() as WordCount,
                pad_words,
            );
        }
        arena.set_word(segment_id, reff, Word::ZERO);
    }

    /// Moves the pointer at `src` to `dst`, rewriting offsets and adding landing pads as
    /// needed. The object itself does not move.
    pub fn transfer_pointer(
        arena: &dyn BuilderArena,
        dst_segment_id: SegmentId,
        dst: WordCount,
        src_segment_id: SegmentId,
        src: WordCount,
    ) -> Result<()> {
        let src_pointer = read_pointer(arena, src_segment_id, src);
        if src_pointer.is_null() {
            arena.set_word(dst_segment_id, dst, Word::ZERO);
        } else if src_pointer.is_positional() {
            transfer_pointer_split(
                arena,
                dst_segment_id,
                dst,
                src_segment_id,
                src_pointer,
                src_pointer.target(src),
            )?;
        } else {
            write_pointer(arena, dst_segment_id, dst, src_pointer);
        }
        Ok(())
    }

    pub fn transfer_pointer_split(
        arena: &dyn BuilderArena,
        dst_segment_id: SegmentId,
        dst: WordCount,
        src_segment_id: SegmentId,
        src_tag: WirePointer,
        src_ptr: WordCount,
    ) -> Result<()> {
        if src_tag.kind() == WirePointerKind::Struct && src_tag.struct_word_size() == 0 {
            let mut pointer = WirePointer::null();
            pointer.set_kind_and_target_for_empty_struct();
            pointer.set_upper32bits(src_tag.upper32bits());
            write_pointer(arena, dst_segment_id, dst, pointer);
            return Ok(());
        }

        if dst_segment_id == src_segment_id {
            let mut pointer = WirePointer::null();
            pointer.set_kind_and_target(src_tag.kind(), dst, src_ptr);
            pointer.set_upper32bits(src_tag.upper32bits());
            write_pointer(arena, dst_segment_id, dst, pointer);
            return Ok(());
        }

        match arena.allocate(src_segment_id, 1) {
            Some(pad) => {
                let mut landing_pad = WirePointer::null();
                landing_pad.set_kind_and_target(src_tag.kind(), pad, src_ptr);
                landing_pad.set_upper32bits(src_tag.upper32bits());
                write_pointer(arena, src_segment_id, pad, landing_pad);

                let mut far = WirePointer::null();
                far.set_far(false, pad as WordCount32);
                far.set_far_segment_id(src_segment_id);
                write_pointer(arena, dst_segment_id, dst, far);
            }
            None => {
                // No room next to the object: a double-far pad names its segment and
                // position, followed by the tag.
                let (pad_segment_id, pad) = arena.allocate_anywhere(2)?;
                trace!(
                    pad_segment = pad_segment_id,
                    object_segment = src_segment_id,
                    "double-far landing pad"
                );

                let mut pad_pointer = WirePointer::null();
                pad_pointer.set_far(false, src_ptr as WordCount32);
                pad_pointer.set_far_segment_id(src_segment_id);
                write_pointer(arena, pad_segment_id, pad, pad_pointer);

                let mut tag = WirePointer::null();
                tag.set_kind_with_zero_offset(src_tag.kind());
                tag.set_upper32bits(src_tag.upper32bits());
                write_pointer(arena, pad_segment_id, pad + 1, tag);

                let mut far = WirePointer::null();
                far.set_far(true, pad as WordCount32);
                far.set_far_segment_id(pad_segment_id);
                write_pointer(arena, dst_segment_id, dst, far);
            }
        }
        Ok(())
    }

    fn struct_builder_at<'a>(
        arena: &'a dyn BuilderArena,
        segment_id: SegmentId,
        ptr: WordCount,
        size: StructSize,
    ) -> StructBuilder<'a> {
        StructBuilder {
            arena,
            segment_id,
            data: ptr * BYTES_PER_WORD,
            pointers: ptr + size.data as WordCount,
            data_size: u32::from(size.data) * BITS_PER_WORD as BitCount32,
            pointer_count: size.pointers,
            field_count: size.field_count,
            bit0_offset: 0,
        }
    }

    fn struct_list_builder_at<'a>(
        arena: &'a dyn BuilderArena,
        segment_id: SegmentId,
        ptr: WordCount,
        element_count: ElementCount32,
        size: StructSize,
    ) -> ListBuilder<'a> {
        ListBuilder {
            arena,
            segment_id,
            ptr: ptr * BYTES_PER_WORD,
            element_count,
            step: size.total() * BITS_PER_WORD as BitCount32,
            element_size: InlineComposite,
            struct_data_size: u32::from(size.data) * BITS_PER_WORD as BitCount32,
            struct_pointer_count: size.pointers,
            struct_field_count: size.field_count,
        }
    }

    /// Writes an inline composite list header at `ptr`: the tag word goes in front of the
    /// elements. Returns the first element word.
    fn write_struct_list_tag(
        arena: &dyn BuilderArena,
        alloc: &Allocation,
        element_count: ElementCount32,
        word_count: WordCount32,
        size: StructSize,
    ) -> WordCount {
        update_pointer(arena, alloc.segment_id, alloc.reff, |p| {
            p.set_list_inline_composite(word_count)
        });
        let mut tag = WirePointer::null();
        tag.set_kind_and_inline_composite_list_element_count(WirePointerKind::Struct, element_count);
        tag.set_struct_size(size);
        write_pointer(arena, alloc.segment_id, alloc.ptr, tag);
        alloc.ptr + POINTER_SIZE_IN_WORDS
    }

    pub fn init_struct_pointer<'a>(
        arena: &'a dyn BuilderArena,
        segment_id: SegmentId,
        reff: WordCount,
        size: StructSize,
    ) -> Result<StructBuilder<'a>> {
        let alloc = allocate(arena, segment_id, reff, size.total(), WirePointerKind::Struct)?;
        update_pointer(arena, alloc.segment_id, alloc.reff, |p| p.set_struct_size(size));
        Ok(struct_builder_at(arena, alloc.segment_id, alloc.ptr, size))
    }

    pub fn get_writable_struct_pointer<'a>(
        arena: &'a dyn BuilderArena,
        segment_id: SegmentId,
        reff: WordCount,
        size: StructSize,
        default: Option<&[Word]>,
    ) -> Result<StructBuilder<'a>> {
        if read_pointer(arena, segment_id, reff).is_null() {
            match default {
                Some(words) if !is_null_default(words) => {
                    copy_pointer(arena, segment_id, reff, ArenaRef::Trusted(words), 0, 0, i32::MAX)?;
                }
                _ => return init_struct_pointer(arena, segment_id, reff, size),
            }
        }

        let (old_tag, old_segment_id, old_ptr) = follow_builder_fars(arena, segment_id, reff);
        if old_tag.kind() != WirePointerKind::Struct {
            return Err(Error::from_kind(
                ErrorKind::MessageContainsNonStructPointerWhereStructPointerWasExpected,
            ));
        }

        let old_size = old_tag.struct_size();
        if old_size.data >= size.data && old_size.pointers >= size.pointers {
            return Ok(struct_builder_at(arena, old_segment_id, old_ptr, old_size));
        }

        // The stored struct predates some of the requested fields. Move it into a larger
        // allocation; its pointers keep their targets.
        let new_size = old_size.union(size);
        debug!(
            old_data_words = old_size.data,
            old_pointers = old_size.pointers,
            new_data_words = new_size.data,
            new_pointers = new_size.pointers,
            "upgrading struct in place"
        );

        zero_pointer_and_fars(arena, segment_id, reff);
        let alloc = allocate(arena, segment_id, reff, new_size.total(), WirePointerKind::Struct)?;
        update_pointer(arena, alloc.segment_id, alloc.reff, |p| p.set_struct_size(new_size));

        arena.copy_words(
            old_segment_id,
            old_ptr,
            alloc.segment_id,
            alloc.ptr,
            old_size.data as WordCount,
        );
        let old_pointer_section = old_ptr + old_size.data as WordCount;
        let new_pointer_section = alloc.ptr + new_size.data as WordCount;
        for i in 0..old_size.pointers as WordCount {
            transfer_pointer(
                arena,
                alloc.segment_id,
                new_pointer_section + i,
                old_segment_id,
                old_pointer_section + i,
            )?;
        }
        arena.zero_words(old_segment_id, old_ptr, old_size.total() as WordCount);

        Ok(struct_builder_at(arena, alloc.segment_id, alloc.ptr, new_size))
    }

    pub fn init_list_pointer<'a>(
        arena: &'a dyn BuilderArena,
        segment_id: SegmentId,
        reff: WordCount,
        element_count: ElementCount32,
        element_size: ElementSize,
    ) -> Result<ListBuilder<'a>> {
        if element_size == InlineComposite {
            return Err(Error::failed(
                "struct lists are created with init_struct_list_pointer()".to_string(),
            ));
        }
        if element_count > MAX_LIST_ELEMENTS {
            return Err(list_too_long());
        }

        let data_size = data_bits_per_element(element_size);
        let pointer_count = pointers_per_element(element_size);
        let step = data_size + pointer_count * BITS_PER_POINTER as BitCount32;
        let word_count =
            round_bits_up_to_words(u64::from(element_count) * u64::from(step)) as WordCount32;
        let alloc = allocate(arena, segment_id, reff, word_count, WirePointerKind::List)?;
        update_pointer(arena, alloc.segment_id, alloc.reff, |p| {
            p.set_list_size_and_count(element_size, element_count)
        });

        Ok(ListBuilder {
            arena,
            segment_id: alloc.segment_id,
            ptr: alloc.ptr * BYTES_PER_WORD,
            element_count,
            step,
            element_size,
            struct_data_size: data_size,
            struct_pointer_count: pointer_count as WirePointerCount16,
            struct_field_count: primitive_field_count(element_size),
        })
    }

    pub fn init_struct_list_pointer<'a>(
        arena: &'a dyn BuilderArena,
        segment_id: SegmentId,
        reff: WordCount,
        element_count: ElementCount32,
        element_size: StructSize,
    ) -> Result<ListBuilder<'a>> {
        if element_count > MAX_LIST_ELEMENTS {
            return Err(list_too_long());
        }
        let word_count =
            checked_list_words(u64::from(element_count) * u64::from(element_size.total()))?;

        let alloc = allocate(
            arena,
            segment_id,
            reff,
            POINTER_SIZE_IN_WORDS as WordCount32 + word_count,
            WirePointerKind::List,
        )?;
        let ptr = write_struct_list_tag(arena, &alloc, element_count, word_count, element_size);
        Ok(struct_list_builder_at(
            arena,
            alloc.segment_id,
            ptr,
            element_count,
            element_size,
        ))
    }

    pub fn get_writable_list_pointer<'a>(
        arena: &'a dyn BuilderArena,
        segment_id: SegmentId,
        reff: WordCount,
        element_size: ElementSize,
        default: Option<&[Word]>,
    ) -> Result<ListBuilder<'a>> {
        if element_size == InlineComposite {
            return Err(Error::failed(
                "struct lists are opened with get_writable_struct_list_pointer()".to_string(),
            ));
        }

        if read_pointer(arena, segment_id, reff).is_null() {
            match default {
                Some(words) if !is_null_default(words) => {
                    copy_pointer(arena, segment_id, reff, ArenaRef::Trusted(words), 0, 0, i32::MAX)?;
                }
                _ => return Ok(ListBuilder::new_default()),
            }
        }

        let (tag, list_segment_id, ptr) = follow_builder_fars(arena, segment_id, reff);
        if tag.kind() != WirePointerKind::List {
            return Err(Error::from_kind(
                ErrorKind::MessageContainsNonListPointerWhereListPointerWasExpected,
            ));
        }

        let old_size = tag.list_element_size();
        if old_size == InlineComposite {
            let element_tag = read_pointer(arena, list_segment_id, ptr);
            if element_tag.kind() != WirePointerKind::Struct {
                return Err(Error::from_kind(
                    ErrorKind::InlineCompositeListWithNonStructElementsNotSupported,
                ));
            }
            let ptr = ptr + POINTER_SIZE_IN_WORDS;
            let data_size = element_tag.struct_data_size();
            let pointer_count = element_tag.struct_ptr_count();
            match element_size {
                Void | InlineComposite => {}
                Bit => {
                    return Err(Error::from_kind(
                        ErrorKind::FoundStructListWhereBitListWasExpected,
                    ));
                }
                Byte | TwoBytes | FourBytes | EightBytes => {
                    if data_size < 1 {
                        return Err(Error::from_kind(
                            ErrorKind::ExistingListValueIsIncompatibleWithExpectedType,
                        ));
                    }
                }
                Pointer => {
                    if pointer_count < 1 {
                        return Err(Error::from_kind(
                            ErrorKind::ExistingListValueIsIncompatibleWithExpectedType,
                        ));
                    }
                }
            }
            Ok(struct_list_builder_at(
                arena,
                list_segment_id,
                ptr,
                element_tag.inline_composite_list_element_count(),
                element_tag.struct_size(),
            ))
        } else {
            let data_size = data_bits_per_element(old_size);
            let pointer_count = pointers_per_element(old_size);
            if data_size < data_bits_per_element(element_size)
                || pointer_count < pointers_per_element(element_size)
            {
                return Err(Error::from_kind(
                    ErrorKind::ExistingListValueIsIncompatibleWithExpectedType,
                ));
            }
            Ok(ListBuilder {
                arena,
                segment_id: list_segment_id,
                ptr: ptr * BYTES_PER_WORD,
                element_count: tag.list_element_count(),
                step: data_size + pointer_count * BITS_PER_POINTER as BitCount32,
                element_size: old_size,
                struct_data_size: data_size,
                struct_pointer_count: pointer_count as WirePointerCount16,
                struct_field_count: primitive_field_count(old_size),
            })
        }
    }

    pub fn get_writable_struct_list_pointer<'a>(
        arena: &'a dyn BuilderArena,
        segment_id: SegmentId,
        reff: WordCount,
        element_size: StructSize,
        default: Option<&[Word]>,
    ) -> Result<ListBuilder<'a>> {
        if read_pointer(arena, segment_id, reff).is_null() {
            match default {
                Some(words) if !is_null_default(words) => {
                    copy_pointer(arena, segment_id, reff, ArenaRef::Trusted(words), 0, 0, i32::MAX)?;
                }
                _ => return Ok(ListBuilder::new_default()),
            }
        }

        let (old_tag, old_segment_id, old_ptr) = follow_builder_fars(arena, segment_id, reff);
        if old_tag.kind() != WirePointerKind::List {
            return Err(Error::from_kind(
                ErrorKind::MessageContainsNonListPointerWhereListPointerWasExpected,
            ));
        }

        let old_element_size = old_tag.list_element_size();
        if old_element_size == InlineComposite {
            let element_tag = read_pointer(arena, old_segment_id, old_ptr);
            if element_tag.kind() != WirePointerKind::Struct {
                return Err(Error::from_kind(
                    ErrorKind::InlineCompositeListWithNonStructElementsNotSupported,
                ));
            }
            let old_ptr = old_ptr + POINTER_SIZE_IN_WORDS;
            let old_size = element_tag.struct_size();
            let element_count = element_tag.inline_composite_list_element_count();

            if old_size.data >= element_size.data && old_size.pointers >= element_size.pointers {
                return Ok(struct_list_builder_at(
                    arena,
                    old_segment_id,
                    old_ptr,
                    element_count,
                    old_size,
                ));
            }

            let new_size = old_size.union(element_size);
            let old_step = old_size.total() as WordCount;
            let new_step = new_size.total() as WordCount;
            let word_count =
                checked_list_words(u64::from(element_count) * u64::from(new_size.total()))?;
            debug!(
                element_count,
                old_data_words = old_size.data,
                old_pointers = old_size.pointers,
                new_data_words = new_size.data,
                new_pointers = new_size.pointers,
                "upgrading struct list elements"
            );

            zero_pointer_and_fars(arena, segment_id, reff);
            let alloc = allocate(
                arena,
                segment_id,
                reff,
                word_count + POINTER_SIZE_IN_WORDS as WordCount32,
                WirePointerKind::List,
            )?;
            let new_ptr = write_struct_list_tag(arena, &alloc, element_count, word_count, new_size);

            for i in 0..element_count as WordCount {
                let src = old_ptr + i * old_step;
                let dst = new_ptr + i * new_step;
                arena.copy_words(old_segment_id, src, alloc.segment_id, dst, old_size.data as WordCount);
                for j in 0..old_size.pointers as WordCount {
                    transfer_pointer(
                        arena,
                        alloc.segment_id,
                        dst + new_size.data as WordCount + j,
                        old_segment_id,
                        src + old_size.data as WordCount + j,
                    )?;
                }
            }
            arena.zero_words(
                old_segment_id,
                old_ptr - POINTER_SIZE_IN_WORDS,
                POINTER_SIZE_IN_WORDS + old_step * element_count as WordCount,
            );

            Ok(struct_list_builder_at(
                arena,
                alloc.segment_id,
                new_ptr,
                element_count,
                new_size,
            ))
        } else {
            let element_count = old_tag.list_element_count();
            if old_element_size == Void {
                // Nothing to carry over.
                return init_struct_list_pointer(arena, segment_id, reff, element_count, element_size);
            }

            let old_data_size = data_bits_per_element(old_element_size);
            let old_pointer_count = pointers_per_element(old_element_size);
            let old_step = old_data_size + old_pointer_count * BITS_PER_POINTER as BitCount32;

            let mut new_size = element_size;
            new_size.field_count = new_size.field_count.max(1);
            if old_element_size == Pointer {
                new_size.pointers = new_size.pointers.max(1);
            } else {
                new_size.data = new_size.data.max(1);
            }
            let new_step = new_size.total() as WordCount;
            let word_count =
                checked_list_words(u64::from(element_count) * u64::from(new_size.total()))?;
            debug!(
                ?old_element_size,
                element_count,
                new_data_words = new_size.data,
                new_pointers = new_size.pointers,
                "upgrading primitive list to struct list"
            );

            zero_pointer_and_fars(arena, segment_id, reff);
            let alloc = allocate(
                arena,
                segment_id,
                reff,
                word_count + POINTER_SIZE_IN_WORDS as WordCount32,
                WirePointerKind::List,
            )?;
            let new_ptr = write_struct_list_tag(arena, &alloc, element_count, word_count, new_size);

            if old_element_size == Pointer {
                for i in 0..element_count as WordCount {
                    transfer_pointer(
                        arena,
                        alloc.segment_id,
                        new_ptr + i * new_step + new_size.data as WordCount,
                        old_segment_id,
                        old_ptr + i,
                    )?;
                }
            } else {
                // Each old element becomes the low bits of its struct's first data word.
                for i in 0..element_count as WordCount {
                    let src_bit = (old_ptr * BITS_PER_WORD) as u64 + (i as u64) * u64::from(old_data_size);
                    let src_word =
                        arena.get_word(old_segment_id, (src_bit / BITS_PER_WORD as u64) as WordCount);
                    let dst = new_ptr + i * new_step;
                    let mut dst_word = arena.get_word(alloc.segment_id, dst);
                    copy_bits(
                        &src_word,
                        (src_bit % BITS_PER_WORD as u64) as BitCount32,
                        &mut dst_word,
                        0,
                        old_data_size,
                    );
                    arena.set_word(alloc.segment_id, dst, dst_word);
                }
            }

            let old_words =
                round_bits_up_to_words(u64::from(element_count) * u64::from(old_step)) as WordCount;
            arena.zero_words(old_segment_id, old_ptr, old_words);

            Ok(struct_list_builder_at(
                arena,
                alloc.segment_id,
                new_ptr,
                element_count,
                new_size,
            ))
        }
    }

    /// Copies the data section of `src` into `dst_words` words starting at `dst`. Bits of
    /// `src` past `dst_words` are dropped; missing bits stay zero.
    pub fn copy_data_section(
        arena: &dyn BuilderArena,
        dst_segment_id: SegmentId,
        dst: WordCount,
        dst_words: WordCount,
        src: &StructReader<'_>,
    ) -> Result<()> {
        if dst_words == 0 {
            return Ok(());
        }

        if src.data_size == 1 {
            // A struct view of a bit list element.
            if src.get_bool_field(0, false) {
                let mut word = Word::ZERO;
                bool::set_in_word(&mut word, 0, true);
                arena.set_word(dst_segment_id, dst, word);
            }
            return Ok(());
        }

        if src.data % BYTES_PER_WORD == 0 && src.data_size as usize % BITS_PER_WORD == 0 {
            let words = dst_words.min(src.data_size as usize / BITS_PER_WORD);
            let src_start = src.data / BYTES_PER_WORD;
            for i in 0..words {
                let word = src.arena.read_word(src.segment_id, src_start + i)?;
                arena.set_word(dst_segment_id, dst + i, word);
            }
        } else {
            let bytes = (dst_words * BYTES_PER_WORD).min(src.data_size as usize / BITS_PER_BYTE);
            for i in 0..bytes {
                let byte: u8 =
                    read_element(src.arena, src.segment_id, ((src.data + i) * BITS_PER_BYTE) as u64);
                let index = dst + i / BYTES_PER_WORD;
                let mut word = arena.get_word(dst_segment_id, index);
                u8::set_in_word(&mut word, ((i % BYTES_PER_WORD) * BITS_PER_BYTE) as BitCount32, byte);
                arena.set_word(dst_segment_id, index, word);
            }
        }
        Ok(())
    }

    pub fn init_struct_list_with_default<'a>(
        arena: &'a dyn BuilderArena,
        segment_id: SegmentId,
        reff: WordCount,
        element_count: ElementCount32,
        element_size: StructSize,
        element_default: Option<&[Word]>,
    ) -> Result<ListBuilder<'a>> {
        let list = init_struct_list_pointer(arena, segment_id, reff, element_count, element_size)?;
        if let Some(default) = element_default {
            if !is_null_default(default) {
                for i in 0..element_count {
                    copy_type_default_data(&list.get_struct_element(i), default)?;
                }
            }
        }
        Ok(list)
    }

    /// Copies the data section of a trusted type default into a freshly initialized struct.
    pub fn copy_type_default_data(builder: &StructBuilder<'_>, default: &[Word]) -> Result<()> {
        let value = read_default_struct(Some(default));
        debug_assert!(
            (0..value.pointer_count as WirePointerCount).all(|i| value.is_pointer_field_null(i)),
            "type default must have an all-null pointer section"
        );
        copy_data_section(
            builder.arena,
            builder.segment_id,
            builder.data / BYTES_PER_WORD,
            builder.data_size as usize / BITS_PER_WORD,
            &value,
        )
    }

    /// Nulls the pointer at `reff` after a failed copy, zeroing whatever part of the copy
    /// was already written.
    fn discard_partial_copy(arena: &dyn BuilderArena, segment_id: SegmentId, reff: WordCount) {
        zero_object(arena, segment_id, reff);
        arena.set_word(segment_id, reff, Word::ZERO);
    }

    /// Stores a deep copy of `value` at `reff`. On failure the pointer is left null.
    pub fn set_struct_pointer(
        arena: &dyn BuilderArena,
        segment_id: SegmentId,
        reff: WordCount,
        value: &StructReader<'_>,
    ) -> Result<()> {
        let result = write_struct_copy(arena, segment_id, reff, value);
        if result.is_err() {
            discard_partial_copy(arena, segment_id, reff);
        }
        result
    }

    fn write_struct_copy(
        arena: &dyn BuilderArena,
        segment_id: SegmentId,
        reff: WordCount,
        value: &StructReader<'_>,
    ) -> Result<()> {
        let data_words = round_bits_up_to_words(u64::from(value.data_size));
        let size = StructSize::new(value.field_count, data_words as WordCount8, value.pointer_count);

        let alloc = allocate(arena, segment_id, reff, size.total(), WirePointerKind::Struct)?;
        update_pointer(arena, alloc.segment_id, alloc.reff, |p| p.set_struct_size(size));

        copy_data_section(arena, alloc.segment_id, alloc.ptr, data_words as WordCount, value)?;

        let pointer_section = alloc.ptr + data_words as WordCount;
        for i in 0..value.pointer_count as WordCount {
            copy_pointer(
                arena,
                alloc.segment_id,
                pointer_section + i,
                value.arena,
                value.segment_id,
                value.pointers + i,
                value.nesting_limit,
            )?;
        }
        Ok(())
    }

    /// Stores a deep copy of `value` at `reff`. On failure the pointer is left null.
    pub fn set_list_pointer(
        arena: &dyn BuilderArena,
        segment_id: SegmentId,
        reff: WordCount,
        value: &ListReader<'_>,
    ) -> Result<()> {
        let result = write_list_copy(arena, segment_id, reff, value);
        if result.is_err() {
            discard_partial_copy(arena, segment_id, reff);
        }
        result
    }

    fn write_list_copy(
        arena: &dyn BuilderArena,
        segment_id: SegmentId,
        reff: WordCount,
        value: &ListReader<'_>,
    ) -> Result<()> {
        let element_count = value.element_count;

        if value.element_size == InlineComposite {
            let data_words = (value.struct_data_size / BITS_PER_WORD as BitCount32) as WordCount8;
            let size = StructSize::new(value.struct_field_count, data_words, value.struct_pointer_count);
            let step = size.total() as WordCount;
            let word_count = checked_list_words(u64::from(element_count) * u64::from(size.total()))?;

            let alloc = allocate(
                arena,
                segment_id,
                reff,
                word_count + POINTER_SIZE_IN_WORDS as WordCount32,
                WirePointerKind::List,
            )?;
            let ptr = write_struct_list_tag(arena, &alloc, element_count, word_count, size);

            for i in 0..element_count {
                let src = value.get_struct_element(i);
                let dst = ptr + i as WordCount * step;
                copy_data_section(arena, alloc.segment_id, dst, data_words as WordCount, &src)?;
                for j in 0..size.pointers as WordCount {
                    copy_pointer(
                        arena,
                        alloc.segment_id,
                        dst + data_words as WordCount + j,
                        src.arena,
                        src.segment_id,
                        src.pointers + j,
                        value.nesting_limit,
                    )?;
                }
            }
            return Ok(());
        }

        let total_bits = u64::from(element_count) * u64::from(value.step);
        let word_count = checked_list_words(round_bits_up_to_words(total_bits))?;

        if value.struct_pointer_count == 1 {
            let alloc = allocate(arena, segment_id, reff, word_count, WirePointerKind::List)?;
            update_pointer(arena, alloc.segment_id, alloc.reff, |p| {
                p.set_list_size_and_count(Pointer, element_count)
            });
            for i in 0..element_count {
                copy_pointer(
                    arena,
                    alloc.segment_id,
                    alloc.ptr + i as WordCount,
                    value.arena,
                    value.segment_id,
                    value.pointer_element_location(i),
                    value.nesting_limit,
                )?;
            }
            return Ok(());
        }

        let element_size = match value.step {
            0 => Void,
            1 => Bit,
            8 => Byte,
            16 => TwoBytes,
            32 => FourBytes,
            64 => EightBytes,
            step => return Err(Error::failed(format!("invalid list step size: {step}"))),
        };

        let alloc = allocate(arena, segment_id, reff, word_count, WirePointerKind::List)?;
        update_pointer(arena, alloc.segment_id, alloc.reff, |p| {
            p.set_list_size_and_count(element_size, element_count)
        });

        // Primitive lists start on a word boundary, so whole words can be copied.
        let src_start = value.ptr / BYTES_PER_WORD;
        let whole_words = (total_bits / BITS_PER_WORD as u64) as WordCount;
        for i in 0..whole_words {
            let word = value.arena.read_word(value.segment_id, src_start + i)?;
            arena.set_word(alloc.segment_id, alloc.ptr + i, word);
        }
        let leftover_bits = (total_bits % BITS_PER_WORD as u64) as BitCount32;
        if leftover_bits > 0 {
            let word = value.arena.read_word(value.segment_id, src_start + whole_words)?;
            let masked = u64::from_le_bytes(word.to_bytes()) & low_bits_mask(leftover_bits);
            arena.set_word(alloc.segment_id, alloc.ptr + whole_words, Word::from_bytes(masked.to_le_bytes()));
        }
        Ok(())
    }

    /// Deep-copies the object that the pointer at `src` refers to into a fresh object owned by
    /// the pointer at `dst`.
    pub fn copy_pointer(
        dst_arena: &dyn BuilderArena,
        dst_segment_id: SegmentId,
        dst: WordCount,
        src_arena: ArenaRef<'_>,
        src_segment_id: SegmentId,
        src: WordCount,
        nesting_limit: i32,
    ) -> Result<()> {
        let src_pointer = WirePointer::from_word(src_arena.read_word(src_segment_id, src)?);
        if src_pointer.is_null() {
            if !read_pointer(dst_arena, dst_segment_id, dst).is_null() {
                zero_object(dst_arena, dst_segment_id, dst);
            }
            dst_arena.set_word(dst_segment_id, dst, Word::ZERO);
            return Ok(());
        }

        if nesting_limit <= 0 {
            return Err(Error::from_kind(ErrorKind::MessageIsTooDeeplyNested));
        }

        let (ptr, tag, segment_id) = follow_fars(src_arena, src_pointer, src, src_segment_id)?;
        match tag.kind() {
            WirePointerKind::Struct => {
                let reader = struct_reader_from_tag(src_arena, segment_id, tag, ptr, nesting_limit)?;
                set_struct_pointer(dst_arena, dst_segment_id, dst, &reader)
            }
            WirePointerKind::List => {
                let reader =
                    list_reader_from_tag(src_arena, segment_id, tag, ptr, Void, nesting_limit)?;
                set_list_pointer(dst_arena, dst_segment_id, dst, &reader)
            }
            WirePointerKind::Far => Err(Error::from_kind(ErrorKind::MalformedDoubleFarPointer)),
            WirePointerKind::Other => {
                Err(Error::from_kind(ErrorKind::MessageContainsUnknownPointerType))
            }
        }
    }

    fn struct_reader_from_tag<'a>(
        arena: ArenaRef<'a>,
        segment_id: SegmentId,
        tag: WirePointer,
        ptr: WordCount,
        nesting_limit: i32,
    ) -> Result<StructReader<'a>> {
        if tag.kind() != WirePointerKind::Struct {
            return Err(Error::from_kind(
                ErrorKind::MessageContainsNonStructPointerWhereStructPointerWasExpected,
            ));
        }
        arena.contains_interval(segment_id, ptr, tag.struct_word_size() as WordCount)?;

        let data_words = tag.struct_data_size();
        Ok(StructReader {
            arena,
            segment_id,
            data: ptr * BYTES_PER_WORD,
            pointers: ptr + data_words as WordCount,
            data_size: u32::from(data_words) * BITS_PER_WORD as BitCount32,
            pointer_count: tag.struct_ptr_count(),
            field_count: tag.struct_field_count(),
            bit0_offset: 0,
            nesting_limit: nesting_limit - 1,
        })
    }

    fn list_reader_from_tag<'a>(
        arena: ArenaRef<'a>,
        segment_id: SegmentId,
        tag: WirePointer,
        ptr: WordCount,
        expected_element_size: ElementSize,
        nesting_limit: i32,
    ) -> Result<ListReader<'a>> {
        if tag.kind() != WirePointerKind::List {
            return Err(Error::from_kind(
                ErrorKind::MessageContainsNonListPointerWhereListPointerWasExpected,
            ));
        }

        let element_size = tag.list_element_size();
        if element_size == InlineComposite {
            let word_count = tag.list_inline_composite_word_count();
            arena.contains_interval(
                segment_id,
                ptr,
                POINTER_SIZE_IN_WORDS + word_count as WordCount,
            )?;

            let element_tag = WirePointer::from_word(arena.read_word(segment_id, ptr)?);
            let ptr = ptr + POINTER_SIZE_IN_WORDS;
            if element_tag.kind() != WirePointerKind::Struct {
                return Err(Error::from_kind(
                    ErrorKind::InlineCompositeListWithNonStructElementsNotSupported,
                ));
            }

            let element_count = element_tag.inline_composite_list_element_count();
            let words_per_element = element_tag.struct_word_size();
            if u64::from(element_count) * u64::from(words_per_element) > u64::from(word_count) {
                return Err(Error::from_kind(
                    ErrorKind::InlineCompositeListsElementsOverrunItsWordCount,
                ));
            }
            if words_per_element == 0 {
                // Zero-sized elements occupy no words, so charge for them explicitly.
                arena.amplified_read(u64::from(element_count))?;
            }

            let data_size = element_tag.struct_data_size();
            let pointer_count = element_tag.struct_ptr_count();
            match expected_element_size {
                Void | InlineComposite => {}
                Bit => {
                    return Err(Error::from_kind(
                        ErrorKind::FoundStructListWhereBitListWasExpected,
                    ));
                }
                Byte | TwoBytes | FourBytes | EightBytes => {
                    if data_size == 0 {
                        return Err(Error::from_kind(
                            ErrorKind::MessageContainsListWithIncompatibleElementType,
                        ));
                    }
                }
                Pointer => {
                    if pointer_count == 0 {
                        return Err(Error::from_kind(
                            ErrorKind::MessageContainsListWithIncompatibleElementType,
                        ));
                    }
                }
            }

            Ok(ListReader {
                arena,
                segment_id,
                ptr: ptr * BYTES_PER_WORD,
                element_count,
                step: words_per_element * BITS_PER_WORD as BitCount32,
                element_size,
                struct_data_size: u32::from(data_size) * BITS_PER_WORD as BitCount32,
                struct_pointer_count: pointer_count,
                struct_field_count: element_tag.struct_field_count(),
                nesting_limit: nesting_limit - 1,
            })
        } else {
            let data_size = data_bits_per_element(element_size);
            let pointer_count = pointers_per_element(element_size);
            let element_count = tag.list_element_count();
            let step = data_size + pointer_count * BITS_PER_POINTER as BitCount32;

            let word_count = round_bits_up_to_words(u64::from(element_count) * u64::from(step));
            arena.contains_interval(segment_id, ptr, word_count as WordCount)?;
            if element_size == Void {
                arena.amplified_read(u64::from(element_count))?;
            }

            // A narrower stored element can't satisfy a wider expectation. Struct and void
            // expectations accept anything, which is what lets a bit list read as structs.
            if data_bits_per_element(expected_element_size) > data_size
                || pointers_per_element(expected_element_size) > pointer_count
            {
                return Err(Error::from_kind(
                    ErrorKind::MessageContainsListWithIncompatibleElementType,
                ));
            }

            Ok(ListReader {
                arena,
                segment_id,
                ptr: ptr * BYTES_PER_WORD,
                element_count,
                step,
                element_size,
                struct_data_size: data_size,
                struct_pointer_count: pointer_count as WirePointerCount16,
                struct_field_count: primitive_field_count(element_size),
                nesting_limit: nesting_limit - 1,
            })
        }
    }

    /// Reads the struct pointer at `location`. `Ok(None)` means the pointer is null or absent.
    pub fn read_struct_pointer<'a>(
        arena: ArenaRef<'a>,
        segment_id: SegmentId,
        location: Option<WordCount>,
        nesting_limit: i32,
    ) -> Result<Option<StructReader<'a>>> {
        let Some(location) = location else {
            return Ok(None);
        };
        let pointer = WirePointer::from_word(arena.read_word(segment_id, location)?);
        if pointer.is_null() {
            return Ok(None);
        }
        if nesting_limit <= 0 {
            return Err(Error::from_kind(ErrorKind::MessageIsTooDeeplyNested));
        }
        let (ptr, tag, segment_id) = follow_fars(arena, pointer, location, segment_id)?;
        struct_reader_from_tag(arena, segment_id, tag, ptr, nesting_limit).map(Some)
    }

    pub fn read_list_pointer<'a>(
        arena: ArenaRef<'a>,
        segment_id: SegmentId,
        location: Option<WordCount>,
        expected_element_size: ElementSize,
        nesting_limit: i32,
    ) -> Result<Option<ListReader<'a>>> {
        let Some(location) = location else {
            return Ok(None);
        };
        let pointer = WirePointer::from_word(arena.read_word(segment_id, location)?);
        if pointer.is_null() {
            return Ok(None);
        }
        if nesting_limit <= 0 {
            return Err(Error::from_kind(ErrorKind::MessageIsTooDeeplyNested));
        }
        let (ptr, tag, segment_id) = follow_fars(arena, pointer, location, segment_id)?;
        list_reader_from_tag(arena, segment_id, tag, ptr, expected_element_size, nesting_limit)
            .map(Some)
    }

    pub fn read_default_struct(default: Option<&[Word]>) -> StructReader<'_> {
        match default {
            Some(words) if !is_null_default(words) => {
                match read_struct_pointer(ArenaRef::Trusted(words), 0, Some(0), i32::MAX) {
                    Ok(Some(reader)) => reader,
                    Ok(None) => StructReader::new_default(),
                    Err(e) => {
                        debug!(error = %e, "unreadable struct default");
                        StructReader::new_default()
                    }
                }
            }
            _ => StructReader::new_default(),
        }
    }

    pub fn read_default_list(
        default: Option<&[Word]>,
        expected_element_size: ElementSize,
    ) -> ListReader<'_> {
        match default {
            Some(words) if !is_null_default(words) => {
                match read_list_pointer(
                    ArenaRef::Trusted(words),
                    0,
                    Some(0),
                    expected_element_size,
                    i32::MAX,
                ) {
                    Ok(Some(reader)) => reader,
                    Ok(None) => ListReader::new_default(),
                    Err(e) => {
                        debug!(error = %e, "unreadable list default");
                        ListReader::new_default()
                    }
                }
            }
            _ => ListReader::new_default(),
        }
    }

    pub fn read_struct_pointer_or_default<'a>(
        arena: ArenaRef<'a>,
        segment_id: SegmentId,
        location: Option<WordCount>,
        default: Option<&'a [Word]>,
        nesting_limit: i32,
    ) -> StructReader<'a> {
        match read_struct_pointer(arena, segment_id, location, nesting_limit) {
            Ok(Some(reader)) => reader,
            Ok(None) => read_default_struct(default),
            Err(e) => {
                debug!(error = %e, segment_id, "struct pointer unreadable, using default");
                read_default_struct(default)
            }
        }
    }

    pub fn read_list_pointer_or_default<'a>(
        arena: ArenaRef<'a>,
        segment_id: SegmentId,
        location: Option<WordCount>,
        expected_element_size: ElementSize,
        default: Option<&'a [Word]>,
        nesting_limit: i32,
    ) -> ListReader<'a> {
        match read_list_pointer(arena, segment_id, location, expected_element_size, nesting_limit) {
            Ok(Some(reader)) => reader,
            Ok(None) => read_default_list(default, expected_element_size),
            Err(e) => {
                debug!(error = %e, segment_id, "list pointer unreadable, using default");
                read_default_list(default, expected_element_size)
            }
        }
    }

    /// Counts the words reachable from the pointer at `location`, validating as it goes.
    pub fn total_size(
        arena: ArenaRef<'_>,
        segment_id: SegmentId,
        location: WordCount,
        nesting_limit: i32,
    ) -> Result<MessageSize> {
        let mut result = MessageSize { word_count: 0 };
        let pointer = WirePointer::from_word(arena.read_word(segment_id, location)?);
        if pointer.is_null() {
            return Ok(result);
        }
        if nesting_limit <= 0 {
            return Err(Error::from_kind(ErrorKind::MessageIsTooDeeplyNested));
        }
        let nesting_limit = nesting_limit - 1;

        let (ptr, tag, segment_id) = follow_fars(arena, pointer, location, segment_id)?;
        match tag.kind() {
            WirePointerKind::Struct => {
                let words = tag.struct_word_size() as WordCount;
                arena.contains_interval(segment_id, ptr, words)?;
                result.word_count += words as u64;
                let pointer_section = ptr + tag.struct_data_size() as WordCount;
                for i in 0..tag.struct_ptr_count() as WordCount {
                    result.plus_eq(total_size(arena, segment_id, pointer_section + i, nesting_limit)?);
                }
            }
            WirePointerKind::List => match tag.list_element_size() {
                Void => {}
                Bit | Byte | TwoBytes | FourBytes | EightBytes => {
                    let bits = u64::from(tag.list_element_count())
                        * u64::from(data_bits_per_element(tag.list_element_size()));
                    let words = round_bits_up_to_words(bits);
                    arena.contains_interval(segment_id, ptr, words as WordCount)?;
                    result.word_count += words;
                }
                Pointer => {
                    let count = tag.list_element_count() as WordCount;
                    arena.contains_interval(segment_id, ptr, count)?;
                    result.word_count += count as u64;
                    for i in 0..count {
                        result.plus_eq(total_size(arena, segment_id, ptr + i, nesting_limit)?);
                    }
                }
                InlineComposite => {
                    let word_count = tag.list_inline_composite_word_count() as WordCount;
                    arena.contains_interval(segment_id, ptr, word_count + POINTER_SIZE_IN_WORDS)?;
                    let element_tag = WirePointer::from_word(arena.read_word(segment_id, ptr)?);
                    if element_tag.kind() != WirePointerKind::Struct {
                        return Err(Error::from_kind(
                            ErrorKind::InlineCompositeListWithNonStructElementsNotSupported,
                        ));
                    }
                    let count = element_tag.inline_composite_list_element_count() as WordCount;
                    let step = element_tag.struct_word_size() as WordCount;
                    if (count as u64) * (step as u64) > word_count as u64 {
                        return Err(Error::from_kind(
                            ErrorKind::InlineCompositeListsElementsOverrunItsWordCount,
                        ));
                    }
                    result.word_count += (count * step + POINTER_SIZE_IN_WORDS) as u64;

                    let data_size = element_tag.struct_data_size() as WordCount;
                    let pointer_count = element_tag.struct_ptr_count() as WordCount;
                    for e in 0..count {
                        let pointer_section = ptr + POINTER_SIZE_IN_WORDS + e * step + data_size;
                        for j in 0..pointer_count {
                            result.plus_eq(total_size(
                                arena,
                                segment_id,
                                pointer_section + j,
                                nesting_limit,
                            )?);
                        }
                    }
                }
            },
            WirePointerKind::Far => {
                return Err(Error::from_kind(ErrorKind::MalformedDoubleFarPointer));
            }
            WirePointerKind::Other => {
                return Err(Error::from_kind(ErrorKind::MessageContainsUnknownPointerType));
            }
        }
        Ok(result)
    }
}

/// Read-only view of one struct.
///
/// Fields past the end of the stored sections read as their defaults. A struct that came
/// from an element of a bit list has a one-bit data section whose bit 0 sits `bit0_offset`
/// bits into its first byte.
#[derive(Clone, Copy)]
pub struct StructReader<'a> {
    arena: ArenaRef<'a>,
    segment_id: SegmentId,
    /// Byte offset of the data section within the segment.
    data: ByteCount,
    /// Word index of the pointer section within the segment.
    pointers: WordCount,
    data_size: BitCount32,
    pointer_count: WirePointerCount16,
    field_count: u8,
    bit0_offset: BitCount8,
    nesting_limit: i32,
}

impl<'a> StructReader<'a> {
    pub fn new_default<'b>() -> StructReader<'b> {
        StructReader {
            arena: ArenaRef::null(),
            segment_id: 0,
            data: 0,
            pointers: 0,
            data_size: 0,
            pointer_count: 0,
            field_count: 0,
            bit0_offset: 0,
            nesting_limit: 0x7fffffff,
        }
    }

    /// Reads the struct that the pointer at word `location` of segment `segment_id` refers to.
    pub fn get_root(
        arena: ArenaRef<'a>,
        segment_id: SegmentId,
        location: WordCount,
        default: Option<&'a [Word]>,
        nesting_limit: i32,
    ) -> StructReader<'a> {
        wire_helpers::read_struct_pointer_or_default(
            arena,
            segment_id,
            Some(location),
            default,
            nesting_limit,
        )
    }

    /// Reads a trusted single-segment value whose first word is the root pointer, such as a
    /// compiled-in default.
    pub fn get_root_unchecked(value: &'a [Word]) -> StructReader<'a> {
        wire_helpers::read_default_struct(Some(value))
    }

    pub fn data_section_size(&self) -> BitCount32 {
        self.data_size
    }

    pub fn pointer_section_size(&self) -> WirePointerCount16 {
        self.pointer_count
    }

    /// Number of fields the writer's schema declared for this struct.
    pub fn field_count(&self) -> u8 {
        self.field_count
    }

    #[inline]
    fn has_data_field<T: PrimitiveElement>(&self, offset: ElementCount) -> bool {
        match (offset as u64).checked_add(1) {
            Some(end) => end.saturating_mul(u64::from(T::BITS)) <= u64::from(self.data_size),
            None => false,
        }
    }

    #[inline]
    fn data_field_bit<T: PrimitiveElement>(&self, offset: ElementCount) -> BitCount64 {
        let relative = if T::BITS == 1 && offset == 0 {
            u64::from(self.bit0_offset)
        } else {
            offset as u64 * u64::from(T::BITS)
        };
        (self.data * BITS_PER_BYTE) as u64 + relative
    }

    /// Reads the element at `offset`, counted in units of `T`'s width. Returns `default` if
    /// the data section is too short to hold it.
    #[inline]
    pub fn get_data_field<T: PrimitiveElement>(&self, offset: ElementCount, default: T) -> T {
        if self.has_data_field::<T>(offset) {
            read_element(self.arena, self.segment_id, self.data_field_bit::<T>(offset))
        } else {
            default
        }
    }

    /// Like `get_data_field()`, but also returns `default` when the writer's schema did not
    /// know field `field_number`.
    #[inline]
    pub fn get_data_field_checking_number<T: PrimitiveElement>(
        &self,
        field_number: usize,
        offset: ElementCount,
        default: T,
    ) -> T {
        if (field_number < self.field_count as usize) & self.has_data_field::<T>(offset) {
            read_element(self.arena, self.segment_id, self.data_field_bit::<T>(offset))
        } else {
            default
        }
    }

    #[inline]
    pub fn get_bool_field(&self, offset: ElementCount, default: bool) -> bool {
        self.get_data_field(offset, default)
    }

    #[inline]
    pub fn get_bool_field_checking_number(
        &self,
        field_number: usize,
        offset: ElementCount,
        default: bool,
    ) -> bool {
        self.get_data_field_checking_number(field_number, offset, default)
    }

    fn pointer_location(&self, ptr_index: WirePointerCount) -> Option<WordCount> {
        if ptr_index < self.pointer_count as WirePointerCount {
            Some(self.pointers + ptr_index)
        } else {
            None
        }
    }

    pub fn is_pointer_field_null(&self, ptr_index: WirePointerCount) -> bool {
        match self.pointer_location(ptr_index) {
            Some(location) => self
                .arena
                .read_word(self.segment_id, location)
                .map_or(true, |word| WirePointer::from_word(word).is_null()),
            None => true,
        }
    }

    /// Reads the struct behind pointer field `ptr_index`, or `default` if that pointer is
    /// absent, null, or unreadable. With no default the result is an empty struct.
    pub fn get_struct_field(
        &self,
        ptr_index: WirePointerCount,
        default: Option<&'a [Word]>,
    ) -> StructReader<'a> {
        wire_helpers::read_struct_pointer_or_default(
            self.arena,
            self.segment_id,
            self.pointer_location(ptr_index),
            default,
            self.nesting_limit,
        )
    }

    pub fn get_list_field(
        &self,
        ptr_index: WirePointerCount,
        expected_element_size: ElementSize,
        default: Option<&'a [Word]>,
    ) -> ListReader<'a> {
        wire_helpers::read_list_pointer_or_default(
            self.arena,
            self.segment_id,
            self.pointer_location(ptr_index),
            expected_element_size,
            default,
            self.nesting_limit,
        )
    }

    /// Words occupied by this struct and everything reachable from it.
    pub fn total_size(&self) -> Result<MessageSize> {
        let mut result = MessageSize {
            word_count: round_bits_up_to_words(u64::from(self.data_size))
                + u64::from(self.pointer_count),
        };
        for i in 0..self.pointer_count as WordCount {
            result.plus_eq(wire_helpers::total_size(
                self.arena,
                self.segment_id,
                self.pointers + i,
                self.nesting_limit,
            )?);
        }
        Ok(result)
    }
}

/// Mutable view of one struct. Always backed by memory of the requested size or larger.
/// Like [`StructReader`], a view of a bit list element keeps its bit within the first byte
/// in `bit0_offset`.
#[derive(Clone, Copy)]
pub struct StructBuilder<'a> {
    arena: &'a dyn BuilderArena,
    segment_id: SegmentId,
    data: ByteCount,
    pointers: WordCount,
    data_size: BitCount32,
    pointer_count: WirePointerCount16,
    field_count: u8,
    bit0_offset: BitCount8,
}

impl<'a> StructBuilder<'a> {
    /// Allocates a fresh struct for the root pointer at `location`, discarding whatever
    /// was there.
    pub fn init_root(
        arena: &'a dyn BuilderArena,
        segment_id: SegmentId,
        location: WordCount,
        size: StructSize,
    ) -> Result<StructBuilder<'a>> {
        wire_helpers::init_struct_pointer(arena, segment_id, location, size)
    }

    pub fn get_root(
        arena: &'a dyn BuilderArena,
        segment_id: SegmentId,
        location: WordCount,
        size: StructSize,
        default: Option<&[Word]>,
    ) -> Result<StructBuilder<'a>> {
        wire_helpers::get_writable_struct_pointer(arena, segment_id, location, size, default)
    }

    pub fn set_root(
        arena: &'a dyn BuilderArena,
        segment_id: SegmentId,
        location: WordCount,
        value: &StructReader<'_>,
    ) -> Result<()> {
        wire_helpers::set_struct_pointer(arena, segment_id, location, value)
    }

    pub fn as_reader(self) -> StructReader<'a> {
        StructReader {
            arena: ArenaRef::Message(self.arena.as_reader()),
            segment_id: self.segment_id,
            data: self.data,
            pointers: self.pointers,
            data_size: self.data_size,
            pointer_count: self.pointer_count,
            field_count: self.field_count,
            bit0_offset: self.bit0_offset,
            nesting_limit: 0x7fffffff,
        }
    }

    pub fn data_section_size(&self) -> BitCount32 {
        self.data_size
    }

    pub fn pointer_section_size(&self) -> WirePointerCount16 {
        self.pointer_count
    }

    pub fn field_count(&self) -> u8 {
        self.field_count
    }

    #[inline]
    fn data_field_bit<T: PrimitiveElement>(&self, offset: ElementCount) -> BitCount64 {
        debug_assert!(
            (offset as u64 + 1) * u64::from(T::BITS) <= u64::from(self.data_size),
            "data field out of range"
        );
        let relative = if T::BITS == 1 && offset == 0 {
            u64::from(self.bit0_offset)
        } else {
            offset as u64 * u64::from(T::BITS)
        };
        (self.data * BITS_PER_BYTE) as u64 + relative
    }

    #[inline]
    pub fn get_data_field<T: PrimitiveElement>(&self, offset: ElementCount) -> T {
        get_builder_element(self.arena, self.segment_id, self.data_field_bit::<T>(offset))
    }

    #[inline]
    pub fn set_data_field<T: PrimitiveElement>(&self, offset: ElementCount, value: T) {
        set_builder_element(self.arena, self.segment_id, self.data_field_bit::<T>(offset), value)
    }

    #[inline]
    pub fn get_bool_field(&self, offset: ElementCount) -> bool {
        self.get_data_field(offset)
    }

    #[inline]
    pub fn set_bool_field(&self, offset: ElementCount, value: bool) {
        self.set_data_field(offset, value)
    }

    fn pointer_location(&self, ptr_index: WirePointerCount) -> Result<WordCount> {
        if ptr_index < self.pointer_count as WirePointerCount {
            Ok(self.pointers + ptr_index)
        } else {
            Err(Error::failed(format!(
                "pointer index {ptr_index} out of range for struct with {} pointers",
                self.pointer_count
            )))
        }
    }

    pub fn is_pointer_field_null(&self, ptr_index: WirePointerCount) -> bool {
        match self.pointer_location(ptr_index) {
            Ok(location) => WirePointer::from_word(self.arena.get_word(self.segment_id, location)).is_null(),
            Err(_) => true,
        }
    }

    /// Nulls pointer field `ptr_index`, zeroing the object it referred to.
    pub fn clear_pointer_field(&self, ptr_index: WirePointerCount) {
        if let Ok(location) = self.pointer_location(ptr_index) {
            wire_helpers::zero_object(self.arena, self.segment_id, location);
            self.arena.set_word(self.segment_id, location, Word::ZERO);
        }
    }

    /// Replaces pointer field `ptr_index` with a fresh struct of `size`. If `type_default` is
    /// given, its data section becomes the initial contents.
    pub fn init_struct_field(
        &self,
        ptr_index: WirePointerCount,
        size: StructSize,
        type_default: Option<&[Word]>,
    ) -> Result<StructBuilder<'a>> {
        let location = self.pointer_location(ptr_index)?;
        let builder = wire_helpers::init_struct_pointer(self.arena, self.segment_id, location, size)?;
        if let Some(default) = type_default {
            wire_helpers::copy_type_default_data(&builder, default)?;
        }
        Ok(builder)
    }

    /// Opens the struct in pointer field `ptr_index` for writing. A null field is first
    /// filled with a copy of `default` (or a zeroed struct); a stored struct smaller than
    /// `size` is moved into a larger allocation.
    pub fn get_struct_field(
        &self,
        ptr_index: WirePointerCount,
        size: StructSize,
        default: Option<&[Word]>,
    ) -> Result<StructBuilder<'a>> {
        let location = self.pointer_location(ptr_index)?;
        wire_helpers::get_writable_struct_pointer(self.arena, self.segment_id, location, size, default)
    }

    pub fn init_list_field(
        &self,
        ptr_index: WirePointerCount,
        element_size: ElementSize,
        element_count: ElementCount32,
    ) -> Result<ListBuilder<'a>> {
        let location = self.pointer_location(ptr_index)?;
        wire_helpers::init_list_pointer(self.arena, self.segment_id, location, element_count, element_size)
    }

    /// Replaces pointer field `ptr_index` with a list of `element_count` structs. Each element
    /// starts with the data section of `element_default`, if given.
    pub fn init_struct_list_field(
        &self,
        ptr_index: WirePointerCount,
        element_count: ElementCount32,
        element_size: StructSize,
        element_default: Option<&[Word]>,
    ) -> Result<ListBuilder<'a>> {
        let location = self.pointer_location(ptr_index)?;
        wire_helpers::init_struct_list_with_default(
            self.arena,
            self.segment_id,
            location,
            element_count,
            element_size,
            element_default,
        )
    }

    pub fn get_list_field(
        &self,
        ptr_index: WirePointerCount,
        element_size: ElementSize,
        default: Option<&[Word]>,
    ) -> Result<ListBuilder<'a>> {
        let location = self.pointer_location(ptr_index)?;
        wire_helpers::get_writable_list_pointer(self.arena, self.segment_id, location, element_size, default)
    }

    /// Opens the struct list in pointer field `ptr_index`. Stored elements smaller than
    /// `element_size`, and primitive or pointer lists, are upgraded to a struct list first.
    pub fn get_struct_list_field(
        &self,
        ptr_index: WirePointerCount,
        element_size: StructSize,
        default: Option<&[Word]>,
    ) -> Result<ListBuilder<'a>> {
        let location = self.pointer_location(ptr_index)?;
        wire_helpers::get_writable_struct_list_pointer(
            self.arena,
            self.segment_id,
            location,
            element_size,
            default,
        )
    }

    /// Stores a deep copy of `value` in pointer field `ptr_index`.
    pub fn set_struct_field(&self, ptr_index: WirePointerCount, value: &StructReader<'_>) -> Result<()> {
        let location = self.pointer_location(ptr_index)?;
        wire_helpers::set_struct_pointer(self.arena, self.segment_id, location, value)
    }

    pub fn set_list_field(&self, ptr_index: WirePointerCount, value: &ListReader<'_>) -> Result<()> {
        let location = self.pointer_location(ptr_index)?;
        wire_helpers::set_list_pointer(self.arena, self.segment_id, location, value)
    }
}

#[derive(Clone, Copy)]
pub struct ListReader<'a> {
    arena: ArenaRef<'a>,
    segment_id: SegmentId,
    /// Byte offset of element 0 within the segment.
    ptr: ByteCount,
    element_count: ElementCount32,
    step: BitCount32,
    element_size: ElementSize,
    struct_data_size: BitCount32,
    struct_pointer_count: WirePointerCount16,
    struct_field_count: u8,
    nesting_limit: i32,
}

impl<'a> ListReader<'a> {
    pub fn new_default<'b>() -> ListReader<'b> {
        ListReader {
            arena: ArenaRef::null(),
            segment_id: 0,
            ptr: 0,
            element_count: 0,
            step: 0,
            element_size: ElementSize::Void,
            struct_data_size: 0,
            struct_pointer_count: 0,
            struct_field_count: 0,
            nesting_limit: 0x7fffffff,
        }
    }

    #[inline]
    pub fn len(&self) -> ElementCount32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element size as stored, which may differ from what the caller expected.
    pub fn element_size(&self) -> ElementSize {
        self.element_size
    }

    /// Distance between consecutive elements, in bits.
    pub fn step(&self) -> BitCount32 {
        self.step
    }

    #[inline]
    fn element_bit(&self, index: ElementCount32) -> BitCount64 {
        (self.ptr * BITS_PER_BYTE) as u64 + u64::from(index) * u64::from(self.step)
    }

    #[inline]
    pub fn get_data_element<T: PrimitiveElement>(&self, index: ElementCount32) -> T {
        if index >= self.element_count {
            return T::default();
        }
        read_element(self.arena, self.segment_id, self.element_bit(index))
    }

    /// Views element `index` as a struct. Works for every list kind: an element of a
    /// primitive list is a struct whose data section is that one element.
    pub fn get_struct_element(&self, index: ElementCount32) -> StructReader<'a> {
        if index >= self.element_count {
            return StructReader::new_default();
        }
        let index_bit = u64::from(index) * u64::from(self.step);
        let struct_data = self.ptr + (index_bit / BITS_PER_BYTE as u64) as ByteCount;
        let struct_pointers =
            (struct_data + self.struct_data_size as ByteCount / BITS_PER_BYTE) / BYTES_PER_WORD;

        StructReader {
            arena: self.arena,
            segment_id: self.segment_id,
            data: struct_data,
            pointers: struct_pointers,
            data_size: self.struct_data_size,
            pointer_count: self.struct_pointer_count,
            field_count: self.struct_field_count,
            bit0_offset: (index_bit % BITS_PER_BYTE as u64) as BitCount8,
            nesting_limit: self.nesting_limit,
        }
    }

    /// Word holding the first pointer of element `index`, past its data section.
    fn pointer_element_location(&self, index: ElementCount32) -> WordCount {
        let index_byte = u64::from(index) * u64::from(self.step) / BITS_PER_BYTE as u64;
        let data_bytes = self.struct_data_size as ByteCount / BITS_PER_BYTE;
        (self.ptr + index_byte as ByteCount + data_bytes) / BYTES_PER_WORD
    }

    /// Reads the list that pointer element `index` refers to, falling back to `default`.
    pub fn get_list_element(
        &self,
        index: ElementCount32,
        expected_element_size: ElementSize,
        default: Option<&'a [Word]>,
    ) -> ListReader<'a> {
        let location = if index < self.element_count && self.struct_pointer_count > 0 {
            Some(self.pointer_element_location(index))
        } else {
            None
        };
        wire_helpers::read_list_pointer_or_default(
            self.arena,
            self.segment_id,
            location,
            expected_element_size,
            default,
            self.nesting_limit,
        )
    }
}

#[derive(Clone, Copy)]
pub struct ListBuilder<'a> {
    arena: &'a dyn BuilderArena,
    segment_id: SegmentId,
    ptr: ByteCount,
    element_count: ElementCount32,
    step: BitCount32,
    element_size: ElementSize,
    struct_data_size: BitCount32,
    struct_pointer_count: WirePointerCount16,
    struct_field_count: u8,
}

impl<'a> ListBuilder<'a> {
    /// An empty list that owns no memory.
    pub fn new_default<'b>() -> ListBuilder<'b> {
        ListBuilder {
            arena: &NullArena,
            segment_id: 0,
            ptr: 0,
            element_count: 0,
            step: 0,
            element_size: ElementSize::Void,
            struct_data_size: 0,
            struct_pointer_count: 0,
            struct_field_count: 0,
        }
    }

    pub fn as_reader(self) -> ListReader<'a> {
        ListReader {
            arena: ArenaRef::Message(self.arena.as_reader()),
            segment_id: self.segment_id,
            ptr: self.ptr,
            element_count: self.element_count,
            step: self.step,
            element_size: self.element_size,
            struct_data_size: self.struct_data_size,
            struct_pointer_count: self.struct_pointer_count,
            struct_field_count: self.struct_field_count,
            nesting_limit: 0x7fffffff,
        }
    }

    #[inline]
    pub fn len(&self) -> ElementCount32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_size(&self) -> ElementSize {
        self.element_size
    }

    #[inline]
    fn element_bit(&self, index: ElementCount32) -> BitCount64 {
        debug_assert!(index < self.element_count, "list index out of range");
        (self.ptr * BITS_PER_BYTE) as u64 + u64::from(index) * u64::from(self.step)
    }

    #[inline]
    pub fn get_data_element<T: PrimitiveElement>(&self, index: ElementCount32) -> T {
        get_builder_element(self.arena, self.segment_id, self.element_bit(index))
    }

    #[inline]
    pub fn set_data_element<T: PrimitiveElement>(&self, index: ElementCount32, value: T) {
        set_builder_element(self.arena, self.segment_id, self.element_bit(index), value)
    }

    pub fn get_struct_element(&self, index: ElementCount32) -> StructBuilder<'a> {
        let index_bit = self.element_bit(index) - (self.ptr * BITS_PER_BYTE) as u64;
        let struct_data = self.ptr + (index_bit / BITS_PER_BYTE as u64) as ByteCount;
        let struct_pointers =
            (struct_data + self.struct_data_size as ByteCount / BITS_PER_BYTE) / BYTES_PER_WORD;
        StructBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            data: struct_data,
            pointers: struct_pointers,
            data_size: self.struct_data_size,
            pointer_count: self.struct_pointer_count,
            field_count: self.struct_field_count,
            bit0_offset: (index_bit % BITS_PER_BYTE as u64) as BitCount8,
        }
    }

    fn pointer_element_location(&self, index: ElementCount32) -> Result<WordCount> {
        if index >= self.element_count || self.struct_pointer_count == 0 {
            return Err(Error::failed(format!(
                "list element {index} is not a pointer"
            )));
        }
        let index_byte = u64::from(index) * u64::from(self.step) / BITS_PER_BYTE as u64;
        let data_bytes = self.struct_data_size as ByteCount / BITS_PER_BYTE;
        Ok((self.ptr + index_byte as ByteCount + data_bytes) / BYTES_PER_WORD)
    }

    pub fn init_list_element(
        &self,
        index: ElementCount32,
        element_size: ElementSize,
        element_count: ElementCount32,
    ) -> Result<ListBuilder<'a>> {
        let location = self.pointer_element_location(index)?;
        wire_helpers::init_list_pointer(self.arena, self.segment_id, location, element_count, element_size)
    }

    /// Replaces pointer element `index` with a list of `element_count` structs, each
    /// starting with the data section of `element_default`, if given.
    pub fn init_struct_list_element(
        &self,
        index: ElementCount32,
        element_count: ElementCount32,
        element_size: StructSize,
        element_default: Option<&[Word]>,
    ) -> Result<ListBuilder<'a>> {
        let location = self.pointer_element_location(index)?;
        wire_helpers::init_struct_list_with_default(
            self.arena,
            self.segment_id,
            location,
            element_count,
            element_size,
            element_default,
        )
    }

    pub fn get_list_element(
        &self,
        index: ElementCount32,
        element_size: ElementSize,
        default: Option<&[Word]>,
    ) -> Result<ListBuilder<'a>> {
        let location = self.pointer_element_location(index)?;
        wire_helpers::get_writable_list_pointer(self.arena, self.segment_id, location, element_size, default)
    }

    pub fn get_struct_list_element(
        &self,
        index: ElementCount32,
        element_size: StructSize,
        default: Option<&[Word]>,
    ) -> Result<ListBuilder<'a>> {
        let location = self.pointer_element_location(index)?;
        wire_helpers::get_writable_struct_list_pointer(
            self.arena,
            self.segment_id,
            location,
            element_size,
            default,
        )
    }

    pub fn set_list_element(&self, index: ElementCount32, value: &ListReader<'_>) -> Result<()> {
        let location = self.pointer_element_location(index)?;
        wire_helpers::set_list_pointer(self.arena, self.segment_id, location, value)
    }
}

impl core::fmt::Debug for StructReader<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StructReader")
            .field("segment_id", &self.segment_id)
            .field("data_size", &self.data_size)
            .field("pointer_count", &self.pointer_count)
            .field("field_count", &self.field_count)
            .finish()
    }
}

impl core::fmt::Debug for ListReader<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListReader")
            .field("segment_id", &self.segment_id)
            .field("element_count", &self.element_count)
            .field("element_size", &self.element_size)
            .field("step", &self.step)
            .finish()
    }
}
