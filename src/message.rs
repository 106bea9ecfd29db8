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

//! Untyped root containers for a message.
//!
//! A [`Reader`] wraps segments that came from somewhere else and hands out the root struct.
//! A [`Builder`] owns its segments, obtained from an [`Allocator`], and lays the root pointer
//! down in the first word of segment 0.

use tracing::trace;

use crate::private::arena::{ArenaRef, BuilderArena, BuilderArenaImpl, ReaderArena, ReaderArenaImpl};
use crate::private::layout::{StructBuilder, StructReader, StructSize};
use crate::private::units::*;
use crate::{Error, ErrorKind, Result, Word};

/// Options controlling how data is read.
#[derive(Clone, Copy, Debug)]
pub struct ReaderOptions {
    /// Total number of words a reader may traverse. Every struct or list obtained through an
    /// accessor is charged again, so a message whose pointers alias each other cannot make
    /// traversal arbitrarily more expensive than its size on the wire.
    ///
    /// Once the budget is used up, further struct and list accessors return their defaults.
    pub traversal_limit_in_words: u64,

    /// How many pointers deep a reader will follow. Structs and lists below this depth read as
    /// their defaults. Keeps recursive traversals of hostile or cyclic messages off the end
    /// of the stack.
    pub nesting_limit: i32,
}

pub const DEFAULT_READER_OPTIONS: ReaderOptions = ReaderOptions {
    traversal_limit_in_words: 8 * 1024 * 1024,
    nesting_limit: 64,
};

impl Default for ReaderOptions {
    fn default() -> Self {
        DEFAULT_READER_OPTIONS
    }
}

impl ReaderOptions {
    pub fn new() -> Self {
        DEFAULT_READER_OPTIONS
    }

    pub fn nesting_limit(&mut self, value: i32) -> &mut Self {
        self.nesting_limit = value;
        self
    }

    pub fn traversal_limit_in_words(&mut self, value: u64) -> &mut Self {
        self.traversal_limit_in_words = value;
        self
    }
}

/// An object that manages the buffers underlying a message reader.
pub trait ReaderSegments {
    /// Gets the segment with index `idx`. Returns `None` if `idx` is out of range.
    fn get_segment(&self, idx: u32) -> Option<&[Word]>;

    /// Gets the number of segments.
    fn len(&self) -> usize {
        let mut result = 0;
        while self.get_segment(result as u32).is_some() {
            result += 1;
        }
        result
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S> ReaderSegments for &S
where
    S: ReaderSegments + ?Sized,
{
    fn get_segment(&self, idx: u32) -> Option<&[Word]> {
        (**self).get_segment(idx)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// An array of segments.
pub struct SegmentArray<'a> {
    segments: &'a [&'a [Word]],
}

impl<'a> SegmentArray<'a> {
    pub fn new(segments: &'a [&'a [Word]]) -> SegmentArray<'a> {
        SegmentArray { segments }
    }
}

impl ReaderSegments for SegmentArray<'_> {
    fn get_segment(&self, id: u32) -> Option<&[Word]> {
        self.segments.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        self.segments.len()
    }
}

impl ReaderSegments for [&[Word]] {
    fn get_segment(&self, id: u32) -> Option<&[Word]> {
        self.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        <[&[Word]]>::len(self)
    }
}

impl ReaderSegments for Vec<Vec<Word>> {
    fn get_segment(&self, id: u32) -> Option<&[Word]> {
        self.get(id as usize).map(|segment| segment.as_slice())
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }
}

/// A container used to read a message.
pub struct Reader<S>
where
    S: ReaderSegments,
{
    arena: ReaderArenaImpl<S>,
}

impl<S> Reader<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        Self {
            arena: ReaderArenaImpl::new(segments, options),
        }
    }

    /// Gets the root struct. If the message is empty or its root pointer cannot be read, this
    /// is `default`, or an empty struct when `default` is `None`.
    pub fn get_root<'a>(&'a self, default: Option<&'a [Word]>) -> StructReader<'a> {
        StructReader::get_root(
            ArenaRef::Message(&self.arena),
            0,
            0,
            default,
            self.arena.nesting_limit(),
        )
    }

    pub fn into_segments(self) -> S {
        self.arena.into_segments()
    }
}

/// An object that allocates memory for a message as it is being built.
pub trait Allocator {
    /// Allocates zeroed memory for a new segment of at least `minimum_size` words. The
    /// length of the returned vector is the capacity of the segment.
    fn allocate_segment(&mut self, minimum_size: u32) -> Result<Vec<Word>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Allocates the same number of words for each segment, to the extent possible.
    /// This strategy is primarily useful for testing cross-segment pointers.
    FixedSize,

    /// Increases segment size by a multiplicative factor for each subsequent segment.
    GrowHeuristically,
}

pub const SUGGESTED_FIRST_SEGMENT_WORDS: u32 = 1024;
pub const SUGGESTED_ALLOCATION_STRATEGY: AllocationStrategy = AllocationStrategy::GrowHeuristically;

/// An `Allocator` whose segments are vectors on the heap.
#[derive(Debug)]
pub struct HeapAllocator {
    // Minimum number of words in the next allocation.
    next_size: u32,

    // How to update next_size after an allocation.
    allocation_strategy: AllocationStrategy,

    // Maximum number of words to allocate in any one segment.
    max_segment_words: u32,

    // Budget across all segments, if any.
    max_total_words: Option<u64>,

    total_words: u64,
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self {
            next_size: SUGGESTED_FIRST_SEGMENT_WORDS,
            allocation_strategy: SUGGESTED_ALLOCATION_STRATEGY,
            max_segment_words: MAX_SEGMENT_WORDS,
            max_total_words: None,
            total_words: 0,
        }
    }

    /// Sets the size of the initial segment in words, where 1 word = 8 bytes.
    pub fn first_segment_words(mut self, value: u32) -> Self {
        self.next_size = value.min(self.max_segment_words);
        self
    }

    /// Sets the allocation strategy for segments after the first one.
    pub fn allocation_strategy(mut self, value: AllocationStrategy) -> Self {
        self.allocation_strategy = value;
        self
    }

    /// Caps the size of any one segment. Requests for more than this still get what they
    /// ask for, up to the wire limit of 2^29 words.
    pub fn max_segment_words(mut self, value: u32) -> Self {
        self.max_segment_words = value.min(MAX_SEGMENT_WORDS);
        self.next_size = self.next_size.min(self.max_segment_words);
        self
    }

    /// Limits the total number of words across all segments. Once a request cannot be met
    /// within the budget, allocation fails with `ErrorKind::AllocationLimitExceeded`.
    pub fn max_total_words(mut self, value: u64) -> Self {
        self.max_total_words = Some(value);
        self
    }
}

impl Allocator for HeapAllocator {
    fn allocate_segment(&mut self, minimum_size: u32) -> Result<Vec<Word>> {
        if minimum_size > MAX_SEGMENT_WORDS {
            return Err(Error::from_kind(ErrorKind::SegmentTooLarge));
        }

        let mut size = core::cmp::max(minimum_size, self.next_size);
        if let Some(max_total_words) = self.max_total_words {
            let remaining = max_total_words.saturating_sub(self.total_words);
            if u64::from(minimum_size) > remaining {
                trace!(
                    requested = minimum_size,
                    remaining,
                    "allocation budget exhausted"
                );
                return Err(Error::from_kind(ErrorKind::AllocationLimitExceeded));
            }
            if u64::from(size) > remaining {
                size = remaining as u32;
            }
        }

        self.total_words += u64::from(size);
        if let AllocationStrategy::GrowHeuristically = self.allocation_strategy {
            if size < self.max_segment_words - self.next_size {
                self.next_size += size;
            } else {
                self.next_size = self.max_segment_words;
            }
        }
        Ok(Word::allocate_zeroed_vec(size as usize))
    }
}

/// A container used to build a message.
pub struct Builder<A>
where
    A: Allocator,
{
    arena: BuilderArenaImpl<A>,
}

impl<A> Builder<A>
where
    A: Allocator,
{
    pub fn new(allocator: A) -> Self {
        Self {
            arena: BuilderArenaImpl::new(allocator),
        }
    }

    /// Makes sure segment 0 exists and that its first word is reserved for the root pointer.
    fn get_root_internal(&mut self) -> Result<()> {
        if self.arena.is_empty() {
            self.arena.allocate_segment(POINTER_SIZE_IN_WORDS as u32)?;
            if self.arena.allocate(0, POINTER_SIZE_IN_WORDS as u32) != Some(0) {
                return Err(Error::failed("could not reserve the root pointer".to_string()));
            }
        }
        Ok(())
    }

    /// Initializes the root as a fresh struct of `size`, discarding any previous root.
    pub fn init_root(&mut self, size: StructSize) -> Result<StructBuilder<'_>> {
        self.get_root_internal()?;
        StructBuilder::init_root(&self.arena, 0, 0, size)
    }

    /// Gets the root struct for writing. A message without a root gets a copy of `default`,
    /// or a zeroed struct of `size`.
    pub fn get_root(
        &mut self,
        size: StructSize,
        default: Option<&[Word]>,
    ) -> Result<StructBuilder<'_>> {
        self.get_root_internal()?;
        StructBuilder::get_root(&self.arena, 0, 0, size, default)
    }

    /// Reads the root of the message as built so far.
    pub fn get_root_as_reader(&self) -> StructReader<'_> {
        if self.arena.is_empty() {
            StructReader::new_default()
        } else {
            StructReader::get_root(
                ArenaRef::Message(&self.arena),
                0,
                0,
                None,
                i32::MAX,
            )
        }
    }

    /// Replaces the root with a deep copy of `value`.
    pub fn set_root(&mut self, value: &StructReader<'_>) -> Result<()> {
        self.get_root_internal()?;
        StructBuilder::set_root(&self.arena, 0, 0, value)
    }

    /// Copies out the used part of each segment, ready to be framed and sent.
    pub fn get_segments_for_output(&self) -> Vec<Vec<Word>> {
        self.arena.get_segments_for_output()
    }

    /// Finishes building and hands the segments to a reader. Data written by this process
    /// is trusted, so the reader has no traversal or nesting budget.
    pub fn into_reader(self) -> Reader<Vec<Vec<Word>>> {
        Reader::new(
            self.arena.into_segments(),
            ReaderOptions {
                traversal_limit_in_words: u64::MAX,
                nesting_limit: i32::MAX,
            },
        )
    }

    /// Total number of words in use across all segments.
    pub fn size_in_words(&self) -> usize {
        self.arena.size_in_words()
    }

    /// Retrieves the underlying `Allocator`, deallocating all currently-allocated
    /// segments.
    pub fn into_allocator(self) -> A {
        self.arena.into_allocator()
    }
}

impl Builder<HeapAllocator> {
    pub fn new_default() -> Self {
        Self::new(HeapAllocator::new())
    }
}
