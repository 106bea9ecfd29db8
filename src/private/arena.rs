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

use core::cell::RefCell;

use tracing::trace;

use crate::message;
use crate::message::{Allocator, ReaderSegments};
use crate::private::read_limiter::ReadLimiter;
use crate::private::units::*;
use crate::{Error, ErrorKind, Result, Word};

pub type SegmentId = u32;

fn out_of_bounds() -> Error {
    Error::from_kind(ErrorKind::MessageContainsOutOfBoundsPointer)
}

/// Resolves a pointer offset against a segment of `segment_len` words. The target may sit
/// one past the last word, which is where zero-sized objects point.
#[inline]
pub fn offset_in_bounds(segment_len: usize, start: usize, offset_in_words: i32) -> Result<usize> {
    let target = start as i64 + i64::from(offset_in_words);
    if target < 0 || target as u64 > segment_len as u64 {
        Err(out_of_bounds())
    } else {
        Ok(target as usize)
    }
}

#[inline]
pub fn interval_in_bounds(segment_len: usize, start: usize, size_in_words: usize) -> Result<()> {
    match start.checked_add(size_in_words) {
        Some(end) if end <= segment_len => Ok(()),
        _ => Err(out_of_bounds()),
    }
}

pub trait ReaderArena {
    /// Returns the number of readable words in segment `id`.
    fn get_segment_len(&self, id: SegmentId) -> Result<usize>;

    fn read_word(&self, id: SegmentId, index: usize) -> Result<Word>;

    fn check_offset(
        &self,
        segment_id: SegmentId,
        start: usize,
        offset_in_words: i32,
    ) -> Result<usize> {
        offset_in_bounds(self.get_segment_len(segment_id)?, start, offset_in_words)
    }

    /// Checks that `size_in_words` words starting at `start` lie inside the segment, and
    /// charges them against the traversal limit.
    fn contains_interval(&self, segment_id: SegmentId, start: usize, size: usize) -> Result<()>;

    fn amplified_read(&self, virtual_amount: u64) -> Result<()>;

    fn nesting_limit(&self) -> i32;
}

pub struct ReaderArenaImpl<S> {
    segments: S,
    read_limiter: ReadLimiter,
    nesting_limit: i32,
}

#[cfg(feature = "sync_reader")]
fn _assert_sync() {
    fn _assert_sync<T: Sync>() {}
    fn _assert_reader<S: ReaderSegments + Sync>() {
        _assert_sync::<ReaderArenaImpl<S>>();
    }
}

impl<S> ReaderArenaImpl<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: message::ReaderOptions) -> Self {
        let limiter = ReadLimiter::new(options.traversal_limit_in_words);
        Self {
            segments,
            read_limiter: limiter,
            nesting_limit: options.nesting_limit,
        }
    }

    pub fn into_segments(self) -> S {
        self.segments
    }

    fn get_segment(&self, id: SegmentId) -> Result<&[Word]> {
        self.segments
            .get_segment(id)
            .ok_or_else(|| Error::from_kind(ErrorKind::InvalidSegmentId(id)))
    }
}

impl<S> ReaderArena for ReaderArenaImpl<S>
where
    S: ReaderSegments,
{
    fn get_segment_len(&self, id: SegmentId) -> Result<usize> {
        Ok(self.get_segment(id)?.len())
    }

    fn read_word(&self, id: SegmentId, index: usize) -> Result<Word> {
        self.get_segment(id)?
            .get(index)
            .copied()
            .ok_or_else(out_of_bounds)
    }

    fn contains_interval(&self, id: SegmentId, start: usize, size_in_words: usize) -> Result<()> {
        interval_in_bounds(self.get_segment_len(id)?, start, size_in_words)?;
        self.read_limiter.can_read(size_in_words)
    }

    fn amplified_read(&self, virtual_amount: u64) -> Result<()> {
        self.read_limiter
            .can_read(usize::try_from(virtual_amount).unwrap_or(usize::MAX))
    }

    fn nesting_limit(&self) -> i32 {
        self.nesting_limit
    }
}

/// The arena a reader cursor reads through: either a message, or a trusted default value
/// that lives in a single static slice.
///
/// Trusted values are still bounds-checked, but are not charged to any traversal limit.
#[derive(Clone, Copy)]
pub enum ArenaRef<'a> {
    Message(&'a dyn ReaderArena),
    Trusted(&'a [Word]),
}

impl<'a> ArenaRef<'a> {
    /// An arena with no segments at all. Everything read through it is absent.
    pub fn null() -> ArenaRef<'static> {
        ArenaRef::Trusted(&[])
    }

    fn trusted_segment(words: &'a [Word], id: SegmentId) -> Result<&'a [Word]> {
        if id == 0 {
            Ok(words)
        } else {
            Err(Error::from_kind(ErrorKind::InvalidSegmentId(id)))
        }
    }

    pub fn get_segment_len(&self, id: SegmentId) -> Result<usize> {
        match *self {
            ArenaRef::Message(arena) => arena.get_segment_len(id),
            ArenaRef::Trusted(words) => Ok(Self::trusted_segment(words, id)?.len()),
        }
    }

    #[inline]
    pub fn read_word(&self, id: SegmentId, index: usize) -> Result<Word> {
        match *self {
            ArenaRef::Message(arena) => arena.read_word(id, index),
            ArenaRef::Trusted(words) => Self::trusted_segment(words, id)?
                .get(index)
                .copied()
                .ok_or_else(out_of_bounds),
        }
    }

    pub fn check_offset(&self, id: SegmentId, start: usize, offset_in_words: i32) -> Result<usize> {
        match *self {
            ArenaRef::Message(arena) => arena.check_offset(id, start, offset_in_words),
            ArenaRef::Trusted(words) => {
                offset_in_bounds(Self::trusted_segment(words, id)?.len(), start, offset_in_words)
            }
        }
    }

    pub fn contains_interval(&self, id: SegmentId, start: usize, size: usize) -> Result<()> {
        match *self {
            ArenaRef::Message(arena) => arena.contains_interval(id, start, size),
            ArenaRef::Trusted(words) => {
                interval_in_bounds(Self::trusted_segment(words, id)?.len(), start, size)
            }
        }
    }

    pub fn amplified_read(&self, virtual_amount: u64) -> Result<()> {
        match *self {
            ArenaRef::Message(arena) => arena.amplified_read(virtual_amount),
            ArenaRef::Trusted(_) => Ok(()),
        }
    }
}

/// Memory a builder writes into.
///
/// Methods take `&self`: cursors are `Copy` values that all share one arena, and each call
/// borrows the segment storage only for its own duration. Word indices handed to
/// `get_word`, `set_word`, `zero_words` and `copy_words` must come from earlier allocations.
pub trait BuilderArena: ReaderArena {
    /// Allocates `amount` words at the end of segment `segment_id`, if it has room. Returns
    /// the index of the first allocated word.
    fn allocate(&self, segment_id: SegmentId, amount: WordCount32) -> Option<usize>;

    /// Allocates `amount` words in any segment, creating a new one if needed.
    fn allocate_anywhere(&self, amount: WordCount32) -> Result<(SegmentId, usize)>;

    fn get_word(&self, segment_id: SegmentId, index: usize) -> Word;

    fn set_word(&self, segment_id: SegmentId, index: usize, value: Word);

    fn zero_words(&self, segment_id: SegmentId, start: usize, count: usize);

    fn copy_words(
        &self,
        src_segment_id: SegmentId,
        src_start: usize,
        dst_segment_id: SegmentId,
        dst_start: usize,
        count: usize,
    );

    fn as_reader(&self) -> &dyn ReaderArena;
}

/// A wrapper around a memory segment used in building a message.
struct BuilderSegment {
    /// Backing storage. Its length is the segment's capacity and never changes.
    words: Vec<Word>,

    /// Number of words already used in the segment.
    allocated: usize,
}

struct BuilderArenaImplInner<A>
where
    A: Allocator,
{
    allocator: A,
    segments: Vec<BuilderSegment>,
}

pub struct BuilderArenaImpl<A>
where
    A: Allocator,
{
    inner: RefCell<BuilderArenaImplInner<A>>,
}

impl<A> BuilderArenaImpl<A>
where
    A: Allocator,
{
    pub fn new(allocator: A) -> Self {
        Self {
            inner: RefCell::new(BuilderArenaImplInner {
                allocator,
                segments: Vec::new(),
            }),
        }
    }

    /// Allocates a new segment with capacity for at least `minimum_size` words.
    pub fn allocate_segment(&self, minimum_size: WordCount32) -> Result<()> {
        self.inner.borrow_mut().allocate_segment(minimum_size)
    }

    /// Copies out the used part of every segment.
    pub fn get_segments_for_output(&self) -> Vec<Vec<Word>> {
        self.inner
            .borrow()
            .segments
            .iter()
            .map(|seg| seg.words[..seg.allocated].to_vec())
            .collect()
    }

    /// Consumes the arena, truncating every segment to its used part.
    pub fn into_segments(self) -> Vec<Vec<Word>> {
        self.inner
            .into_inner()
            .segments
            .into_iter()
            .map(|mut seg| {
                seg.words.truncate(seg.allocated);
                seg.words
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of words used across all segments.
    pub fn size_in_words(&self) -> usize {
        self.inner
            .borrow()
            .segments
            .iter()
            .map(|seg| seg.allocated)
            .sum()
    }

    /// Retrieves the underlying `Allocator`, dropping all currently-allocated segments.
    pub fn into_allocator(self) -> A {
        self.inner.into_inner().allocator
    }
}

impl<A> BuilderArenaImplInner<A>
where
    A: Allocator,
{
    fn allocate_segment(&mut self, minimum_size: WordCount32) -> Result<()> {
        let words = self.allocator.allocate_segment(minimum_size)?;
        if words.len() < minimum_size as usize {
            return Err(Error::failed(format!(
                "allocator returned {} words, but {} were requested",
                words.len(),
                minimum_size
            )));
        }
        trace!(
            segment_id = self.segments.len(),
            words = words.len(),
            "allocated segment"
        );
        self.segments.push(BuilderSegment {
            words,
            allocated: 0,
        });
        Ok(())
    }

    fn allocate(&mut self, segment_id: SegmentId, amount: WordCount32) -> Option<usize> {
        let seg = self.segments.get_mut(segment_id as usize)?;
        if amount as usize > seg.words.len() - seg.allocated {
            None
        } else {
            let result = seg.allocated;
            seg.allocated += amount as usize;
            Some(result)
        }
    }

    fn allocate_anywhere(&mut self, amount: WordCount32) -> Result<(SegmentId, usize)> {
        // first try the existing segments, then try allocating a new segment.
        let allocated_len = self.segments.len() as SegmentId;
        for segment_id in 0..allocated_len {
            if let Some(idx) = self.allocate(segment_id, amount) {
                return Ok((segment_id, idx));
            }
        }

        self.allocate_segment(amount)?;
        match self.allocate(allocated_len, amount) {
            Some(idx) => Ok((allocated_len, idx)),
            None => Err(Error::failed("freshly allocated segment is too small".to_string())),
        }
    }
}

impl<A> ReaderArena for BuilderArenaImpl<A>
where
    A: Allocator,
{
    fn get_segment_len(&self, id: SegmentId) -> Result<usize> {
        self.inner
            .borrow()
            .segments
            .get(id as usize)
            .map(|seg| seg.allocated)
            .ok_or_else(|| Error::from_kind(ErrorKind::InvalidSegmentId(id)))
    }

    fn read_word(&self, id: SegmentId, index: usize) -> Result<Word> {
        let inner = self.inner.borrow();
        let seg = inner
            .segments
            .get(id as usize)
            .ok_or_else(|| Error::from_kind(ErrorKind::InvalidSegmentId(id)))?;
        if index < seg.allocated {
            Ok(seg.words[index])
        } else {
            Err(out_of_bounds())
        }
    }

    fn contains_interval(&self, id: SegmentId, start: usize, size: usize) -> Result<()> {
        interval_in_bounds(self.get_segment_len(id)?, start, size)
    }

    fn amplified_read(&self, _virtual_amount: u64) -> Result<()> {
        Ok(())
    }

    fn nesting_limit(&self) -> i32 {
        0x7fffffff
    }
}

impl<A> BuilderArena for BuilderArenaImpl<A>
where
    A: Allocator,
{
    fn allocate(&self, segment_id: SegmentId, amount: WordCount32) -> Option<usize> {
        self.inner.borrow_mut().allocate(segment_id, amount)
    }

    fn allocate_anywhere(&self, amount: WordCount32) -> Result<(SegmentId, usize)> {
        self.inner.borrow_mut().allocate_anywhere(amount)
    }

    fn get_word(&self, segment_id: SegmentId, index: usize) -> Word {
        self.inner.borrow().segments[segment_id as usize].words[index]
    }

    fn set_word(&self, segment_id: SegmentId, index: usize, value: Word) {
        self.inner.borrow_mut().segments[segment_id as usize].words[index] = value;
    }

    fn zero_words(&self, segment_id: SegmentId, start: usize, count: usize) {
        self.inner.borrow_mut().segments[segment_id as usize].words[start..start + count]
            .fill(Word::ZERO);
    }

    fn copy_words(
        &self,
        src_segment_id: SegmentId,
        src_start: usize,
        dst_segment_id: SegmentId,
        dst_start: usize,
        count: usize,
    ) {
        let mut inner = self.inner.borrow_mut();
        if src_segment_id == dst_segment_id {
            inner.segments[src_segment_id as usize]
                .words
                .copy_within(src_start..src_start + count, dst_start);
        } else {
            let src = inner.segments[src_segment_id as usize].words[src_start..src_start + count]
                .to_vec();
            inner.segments[dst_segment_id as usize].words[dst_start..dst_start + count]
                .copy_from_slice(&src);
        }
    }

    fn as_reader(&self) -> &dyn ReaderArena {
        self
    }
}

/// Arena behind default-constructed builders. It has no memory and refuses to allocate.
pub struct NullArena;

impl ReaderArena for NullArena {
    fn get_segment_len(&self, id: SegmentId) -> Result<usize> {
        Err(Error::from_kind(ErrorKind::InvalidSegmentId(id)))
    }

    fn read_word(&self, id: SegmentId, _index: usize) -> Result<Word> {
        Err(Error::from_kind(ErrorKind::InvalidSegmentId(id)))
    }

    fn contains_interval(&self, id: SegmentId, _start: usize, _size: usize) -> Result<()> {
        Err(Error::from_kind(ErrorKind::InvalidSegmentId(id)))
    }

    fn amplified_read(&self, _virtual_amount: u64) -> Result<()> {
        Ok(())
    }

    fn nesting_limit(&self) -> i32 {
        0x7fffffff
    }
}

impl BuilderArena for NullArena {
    fn allocate(&self, _segment_id: SegmentId, _amount: WordCount32) -> Option<usize> {
        None
    }

    fn allocate_anywhere(&self, _amount: WordCount32) -> Result<(SegmentId, usize)> {
        Err(Error::failed("tried to allocate in a null arena".to_string()))
    }

    fn get_word(&self, _segment_id: SegmentId, _index: usize) -> Word {
        Word::ZERO
    }

    fn set_word(&self, _segment_id: SegmentId, _index: usize, _value: Word) {}

    fn zero_words(&self, _segment_id: SegmentId, _start: usize, _count: usize) {}

    fn copy_words(&self, _: SegmentId, _: usize, _: SegmentId, _: usize, _: usize) {}

    fn as_reader(&self) -> &dyn ReaderArena {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{offset_in_bounds, ArenaRef, BuilderArena, BuilderArenaImpl, ReaderArena};
    use crate::message::{AllocationStrategy, HeapAllocator};
    use crate::{word, ErrorKind, Word};

    #[test]
    fn offsets() {
        assert_eq!(offset_in_bounds(4, 1, 3).unwrap(), 4);
        assert!(offset_in_bounds(4, 1, 4).is_err());
        assert!(offset_in_bounds(4, 1, -2).is_err());
        assert_eq!(offset_in_bounds(4, 1, -1).unwrap(), 0);
    }

    #[test]
    fn allocate_spills_into_new_segments() {
        let arena = BuilderArenaImpl::new(
            HeapAllocator::new()
                .first_segment_words(4)
                .allocation_strategy(AllocationStrategy::FixedSize),
        );
        arena.allocate_segment(1).unwrap();
        assert_eq!(arena.allocate(0, 3), Some(0));
        assert_eq!(arena.allocate(0, 2), None);
        assert_eq!(arena.allocate_anywhere(1).unwrap(), (0, 3));
        assert_eq!(arena.allocate_anywhere(2).unwrap(), (1, 0));
        assert_eq!(arena.allocate_anywhere(9).unwrap(), (2, 0));
        assert_eq!(arena.len(), 3);
        assert_eq!(arena.size_in_words(), 4 + 2 + 9);

        arena.set_word(1, 1, word(1, 2, 3, 4, 5, 6, 7, 8));
        arena.copy_words(1, 1, 0, 2, 1);
        assert_eq!(arena.read_word(0, 2).unwrap(), word(1, 2, 3, 4, 5, 6, 7, 8));
        arena.zero_words(0, 0, 4);
        assert_eq!(arena.get_word(0, 2), Word::ZERO);
        assert!(arena.read_word(1, 2).is_err());
    }

    #[test]
    fn trusted_arena_is_bounds_checked() {
        let words = [word(1, 0, 0, 0, 0, 0, 0, 0)];
        let arena = ArenaRef::Trusted(&words);
        assert!(arena.read_word(0, 0).is_ok());
        assert_eq!(
            arena.read_word(0, 1).map_err(|e| e.kind),
            Err(ErrorKind::MessageContainsOutOfBoundsPointer)
        );
        assert_eq!(
            arena.read_word(1, 0).map_err(|e| e.kind),
            Err(ErrorKind::InvalidSegmentId(1))
        );
        assert!(arena.contains_interval(0, 1, 0).is_ok());
        assert!(ArenaRef::null().get_segment_len(0).unwrap() == 0);
    }
}
