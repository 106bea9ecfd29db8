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

//! # Cap'n Proto layout accessors
//!
//! Low-level, non-type-safe cursors for interpreting the raw Cap'n Proto wire format in place.
//! Generated code and reflection layers sit on top of these types; they are not meant to be
//! used directly by application code.
//!
//! A message is a sequence of segments, each a slice of 64-bit [`Word`]s. Builders
//! ([`StructBuilder`], [`ListBuilder`]) allocate on demand and always hand back a usable,
//! zero-initialized target. Readers ([`StructReader`], [`ListReader`]) never fail: absent,
//! truncated, malformed or too deeply nested data reads as the caller-supplied default.

pub mod message;

pub mod private;

pub use crate::private::layout::{
    ElementSize, ListBuilder, ListReader, PrimitiveElement, StructBuilder, StructReader,
    StructSize,
};

/// Eight bytes of memory with opaque interior.
///
/// This type is used to ensure that the data of a message is properly aligned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(C, align(8))]
pub struct Word {
    raw_content: [u8; 8],
}

/// Constructs a word with the given bytes.
#[allow(clippy::too_many_arguments)]
pub const fn word(b0: u8, b1: u8, b2: u8, b3: u8, b4: u8, b5: u8, b6: u8, b7: u8) -> Word {
    Word {
        raw_content: [b0, b1, b2, b3, b4, b5, b6, b7],
    }
}

impl Word {
    pub const ZERO: Word = word(0, 0, 0, 0, 0, 0, 0, 0);

    /// Allocates a vec of `length` words, all set to zero.
    pub fn allocate_zeroed_vec(length: usize) -> Vec<Word> {
        vec![Word::ZERO; length]
    }

    pub const fn from_bytes(bytes: [u8; 8]) -> Word {
        Word { raw_content: bytes }
    }

    pub const fn to_bytes(self) -> [u8; 8] {
        self.raw_content
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.raw_content
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8; 8] {
        &mut self.raw_content
    }

    /// Copies a byte buffer into words. Returns `None` if the length is not a multiple of eight.
    pub fn bytes_to_words(bytes: &[u8]) -> Option<Vec<Word>> {
        if bytes.len() % 8 != 0 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(8)
                .map(|chunk| {
                    let mut w = Word::ZERO;
                    w.raw_content.copy_from_slice(chunk);
                    w
                })
                .collect(),
        )
    }

    pub fn words_to_bytes(words: &[Word]) -> Vec<u8> {
        words.iter().flat_map(|w| w.raw_content).collect()
    }
}

/// Size of a message, as reported by `StructReader::total_size()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageSize {
    pub word_count: u64,
}

impl MessageSize {
    pub fn plus_eq(&mut self, other: MessageSize) {
        self.word_count += other.word_count;
    }
}

/// Because messages are lazily validated, the return type of any method that reads a pointer
/// field on a builder must be wrapped in a Result.
pub type Result<T> = ::core::result::Result<T, Error>;

/// Describes an arbitrary error that prevented an operation from completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    /// The general kind of the error.
    pub kind: ErrorKind,

    /// Extra context about the error, if any.
    pub extra: String,
}

/// The general nature of an error. Readers swallow all of these and fall back to defaults;
/// builders propagate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Something went wrong
    #[error("failed")]
    Failed,

    /// The allocator refused to hand out another segment.
    #[error("allocation limit exceeded")]
    AllocationLimitExceeded,

    #[error("requested segment is larger than 2^29 words")]
    SegmentTooLarge,

    #[error("invalid segment id {0}")]
    InvalidSegmentId(u32),

    #[error("message contains out-of-bounds pointer")]
    MessageContainsOutOfBoundsPointer,

    #[error("message is too deeply nested")]
    MessageIsTooDeeplyNested,

    #[error("read limit exceeded")]
    ReadLimitExceeded,

    #[error("message contains non-struct pointer where struct pointer was expected")]
    MessageContainsNonStructPointerWhereStructPointerWasExpected,

    #[error("message contains non-list pointer where list pointer was expected")]
    MessageContainsNonListPointerWhereListPointerWasExpected,

    #[error("message contains unknown pointer type")]
    MessageContainsUnknownPointerType,

    #[error("malformed double-far pointer")]
    MalformedDoubleFarPointer,

    #[error("inline composite list with non-struct elements not supported")]
    InlineCompositeListWithNonStructElementsNotSupported,

    #[error("inline composite list's elements overrun its word count")]
    InlineCompositeListsElementsOverrunItsWordCount,

    #[error("found struct list where bit list was expected")]
    FoundStructListWhereBitListWasExpected,

    #[error("message contains list with incompatible element type")]
    MessageContainsListWithIncompatibleElementType,

    #[error("existing list value is incompatible with expected type")]
    ExistingListValueIsIncompatibleWithExpectedType,

    #[error("lists are limited to 2^29 elements or words")]
    ListTooLong,
}

impl Error {
    /// Constructs a generic "failed" error.
    pub fn failed(description: String) -> Self {
        Self {
            extra: description,
            kind: ErrorKind::Failed,
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            extra: String::new(),
            kind,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::result::Result<(), core::fmt::Error> {
        if self.extra.is_empty() {
            write!(fmt, "{}", self.kind)
        } else {
            write!(fmt, "{}: {}", self.kind, self.extra)
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::from_kind(kind)
    }
}
