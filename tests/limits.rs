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

use capnp_layout::message::{self, HeapAllocator, ReaderOptions};
use capnp_layout::{word, ElementSize, ErrorKind, StructSize, Word};

#[test]
fn allocation_budget_is_enforced() {
    let allocator = HeapAllocator::new().first_segment_words(8).max_total_words(8);
    let mut builder = message::Builder::new(allocator);
    let root = builder.init_root(StructSize::new(1, 1, 1)).unwrap();
    let small = root.init_list_field(0, ElementSize::EightBytes, 4).unwrap();
    assert_eq!(small.len(), 4);

    let err = root
        .init_list_field(0, ElementSize::EightBytes, 100)
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::AllocationLimitExceeded);
}

#[test]
fn lists_are_limited_to_2_pow_29_elements() {
    let mut builder = message::Builder::new_default();
    let root = builder.init_root(StructSize::new(0, 0, 1)).unwrap();
    let err = root
        .init_list_field(0, ElementSize::Byte, 1 << 29)
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ListTooLong);

    let err = root
        .init_struct_list_field(0, 1 << 28, StructSize::new(1, 1, 1), None)
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ListTooLong);
    assert!(root.is_pointer_field_null(0));
}

#[test]
fn pointer_index_out_of_range() {
    let mut builder = message::Builder::new_default();
    let root = builder.init_root(StructSize::new(1, 1, 1)).unwrap();
    let err = root
        .init_struct_field(1, StructSize::new(0, 1, 0), None)
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Failed);
    assert!(root.get_list_field(4, ElementSize::Byte, None).is_err());
    assert!(root.is_pointer_field_null(4));

    // Readers treat it as absent.
    let reader = root.as_reader();
    assert!(reader.get_list_field(4, ElementSize::Byte, None).is_empty());
    assert!(reader.is_pointer_field_null(4));
}

#[test]
fn traversal_limit_degrades_to_default() {
    let segment: &[Word] = &[word(0, 0, 0, 0, 1, 1, 0, 0), word(5, 0, 0, 0, 0, 0, 0, 0)];
    let segments = [segment];
    let mut options = ReaderOptions::new();
    options.traversal_limit_in_words(1);
    let reader = message::Reader::new(message::SegmentArray::new(&segments), options);

    assert_eq!(reader.get_root(None).get_data_field::<u8>(0, 0), 5);
    assert_eq!(reader.get_root(None).get_data_field::<u8>(0, 0), 0);
}

#[test]
fn nesting_limit_from_options() {
    // root -> child struct -> grandchild struct, each with one pointer.
    let segment: &[Word] = &[
        word(0, 0, 0, 0, 1, 0, 1, 0),
        word(0, 0, 0, 0, 1, 0, 1, 0),
        word(0, 0, 0, 0, 1, 1, 0, 0),
        word(3, 0, 0, 0, 0, 0, 0, 0),
    ];
    let segments = [segment];

    let mut options = ReaderOptions::new();
    options.nesting_limit(3);
    let reader = message::Reader::new(message::SegmentArray::new(&segments), options);
    let grandchild = reader.get_root(None).get_struct_field(0, None).get_struct_field(0, None);
    assert_eq!(grandchild.get_data_field::<u8>(0, 0), 3);

    let mut options = ReaderOptions::new();
    options.nesting_limit(2);
    let reader = message::Reader::new(message::SegmentArray::new(&segments), options);
    let child = reader.get_root(None).get_struct_field(0, None);
    assert_eq!(child.pointer_section_size(), 1);
    assert_eq!(child.get_struct_field(0, None).get_data_field::<u8>(0, 0), 0);
}
