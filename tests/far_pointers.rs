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

use capnp_layout::message::{self, AllocationStrategy, HeapAllocator, ReaderOptions, SegmentArray};
use capnp_layout::{word, ElementSize, StructSize, Word};

#[test]
fn objects_spill_into_new_segments() {
    let allocator = HeapAllocator::new()
        .first_segment_words(4)
        .allocation_strategy(AllocationStrategy::FixedSize);
    let mut builder = message::Builder::new(allocator);
    {
        let root = builder.init_root(StructSize::new(1, 1, 1)).unwrap();
        root.set_data_field::<u64>(0, 0x1234);
        let bytes = root.init_list_field(0, ElementSize::Byte, 8).unwrap();
        for i in 0..8 {
            bytes.set_data_element::<u8>(i, i as u8 * 3);
        }
    }
    assert_eq!(builder.get_segments_for_output().len(), 1);

    {
        // Segment 0 is full, so the grown root moves to segment 1 behind a far pointer and
        // its list pointer needs a double-far landing pad in a third segment.
        let root = builder.get_root(StructSize::new(2, 2, 1), None).unwrap();
        assert_eq!(root.get_data_field::<u64>(0), 0x1234);
        root.set_data_field::<u64>(1, 0x5678);
    }
    let segments = builder.get_segments_for_output();
    assert_eq!(segments.len(), 3);

    let reader = builder.into_reader();
    let root = reader.get_root(None);
    assert_eq!(root.data_section_size(), 128);
    assert_eq!(root.get_data_field::<u64>(0, 0), 0x1234);
    assert_eq!(root.get_data_field::<u64>(1, 0), 0x5678);
    let bytes = root.get_list_field(0, ElementSize::Byte, None);
    assert_eq!(bytes.len(), 8);
    for i in 0..8 {
        assert_eq!(bytes.get_data_element::<u8>(i), i as u8 * 3);
    }
}

#[test]
fn many_small_segments() {
    let allocator = HeapAllocator::new()
        .first_segment_words(1)
        .allocation_strategy(AllocationStrategy::FixedSize);
    let mut builder = message::Builder::new(allocator);
    {
        let root = builder.init_root(StructSize::new(0, 0, 1)).unwrap();
        let list = root
            .init_struct_list_field(0, 3, StructSize::new(1, 1, 1), None)
            .unwrap();
        for i in 0..3 {
            let element = list.get_struct_element(i);
            element.set_data_field::<u32>(0, 100 + i);
            element
                .init_list_field(0, ElementSize::TwoBytes, 2)
                .unwrap()
                .set_data_element::<u16>(1, 7 * i as u16);
        }
    }
    assert!(builder.get_segments_for_output().len() > 1);

    let reader = builder.into_reader();
    let list = reader
        .get_root(None)
        .get_list_field(0, ElementSize::InlineComposite, None);
    assert_eq!(list.len(), 3);
    for i in 0..3 {
        let element = list.get_struct_element(i);
        assert_eq!(element.get_data_field::<u32>(0, 0), 100 + i);
        assert_eq!(
            element
                .get_list_field(0, ElementSize::TwoBytes, None)
                .get_data_element::<u16>(1),
            7 * i as u16
        );
    }
}

#[test]
fn single_far_pointer() {
    let segment0: &[Word] = &[word(0x02, 0, 0, 0, 1, 0, 0, 0)];
    let segment1: &[Word] = &[word(0, 0, 0, 0, 1, 1, 0, 0), word(7, 0, 0, 0, 0, 0, 0, 0)];
    let segments = [segment0, segment1];
    let reader = message::Reader::new(SegmentArray::new(&segments), ReaderOptions::new());
    let root = reader.get_root(None);
    assert_eq!(root.field_count(), 1);
    assert_eq!(root.get_data_field::<u8>(0, 0), 7);
}

#[test]
fn double_far_pointer() {
    let segment0: &[Word] = &[word(0x06, 0, 0, 0, 1, 0, 0, 0)];
    let segment1: &[Word] = &[
        word(0x02, 0, 0, 0, 2, 0, 0, 0),
        word(0, 0, 0, 0, 1, 1, 0, 0),
    ];
    let segment2: &[Word] = &[word(8, 0, 0, 0, 0, 0, 0, 0)];
    let segments = [segment0, segment1, segment2];
    let reader = message::Reader::new(SegmentArray::new(&segments), ReaderOptions::new());
    assert_eq!(reader.get_root(None).get_data_field::<u8>(0, 0), 8);
}

#[test]
fn malformed_far_pointers_read_default() {
    static DEFAULT: [Word; 2] = [word(0, 0, 0, 0, 1, 1, 0, 0), word(42, 0, 0, 0, 0, 0, 0, 0)];

    // The double-far landing pad doesn't start with a far pointer.
    let segment0: &[Word] = &[word(0x06, 0, 0, 0, 1, 0, 0, 0)];
    let segment1: &[Word] = &[
        word(0, 0, 0, 0, 1, 1, 0, 0),
        word(0, 0, 0, 0, 1, 1, 0, 0),
    ];
    let segments = [segment0, segment1];
    let reader = message::Reader::new(SegmentArray::new(&segments), ReaderOptions::new());
    assert_eq!(reader.get_root(Some(&DEFAULT[..])).get_data_field::<u8>(0, 0), 42);

    // Landing pad in a segment that doesn't exist.
    let segment0: &[Word] = &[word(0x02, 0, 0, 0, 5, 0, 0, 0)];
    let segments = [segment0];
    let reader = message::Reader::new(SegmentArray::new(&segments), ReaderOptions::new());
    assert_eq!(reader.get_root(Some(&DEFAULT[..])).get_data_field::<u8>(0, 0), 42);

    // A single-far landing pad that is itself a far pointer.
    let segment0: &[Word] = &[word(0x02, 0, 0, 0, 1, 0, 0, 0)];
    let segment1: &[Word] = &[word(0x02, 0, 0, 0, 0, 0, 0, 0)];
    let segments = [segment0, segment1];
    let reader = message::Reader::new(SegmentArray::new(&segments), ReaderOptions::new());
    assert_eq!(reader.get_root(Some(&DEFAULT[..])).get_data_field::<u8>(0, 0), 42);
}
