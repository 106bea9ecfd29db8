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

use capnp_layout::message::{self, ReaderOptions, SegmentArray};
use capnp_layout::{word, ElementSize, ErrorKind, StructSize, Word};

#[test]
fn struct_grows_in_place() {
    let mut builder = message::Builder::new_default();
    let root = builder.init_root(StructSize::new(1, 0, 1)).unwrap();

    let old = root.init_struct_field(0, StructSize::new(1, 1, 1), None).unwrap();
    old.set_data_field::<u64>(0, 11);
    let names = old.init_list_field(0, ElementSize::Byte, 2).unwrap();
    names.set_data_element::<u8>(0, b'h');
    names.set_data_element::<u8>(1, b'i');

    let new = root.get_struct_field(0, StructSize::new(3, 2, 2), None).unwrap();
    assert_eq!(new.data_section_size(), 128);
    assert_eq!(new.pointer_section_size(), 2);
    assert_eq!(new.field_count(), 3);
    assert_eq!(new.get_data_field::<u64>(0), 11);
    assert_eq!(new.get_data_field::<u64>(1), 0);
    assert!(new.is_pointer_field_null(1));
    new.set_data_field::<u64>(1, 22);

    // Pointers of the old struct moved along.
    let names = new.get_list_field(0, ElementSize::Byte, None).unwrap();
    assert_eq!(names.len(), 2);
    assert_eq!(names.get_data_element::<u8>(1), b'i');

    // Asking for less than what is there returns the larger struct unchanged.
    let same = root.get_struct_field(0, StructSize::new(1, 1, 0), None).unwrap();
    assert_eq!(same.data_section_size(), 128);
    assert_eq!(same.get_data_field::<u64>(1), 22);

    let reader = root.as_reader().get_struct_field(0, None);
    assert_eq!(reader.field_count(), 3);
    assert_eq!(reader.get_data_field::<u64>(0, 0), 11);
    assert_eq!(reader.get_data_field::<u64>(1, 0), 22);
    assert_eq!(
        reader.get_list_field(0, ElementSize::Byte, None).get_data_element::<u8>(0),
        b'h'
    );
    // Old struct: 2 words, abandoned and zeroed. New struct: 4 words. List: 1 word.
    assert_eq!(root.as_reader().total_size().unwrap().word_count, 1 + 4 + 1);
}

#[test]
fn bool_list_upgrades_to_struct_list() {
    let pattern = [true, false, false, true, true, false, true, true, false, true, false];

    let mut builder = message::Builder::new_default();
    let root = builder.init_root(StructSize::new(1, 0, 1)).unwrap();
    let bits = root
        .init_list_field(0, ElementSize::Bit, pattern.len() as u32)
        .unwrap();
    for (i, &value) in pattern.iter().enumerate() {
        bits.set_data_element(i as u32, value);
    }

    let structs = root
        .get_struct_list_field(0, StructSize::new(2, 1, 1), None)
        .unwrap();
    assert_eq!(structs.len(), pattern.len() as u32);
    assert_eq!(structs.element_size(), ElementSize::InlineComposite);
    for (i, &value) in pattern.iter().enumerate() {
        let element = structs.get_struct_element(i as u32);
        assert_eq!(element.get_bool_field(0), value, "element {i}");
        // Only bit 0 carries the old element.
        assert_eq!(element.get_data_field::<u64>(0), u64::from(value));
        assert!(element.is_pointer_field_null(0));
    }
    structs.get_struct_element(1).set_data_field::<u32>(1, 9);

    let reader = root.as_reader();
    let list = reader.get_list_field(0, ElementSize::InlineComposite, None);
    assert_eq!(list.len(), pattern.len() as u32);
    assert!(list.get_struct_element(0).get_bool_field(0, false));
    assert_eq!(list.get_struct_element(1).get_data_field::<u32>(1, 0), 9);
    // The list is a struct list now, which can't be read as bits.
    assert!(reader.get_list_field(0, ElementSize::Bit, None).is_empty());
    assert_eq!(
        root.get_list_field(0, ElementSize::Bit, None).map(|_| ()).unwrap_err().kind,
        ErrorKind::FoundStructListWhereBitListWasExpected
    );
}

#[test]
fn primitive_list_upgrades_to_struct_list() {
    let mut builder = message::Builder::new_default();
    let root = builder.init_root(StructSize::new(1, 0, 1)).unwrap();
    let values = root.init_list_field(0, ElementSize::TwoBytes, 3).unwrap();
    values.set_data_element::<u16>(0, 0x1111);
    values.set_data_element::<u16>(1, 0x2222);
    values.set_data_element::<u16>(2, 0x3333);

    let structs = root
        .get_struct_list_field(0, StructSize::new(1, 0, 0), None)
        .unwrap();
    assert_eq!(structs.len(), 3);
    assert_eq!(structs.get_struct_element(1).get_data_field::<u16>(0), 0x2222);
    assert_eq!(structs.get_struct_element(2).get_data_field::<u16>(1), 0);

    // The upgraded list still reads as the narrower primitive.
    let reader = root.as_reader().get_list_field(0, ElementSize::TwoBytes, None);
    assert_eq!(reader.len(), 3);
    assert_eq!(reader.get_data_element::<u16>(2), 0x3333);
}

#[test]
fn pointer_list_upgrades_to_struct_list() {
    let mut builder = message::Builder::new_default();
    let root = builder.init_root(StructSize::new(1, 0, 1)).unwrap();
    let pointers = root.init_list_field(0, ElementSize::Pointer, 2).unwrap();
    pointers
        .init_list_element(1, ElementSize::Byte, 1)
        .unwrap()
        .set_data_element::<u8>(0, 0x55);

    let structs = root
        .get_struct_list_field(0, StructSize::new(1, 1, 0), None)
        .unwrap();
    assert_eq!(structs.len(), 2);
    let second = structs.get_struct_element(1);
    assert_eq!(second.data_section_size(), 64);
    assert_eq!(second.pointer_section_size(), 1);
    assert!(structs.get_struct_element(0).is_pointer_field_null(0));
    assert_eq!(
        second
            .get_list_field(0, ElementSize::Byte, None)
            .unwrap()
            .get_data_element::<u8>(0),
        0x55
    );

    // Reading it back as a pointer list sees the first pointer of each element.
    let reader = root.as_reader().get_list_field(0, ElementSize::Pointer, None);
    assert_eq!(
        reader
            .get_list_element(1, ElementSize::Byte, None)
            .get_data_element::<u8>(0),
        0x55
    );
}

#[test]
fn struct_list_elements_grow() {
    let mut builder = message::Builder::new_default();
    let root = builder.init_root(StructSize::new(1, 0, 1)).unwrap();
    let old = root
        .init_struct_list_field(0, 3, StructSize::new(1, 1, 1), None)
        .unwrap();
    for i in 0..3 {
        let element = old.get_struct_element(i);
        element.set_data_field::<u32>(0, i + 1);
        element
            .init_list_field(0, ElementSize::FourBytes, 1)
            .unwrap()
            .set_data_element::<u32>(0, (i + 1) * 100);
    }

    let new = root
        .get_struct_list_field(0, StructSize::new(2, 2, 2), None)
        .unwrap();
    assert_eq!(new.len(), 3);
    for i in 0..3 {
        let element = new.get_struct_element(i);
        assert_eq!(element.field_count(), 2);
        assert_eq!(element.get_data_field::<u32>(0), i + 1);
        assert_eq!(element.get_data_field::<u64>(1), 0);
        assert!(element.is_pointer_field_null(1));
        let inner = element.get_list_field(0, ElementSize::FourBytes, None).unwrap();
        assert_eq!(inner.get_data_element::<u32>(0), (i + 1) * 100);
    }

    let again = root
        .get_struct_list_field(0, StructSize::new(1, 1, 0), None)
        .unwrap();
    assert_eq!(again.get_struct_element(0).data_section_size(), 128);
}

#[test]
fn void_list_becomes_struct_list() {
    let mut builder = message::Builder::new_default();
    let root = builder.init_root(StructSize::new(1, 0, 1)).unwrap();
    root.init_list_field(0, ElementSize::Void, 4).unwrap();
    let structs = root
        .get_struct_list_field(0, StructSize::new(1, 1, 0), None)
        .unwrap();
    assert_eq!(structs.len(), 4);
    assert_eq!(structs.get_struct_element(3).get_data_field::<u64>(0), 0);
}

#[test]
fn incompatible_existing_lists() {
    let mut builder = message::Builder::new_default();
    let root = builder.init_root(StructSize::new(1, 0, 2)).unwrap();
    root.init_list_field(0, ElementSize::Byte, 4).unwrap();
    root.init_struct_list_field(1, 2, StructSize::new(1, 0, 0), None)
        .unwrap();

    assert_eq!(
        root.get_list_field(0, ElementSize::EightBytes, None).map(|_| ()).unwrap_err().kind,
        ErrorKind::ExistingListValueIsIncompatibleWithExpectedType
    );
    assert_eq!(
        root.get_list_field(1, ElementSize::Pointer, None).map(|_| ()).unwrap_err().kind,
        ErrorKind::ExistingListValueIsIncompatibleWithExpectedType
    );
    assert_eq!(
        root.get_struct_field(0, StructSize::new(1, 1, 0), None).map(|_| ()).unwrap_err().kind,
        ErrorKind::MessageContainsNonStructPointerWhereStructPointerWasExpected
    );
    assert!(root.get_list_field(0, ElementSize::Bit, None).is_ok());
    assert!(root.init_list_field(0, ElementSize::InlineComposite, 1).is_err());
    assert!(root.init_list_field(2, ElementSize::Byte, 1).is_err());
}

#[test]
fn struct_list_read_as_pointer_list_copies_whole_elements() {
    let mut source = message::Builder::new_default();
    {
        let root = source.init_root(StructSize::new(1, 0, 1)).unwrap();
        let structs = root
            .init_struct_list_field(0, 2, StructSize::new(2, 1, 1), None)
            .unwrap();
        for i in 0..2u32 {
            let element = structs.get_struct_element(i);
            element.set_data_field::<u64>(0, 100 + u64::from(i));
            element
                .init_list_field(0, ElementSize::Byte, 1)
                .unwrap()
                .set_data_element::<u8>(0, 10 + i as u8);
        }
    }
    let source = source.into_reader();
    let as_pointers = source.get_root(None).get_list_field(0, ElementSize::Pointer, None);
    assert_eq!(as_pointers.len(), 2);
    assert_eq!(as_pointers.element_size(), ElementSize::InlineComposite);
    assert_eq!(
        as_pointers
            .get_list_element(1, ElementSize::Byte, None)
            .get_data_element::<u8>(0),
        11
    );
    assert_eq!(as_pointers.get_struct_element(1).get_data_field::<u64>(0, 0), 101);

    let mut copy = message::Builder::new_default();
    {
        let root = copy.init_root(StructSize::new(1, 0, 1)).unwrap();
        root.set_list_field(0, &as_pointers).unwrap();
    }
    let copy = copy.into_reader();
    let structs = copy
        .get_root(None)
        .get_list_field(0, ElementSize::InlineComposite, None);
    assert_eq!(structs.len(), 2);
    for i in 0..2u32 {
        let element = structs.get_struct_element(i);
        assert_eq!(element.field_count(), 2);
        assert_eq!(element.get_data_field::<u64>(0, 0), 100 + u64::from(i));
        assert_eq!(
            element
                .get_list_field(0, ElementSize::Byte, None)
                .get_data_element::<u8>(0),
            10 + i as u8
        );
    }
}

#[test]
fn struct_list_opened_as_pointer_list_writes_pointer_sections() {
    let mut builder = message::Builder::new_default();
    let root = builder.init_root(StructSize::new(1, 0, 1)).unwrap();
    let structs = root
        .init_struct_list_field(0, 3, StructSize::new(2, 1, 1), None)
        .unwrap();
    for i in 0..3u32 {
        structs.get_struct_element(i).set_data_field::<u64>(0, u64::from(i) + 1);
    }

    let pointers = root.get_list_field(0, ElementSize::Pointer, None).unwrap();
    assert_eq!(pointers.len(), 3);
    pointers
        .init_list_element(2, ElementSize::FourBytes, 1)
        .unwrap()
        .set_data_element::<u32>(0, 77);
    assert_eq!(pointers.get_struct_element(2).get_data_field::<u64>(0), 3);

    let reader = root.as_reader().get_list_field(0, ElementSize::InlineComposite, None);
    let last = reader.get_struct_element(2);
    assert_eq!(last.get_data_field::<u64>(0, 0), 3);
    assert_eq!(
        last.get_list_field(0, ElementSize::FourBytes, None)
            .get_data_element::<u32>(0),
        77
    );
    assert!(reader.get_struct_element(1).is_pointer_field_null(0));
}

#[test]
fn failed_list_copy_leaves_field_null() {
    // Root struct with one pointer to a struct list whose only element points out of
    // the segment.
    let segment: &[Word] = &[
        word(0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00),
        word(0x01, 0x00, 0x00, 0x00, 0x17, 0x00, 0x00, 0x00),
        word(0x04, 0x00, 0x00, 0x00, 0x01, 0x01, 0x01, 0x00),
        word(0x63, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
        word(0x91, 0x01, 0x00, 0x00, 0x0a, 0x00, 0x00, 0x00),
    ];
    let segments = [segment];
    let reader = message::Reader::new(SegmentArray::new(&segments), ReaderOptions::new());
    let source = reader.get_root(None).get_list_field(0, ElementSize::Pointer, None);
    assert_eq!(source.len(), 1);
    assert_eq!(source.get_struct_element(0).get_data_field::<u8>(0, 0), 0x63);

    let mut builder = message::Builder::new_default();
    let root = builder.init_root(StructSize::new(1, 0, 1)).unwrap();
    root.init_list_field(0, ElementSize::EightBytes, 4).unwrap();
    let err = root.set_list_field(0, &source).unwrap_err();
    assert_eq!(err.kind, ErrorKind::MessageContainsOutOfBoundsPointer);
    assert!(root.is_pointer_field_null(0));
    assert_eq!(root.as_reader().total_size().unwrap().word_count, 1);
}
