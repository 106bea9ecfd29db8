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

use capnp_layout::message;
use capnp_layout::{ElementSize, StructSize};

#[test]
fn readers_share_a_message_across_threads() {
    let mut builder = message::Builder::new_default();
    {
        let root = builder.init_root(StructSize::new(1, 1, 1)).unwrap();
        root.set_data_field::<u64>(0, 99);
        let list = root.init_list_field(0, ElementSize::FourBytes, 64).unwrap();
        for i in 0..64 {
            list.set_data_element::<u32>(i, i * i);
        }
    }
    let reader = builder.into_reader();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let root = reader.get_root(None);
                assert_eq!(root.get_data_field::<u64>(0, 0), 99);
                let list = root.get_list_field(0, ElementSize::FourBytes, None);
                let sum: u64 = (0..list.len())
                    .map(|i| u64::from(list.get_data_element::<u32>(i)))
                    .sum();
                assert_eq!(sum, (0..64u64).map(|i| i * i).sum::<u64>());
            });
        }
    });
}
