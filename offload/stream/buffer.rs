// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::metadata::MetadataTag;

/// Buffer shared between the two sides of a transform
pub type SharedBuffer = Rc<RefCell<CBuffer>>;

/// Circular octet buffer, with an optional list of metadata tags
/// following the data.
///
/// The shift and byte swap settings describe how the hardware accesses the
/// buffer; they are reported back as the data format of link buffers.
#[derive(Debug)]
pub struct CBuffer {
    data: Vec<u8>,
    read: usize,
    len: usize,
    metadata: Option<VecDeque<MetadataTag>>,
    read_shift: u8,
    write_shift: u8,
    read_byte_swap: bool,
    write_byte_swap: bool,
    usable_octets: u8,
}

impl CBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            read: 0,
            len: 0,
            metadata: None,
            read_shift: 0,
            write_shift: 0,
            read_byte_swap: false,
            write_byte_swap: false,
            usable_octets: 0,
        }
    }

    pub fn with_metadata(size: usize) -> Self {
        Self { metadata: Some(VecDeque::new()), ..Self::new(size) }
    }

    pub fn shared(self) -> SharedBuffer {
        Rc::new(RefCell::new(self))
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn amount_data(&self) -> usize {
        self.len
    }

    pub fn amount_space(&self) -> usize {
        self.data.len() - self.len
    }

    /// Write as much as possible of `src`, returns the amount written
    pub fn write(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.amount_space());
        let size = self.data.len();
        let start = (self.read + self.len) % size.max(1);
        for (i, byte) in src[..n].iter().enumerate() {
            self.data[(start + i) % size] = *byte;
        }
        self.len += n;
        n
    }

    /// Write `record` entirely, or nothing at all.
    /// The reader never observes part of a record.
    pub fn write_record(&mut self, record: &[u8]) -> bool {
        if record.len() > self.amount_space() {
            return false;
        }
        self.write(record) == record.len()
    }

    /// Copy data without consuming it
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len);
        let size = self.data.len();
        for (i, byte) in dst[..n].iter_mut().enumerate() {
            *byte = self.data[(self.read + i) % size];
        }
        n
    }

    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        self.advance_read(n);
        n
    }

    pub fn advance_read(&mut self, n: usize) {
        let n = n.min(self.len);
        if n > 0 {
            self.read = (self.read + n) % self.data.len();
            self.len -= n;
        }
    }

    /// Discard all data and metadata
    pub fn empty(&mut self) {
        self.read = 0;
        self.len = 0;
        if let Some(tags) = self.metadata.as_mut() {
            tags.clear();
        }
    }

    /// Discard the content and overwrite the memory with `value`
    pub fn flush_and_fill(&mut self, value: u8) {
        self.empty();
        self.data.fill(value);
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    pub fn enable_metadata(&mut self) {
        self.metadata.get_or_insert_with(VecDeque::new);
    }

    pub fn release_metadata(&mut self) {
        self.metadata = None;
    }

    /// Append a tag describing the last written octets.
    /// Silently dropped when the buffer does not carry metadata.
    pub fn append_tag(&mut self, tag: MetadataTag) {
        if let Some(tags) = self.metadata.as_mut() {
            tags.push_back(tag);
        }
    }

    pub fn peek_tag(&self) -> Option<&MetadataTag> {
        self.metadata.as_ref()?.front()
    }

    pub fn peek_tag_mut(&mut self) -> Option<&mut MetadataTag> {
        self.metadata.as_mut()?.front_mut()
    }

    pub fn remove_tag(&mut self) -> Option<MetadataTag> {
        self.metadata.as_mut()?.pop_front()
    }

    pub fn tag_count(&self) -> usize {
        self.metadata.as_ref().map_or(0, |tags| tags.len())
    }

    pub fn read_shift(&self) -> u8 {
        self.read_shift
    }

    pub fn write_shift(&self) -> u8 {
        self.write_shift
    }

    pub fn set_read_shift(&mut self, shift: u8) {
        self.read_shift = shift;
    }

    pub fn set_write_shift(&mut self, shift: u8) {
        self.write_shift = shift;
    }

    pub fn read_byte_swap(&self) -> bool {
        self.read_byte_swap
    }

    pub fn write_byte_swap(&self) -> bool {
        self.write_byte_swap
    }

    pub fn set_read_byte_swap(&mut self, swap: bool) {
        self.read_byte_swap = swap;
    }

    pub fn set_write_byte_swap(&mut self, swap: bool) {
        self.write_byte_swap = swap;
    }

    pub fn usable_octets(&self) -> u8 {
        self.usable_octets
    }

    pub fn set_usable_octets(&mut self, octets: u8) {
        self.usable_octets = octets;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_around() {
        let mut b = CBuffer::new(8);
        assert_eq!(b.write(&[1, 2, 3, 4, 5, 6]), 6);

        let mut out = [0; 4];
        assert_eq!(b.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);

        assert_eq!(b.write(&[7, 8, 9, 10, 11, 12, 13]), 6);
        assert_eq!(b.amount_space(), 0);

        let mut out = [0; 8];
        assert_eq!(b.read(&mut out), 8);
        assert_eq!(out, [5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(b.amount_data(), 0);
    }

    #[test]
    fn records_are_not_torn() {
        let mut b = CBuffer::new(10);
        assert!(b.write_record(&[0xaa; 6]));
        assert!(!b.write_record(&[0xbb; 6]));
        assert_eq!(b.amount_data(), 6);

        b.advance_read(4);
        assert!(b.write_record(&[0xbb; 6]));
        assert_eq!(b.amount_data(), 8);
    }

    #[test]
    fn flush_and_fill() {
        let mut b = CBuffer::with_metadata(4);
        b.write(&[1, 2, 3]);
        b.append_tag(MetadataTag::new(3));
        b.flush_and_fill(0);

        assert_eq!(b.amount_data(), 0);
        assert_eq!(b.tag_count(), 0);
        assert!(b.has_metadata());

        b.write(&[9]);
        let mut out = [0xff; 1];
        b.peek(&mut out);
        assert_eq!(out, [9]);
    }

    #[test]
    fn metadata_follows_configuration() {
        let mut b = CBuffer::new(16);
        b.append_tag(MetadataTag::new(4));
        assert!(b.peek_tag().is_none());

        b.enable_metadata();
        b.append_tag(MetadataTag::new(4));
        b.append_tag(MetadataTag::new(0));
        assert_eq!(b.tag_count(), 2);
        assert_eq!(b.remove_tag().map(|t| t.length), Some(4));

        b.release_metadata();
        assert!(!b.has_metadata());
        assert_eq!(b.tag_count(), 0);
    }
}
