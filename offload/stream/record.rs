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

//! Records exchanged with the radio through the link buffers.
//!
//! A record is a header of 16 bits little-endian words, followed by the
//! payload:
//!
//! | word | content                                      |
//! |------|----------------------------------------------|
//! | 0    | sync word `0x5C5C`                           |
//! | 1    | header length, in words                      |
//! | 2    | payload length, in octets                    |
//! | 3    | link status                                  |
//! | 4    | timestamp (Bluetooth clock or SDU number)    |

use bytes::{Buf, BufMut, BytesMut};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::buffer::CBuffer;
use crate::metadata::LinkStatus;

pub const SYNC_WORD: u16 = 0x5C5C;

/// Header length, in 16 bits words
pub const HEADER_WORDS: u16 = 5;

/// Header length, in octets
pub const HEADER_LEN: usize = 2 * HEADER_WORDS as usize;

/// Header of a link record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordHeader {
    /// Length of the payload following the header
    pub payload_len: u16,
    /// Reception status, always `Ok` toward the air
    pub status: LinkStatus,
    /// 16 LSBs of the Bluetooth clock in half slots, or SDU sequence number
    pub timestamp: u16,
}

/// Outcome of parsing the head of a link buffer
#[derive(Debug, PartialEq, Eq)]
pub enum Peek {
    /// Not enough data to hold a header, or the announced payload
    Incomplete,
    /// The data does not start with a valid header
    Invalid,
    /// A complete record is available
    Record(RecordHeader),
}

impl RecordHeader {
    pub fn new(payload_len: u16, status: LinkStatus, timestamp: u16) -> Self {
        Self { payload_len, status, timestamp }
    }

    fn parse(mut buf: &[u8]) -> Option<Self> {
        if buf.get_u16_le() != SYNC_WORD || buf.get_u16_le() != HEADER_WORDS {
            return None;
        }
        let payload_len = buf.get_u16_le();
        let status = LinkStatus::from_u16(buf.get_u16_le())?;
        let timestamp = buf.get_u16_le();
        Some(Self { payload_len, status, timestamp })
    }

    /// Header and payload, as one contiguous record
    pub fn to_record(&self, payload: &[u8]) -> BytesMut {
        let mut w = BytesMut::with_capacity(HEADER_LEN + payload.len());
        w.put_u16_le(SYNC_WORD);
        w.put_u16_le(HEADER_WORDS);
        w.put_u16_le(self.payload_len);
        w.put_u16_le(self.status.to_u16().unwrap_or_default());
        w.put_u16_le(self.timestamp);
        w.put_slice(payload);
        w
    }
}

/// Look at the record at the head of `buffer`, without consuming it
pub fn peek_record(buffer: &CBuffer) -> Peek {
    let mut hdr = [0u8; HEADER_LEN];
    if buffer.peek(&mut hdr) < HEADER_LEN {
        return Peek::Incomplete;
    }
    match RecordHeader::parse(&hdr) {
        None => Peek::Invalid,
        Some(h) if HEADER_LEN + h.payload_len as usize > buffer.size() => Peek::Invalid,
        Some(h) if HEADER_LEN + h.payload_len as usize > buffer.amount_data() => Peek::Incomplete,
        Some(h) => Peek::Record(h),
    }
}

/// Consume the record announced by `hdr`, copying at most `payload.len()`
/// octets of its payload. Returns the amount copied.
pub fn read_record(buffer: &mut CBuffer, hdr: &RecordHeader, payload: &mut [u8]) -> usize {
    buffer.advance_read(HEADER_LEN);
    let len = hdr.payload_len as usize;
    let n = len.min(payload.len());
    let n = buffer.read(&mut payload[..n]);
    buffer.advance_read(len - n);
    n
}

/// Drop the record announced by `hdr`
pub fn discard_record(buffer: &mut CBuffer, hdr: &RecordHeader) {
    buffer.advance_read(HEADER_LEN + hdr.payload_len as usize);
}

/// Push a record, at once; returns false when it does not fit
pub fn write_record(buffer: &mut CBuffer, hdr: &RecordHeader, payload: &[u8]) -> bool {
    buffer.write_record(&hdr.to_record(payload))
}

#[test]
fn test_record() {
    let mut buffer = CBuffer::new(64);
    let hdr = RecordHeader::new(4, LinkStatus::CrcError, 0x1234);
    assert!(write_record(&mut buffer, &hdr, &[1, 2, 3, 4]));

    let mut raw = [0u8; HEADER_LEN];
    buffer.peek(&mut raw);
    assert_eq!(raw, [0x5c, 0x5c, 0x05, 0x00, 0x04, 0x00, 0x01, 0x00, 0x34, 0x12]);

    let Peek::Record(parsed) = peek_record(&buffer) else { panic!() };
    assert_eq!(parsed, hdr);

    let mut payload = [0u8; 2];
    assert_eq!(read_record(&mut buffer, &parsed, &mut payload), 2);
    assert_eq!(payload, [1, 2]);
    assert_eq!(buffer.amount_data(), 0);
}

#[test]
fn test_record_into_larger_payload() {
    let mut buffer = CBuffer::new(64);
    let hdr = RecordHeader::new(3, LinkStatus::Ok, 7);
    assert!(write_record(&mut buffer, &hdr, &[4, 5, 6]));
    assert!(write_record(&mut buffer, &hdr, &[7, 8, 9]));

    let mut payload = [0u8; 8];
    assert_eq!(read_record(&mut buffer, &hdr, &mut payload), 3);
    assert_eq!(payload[..4], [4, 5, 6, 0]);
    assert_eq!(peek_record(&buffer), Peek::Record(hdr));
}

#[test]
fn test_record_incomplete_and_invalid() {
    let mut buffer = CBuffer::new(64);
    assert_eq!(peek_record(&buffer), Peek::Incomplete);

    let record = RecordHeader::new(8, LinkStatus::Ok, 0).to_record(&[0; 8]);
    buffer.write(&record[..12]);
    assert_eq!(peek_record(&buffer), Peek::Incomplete);

    buffer.empty();
    buffer.write(&[0xde, 0xad, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(peek_record(&buffer), Peek::Invalid);

    buffer.empty();
    let record = RecordHeader::new(100, LinkStatus::Ok, 0).to_record(&[]);
    buffer.write(&record);
    assert_eq!(peek_record(&buffer), Peek::Invalid);
}
