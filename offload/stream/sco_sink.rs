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

//! To-air driver: frames one unit of the transform buffer per kick into a
//! record for the radio, and checks its time to play against the slot.

use crate::buffer::CBuffer;
use crate::clock::{time_sub, Time, TimeInterval};
use crate::endpoint::DataFormat;
use crate::metadata::{cumulative_status, LinkStatus, TagFlags};
use crate::record::{write_record, RecordHeader, HEADER_LEN};

/// Time to play of a unit, against the reference time of its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtpState {
    Early,
    InTime,
    Late,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub records: u32,
    pub early: u32,
    pub in_time: u32,
    pub late: u32,
    /// Units sent as silence, nothing was available
    pub underruns: u32,
    /// Units dropped, the radio did not consume the previous ones
    pub overruns: u32,
}

/// Proportional-integral controller turning the time to play deviation
/// into a playback rate correction, as a Q1.31 fraction.
/// The correction is positive when the data arrives late.
#[derive(Debug, Clone, Default)]
pub struct TtpController {
    integral: i64,
}

impl TtpController {
    /// Gain of the deviation, per microsecond
    pub const KP: i64 = 214;
    pub const KI: i64 = 8;
    /// Correction limit, 2000 ppm
    pub const WARP_LIMIT: i64 = 4_294_967;

    pub fn reset(&mut self) {
        self.integral = 0;
    }

    /// `deviation` is the time to play minus the reference time
    pub fn update(&mut self, deviation: TimeInterval) -> i32 {
        let lateness = -(deviation as i64);
        let bound = Self::WARP_LIMIT / Self::KI;
        self.integral = (self.integral + lateness).clamp(-bound, bound);
        (Self::KP * lateness + Self::KI * self.integral)
            .clamp(-Self::WARP_LIMIT, Self::WARP_LIMIT) as i32
    }
}

#[derive(Debug)]
pub struct ScoSinkDriver {
    format: DataFormat,
    frame_len: usize,
    /// Sequence number of the next record, when numbered
    seq: Option<u16>,
    max_deviation_us: u32,
    ttp: Option<TtpController>,
    stats: SinkStats,
}

impl ScoSinkDriver {
    pub fn new(format: DataFormat, max_deviation_us: u32) -> Self {
        Self {
            format,
            frame_len: 0,
            seq: None,
            max_deviation_us,
            ttp: None,
            stats: Default::default(),
        }
    }

    /// Reset the state before the first kick
    pub fn prepare(&mut self, frame_len: usize, ttp_enable: bool) {
        self.frame_len = frame_len;
        self.seq = None;
        self.ttp = ttp_enable.then(TtpController::default);
    }

    /// Number the records, starting from `seq`
    pub fn set_sequence_number(&mut self, seq: Option<u16>) {
        self.seq = seq;
    }

    pub fn sequence_number(&self) -> Option<u16> {
        self.seq
    }

    pub fn set_max_deviation(&mut self, max_deviation_us: u32) {
        self.max_deviation_us = max_deviation_us;
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    pub fn classify(&self, deviation: TimeInterval) -> TtpState {
        let max = self.max_deviation_us as i64;
        match deviation as i64 {
            d if d < -max => TtpState::Late,
            d if d > max => TtpState::Early,
            _ => TtpState::InTime,
        }
    }

    /// Handle one kick, for the slot whose payload is read at `reference`.
    /// Returns the rate correction, when the controller is enabled.
    pub fn run(
        &mut self,
        input: &mut CBuffer,
        output: &mut CBuffer,
        reference: Time,
    ) -> Option<i32> {
        let len = match self.format {
            DataFormat::Encoded => input.peek_tag().map_or(0, |t| t.length),
            _ => self.frame_len,
        };

        let mut payload = vec![0u8; len];
        let mut ttp = None;
        let mut status = LinkStatus::Ok;
        if input.amount_data() < len || (len == 0 && input.peek_tag().is_none()) {
            self.stats.underruns += 1;
            log::warn!("underrun, {} of {} octets available", input.amount_data(), len);
        } else {
            input.read(&mut payload);
            (ttp, status) = consume_tags(input, len);
        }
        if output.amount_space() < HEADER_LEN + len {
            self.stats.overruns += 1;
            log::warn!("radio is not consuming, unit dropped");
            return None;
        }

        if self.format == DataFormat::Pcm16ByteSwap {
            payload.chunks_exact_mut(2).for_each(|s| s.swap(0, 1));
        }
        let hdr = RecordHeader::new(len as u16, status, self.seq.unwrap_or(0));
        if !write_record(output, &hdr, &payload) {
            self.stats.overruns += 1;
            return None;
        }
        self.seq = self.seq.map(|seq| seq.wrapping_add(1));
        self.stats.records += 1;

        let deviation = time_sub(ttp?, reference);
        match self.classify(deviation) {
            TtpState::Early => self.stats.early += 1,
            TtpState::InTime => self.stats.in_time += 1,
            TtpState::Late => {
                log::debug!("unit late by {} us", -deviation);
                self.stats.late += 1
            }
        }
        self.ttp.as_mut().map(|ctrl| ctrl.update(deviation))
    }
}

/// Remove the tags describing the `len` octets just read, keeping the
/// first time to play and the worst status. A tag longer than what is
/// left is shortened and stays at the head, without its time to play.
fn consume_tags(input: &mut CBuffer, len: usize) -> (Option<Time>, LinkStatus) {
    let mut ttp = None;
    let mut status = LinkStatus::Ok;
    let mut remaining = len;
    let mut first = true;
    while let Some(tag) = input.peek_tag_mut() {
        if !first && remaining == 0 {
            break;
        }
        first = false;
        ttp = ttp.or(tag.time_to_play());
        if let Some(tag_status) = tag.status() {
            status = cumulative_status(status, tag_status);
        }
        if tag.length > remaining {
            tag.length -= remaining;
            tag.flags.remove(TagFlags::TIME_TO_PLAY | TagFlags::PACKET_START);
            break;
        }
        remaining -= tag.length;
        input.remove_tag();
    }
    (ttp, status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataTag, ScoPrivateMetadata};
    use crate::record::{peek_record, read_record, Peek};

    fn feed(input: &mut CBuffer, octets: &[u8], ttp: Time) {
        input.write(octets);
        input.append_tag(MetadataTag::ttp(octets.len(), ttp));
    }

    fn take_record(output: &mut CBuffer) -> (RecordHeader, Vec<u8>) {
        let Peek::Record(hdr) = peek_record(output) else { panic!("no record") };
        let mut payload = vec![0u8; hdr.payload_len as usize];
        read_record(output, &hdr, &mut payload);
        (hdr, payload)
    }

    #[test]
    fn numbered_records() {
        let mut input = CBuffer::with_metadata(64);
        let mut output = CBuffer::new(64);
        let mut drv = ScoSinkDriver::new(DataFormat::Pcm16, 500);
        drv.prepare(4, false);
        drv.set_sequence_number(Some(0xffff));

        feed(&mut input, &[1, 2, 3, 4], 1000);
        assert_eq!(drv.run(&mut input, &mut output, 1000), None);
        feed(&mut input, &[5, 6, 7, 8], 8500);
        drv.run(&mut input, &mut output, 8500);

        let (hdr, payload) = take_record(&mut output);
        assert_eq!((hdr.timestamp, hdr.status), (0xffff, LinkStatus::Ok));
        assert_eq!(payload, vec![1, 2, 3, 4]);
        let (hdr, _) = take_record(&mut output);
        assert_eq!(hdr.timestamp, 0);
        assert_eq!(drv.sequence_number(), Some(1));
        assert_eq!(drv.stats().in_time, 2);
    }

    #[test]
    fn underrun_sends_silence() {
        let mut input = CBuffer::with_metadata(64);
        let mut output = CBuffer::new(64);
        let mut drv = ScoSinkDriver::new(DataFormat::Pcm16, 500);
        drv.prepare(4, false);

        input.write(&[1, 2]);
        drv.run(&mut input, &mut output, 0);

        assert_eq!(drv.stats().underruns, 1);
        assert_eq!(input.amount_data(), 2);
        let (hdr, payload) = take_record(&mut output);
        assert_eq!((hdr.timestamp, payload), (0, vec![0; 4]));
    }

    #[test]
    fn overrun_drops_unit() {
        let mut input = CBuffer::with_metadata(64);
        let mut output = CBuffer::new(HEADER_LEN + 6);
        let mut drv = ScoSinkDriver::new(DataFormat::Pcm16, 500);
        drv.prepare(4, false);

        feed(&mut input, &[1; 4], 0);
        feed(&mut input, &[2; 4], 0);
        drv.run(&mut input, &mut output, 0);
        drv.run(&mut input, &mut output, 0);

        assert_eq!(drv.stats().overruns, 1);
        assert_eq!(drv.stats().records, 1);
        assert_eq!(input.amount_data(), 0);
        assert_eq!(output.amount_data(), HEADER_LEN + 4);
    }

    #[test]
    fn deviation_window() {
        let drv = ScoSinkDriver::new(DataFormat::Pcm16, 500);
        assert_eq!(drv.classify(-501), TtpState::Late);
        assert_eq!(drv.classify(-500), TtpState::InTime);
        assert_eq!(drv.classify(500), TtpState::InTime);
        assert_eq!(drv.classify(501), TtpState::Early);
    }

    #[test]
    fn late_data_speeds_up() {
        let mut input = CBuffer::with_metadata(64);
        let mut output = CBuffer::new(256);
        let mut drv = ScoSinkDriver::new(DataFormat::Pcm16, 500);
        drv.prepare(4, true);

        feed(&mut input, &[0; 4], 9000);
        let warp = drv.run(&mut input, &mut output, 10_000).unwrap();
        assert_eq!(warp, (214 * 1000 + 8 * 1000) as i32);
        assert_eq!(drv.stats().late, 1);

        feed(&mut input, &[0; 4], 30_000);
        let warp = drv.run(&mut input, &mut output, 10_000).unwrap();
        assert_eq!(warp, -(TtpController::WARP_LIMIT as i32));
        assert_eq!(drv.stats().early, 1);
    }

    #[test]
    fn encoded_units_follow_tags() {
        let mut input = CBuffer::with_metadata(64);
        let mut output = CBuffer::new(64);
        let mut drv = ScoSinkDriver::new(DataFormat::Encoded, 500);
        drv.prepare(0, false);

        feed(&mut input, &[7; 5], 0);
        feed(&mut input, &[8; 3], 0);
        drv.run(&mut input, &mut output, 0);
        drv.run(&mut input, &mut output, 0);

        assert_eq!(take_record(&mut output).1, vec![7; 5]);
        assert_eq!(take_record(&mut output).1, vec![8; 3]);
    }

    #[test]
    fn long_tag_spans_several_units() {
        let mut input = CBuffer::with_metadata(64);
        let mut output = CBuffer::new(128);
        let mut drv = ScoSinkDriver::new(DataFormat::Pcm16, 500);
        drv.prepare(4, false);

        feed(&mut input, &[1; 8], 1000);
        feed(&mut input, &[2; 4], 16_000);
        drv.run(&mut input, &mut output, 1000);
        assert_eq!((input.amount_data(), input.tag_count()), (8, 2));
        assert_eq!(input.peek_tag().map(|t| (t.length, t.time_to_play())), Some((4, None)));

        // The rest of the first tag carries no time to play of its own
        drv.run(&mut input, &mut output, 8500);
        assert_eq!((input.amount_data(), input.tag_count()), (4, 1));
        drv.run(&mut input, &mut output, 16_000);
        assert_eq!((input.amount_data(), input.tag_count()), (0, 0));

        assert_eq!(drv.stats().records, 3);
        assert_eq!(drv.stats().in_time, 2);
        assert_eq!(drv.stats().early + drv.stats().late, 0);
        let payloads: Vec<_> = (0..3).map(|_| take_record(&mut output).1).collect();
        assert_eq!(payloads, [vec![1; 4], vec![1; 4], vec![2; 4]]);
    }

    #[test]
    fn merged_tags_keep_the_worst_status() {
        let mut input = CBuffer::with_metadata(64);
        let mut output = CBuffer::new(64);
        let mut drv = ScoSinkDriver::new(DataFormat::Pcm16, 500);
        drv.prepare(4, false);

        let private = |status| ScoPrivateMetadata { status, discarded_data: 0 };
        input.write(&[1; 2]);
        input.append_tag(MetadataTag::ttp(2, 0).with_private(private(LinkStatus::OkWbm)));
        input.write(&[2; 2]);
        input.append_tag(MetadataTag::new(2).with_private(private(LinkStatus::CrcError)));
        drv.run(&mut input, &mut output, 0);

        let (hdr, payload) = take_record(&mut output);
        assert_eq!(hdr.status, LinkStatus::CrcError);
        assert_eq!(payload, vec![1, 1, 2, 2]);
        assert_eq!(input.tag_count(), 0);
    }
}
