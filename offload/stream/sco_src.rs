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

//! From-air driver: moves the records written by the radio into the
//! transform buffer, one unit per kick, tagged with their time of arrival.
//!
//! Whatever the radio did, exactly one entry is emitted for each unit:
//! the received payload, or a synthetic one when nothing usable arrived.

use crate::buffer::CBuffer;
use crate::clock::{time_add, Time};
use crate::endpoint::DataFormat;
use crate::metadata::{LinkStatus, MetadataTag, ScoPrivateMetadata};
use crate::record::{discard_record, peek_record, read_record, Peek, RecordHeader};

/// Position of a record timestamp against the expected one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Nothing expected yet, the record sets the reference
    Ready,
    OnTime,
    /// Precedes the expected timestamp
    Late,
    /// Follows the expected timestamp, records were lost
    Jumped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SrcStats {
    pub records: u32,
    pub synthesized: u32,
    pub late: u32,
    pub jumped: u32,
    pub resyncs: u32,
    /// Invalid headers, the input buffer is emptied
    pub resets: u32,
    /// Octets dropped because the output was full
    pub discarded_octets: u32,
}

/// Units of a framed isochronous channel: SDUs are not aligned on the ISO
/// interval, so each kick handles as many SDU intervals as elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramedUnits {
    sdu_interval_us: u32,
    iso_interval_us: u32,
    time_remaining_us: u32,
}

impl FramedUnits {
    pub fn new(sdu_interval_us: u32, iso_interval_us: u32) -> Self {
        Self { sdu_interval_us: sdu_interval_us.max(1), iso_interval_us, time_remaining_us: 0 }
    }

    /// Units due in the ISO interval that starts
    pub fn next_units(&mut self) -> u32 {
        self.time_remaining_us += self.iso_interval_us;
        let units = self.time_remaining_us / self.sdu_interval_us;
        self.time_remaining_us -= units * self.sdu_interval_us;
        units
    }
}

#[derive(Debug)]
pub struct ScoSrcDriver {
    format: DataFormat,
    frame_len: usize,
    ts_step: u16,
    exp_ts: Option<u16>,
    resync_threshold: u16,
    consecutive_late: u16,
    pending_discarded: u16,
    framed: Option<FramedUnits>,
    stats: SrcStats,
}

impl ScoSrcDriver {
    pub fn new(format: DataFormat, resync_threshold: u16) -> Self {
        Self {
            format,
            frame_len: 0,
            ts_step: 0,
            exp_ts: None,
            resync_threshold,
            consecutive_late: 0,
            pending_discarded: 0,
            framed: None,
            stats: Default::default(),
        }
    }

    /// Reset the timing state before the first kick
    pub fn prepare(&mut self, frame_len: usize, ts_step: u16, framed: Option<FramedUnits>) {
        self.frame_len = frame_len;
        self.ts_step = ts_step;
        self.exp_ts = None;
        self.consecutive_late = 0;
        self.pending_discarded = 0;
        self.framed = framed;
    }

    pub fn set_expected_timestamp(&mut self, ts: Option<u16>) {
        self.exp_ts = ts;
    }

    pub fn expected_timestamp(&self) -> Option<u16> {
        self.exp_ts
    }

    pub fn set_resync_threshold(&mut self, threshold: u16) {
        self.resync_threshold = threshold;
    }

    pub fn stats(&self) -> &SrcStats {
        &self.stats
    }

    pub fn classify(&self, ts: u16) -> Classification {
        let Some(exp) = self.exp_ts else {
            return Classification::Ready;
        };
        match ts.wrapping_sub(exp) as i16 {
            0 => Classification::OnTime,
            d if d < 0 => Classification::Late,
            _ => Classification::Jumped,
        }
    }

    /// Handle one kick. `toa` is the time of arrival of the first unit,
    /// `sp_adjust` the current sample period deviation of the link.
    pub fn run(&mut self, input: &mut CBuffer, output: &mut CBuffer, toa: Time, sp_adjust: i32) {
        let (units, interval) = match self.framed.as_mut() {
            Some(framed) => (framed.next_units(), framed.sdu_interval_us),
            None => (1, 0),
        };
        for k in 0..units {
            self.process_unit(input, output, time_add(toa, (k * interval) as i32), sp_adjust);
            self.exp_ts = self.exp_ts.map(|ts| ts.wrapping_add(self.ts_step));
        }
    }

    fn process_unit(&mut self, input: &mut CBuffer, output: &mut CBuffer, toa: Time, sp: i32) {
        loop {
            let hdr = match peek_record(input) {
                Peek::Incomplete => {
                    return self.emit_synthetic(output, LinkStatus::NothingReceived, toa, sp);
                }
                Peek::Invalid => {
                    log::warn!("invalid record header, flushing {} octets", input.amount_data());
                    input.empty();
                    self.stats.resets += 1;
                    return self.emit_synthetic(output, LinkStatus::NothingReceived, toa, sp);
                }
                Peek::Record(hdr) => hdr,
            };

            match self.classify(hdr.timestamp) {
                Classification::Late => {
                    discard_record(input, &hdr);
                    self.stats.late += 1;
                    self.consecutive_late += 1;
                    log::warn!("late record {:04x}, expected {:04x?}", hdr.timestamp, self.exp_ts);
                    if self.consecutive_late > self.resync_threshold {
                        let late = self.consecutive_late;
                        log::warn!("{} late records in a row, resynchronising", late);
                        self.exp_ts = None;
                        self.consecutive_late = 0;
                        self.stats.resyncs += 1;
                    }
                }
                class => {
                    if class == Classification::Jumped {
                        log::warn!("record {:04x}, expected {:04x?}", hdr.timestamp, self.exp_ts);
                        self.stats.jumped += 1;
                    }
                    self.consecutive_late = 0;
                    self.exp_ts = Some(hdr.timestamp);
                    return self.emit_record(input, output, &hdr, toa, sp);
                }
            }
        }
    }

    fn unit_len(&self, payload_len: usize) -> usize {
        match self.format {
            DataFormat::Encoded => payload_len,
            _ => self.frame_len,
        }
    }

    fn emit_record(
        &mut self,
        input: &mut CBuffer,
        output: &mut CBuffer,
        hdr: &RecordHeader,
        toa: Time,
        sp: i32,
    ) {
        let len = self.unit_len(hdr.payload_len as usize);
        if output.amount_space() < len {
            discard_record(input, hdr);
            self.pending_discarded = self.pending_discarded.saturating_add(hdr.payload_len);
            self.stats.discarded_octets += hdr.payload_len as u32;
            log::warn!("output stalled, {} octets discarded", self.pending_discarded);
            return;
        }

        let mut payload = vec![0u8; len];
        read_record(input, hdr, &mut payload);
        if self.format == DataFormat::Pcm16ByteSwap {
            payload.chunks_exact_mut(2).for_each(|s| s.swap(0, 1));
        }
        self.stats.records += 1;
        self.push(output, &payload, hdr.status, toa, sp);
    }

    fn emit_synthetic(&mut self, output: &mut CBuffer, status: LinkStatus, toa: Time, sp: i32) {
        let len = self.unit_len(0);
        if output.amount_space() < len {
            log::warn!("output stalled, no room for silence");
            return;
        }
        self.stats.synthesized += 1;
        self.push(output, &vec![0u8; len], status, toa, sp);
    }

    fn push(
        &mut self,
        output: &mut CBuffer,
        payload: &[u8],
        status: LinkStatus,
        toa: Time,
        sp: i32,
    ) {
        output.write(payload);
        output.append_tag(MetadataTag::packet_toa(payload.len(), toa, sp).with_private(
            ScoPrivateMetadata {
                status: status.normalized(),
                discarded_data: std::mem::take(&mut self.pending_discarded),
            },
        ));
    }
}
