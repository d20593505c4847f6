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

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};

use crate::clock::Time;

/// Reception status of a link packet, as reported by the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive, ToPrimitive)]
pub enum LinkStatus {
    #[default]
    Ok = 0,
    CrcError = 1,
    NothingReceived = 2,
    NeverScheduled = 3,
    OkWbm = 4,
    ZeroPacket = 5,
    NoPacket = 6,
}

impl LinkStatus {
    /// Weak-bit-mask packets are good packets for everything downstream
    pub fn normalized(self) -> Self {
        match self {
            LinkStatus::OkWbm => LinkStatus::Ok,
            status => status,
        }
    }
}

/// Status of a frame built from several tags: keep the worst one.
pub fn cumulative_status(old: LinkStatus, cur: LinkStatus) -> LinkStatus {
    let (old, cur) = (old.normalized(), cur.normalized());
    match (old, cur) {
        (LinkStatus::Ok, _) => cur,
        (LinkStatus::CrcError, cur) if cur != LinkStatus::Ok => cur,
        _ => old,
    }
}

bitflags! {
    /// Framing and timing flags of a metadata tag
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TagFlags: u8 {
        const PACKET_START = 1 << 0;
        const PACKET_END = 1 << 1;
        const TIME_OF_ARRIVAL = 1 << 2;
        const TIME_TO_PLAY = 1 << 3;
    }
}

/// Private data attached by the link drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScoPrivateMetadata {
    pub status: LinkStatus,
    /// Octets dropped by the driver before this tag, because of a stall
    pub discarded_data: u16,
}

/// Metadata describing `length` octets of a buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataTag {
    pub length: usize,
    pub flags: TagFlags,
    /// Time of arrival or time to play, following `flags`
    pub timestamp: Time,
    /// Sample period adjustment, fractional
    pub sp_adjust: i32,
    pub private: Option<ScoPrivateMetadata>,
}

impl MetadataTag {
    pub fn new(length: usize) -> Self {
        Self { length, ..Default::default() }
    }

    /// A complete packet, which arrived at `toa`
    pub fn packet_toa(length: usize, toa: Time, sp_adjust: i32) -> Self {
        Self {
            length,
            flags: TagFlags::PACKET_START | TagFlags::PACKET_END | TagFlags::TIME_OF_ARRIVAL,
            timestamp: toa,
            sp_adjust,
            private: None,
        }
    }

    /// A chunk of data, to be played at `ttp`
    pub fn ttp(length: usize, ttp: Time) -> Self {
        Self { length, flags: TagFlags::TIME_TO_PLAY, timestamp: ttp, ..Default::default() }
    }

    pub fn with_private(self, private: ScoPrivateMetadata) -> Self {
        Self { private: Some(private), ..self }
    }

    pub fn time_of_arrival(&self) -> Option<Time> {
        self.flags.contains(TagFlags::TIME_OF_ARRIVAL).then_some(self.timestamp)
    }

    pub fn time_to_play(&self) -> Option<Time> {
        self.flags.contains(TagFlags::TIME_TO_PLAY).then_some(self.timestamp)
    }

    /// Status found in the private data, if any
    pub fn status(&self) -> Option<LinkStatus> {
        self.private.map(|p| p.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn status_from_wire() {
        assert_eq!(LinkStatus::from_u16(1), Some(LinkStatus::CrcError));
        assert_eq!(LinkStatus::from_u16(6), Some(LinkStatus::NoPacket));
        assert_eq!(LinkStatus::from_u16(7), None);
    }

    #[test]
    fn cumulative_status_is_pessimistic() {
        use LinkStatus::*;

        assert_eq!(cumulative_status(Ok, CrcError), CrcError);
        assert_eq!(cumulative_status(Ok, NothingReceived), NothingReceived);
        assert_eq!(cumulative_status(CrcError, Ok), CrcError);
        assert_eq!(cumulative_status(CrcError, NothingReceived), NothingReceived);
        assert_eq!(cumulative_status(NothingReceived, CrcError), NothingReceived);
        assert_eq!(cumulative_status(NeverScheduled, Ok), NeverScheduled);
    }

    #[test]
    fn weak_bit_mask_is_ok() {
        use LinkStatus::*;

        assert_eq!(OkWbm.normalized(), Ok);
        assert_eq!(cumulative_status(OkWbm, CrcError), CrcError);
        assert_eq!(cumulative_status(CrcError, OkWbm), CrcError);
        assert_eq!(cumulative_status(OkWbm, OkWbm), Ok);
    }

    #[test]
    fn tag_timestamps() {
        let tag = MetadataTag::packet_toa(60, 1234, -5);
        assert_eq!(tag.time_of_arrival(), Some(1234));
        assert_eq!(tag.time_to_play(), None);
        assert!(tag.flags.contains(TagFlags::PACKET_START | TagFlags::PACKET_END));

        let tag = MetadataTag::ttp(120, 99)
            .with_private(ScoPrivateMetadata { status: LinkStatus::CrcError, discarded_data: 0 });
        assert_eq!(tag.time_to_play(), Some(99));
        assert_eq!(tag.status(), Some(LinkStatus::CrcError));
    }
}
