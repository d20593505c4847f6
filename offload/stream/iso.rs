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

//! Isochronous channel specifics of the link endpoints

use crate::endpoint::{Context, Direction, Endpoint, EndpointCore, EndpointState};
use crate::error::{Error, Result};
use crate::link::IsoParams;
use crate::sco::LinkEndpoint;
use crate::sco_src::FramedUnits;

/// Kick period of an ISO endpoint: one SDU for unframed channels,
/// one ISO interval for framed ones
pub fn kick_period(iso: &IsoParams, dir: Direction) -> u32 {
    if iso.framed {
        iso.iso_interval_us()
    } else {
        sdu_interval(iso, dir)
    }
}

pub fn sdu_interval(iso: &IsoParams, dir: Direction) -> u32 {
    match dir {
        Direction::Source => iso.sdu_interval_from_air_us,
        Direction::Sink => iso.sdu_interval_to_air_us,
    }
}

/// Sequence number of the SDU of the first kick, `skipped` kick periods
/// after the slot the link parameters refer to. `None` when it cannot be
/// predicted.
pub fn first_sdu_number(iso: &IsoParams, dir: Direction, skipped: u32) -> Option<u16> {
    let (number, interval) = match dir {
        Direction::Source => (iso.sdu_number_from_air, iso.sdu_interval_from_air_us),
        Direction::Sink => (iso.sdu_number_to_air, iso.sdu_interval_to_air_us),
    };
    match (iso.framed, dir) {
        (true, Direction::Source) => None,
        (true, Direction::Sink) => Some(number),
        (false, _) => {
            let per_kick = kick_period(iso, dir) / interval.max(1);
            Some((number as u32).wrapping_add(skipped.wrapping_mul(per_kick)) as u16)
        }
    }
}

/// Unit accounting of the from-air driver, for framed channels
pub fn framed_units(iso: &IsoParams) -> Option<FramedUnits> {
    iso.framed.then(|| FramedUnits::new(iso.sdu_interval_from_air_us, iso.iso_interval_us()))
}

/// Check that two ISO endpoints can have their first kick in the same
/// interval. Nothing is modified.
pub fn check_sync(
    ep: &LinkEndpoint,
    core: &EndpointCore,
    cx: &Context,
    peer: Option<&Endpoint>,
) -> Result<()> {
    let Some(peer) = peer else {
        if core.is_running() {
            return Err(Error::SyncRejected("endpoint is running"));
        }
        return Ok(());
    };
    let EndpointState::Iso(other) = &peer.state else {
        return Err(Error::SyncRejected("peer is not an ISO endpoint"));
    };
    if core.direction != Direction::Source || peer.core.direction != Direction::Source {
        return Err(Error::SyncRejected("only ISO sources can be synchronised"));
    }
    if core.is_running() || peer.core.is_running() {
        return Err(Error::SyncRejected("endpoint is running"));
    }

    let iso_params = |ep: &LinkEndpoint| -> Option<IsoParams> {
        cx.links.params(ep.hci_handle())?.iso.clone()
    };
    let (Some(a), Some(b)) = (iso_params(ep), iso_params(other)) else {
        return Err(Error::SyncRejected("link parameters unknown"));
    };
    if a.framed || b.framed {
        return Err(Error::SyncRejected("framed channels cannot be synchronised"));
    }
    if kick_period(&a, Direction::Source) != kick_period(&b, Direction::Source)
        || a.iso_interval != b.iso_interval
    {
        return Err(Error::SyncRejected("different intervals"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iso(framed: bool) -> IsoParams {
        IsoParams {
            framed,
            iso_interval: 8,
            sdu_interval_from_air_us: 10_000,
            sdu_interval_to_air_us: 5_000,
            sdu_number_from_air: 0xfffe,
            sdu_number_to_air: 40,
        }
    }

    #[test]
    fn kick_periods() {
        assert_eq!(kick_period(&iso(false), Direction::Source), 10_000);
        assert_eq!(kick_period(&iso(false), Direction::Sink), 5_000);
        assert_eq!(kick_period(&iso(true), Direction::Sink), 10_000);
    }

    #[test]
    fn sdu_numbering() {
        assert_eq!(first_sdu_number(&iso(false), Direction::Source, 0), Some(0xfffe));
        assert_eq!(first_sdu_number(&iso(false), Direction::Source, 3), Some(1));
        assert_eq!(first_sdu_number(&iso(false), Direction::Sink, 2), Some(42));
        assert_eq!(first_sdu_number(&iso(true), Direction::Source, 2), None);
        assert_eq!(first_sdu_number(&iso(true), Direction::Sink, 2), Some(40));
    }

    #[test]
    fn framed_unit_accounting() {
        assert!(framed_units(&iso(false)).is_none());

        let mut params = iso(true);
        params.sdu_interval_from_air_us = 7500;
        let mut units = framed_units(&params).unwrap();
        assert_eq!(units.next_units(), 1);
    }
}
