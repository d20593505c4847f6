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

//! Parameters of the radio links, as granted by the Bluetooth subsystem,
//! and the state reported back to it.

use std::collections::HashMap;

use crate::clock::{ClockTranslation, Time, US_PER_SLOT};

/// Snapshot of the parameters of a SCO or ISO link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkParams {
    /// Interval between packets, in microseconds
    pub tesco_us: u32,
    /// Wallclock used to translate the Bluetooth clock of the link
    pub wallclock_id: u32,
    /// Packet payload size from the air, in octets
    pub from_air_length: u16,
    /// Packet payload size to the air, in octets
    pub to_air_length: u16,
    /// Time between a slot and the availability of its payload
    pub from_air_latency_us: i32,
    /// Time between the read of a payload and its slot.
    /// Negative when the link is clocked by the remote device.
    pub to_air_latency_us: i32,
    /// Bluetooth clock of the next scheduled slot
    pub next_slot: u32,
    /// Isochronous channel parameters, for ISO links
    pub iso: Option<IsoParams>,
}

/// Parameters specific to isochronous channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoParams {
    pub framed: bool,
    /// ISO interval, in 1.25 ms units
    pub iso_interval: u16,
    pub sdu_interval_from_air_us: u32,
    pub sdu_interval_to_air_us: u32,
    /// Sequence number of the SDU of the next slot
    pub sdu_number_from_air: u16,
    pub sdu_number_to_air: u16,
}

impl IsoParams {
    pub fn iso_interval_us(&self) -> u32 {
        self.iso_interval as u32 * US_PER_SLOT * 2
    }
}

/// Link direction, seen from the air
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkDirection {
    FromAir,
    ToAir,
}

/// State reported to the radio, for one direction of a link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkRunState {
    pub running: bool,
    /// Frame length handed to the radio for frame based rate matching
    pub frame_length: u16,
}

#[derive(Debug, Default)]
struct Link {
    params: Option<LinkParams>,
    from_air: LinkRunState,
    to_air: LinkRunState,
}

/// Parameters of all the links, and translation of their clocks
pub struct LinkTable {
    links: HashMap<u16, Link>,
    clocks: Box<dyn ClockTranslation>,
}

impl LinkTable {
    pub fn new(clocks: Box<dyn ClockTranslation>) -> Self {
        Self { links: HashMap::new(), clocks }
    }

    pub(crate) fn add(&mut self, hci_handle: u16) {
        self.links.entry(hci_handle).or_default();
    }

    pub(crate) fn remove(&mut self, hci_handle: u16) {
        self.links.remove(&hci_handle);
    }

    pub fn contains(&self, hci_handle: u16) -> bool {
        self.links.contains_key(&hci_handle)
    }

    pub(crate) fn set_params(&mut self, hci_handle: u16, params: LinkParams) {
        self.links.entry(hci_handle).or_default().params = Some(params);
    }

    /// Parameters of the link, once received
    pub fn params(&self, hci_handle: u16) -> Option<&LinkParams> {
        self.links.get(&hci_handle)?.params.as_ref()
    }

    /// Local time of the Bluetooth clock value `ticks` of the link
    pub fn time_from_ticks(&self, hci_handle: u16, ticks: u32) -> Option<Time> {
        let params = self.params(hci_handle)?;
        self.clocks.time_from_ticks(params.wallclock_id, ticks)
    }

    pub fn run_state(&self, hci_handle: u16, dir: LinkDirection) -> LinkRunState {
        let Some(link) = self.links.get(&hci_handle) else {
            return Default::default();
        };
        match dir {
            LinkDirection::FromAir => link.from_air,
            LinkDirection::ToAir => link.to_air,
        }
    }

    pub(crate) fn set_running(&mut self, hci_handle: u16, dir: LinkDirection, running: bool) {
        self.run_state_mut(hci_handle, dir).running = running;
    }

    pub(crate) fn send_frame_length(&mut self, hci_handle: u16, dir: LinkDirection, len: u16) {
        log::debug!("link 0x{:03x} {:?}: frame length {}", hci_handle, dir, len);
        self.run_state_mut(hci_handle, dir).frame_length = len;
    }

    fn run_state_mut(&mut self, hci_handle: u16, dir: LinkDirection) -> &mut LinkRunState {
        let link = self.links.entry(hci_handle).or_default();
        match dir {
            LinkDirection::FromAir => &mut link.from_air,
            LinkDirection::ToAir => &mut link.to_air,
        }
    }
}
