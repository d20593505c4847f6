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

//! Local time and Bluetooth clock domains.
//!
//! Local time is a free running microsecond counter that wraps at 32 bits.
//! The Bluetooth clock counts half slots (312.5 us) on 28 bits.
//! Conversions between both domains go through a [`ClockTranslation`].

use std::cell::Cell;
use std::collections::HashMap;

/// Local time, in microseconds, wrapping
pub type Time = u32;

/// Signed difference between two local times, in microseconds
pub type TimeInterval = i32;

pub const SECOND: u32 = 1_000_000;

/// Duration of a Bluetooth slot, in microseconds
pub const US_PER_SLOT: u32 = 625;

/// Bit width of the Bluetooth clock
pub const BT_TICK_MASK: u32 = 0x0FFF_FFFF;

pub fn time_add(t: Time, d: TimeInterval) -> Time {
    t.wrapping_add(d as u32)
}

pub fn time_sub(a: Time, b: Time) -> TimeInterval {
    a.wrapping_sub(b) as TimeInterval
}

/// `a` is at, or before `b`
pub fn time_le(a: Time, b: Time) -> bool {
    time_sub(a, b) <= 0
}

pub fn us_to_bt_ticks(us: u32) -> u32 {
    us * 2 / US_PER_SLOT
}

pub fn bt_ticks_to_us(ticks: u32) -> u32 {
    ticks * US_PER_SLOT / 2
}

pub fn btclock_add(ticks: u32, d: u32) -> u32 {
    ticks.wrapping_add(d) & BT_TICK_MASK
}

/// Microseconds elapsed from Bluetooth clock `from` to `to`, across wraparound
pub fn time_between_bt_clocks(from: u32, to: u32) -> u32 {
    let ticks = to.wrapping_sub(from) & BT_TICK_MASK;
    (ticks as u64 * US_PER_SLOT as u64 / 2) as u32
}

/// Source of the local time
pub trait LocalClock {
    /// Current local time
    fn now(&self) -> Time;
}

/// Local clock driven by hand, used to simulate the DSP timebase
#[derive(Debug, Default)]
pub struct VirtualClock {
    now: Cell<Time>,
}

impl VirtualClock {
    pub fn new(now: Time) -> Self {
        Self { now: Cell::new(now) }
    }

    pub fn set(&self, now: Time) {
        self.now.set(now);
    }

    pub fn advance(&self, us: u32) {
        self.now.set(self.now.get().wrapping_add(us));
    }
}

impl LocalClock for VirtualClock {
    fn now(&self) -> Time {
        self.now.get()
    }
}

/// Translation of Bluetooth clock values into local time.
/// This is the only place where both domains meet.
pub trait ClockTranslation {
    /// Local time of the Bluetooth clock value `ticks`, on wallclock `wallclock_id`.
    /// Returns `None` when the wallclock is not known.
    fn time_from_ticks(&self, wallclock_id: u32, ticks: u32) -> Option<Time>;
}

/// Wallclock sampled at one point, and extrapolated with a constant drift
#[derive(Debug, Clone, Copy)]
pub struct LinearWallclock {
    /// Bluetooth clock at the sampling point
    pub ref_ticks: u32,
    /// Local time at the sampling point
    pub ref_time: Time,
    /// Drift of the Bluetooth clock against the local clock, in ppm
    pub drift_ppm: i32,
}

impl LinearWallclock {
    pub fn new(ref_ticks: u32, ref_time: Time) -> Self {
        Self { ref_ticks: ref_ticks & BT_TICK_MASK, ref_time, drift_ppm: 0 }
    }

    pub fn with_drift(self, drift_ppm: i32) -> Self {
        Self { drift_ppm, ..self }
    }

    pub fn time_from_ticks(&self, ticks: u32) -> Time {
        // Half the clock range is considered in the past of the reference
        let mut delta = (ticks.wrapping_sub(self.ref_ticks) & BT_TICK_MASK) as i64;
        if delta >= 1 << 27 {
            delta -= 1 << 28;
        }

        let us = delta * US_PER_SLOT as i64 / 2;
        let us = us + us * self.drift_ppm as i64 / SECOND as i64;
        time_add(self.ref_time, us as TimeInterval)
    }
}

/// Set of wallclocks, keyed by wallclock identifier
#[derive(Debug, Default)]
pub struct Wallclocks {
    clocks: HashMap<u32, LinearWallclock>,
}

impl Wallclocks {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, wallclock_id: u32, clock: LinearWallclock) {
        self.clocks.insert(wallclock_id, clock);
    }
}

impl ClockTranslation for Wallclocks {
    fn time_from_ticks(&self, wallclock_id: u32, ticks: u32) -> Option<Time> {
        Some(self.clocks.get(&wallclock_id)?.time_from_ticks(ticks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_time_wraps() {
        assert_eq!(time_add(0xffff_fff0, 0x20), 0x10);
        assert_eq!(time_sub(0x10, 0xffff_fff0), 0x20);
        assert!(time_le(0xffff_fff0, 0x10));
        assert!(!time_le(0x10, 0xffff_fff0));
        assert!(time_le(5, 5));
    }

    #[test]
    fn tick_conversions() {
        assert_eq!(us_to_bt_ticks(7500), 24);
        assert_eq!(bt_ticks_to_us(24), 7500);
        assert_eq!(us_to_bt_ticks(7000), 22);
        assert_eq!(bt_ticks_to_us(2), US_PER_SLOT);
        assert_eq!(btclock_add(BT_TICK_MASK, 3), 2);
        assert_eq!(time_between_bt_clocks(BT_TICK_MASK - 1, 2), bt_ticks_to_us(4));
    }

    #[test]
    fn wallclock_across_wrap() {
        let clock = LinearWallclock::new(BT_TICK_MASK - 7, 1_000_000);
        assert_eq!(clock.time_from_ticks(BT_TICK_MASK - 7), 1_000_000);
        assert_eq!(clock.time_from_ticks(16), 1_000_000 + 7500);
        assert_eq!(clock.time_from_ticks(BT_TICK_MASK - 31), 1_000_000 - 7500);
    }

    #[test]
    fn wallclock_drift() {
        let clock = LinearWallclock::new(0, 0).with_drift(100);
        assert_eq!(clock.time_from_ticks(us_to_bt_ticks(SECOND)), SECOND + 100);

        let mut clocks = Wallclocks::new();
        clocks.insert(3, clock);
        assert_eq!(clocks.time_from_ticks(3, 32), Some(10_001));
        assert_eq!(clocks.time_from_ticks(4, 32), None);
    }
}
