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

//! Measurement of the rate of a link against the local clock

use crate::clock::{time_between_bt_clocks, time_sub, Time, SECOND};

/// Fixed point position of measured rates
pub const RATE_FIX_POINT_SHIFT: u32 = 22;

/// Rate of a link running exactly at the local clock speed
pub const UNITY_RATE: i32 = 1 << RATE_FIX_POINT_SHIFT;

/// Rate as `expected / measured`, on [`RATE_FIX_POINT_SHIFT`] fixed point
pub fn calc_rate(expected: i32, measured: i32) -> i32 {
    if measured <= 0 {
        return UNITY_RATE;
    }
    (((expected as i64) << RATE_FIX_POINT_SHIFT) / measured as i64) as i32
}

/// Deviation of a rate from unity, as a Q1.31 fraction
pub fn rate_to_frac(rate: i32) -> i32 {
    let deviation = (rate - UNITY_RATE) as i64;
    (deviation << (31 - RATE_FIX_POINT_SHIFT)).clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Rate estimator of a link endpoint.
///
/// A measurement window starts at a kick, identified by its local time
/// and Bluetooth clock. When a kick happens more than a second after the
/// start of the window, the Bluetooth clock progression is compared to the
/// local time progression, and a new window starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateEstimator {
    rate: i32,
    start_time: Time,
    start_ticks: u32,
    start_remainder_us: u32,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self { rate: UNITY_RATE, start_time: 0, start_ticks: 0, start_remainder_us: 0 }
    }
}

impl RateEstimator {
    /// Forget the measurements, and start a window at this kick
    pub fn reset(&mut self, kick_time: Time, ticks: u32, remainder_us: u32) {
        *self = Self {
            rate: UNITY_RATE,
            start_time: kick_time,
            start_ticks: ticks,
            start_remainder_us: remainder_us,
        };
    }

    /// Account a kick scheduled at `kick_time`, for the slot at
    /// Bluetooth clock `ticks` plus `remainder_us`.
    /// Returns the new rate when the window is complete.
    pub fn update(&mut self, kick_time: Time, ticks: u32, remainder_us: u32) -> Option<i32> {
        let measured = time_sub(kick_time, self.start_time);
        if measured <= SECOND as i32 {
            return None;
        }

        let expected = time_between_bt_clocks(self.start_ticks, ticks) as i64
            + remainder_us as i64
            - self.start_remainder_us as i64;

        log::debug!("rate window: measured {} expected {}", measured, expected);

        self.start_time = kick_time;
        self.start_ticks = ticks;
        self.start_remainder_us = remainder_us;
        self.rate = calc_rate(expected as i32, measured);
        Some(self.rate)
    }

    /// Last measured rate, on [`RATE_FIX_POINT_SHIFT`] fixed point
    pub fn rate(&self) -> i32 {
        self.rate
    }

    /// Sample period deviation of the last measured rate
    pub fn sp_deviation(&self) -> i32 {
        rate_to_frac(self.rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::us_to_bt_ticks;

    #[test]
    fn fixed_point() {
        assert_eq!(calc_rate(1_000_000, 1_000_000), UNITY_RATE);
        assert_eq!(calc_rate(1_000_100, 1_000_000), UNITY_RATE + 419);
        assert_eq!(calc_rate(5, 0), UNITY_RATE);

        assert_eq!(rate_to_frac(UNITY_RATE), 0);
        assert_eq!(rate_to_frac(UNITY_RATE + 1), 1 << 9);
        assert_eq!(rate_to_frac(UNITY_RATE - 419), -419 << 9);
    }

    #[test]
    fn window_below_a_second() {
        let mut rate = RateEstimator::default();
        rate.reset(0, 0, 0);
        assert_eq!(rate.update(SECOND, us_to_bt_ticks(SECOND), 0), None);
        assert_eq!(rate.rate(), UNITY_RATE);
    }

    #[test]
    fn slow_local_clock() {
        let mut rate = RateEstimator::default();
        rate.reset(1000, 100, 0);

        // 1.2 s of Bluetooth clock elapsed in 1.2 s - 120 us of local time
        let ticks = 100 + us_to_bt_ticks(1_200_000);
        assert_eq!(rate.update(1000 + 1_200_000 - 120, ticks, 0), Some(UNITY_RATE + 419));
        assert!(rate.sp_deviation() > 0);

        // The next window starts at this kick
        let ticks = ticks + us_to_bt_ticks(1_200_000);
        assert_eq!(rate.update(1000 + 2_400_000 - 120, ticks, 0), Some(UNITY_RATE));
    }

    #[test]
    fn remainder_is_accounted() {
        let mut rate = RateEstimator::default();
        rate.reset(0, 0, 125);
        let ticks = us_to_bt_ticks(1_500_000);
        assert_eq!(rate.update(1_500_125, ticks, 250), Some(calc_rate(1_500_125, 1_500_125)));
    }
}
