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

//! One-shot timers, kick handles and deferred kick queue

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::clock::{time_sub, Time};
use crate::endpoint::EndpointId;

/// Identifier of an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(NonZeroU32);

impl TimerId {
    pub fn get(&self) -> u32 {
        self.0.get()
    }
}

/// What a timer kicks when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KickObject {
    pub endpoint: EndpointId,
}

#[derive(Debug)]
struct TimerEvent {
    id: TimerId,
    at: Time,
    ko: KickObject,
}

/// One-shot timers, ordered by expiry
#[derive(Debug)]
pub struct TimerQueue {
    next_id: u32,
    events: Vec<TimerEvent>,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self { next_id: 1, events: Vec::new() }
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Default::default()
    }

    /// Arm a timer firing at `at`
    pub fn schedule_at(&mut self, at: Time, ko: KickObject) -> TimerId {
        let id = loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if let Some(id) = NonZeroU32::new(id).map(TimerId) {
                if !self.is_pending(id) {
                    break id;
                }
            }
        };
        self.events.push(TimerEvent { id, at, ko });
        id
    }

    /// Disarm a timer, returns false when it already fired or never existed
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let len = self.events.len();
        self.events.retain(|e| e.id != id);
        self.events.len() != len
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.events.iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Earliest expiry, as seen from `now`
    pub fn next_deadline(&self, now: Time) -> Option<Time> {
        self.events.iter().map(|e| e.at).min_by_key(|&at| time_sub(at, now))
    }

    /// Remove and return the earliest timer expired at `now`
    pub fn expire(&mut self, now: Time) -> Option<(TimerId, KickObject)> {
        let (idx, _) = self
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| time_sub(e.at, now) <= 0)
            .min_by_key(|(_, e)| time_sub(e.at, now))?;
        let e = self.events.remove(idx);
        Some((e.id, e.ko))
    }
}

const TIMER_ID_INVALID: u32 = 0;

/// Handle of the kick timer of an endpoint.
///
/// The handle is only cleared with an atomic swap, so that a stop racing
/// with the timer firing cancels it exactly once.
#[derive(Debug, Default)]
pub struct KickTimer(AtomicU32);

impl KickTimer {
    pub fn get(&self) -> Option<TimerId> {
        NonZeroU32::new(self.0.load(Ordering::SeqCst)).map(TimerId)
    }

    pub fn is_armed(&self) -> bool {
        self.get().is_some()
    }

    /// Arm a timer and record its handle
    pub fn arm(&self, timers: &mut TimerQueue, at: Time, ko: KickObject) {
        let id = timers.schedule_at(at, ko);
        self.0.store(id.get(), Ordering::SeqCst);
    }

    /// Clear the handle, returning the timer it referred to
    pub fn take(&self) -> Option<TimerId> {
        NonZeroU32::new(self.0.swap(TIMER_ID_INVALID, Ordering::SeqCst)).map(TimerId)
    }

    /// Cancel the recorded timer, if any.
    /// Returns true when a handle was recorded.
    pub fn cancel(&self, timers: &mut TimerQueue) -> bool {
        match self.take() {
            Some(id) => {
                timers.cancel(id);
                true
            }
            None => false,
        }
    }
}

/// Context in which the kicks of an endpoint are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KickMode {
    /// Straight from the timer
    #[default]
    Immediate,
    /// Posted to the high priority background queue
    Deferred,
}

/// Kicks waiting to be run by the background task
#[derive(Debug, Default)]
pub struct DeferredQueue {
    queue: VecDeque<KickObject>,
}

impl DeferredQueue {
    pub fn push(&mut self, ko: KickObject) {
        self.queue.push_back(ko);
    }

    pub fn pop(&mut self) -> Option<KickObject> {
        self.queue.pop_front()
    }

    /// Drop the pending kicks of an endpoint
    pub fn cancel(&mut self, endpoint: EndpointId) {
        self.queue.retain(|ko| ko.endpoint != endpoint);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Time spent in the kick handler of an endpoint
#[derive(Debug, Default)]
pub struct KickProfiler {
    pub kicks: u32,
    pub total_us: u64,
    pub peak_us: u32,
    started: Option<Time>,
}

impl KickProfiler {
    pub fn start(&mut self, now: Time) {
        self.started = Some(now);
        self.kicks += 1;
    }

    pub fn stop(&mut self, now: Time) {
        if let Some(started) = self.started.take() {
            let spent = time_sub(now, started).max(0) as u32;
            self.total_us += spent as u64;
            self.peak_us = self.peak_us.max(spent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ko(n: u16) -> KickObject {
        KickObject { endpoint: EndpointId(n) }
    }

    #[test]
    fn expire_in_order() {
        let mut timers = TimerQueue::new();
        let a = timers.schedule_at(300, ko(1));
        let b = timers.schedule_at(100, ko(2));
        timers.schedule_at(500, ko(3));

        assert_eq!(timers.next_deadline(0), Some(100));
        assert_eq!(timers.expire(50), None);
        assert_eq!(timers.expire(400), Some((b, ko(2))));
        assert_eq!(timers.expire(400), Some((a, ko(1))));
        assert_eq!(timers.expire(400), None);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn expire_across_wrap() {
        let mut timers = TimerQueue::new();
        timers.schedule_at(0x10, ko(1));
        let early = timers.schedule_at(0xffff_fff0, ko(2));

        assert_eq!(timers.next_deadline(0xffff_ff00), Some(0xffff_fff0));
        assert_eq!(timers.expire(0x20).map(|(id, _)| id), Some(early));
    }

    #[test]
    fn kick_timer_cancels_once() {
        let mut timers = TimerQueue::new();
        let handle = KickTimer::default();

        handle.arm(&mut timers, 1000, ko(1));
        assert!(handle.is_armed());
        assert!(handle.cancel(&mut timers));
        assert!(!handle.cancel(&mut timers));
        assert!(timers.is_empty());
    }

    #[test]
    fn kick_timer_after_fire() {
        let mut timers = TimerQueue::new();
        let handle = KickTimer::default();

        handle.arm(&mut timers, 1000, ko(1));
        assert!(timers.expire(1000).is_some());

        // Fired but not re-armed yet: the stale handle is still cleared once
        assert!(handle.cancel(&mut timers));
        assert!(!handle.cancel(&mut timers));
    }

    #[test]
    fn deferred_queue_cancel() {
        let mut queue = DeferredQueue::default();
        queue.push(ko(1));
        queue.push(ko(2));
        queue.push(ko(1));
        queue.cancel(EndpointId(1));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(ko(2)));
        assert!(queue.is_empty());
    }

    #[test]
    fn profiler() {
        let mut profiler = KickProfiler::default();
        profiler.start(100);
        profiler.stop(130);
        profiler.start(200);
        profiler.stop(210);
        assert_eq!((profiler.kicks, profiler.total_us, profiler.peak_us), (2, 40, 30));
    }
}
