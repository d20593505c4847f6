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

//! Hardware audio endpoints

use bytes::{Buf, BufMut, BytesMut};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::buffer::{CBuffer, SharedBuffer};
use crate::clock::{time_add, Time};
use crate::endpoint::{
    BufferDetails, ClockSource, ConfigKey, ConfigValue, Context, DataFormat, Direction, Endpoint,
    EndpointCore, EndpointId, EndpointOps, EndpointState, KickDirection, Propagation,
    RatematchAbility, StreamConfig, TimingInfo,
};
use crate::error::{Error, Result};
use crate::metadata::MetadataTag;
use crate::sched::{KickObject, KickTimer};

/// Sample rate of the hardware interfaces
pub const SAMPLE_RATE_HZ: u32 = 16_000;

/// Audio interface channel, exchanging samples in the native 32 bits format
pub trait AudioDevice {
    /// Fill `samples` with captured audio, returns the number of samples read
    fn read(&mut self, samples: &mut [i32]) -> usize;

    /// Queue `samples` for playback, returns the number of samples taken
    fn write(&mut self, samples: &[i32]) -> usize;
}

/// Outcome of an acquisition of audio hardware
pub enum Acquire {
    Ready(Box<dyn AudioDevice>),
    /// Completed later, through `Stream::audio_acquired`
    Pending,
    Unavailable,
}

/// Platform access to the audio interfaces
pub trait AudioHardware {
    fn acquire(&mut self, instance: u8, channel: u8, dir: Direction) -> Acquire;

    fn release(&mut self, instance: u8, channel: u8, dir: Direction);
}

/// Key of an audio endpoint in the registry
pub fn audio_key(instance: u8, channel: u8) -> u32 {
    (instance as u32) << 8 | channel as u32
}

/// State of a hardware audio endpoint
pub struct AudioEndpoint {
    instance: u8,
    channel: u8,
    direction: Direction,
    device: Option<Box<dyn AudioDevice>>,
    format: DataFormat,
    buffer: Option<SharedBuffer>,
    /// Buffer supplied to the transform, when configured
    hw_buffer: Option<SharedBuffer>,
    kick_period_us: u32,
    kick_timer: KickTimer,
    kick_time: Time,
}

impl AudioEndpoint {
    pub fn new(instance: u8, channel: u8, direction: Direction, config: &StreamConfig) -> Self {
        Self {
            instance,
            channel,
            direction,
            device: None,
            format: DataFormat::Fixp,
            buffer: None,
            hw_buffer: None,
            kick_period_us: config.audio_kick_period_us,
            kick_timer: Default::default(),
            kick_time: 0,
        }
    }

    pub fn instance(&self) -> u8 {
        self.instance
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    pub fn set_device(&mut self, device: Box<dyn AudioDevice>) {
        self.device = Some(device);
    }

    pub fn kick_time(&self) -> Option<Time> {
        self.kick_timer.is_armed().then_some(self.kick_time)
    }

    fn samples_per_kick(&self) -> usize {
        (self.kick_period_us as u64 * SAMPLE_RATE_HZ as u64 / 1_000_000) as usize
    }

    fn sample_octets(&self) -> usize {
        match self.format {
            DataFormat::Fixp => 4,
            _ => 2,
        }
    }

    fn encode(&self, samples: &[i32]) -> BytesMut {
        let mut octets = BytesMut::with_capacity(samples.len() * self.sample_octets());
        for &s in samples {
            match self.format {
                DataFormat::Fixp => octets.put_i32_le(s),
                DataFormat::Pcm16ByteSwap => octets.put_i16((s >> 16) as i16),
                _ => octets.put_i16_le((s >> 16) as i16),
            }
        }
        octets
    }

    fn decode(&self, mut octets: &[u8]) -> Vec<i32> {
        let mut samples = Vec::with_capacity(octets.len() / self.sample_octets());
        while octets.remaining() >= self.sample_octets() {
            samples.push(match self.format {
                DataFormat::Fixp => octets.get_i32_le(),
                DataFormat::Pcm16ByteSwap => (octets.get_i16() as i32) << 16,
                _ => (octets.get_i16_le() as i32) << 16,
            });
        }
        samples
    }

    fn capture(&mut self, buffer: &mut CBuffer, now: Time) {
        let mut samples =
            vec![0; self.samples_per_kick().min(buffer.amount_space() / self.sample_octets())];
        let Some(device) = self.device.as_mut() else {
            return;
        };
        let n = device.read(&mut samples);
        if n == 0 {
            return;
        }

        let octets = self.encode(&samples[..n]);
        buffer.write(&octets);
        buffer.append_tag(MetadataTag::packet_toa(octets.len(), now, 0));
    }

    fn play(&mut self, buffer: &mut CBuffer) {
        if self.device.is_none() {
            return;
        }
        let n = self.samples_per_kick().min(buffer.amount_data() / self.sample_octets());
        let mut octets = vec![0; n * self.sample_octets()];
        buffer.read(&mut octets);

        let mut consumed = 0;
        while let Some(tag) = buffer.peek_tag() {
            if consumed + tag.length > octets.len() {
                break;
            }
            consumed += tag.length;
            buffer.remove_tag();
        }

        let samples = self.decode(&octets);
        let written = self.device.as_mut().map_or(0, |device| device.write(&samples));
        if written < samples.len() {
            log::warn!(
                "audio {}:{}: {} samples dropped",
                self.instance,
                self.channel,
                samples.len() - written
            );
        }
    }
}

impl EndpointOps for AudioEndpoint {
    fn close(&mut self, _core: &mut EndpointCore, _cx: &mut Context) -> Result<()> {
        self.device = None;
        Ok(())
    }

    fn connect(
        &mut self,
        _core: &mut EndpointCore,
        _cx: &mut Context,
        buffer: &SharedBuffer,
        _kick_target: Option<EndpointId>,
    ) -> Result<bool> {
        if self.device.is_none() {
            return Err(Error::HardwareUnavailable(self.instance, self.channel));
        }
        buffer.borrow_mut().set_usable_octets(self.format.usable_octets());
        self.buffer = Some(buffer.clone());
        Ok(false)
    }

    fn disconnect(&mut self, _core: &mut EndpointCore, _cx: &mut Context) -> Result<()> {
        self.buffer = None;
        Ok(())
    }

    fn buffer_details(&self, _core: &EndpointCore, _cx: &Context) -> BufferDetails {
        BufferDetails {
            supports_metadata: true,
            requires_metadata: false,
            supplies_buffer: self.hw_buffer.clone(),
            min_size: 2 * self.samples_per_kick() * self.sample_octets(),
            runs_in_place: false,
        }
    }

    fn data_format(&self, _core: &EndpointCore, _cx: &Context) -> DataFormat {
        self.format
    }

    fn kick(
        &mut self,
        core: &mut EndpointCore,
        cx: &mut Context,
        _dir: KickDirection,
    ) -> Vec<Propagation> {
        let Some(buffer) = self.buffer.clone() else {
            return vec![];
        };
        match self.direction {
            Direction::Source => {
                self.capture(&mut buffer.borrow_mut(), cx.clock.now());
                vec![Propagation { from: core.id, dir: KickDirection::Forwards }]
            }
            Direction::Sink => {
                self.play(&mut buffer.borrow_mut());
                vec![Propagation { from: core.id, dir: KickDirection::Backwards }]
            }
        }
    }

    fn sched_kick(&mut self, core: &mut EndpointCore, cx: &mut Context) {
        self.kick_time = time_add(self.kick_time, self.kick_period_us as i32);
        self.kick_timer.arm(cx.timers, self.kick_time, KickObject { endpoint: core.id });
    }

    fn start(&mut self, core: &mut EndpointCore, cx: &mut Context) -> Result<()> {
        if self.kick_timer.is_armed() {
            return Ok(());
        }
        self.kick_time = time_add(cx.clock.now(), self.kick_period_us as i32);
        self.kick_timer.arm(cx.timers, self.kick_time, KickObject { endpoint: core.id });
        core.set_running(true);
        log::info!("{} started, kick every {} us", core.id, self.kick_period_us);
        Ok(())
    }

    fn stop(&mut self, core: &mut EndpointCore, cx: &mut Context) -> bool {
        core.set_running(false);
        cx.deferred.cancel(core.id);
        self.kick_timer.cancel(cx.timers)
    }

    fn configure(
        &mut self,
        core: &mut EndpointCore,
        _cx: &mut Context,
        key: ConfigKey,
        value: u32,
    ) -> Result<()> {
        match key {
            ConfigKey::DataFormat => {
                if self.buffer.is_some() {
                    return Err(Error::AlreadyConnected(core.id));
                }
                self.format = match DataFormat::from_u32(value) {
                    Some(DataFormat::Encoded) | None => {
                        return Err(Error::InvalidConfigValue(key, value))
                    }
                    Some(format) => format,
                };
            }
            ConfigKey::KickPeriod => {
                if core.is_running() {
                    return Err(Error::Running(core.id));
                }
                if value == 0 {
                    return Err(Error::InvalidConfigValue(key, value));
                }
                self.kick_period_us = value;
            }
            ConfigKey::AudioBufferSize => {
                if self.buffer.is_some() {
                    return Err(Error::AlreadyConnected(core.id));
                }
                self.hw_buffer = match value {
                    0 => None,
                    size => Some(CBuffer::new(size as usize).shared()),
                };
            }
            _ => return Err(Error::InvalidConfigKey(key as u32)),
        }
        Ok(())
    }

    fn get_config(
        &self,
        _core: &EndpointCore,
        _cx: &Context,
        key: ConfigKey,
    ) -> Result<ConfigValue> {
        let value = match key {
            ConfigKey::DataFormat => self.format.to_u32().unwrap_or_default(),
            ConfigKey::KickPeriod => self.kick_period_us,
            ConfigKey::AudioBufferSize => {
                self.hw_buffer.as_ref().map_or(0, |b| b.borrow().size() as u32)
            }
            ConfigKey::RatematchAbility => RatematchAbility::None as u32,
            ConfigKey::LocallyClocked => 1,
            _ => return Err(Error::InvalidConfigKey(key as u32)),
        };
        Ok(ConfigValue::Value(value))
    }

    fn get_timing(&self, _core: &EndpointCore, _cx: &Context) -> TimingInfo {
        TimingInfo {
            block_size: self.samples_per_kick(),
            is_volatile: false,
            locally_clocked: true,
            wants_kicks: false,
        }
    }

    fn can_sync(&self, core: &EndpointCore, _cx: &Context, peer: Option<&Endpoint>) -> Result<()> {
        if core.is_running() {
            return Err(Error::SyncRejected("endpoint is running"));
        }
        let Some(peer) = peer else {
            return Ok(());
        };
        let EndpointState::Audio(_) = &peer.state else {
            return Err(Error::SyncRejected("peer is not an audio endpoint"));
        };
        if peer.core.direction != core.direction {
            return Err(Error::SyncRejected("different directions"));
        }
        if peer.core.is_running() {
            return Err(Error::SyncRejected("endpoint is running"));
        }
        Ok(())
    }

    fn clock_source(&self, _core: &EndpointCore, _cx: &Context) -> Option<ClockSource> {
        Some(ClockSource::Local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{LocalClock, VirtualClock, Wallclocks};
    use crate::endpoint::EndpointFlags;
    use crate::link::LinkTable;
    use crate::operator::OperatorTable;
    use crate::sched::{DeferredQueue, TimerQueue};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default)]
    struct Loopback {
        captured: VecDeque<i32>,
        played: Vec<i32>,
    }

    struct MockDevice(Rc<RefCell<Loopback>>);

    impl AudioDevice for MockDevice {
        fn read(&mut self, samples: &mut [i32]) -> usize {
            let mut lb = self.0.borrow_mut();
            let n = samples.len().min(lb.captured.len());
            for s in samples[..n].iter_mut() {
                *s = lb.captured.pop_front().unwrap();
            }
            n
        }

        fn write(&mut self, samples: &[i32]) -> usize {
            self.0.borrow_mut().played.extend_from_slice(samples);
            samples.len()
        }
    }

    struct Harness {
        clock: VirtualClock,
        timers: TimerQueue,
        links: LinkTable,
        operators: OperatorTable,
        deferred: DeferredQueue,
        config: StreamConfig,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                clock: VirtualClock::new(5000),
                timers: TimerQueue::new(),
                links: LinkTable::new(Box::new(Wallclocks::new())),
                operators: OperatorTable::new(),
                deferred: DeferredQueue::default(),
                config: StreamConfig { audio_kick_period_us: 1000, ..Default::default() },
            }
        }

        fn cx(&mut self) -> Context<'_> {
            Context {
                clock: &self.clock,
                timers: &mut self.timers,
                links: &mut self.links,
                operators: &mut self.operators,
                deferred: &mut self.deferred,
                config: &self.config,
                peer_ticks: None,
            }
        }
    }

    fn endpoint(
        h: &Harness,
        dir: Direction,
        lb: &Rc<RefCell<Loopback>>,
    ) -> (EndpointCore, AudioEndpoint) {
        let core =
            EndpointCore::new(EndpointId::real(dir, 2), audio_key(0, 1), EndpointFlags::REAL);
        let mut ep = AudioEndpoint::new(0, 1, dir, &h.config);
        ep.set_device(Box::new(MockDevice(lb.clone())));
        (core, ep)
    }

    #[test]
    fn capture_to_pcm16() {
        let mut h = Harness::new();
        let lb = Rc::new(RefCell::new(Loopback::default()));
        lb.borrow_mut().captured.extend([0x1234_0000, -0x0001_0000, 0x7fff_ffff]);
        let (mut core, mut ep) = endpoint(&h, Direction::Source, &lb);
        ep.configure(&mut core, &mut h.cx(), ConfigKey::DataFormat, 1).unwrap();

        let buffer = CBuffer::with_metadata(64).shared();
        assert_eq!(ep.connect(&mut core, &mut h.cx(), &buffer, None), Ok(false));
        let next = ep.kick(&mut core, &mut h.cx(), KickDirection::Internal);

        assert_eq!(next, vec![Propagation { from: core.id, dir: KickDirection::Forwards }]);
        let mut octets = [0; 6];
        assert_eq!(buffer.borrow_mut().read(&mut octets), 6);
        assert_eq!(octets, [0x34, 0x12, 0xff, 0xff, 0xff, 0x7f]);
        let tag = buffer.borrow_mut().remove_tag().unwrap();
        assert_eq!((tag.length, tag.time_of_arrival()), (6, Some(5000)));
    }

    #[test]
    fn playback_from_fixp() {
        let mut h = Harness::new();
        let lb = Rc::new(RefCell::new(Loopback::default()));
        let (mut core, mut ep) = endpoint(&h, Direction::Sink, &lb);

        let buffer = CBuffer::with_metadata(256).shared();
        ep.connect(&mut core, &mut h.cx(), &buffer, None).unwrap();
        {
            let mut b = buffer.borrow_mut();
            b.write(&7i32.to_le_bytes());
            b.write(&(-9i32).to_le_bytes());
            b.append_tag(MetadataTag::new(8));
        }
        ep.kick(&mut core, &mut h.cx(), KickDirection::Forwards);

        assert_eq!(lb.borrow().played, vec![7, -9]);
        assert_eq!(buffer.borrow().tag_count(), 0);
    }

    #[test]
    fn periodic_kicks() {
        let mut h = Harness::new();
        let lb = Rc::new(RefCell::new(Loopback::default()));
        let (mut core, mut ep) = endpoint(&h, Direction::Source, &lb);

        ep.start(&mut core, &mut h.cx()).unwrap();
        assert_eq!(ep.kick_time(), Some(6000));
        h.clock.advance(1000);
        assert!(h.timers.expire(h.clock.now()).is_some());
        ep.sched_kick(&mut core, &mut h.cx());
        assert_eq!(ep.kick_time(), Some(7000));

        assert_eq!(
            ep.configure(&mut core, &mut h.cx(), ConfigKey::KickPeriod, 500),
            Err(Error::Running(core.id))
        );
        assert!(ep.stop(&mut core, &mut h.cx()));
        assert!(!ep.stop(&mut core, &mut h.cx()));
        assert!(h.timers.is_empty());
    }

    #[test]
    fn connect_needs_hardware() {
        let mut h = Harness::new();
        let id = EndpointId::real(Direction::Sink, 3);
        let mut core = EndpointCore::new(id, audio_key(1, 0), EndpointFlags::REAL);
        let mut ep = AudioEndpoint::new(1, 0, Direction::Sink, &h.config);
        let buffer = CBuffer::new(64).shared();

        assert_eq!(
            ep.connect(&mut core, &mut h.cx(), &buffer, None),
            Err(Error::HardwareUnavailable(1, 0))
        );
    }

    #[test]
    fn supplied_buffer() {
        let mut h = Harness::new();
        let lb = Rc::new(RefCell::new(Loopback::default()));
        let (mut core, mut ep) = endpoint(&h, Direction::Sink, &lb);
        assert!(ep.buffer_details(&core, &h.cx()).supplies_buffer.is_none());

        ep.configure(&mut core, &mut h.cx(), ConfigKey::AudioBufferSize, 128).unwrap();
        let details = ep.buffer_details(&core, &h.cx());
        assert_eq!(details.supplies_buffer.map(|b| b.borrow().size()), Some(128));
        assert_eq!(
            ep.get_config(&core, &h.cx(), ConfigKey::AudioBufferSize),
            Ok(ConfigValue::Value(128))
        );
        assert_eq!(
            ep.configure(&mut core, &mut h.cx(), ConfigKey::DataFormat, 3),
            Err(Error::InvalidConfigValue(ConfigKey::DataFormat, 3))
        );
    }
}
