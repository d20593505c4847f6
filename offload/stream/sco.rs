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

//! SCO and ISO link endpoints
//!
//! The endpoints of a link are kicked by their own timer, armed for each
//! slot of the link. The slot time is derived from the radio clock of the
//! link, translated into local time:
//!
//! ```text
//!              slot                         slot
//!   radio  -----|----------------------------|--------------->
//!               |<- from air ->|             |
//!   source                     K             |
//!                            |<- to air -+-  |
//!   sink                     K    proc       |
//! ```
//!
//! The source kick (K) happens once the payload of the slot is available,
//! the sink kick early enough for the payload to be processed and read by
//! the radio before the slot.

use num_traits::{FromPrimitive, ToPrimitive};

use crate::buffer::{CBuffer, SharedBuffer};
use crate::clock::{
    bt_ticks_to_us, btclock_add, time_add, time_le, time_sub, us_to_bt_ticks, Time, BT_TICK_MASK,
};
use crate::endpoint::{
    BufferDetails, ClockSource, ConfigKey, ConfigValue, Context, DataFormat, Direction, Endpoint,
    EndpointCore, EndpointFlags, EndpointId, EndpointOps, KickDirection, Propagation,
    RatematchAbility, StreamConfig, TimingInfo,
};
use crate::error::{Error, Result};
use crate::iso;
use crate::link::{LinkDirection, LinkParams, LinkTable};
use crate::rate::RateEstimator;
use crate::sched::{KickMode, KickObject, KickProfiler, KickTimer};
use crate::sco_sink::{ScoSinkDriver, SinkStats};
use crate::sco_src::{ScoSrcDriver, SrcStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Sco,
    Iso,
}

#[derive(Debug)]
enum LinkDriver {
    Source(ScoSrcDriver),
    Sink(ScoSinkDriver),
}

#[derive(Debug, Default)]
struct LinkSchedule {
    kick_period_us: u32,
    /// Radio clock of the slot of the armed kick
    ticks: u32,
    /// Part of the slot time below the radio clock resolution
    remainder_us: u32,
    /// Slot of the armed kick
    slot_time: Time,
    /// Slot of the kick being handled
    current_slot_time: Time,
    kick_time: Time,
    /// One way latency of the link, in the direction of the endpoint
    latency_us: i32,
}

/// State of a SCO or ISO endpoint
#[derive(Debug)]
pub struct LinkEndpoint {
    kind: LinkKind,
    hci_handle: u16,
    direction: Direction,
    link_buffer: SharedBuffer,
    buffer: Option<SharedBuffer>,
    format: DataFormat,
    proc_time_us: u32,
    resync_threshold: u16,
    ttp_max_deviation_us: u32,
    rate_adjust_op: Option<u16>,
    driver: Option<LinkDriver>,
    sched: LinkSchedule,
    kick_timer: KickTimer,
    start_pending: bool,
    rate: RateEstimator,
    profiler: Option<KickProfiler>,
}

impl LinkEndpoint {
    /// Endpoint of one direction of a link. The buffer shared with the radio
    /// is accessed by the hardware as 16 bits swapped words.
    pub fn new(
        kind: LinkKind,
        hci_handle: u16,
        direction: Direction,
        buffer_size: usize,
        config: &StreamConfig,
    ) -> Self {
        let mut link_buffer = CBuffer::new(buffer_size);
        match direction {
            Direction::Source => {
                link_buffer.set_write_shift(16);
                link_buffer.set_write_byte_swap(true);
            }
            Direction::Sink => {
                link_buffer.set_read_shift(16);
                link_buffer.set_read_byte_swap(true);
            }
        }

        Self {
            kind,
            hci_handle,
            direction,
            link_buffer: link_buffer.shared(),
            buffer: None,
            format: DataFormat::Fixp,
            proc_time_us: match direction {
                Direction::Source => 0,
                Direction::Sink => config.sink_proc_time_us,
            },
            resync_threshold: config.resync_threshold,
            ttp_max_deviation_us: config.ttp_max_deviation_us,
            rate_adjust_op: None,
            driver: None,
            sched: Default::default(),
            kick_timer: Default::default(),
            start_pending: false,
            rate: Default::default(),
            profiler: None,
        }
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn hci_handle(&self) -> u16 {
        self.hci_handle
    }

    /// Buffer shared with the radio
    pub fn link_buffer(&self) -> SharedBuffer {
        self.link_buffer.clone()
    }

    pub fn is_start_pending(&self) -> bool {
        self.start_pending
    }

    pub fn kick_timer(&self) -> &KickTimer {
        &self.kick_timer
    }

    /// Local time of the armed kick
    pub fn kick_time(&self) -> Option<Time> {
        self.kick_timer.is_armed().then_some(self.sched.kick_time)
    }

    pub fn kick_period(&self) -> u32 {
        self.sched.kick_period_us
    }

    /// Radio clock of the slot of the armed kick
    pub fn ticks(&self) -> u32 {
        self.sched.ticks
    }

    pub fn rate(&self) -> i32 {
        self.rate.rate()
    }

    pub fn src_stats(&self) -> Option<SrcStats> {
        match &self.driver {
            Some(LinkDriver::Source(drv)) => Some(*drv.stats()),
            _ => None,
        }
    }

    pub fn sink_stats(&self) -> Option<SinkStats> {
        match &self.driver {
            Some(LinkDriver::Sink(drv)) => Some(*drv.stats()),
            _ => None,
        }
    }

    pub fn expected_timestamp(&self) -> Option<u16> {
        match &self.driver {
            Some(LinkDriver::Source(drv)) => drv.expected_timestamp(),
            Some(LinkDriver::Sink(drv)) => drv.sequence_number(),
            None => None,
        }
    }

    pub fn profiler(&self) -> Option<&KickProfiler> {
        self.profiler.as_ref()
    }

    fn link_dir(&self) -> LinkDirection {
        match self.direction {
            Direction::Source => LinkDirection::FromAir,
            Direction::Sink => LinkDirection::ToAir,
        }
    }

    fn iso_params<'a>(&self, params: &'a LinkParams) -> Option<&'a crate::link::IsoParams> {
        params.iso.as_ref().filter(|_| self.kind == LinkKind::Iso)
    }

    fn kick_period_for(&self, params: &LinkParams) -> u32 {
        match self.iso_params(params) {
            Some(iso) => iso::kick_period(iso, self.direction),
            None => params.tesco_us,
        }
    }

    fn locally_clocked(&self, links: &LinkTable) -> bool {
        links.params(self.hci_handle).map_or(false, |p| p.to_air_latency_us >= 0)
    }

    fn fire_time(&self, slot: Time) -> Time {
        match self.direction {
            Direction::Source => time_add(slot, self.sched.latency_us),
            Direction::Sink => {
                time_add(slot, -(self.sched.latency_us + self.proc_time_us as i32))
            }
        }
    }

    /// Move the radio clock to the slot of the next kick
    fn step_clock(&mut self) {
        let period = self.sched.kick_period_us;
        let mut ticks = us_to_bt_ticks(period);
        self.sched.remainder_us += period - bt_ticks_to_us(ticks);
        if self.sched.remainder_us >= bt_ticks_to_us(2) {
            self.sched.remainder_us -= bt_ticks_to_us(2);
            ticks += 2;
        }
        self.sched.ticks = btclock_add(self.sched.ticks, ticks);
    }

    /// Translate the radio clock into the local time of the slot,
    /// and return the matching kick time
    fn locate_slot(&mut self, links: &LinkTable) -> Option<Time> {
        let slot = links.time_from_ticks(self.hci_handle, self.sched.ticks)?;
        self.sched.slot_time = time_add(slot, self.sched.remainder_us as i32);
        Some(self.fire_time(self.sched.slot_time))
    }

    /// Arm the first kick, in the future. Returns the number of kick periods
    /// skipped to get there, or `None` when nothing was armed.
    fn start_timers(
        &mut self,
        core: &mut EndpointCore,
        cx: &mut Context,
        params: &LinkParams,
    ) -> Option<u32> {
        if self.kick_timer.is_armed() {
            return None;
        }
        core.kick_mode = match core.flags.contains(EndpointFlags::DEFERRED_KICK) {
            true => KickMode::Deferred,
            false => KickMode::Immediate,
        };

        self.sched.ticks = cx.peer_ticks.unwrap_or(params.next_slot) & BT_TICK_MASK;
        self.sched.remainder_us = 0;
        let mut fire = self.locate_slot(cx.links)?;

        let now = cx.clock.now();
        let mut skipped = 0;
        if time_le(fire, now) {
            let n = time_sub(now, fire) as u32 / self.sched.kick_period_us + 1;
            for _ in 0..n {
                self.step_clock();
            }
            skipped = n;
            fire = self.locate_slot(cx.links)?;
            while time_le(fire, now) {
                self.step_clock();
                skipped += 1;
                fire = self.locate_slot(cx.links)?;
            }
        }

        self.sched.kick_time = fire;
        self.rate.reset(fire, self.sched.ticks, self.sched.remainder_us);
        self.kick_timer.arm(cx.timers, fire, KickObject { endpoint: core.id });
        Some(skipped)
    }

    fn set_data_format(&mut self, format: DataFormat) {
        let (shift, swap) = match format {
            DataFormat::Fixp => (16, false),
            DataFormat::Pcm16 => (0, false),
            DataFormat::Pcm16ByteSwap | DataFormat::Encoded => (0, true),
        };
        let mut link = self.link_buffer.borrow_mut();
        match self.direction {
            Direction::Source => {
                link.set_write_shift(shift);
                link.set_write_byte_swap(swap);
            }
            Direction::Sink => {
                link.set_read_shift(shift);
                link.set_read_byte_swap(swap);
            }
        }
        self.format = format;
    }

    fn set_rate_adjust_operator(&mut self, cx: &mut Context, opid: u16) -> Result<()> {
        if opid != 0 && !cx.operators.contains(opid) {
            return Err(Error::UnknownOperator(opid));
        }
        if let Some(prev) = self.rate_adjust_op.take() {
            if let Some(op) = cx.operators.get_mut(prev) {
                op.set_passthrough(true);
            }
        }
        if opid != 0 {
            if let Some(op) = cx.operators.get_mut(opid) {
                op.set_passthrough(false);
            }
            self.rate_adjust_op = Some(opid);
        }
        Ok(())
    }
}

impl EndpointOps for LinkEndpoint {
    fn close(&mut self, core: &mut EndpointCore, _cx: &mut Context) -> Result<()> {
        core.con_id = None;
        Ok(())
    }

    fn connect(
        &mut self,
        core: &mut EndpointCore,
        _cx: &mut Context,
        buffer: &SharedBuffer,
        _kick_target: Option<EndpointId>,
    ) -> Result<bool> {
        if self.driver.is_some() {
            return Err(Error::AlreadyConnected(core.id));
        }
        if self.direction == Direction::Source && !buffer.borrow().has_metadata() {
            return Err(Error::DriverConnect(core.id));
        }

        buffer.borrow_mut().set_usable_octets(self.format.usable_octets());
        self.driver = Some(match self.direction {
            Direction::Source => {
                LinkDriver::Source(ScoSrcDriver::new(self.format, self.resync_threshold))
            }
            Direction::Sink => {
                LinkDriver::Sink(ScoSinkDriver::new(self.format, self.ttp_max_deviation_us))
            }
        });
        self.buffer = Some(buffer.clone());
        Ok(false)
    }

    fn disconnect(&mut self, _core: &mut EndpointCore, _cx: &mut Context) -> Result<()> {
        {
            let mut link = self.link_buffer.borrow_mut();
            link.set_read_shift(0);
            link.set_write_shift(0);
            link.set_read_byte_swap(false);
            link.set_write_byte_swap(false);
        }
        self.format = DataFormat::Pcm16;
        self.start_pending = false;
        if let Some(buffer) = self.buffer.take() {
            buffer.borrow_mut().release_metadata();
        }
        self.driver = None;
        Ok(())
    }

    fn buffer_details(&self, _core: &EndpointCore, cx: &Context) -> BufferDetails {
        BufferDetails {
            supports_metadata: true,
            requires_metadata: self.direction == Direction::Source,
            supplies_buffer: None,
            min_size: cx.config.link_transform_buffer_size,
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
            panic!("Kick on endpoint {} without transform buffer", core.id);
        };
        let Some(driver) = self.driver.as_mut() else {
            panic!("Kick on endpoint {} without driver", core.id);
        };
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.start(cx.clock.now());
        }

        let slot = self.sched.current_slot_time;
        let propagation = match driver {
            LinkDriver::Source(drv) => {
                let toa = time_add(slot, self.sched.latency_us);
                drv.run(
                    &mut self.link_buffer.borrow_mut(),
                    &mut buffer.borrow_mut(),
                    toa,
                    self.rate.sp_deviation(),
                );
                Propagation { from: core.id, dir: KickDirection::Forwards }
            }
            LinkDriver::Sink(drv) => {
                let reference = time_add(slot, -self.sched.latency_us);
                let warp = drv.run(
                    &mut buffer.borrow_mut(),
                    &mut self.link_buffer.borrow_mut(),
                    reference,
                );
                if let (Some(warp), Some(opid)) = (warp, self.rate_adjust_op) {
                    match cx.operators.get_mut(opid) {
                        Some(op) => op.set_rate(warp),
                        None => log::warn!("{}: rate adjustment operator {} gone", core.id, opid),
                    }
                }
                Propagation { from: core.id, dir: KickDirection::Backwards }
            }
        };

        if let Some(profiler) = self.profiler.as_mut() {
            profiler.stop(cx.clock.now());
        }
        vec![propagation]
    }

    fn sched_kick(&mut self, core: &mut EndpointCore, cx: &mut Context) {
        self.sched.current_slot_time = self.sched.slot_time;
        self.step_clock();
        let Some(fire) = self.locate_slot(cx.links) else {
            log::error!("{}: radio clock of link 0x{:03x} lost", core.id, self.hci_handle);
            self.kick_timer.take();
            return;
        };

        self.sched.kick_time = fire;
        if let Some(rate) = self.rate.update(fire, self.sched.ticks, self.sched.remainder_us) {
            log::debug!("{}: rate 0x{:08x}", core.id, rate);
        }
        self.kick_timer.arm(cx.timers, fire, KickObject { endpoint: core.id });
    }

    fn start(&mut self, core: &mut EndpointCore, cx: &mut Context) -> Result<()> {
        if core.is_running() || self.kick_timer.is_armed() {
            return Ok(());
        }
        let Some(params) = cx.links.params(self.hci_handle).cloned() else {
            log::info!("{}: waiting for the parameters of link 0x{:03x}", core.id, self.hci_handle);
            self.start_pending = true;
            return Ok(());
        };
        let period = self.kick_period_for(&params);
        if period == 0 {
            log::error!("{}: link 0x{:03x} has no interval", core.id, self.hci_handle);
            return Err(Error::NotSupported(core.id));
        }
        self.sched.kick_period_us = period;

        let iso = self.iso_params(&params);
        let ttp_enable = self.rate_adjust_op.is_some();
        let Some(driver) = self.driver.as_mut() else {
            panic!("Start of endpoint {} without driver", core.id);
        };
        match driver {
            LinkDriver::Source(drv) => {
                self.sched.latency_us = params.from_air_latency_us;
                let ts_step = match iso {
                    Some(_) => 1,
                    None => us_to_bt_ticks(period) as u16,
                };
                let framed = iso.and_then(iso::framed_units);
                drv.prepare(params.from_air_length as usize, ts_step, framed);
            }
            LinkDriver::Sink(drv) => {
                self.sched.latency_us = params.to_air_latency_us;
                drv.prepare(params.to_air_length as usize, ttp_enable);
            }
        }

        let Some(skipped) = self.start_timers(core, cx, &params) else {
            log::warn!("{}: clock of link 0x{:03x} unknown", core.id, self.hci_handle);
            self.start_pending = true;
            return Ok(());
        };
        if let Some(iso) = iso {
            let number = iso::first_sdu_number(iso, self.direction, skipped);
            match self.driver.as_mut() {
                Some(LinkDriver::Source(drv)) => drv.set_expected_timestamp(number),
                Some(LinkDriver::Sink(drv)) => drv.set_sequence_number(number),
                None => {}
            }
        }

        self.start_pending = false;
        core.set_running(true);
        let link_dir = self.link_dir();
        cx.links.set_running(self.hci_handle, link_dir, true);
        let frame_length = match self.direction {
            Direction::Source => 0,
            Direction::Sink => {
                let block_size = core
                    .connected_to
                    .and_then(|id| id.operator_terminal())
                    .map_or(0, |(opid, _)| cx.operators.block_size(opid));
                match block_size {
                    0 => params.to_air_length,
                    n => n as u16,
                }
            }
        };
        cx.links.send_frame_length(self.hci_handle, link_dir, frame_length);

        match self.direction {
            Direction::Source => self.link_buffer.borrow_mut().empty(),
            Direction::Sink => self.link_buffer.borrow_mut().flush_and_fill(0),
        }
        if cx.config.profile_kicks {
            self.profiler = Some(Default::default());
        }

        log::info!(
            "{} started: first kick at {}, {} periods of {} us skipped",
            core.id,
            self.sched.kick_time,
            skipped,
            period
        );
        Ok(())
    }

    fn stop(&mut self, core: &mut EndpointCore, cx: &mut Context) -> bool {
        cx.links.set_running(self.hci_handle, self.link_dir(), false);
        core.set_running(false);
        core.kick_mode = KickMode::Immediate;
        cx.deferred.cancel(core.id);
        self.profiler = None;

        if self.kick_timer.cancel(cx.timers) {
            log::info!("{} stopped", core.id);
            return true;
        }
        std::mem::take(&mut self.start_pending)
    }

    fn configure(
        &mut self,
        core: &mut EndpointCore,
        cx: &mut Context,
        key: ConfigKey,
        value: u32,
    ) -> Result<()> {
        match key {
            ConfigKey::DataFormat => {
                if self.driver.is_some() {
                    return Err(Error::AlreadyConnected(core.id));
                }
                let format =
                    DataFormat::from_u32(value).ok_or(Error::InvalidConfigValue(key, value))?;
                self.set_data_format(format);
            }
            ConfigKey::ProcTime => self.proc_time_us = value,
            ConfigKey::RmUseRateAdjustOperator => {
                if self.driver.is_some() {
                    return Err(Error::AlreadyConnected(core.id));
                }
                let opid = u16::try_from(value).map_err(|_| Error::InvalidConfigValue(key, value))?;
                self.set_rate_adjust_operator(cx, opid)?;
            }
            ConfigKey::ResyncThreshold if self.direction == Direction::Source => {
                let threshold =
                    u16::try_from(value).map_err(|_| Error::InvalidConfigValue(key, value))?;
                self.resync_threshold = threshold;
                if let Some(LinkDriver::Source(drv)) = self.driver.as_mut() {
                    drv.set_resync_threshold(threshold);
                }
            }
            ConfigKey::TtpMaxDeviation if self.direction == Direction::Sink => {
                self.ttp_max_deviation_us = value;
                if let Some(LinkDriver::Sink(drv)) = self.driver.as_mut() {
                    drv.set_max_deviation(value);
                }
            }
            _ => return Err(Error::InvalidConfigKey(key as u32)),
        }
        Ok(())
    }

    fn get_config(
        &self,
        _core: &EndpointCore,
        cx: &Context,
        key: ConfigKey,
    ) -> Result<ConfigValue> {
        let value = match key {
            ConfigKey::DataFormat => self.format.to_u32().unwrap_or_default(),
            ConfigKey::ProcTime => self.proc_time_us,
            ConfigKey::RatematchAbility => RatematchAbility::None as u32,
            ConfigKey::RatematchRate => self.rate.rate() as u32,
            ConfigKey::RatematchMeasurement => {
                return Ok(ConfigValue::Measurement {
                    sp_deviation: self.rate.sp_deviation(),
                    valid: false,
                })
            }
            ConfigKey::LocallyClocked => self.locally_clocked(cx.links) as u32,
            ConfigKey::SrcLateCount if self.direction == Direction::Source => {
                self.src_stats().map_or(0, |s| s.late)
            }
            ConfigKey::SinkLateCount if self.direction == Direction::Sink => {
                self.sink_stats().map_or(0, |s| s.late)
            }
            _ => return Err(Error::InvalidConfigKey(key as u32)),
        };
        Ok(ConfigValue::Value(value))
    }

    fn get_timing(&self, _core: &EndpointCore, cx: &Context) -> TimingInfo {
        TimingInfo {
            block_size: 0,
            is_volatile: true,
            locally_clocked: self.locally_clocked(cx.links),
            wants_kicks: false,
        }
    }

    fn can_sync(&self, core: &EndpointCore, cx: &Context, peer: Option<&Endpoint>) -> Result<()> {
        match self.kind {
            LinkKind::Sco => Err(Error::NotSupported(core.id)),
            LinkKind::Iso => iso::check_sync(self, core, cx, peer),
        }
    }

    fn clock_source(&self, _core: &EndpointCore, cx: &Context) -> Option<ClockSource> {
        let params = cx.links.params(self.hci_handle)?;
        Some(match params.to_air_latency_us >= 0 {
            true => ClockSource::Local,
            false => ClockSource::Wallclock(params.wallclock_id),
        })
    }

    fn next_kick_ticks(&self, core: &EndpointCore) -> Option<u32> {
        core.is_running().then_some(self.sched.ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{LinearWallclock, VirtualClock, Wallclocks};
    use crate::endpoint::EndpointFlags;
    use crate::metadata::LinkStatus;
    use crate::operator::OperatorTable;
    use crate::record::{write_record, RecordHeader};
    use crate::sched::{DeferredQueue, TimerQueue};

    const HANDLE: u16 = 0x40;
    const NOW: Time = 1_000_000;

    struct Harness {
        clock: VirtualClock,
        timers: TimerQueue,
        links: LinkTable,
        operators: OperatorTable,
        deferred: DeferredQueue,
        config: StreamConfig,
    }

    impl Harness {
        /// Radio clock 0x1000 is at local time `slot_time`
        fn new(slot_time: Time) -> Self {
            let mut clocks = Wallclocks::new();
            clocks.insert(1, LinearWallclock::new(0x1000, slot_time));
            Self {
                clock: VirtualClock::new(NOW),
                timers: TimerQueue::new(),
                links: LinkTable::new(Box::new(clocks)),
                operators: OperatorTable::new(),
                deferred: DeferredQueue::default(),
                config: StreamConfig { sink_proc_time_us: 0, ..Default::default() },
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

    fn params(tesco_us: u32) -> LinkParams {
        LinkParams {
            tesco_us,
            wallclock_id: 1,
            from_air_length: 4,
            to_air_length: 4,
            from_air_latency_us: 1000,
            to_air_latency_us: 500,
            next_slot: 0x1000,
            iso: None,
        }
    }

    fn connected(h: &mut Harness, dir: Direction) -> (EndpointCore, LinkEndpoint, SharedBuffer) {
        let mut core = EndpointCore::new(
            EndpointId::real(dir, 1),
            HANDLE as u32,
            EndpointFlags::REAL | EndpointFlags::DEFERRED_KICK,
        );
        let mut ep = LinkEndpoint::new(LinkKind::Sco, HANDLE, dir, 64, &h.config);
        let buffer = CBuffer::with_metadata(256).shared();
        assert_eq!(ep.connect(&mut core, &mut h.cx(), &buffer, None), Ok(false));
        (core, ep, buffer)
    }

    #[test]
    fn start_pending_until_parameters() {
        let mut h = Harness::new(NOW);
        let (mut core, mut ep, _) = connected(&mut h, Direction::Source);

        assert_eq!(ep.start(&mut core, &mut h.cx()), Ok(()));
        assert!(ep.is_start_pending());
        assert!(!core.is_running());

        // A stop resolves the pending start, once
        assert!(ep.stop(&mut core, &mut h.cx()));
        assert!(!ep.stop(&mut core, &mut h.cx()));
    }

    #[test]
    fn first_kick_after_late_start() {
        // The next slot is 15 ms in the past
        let mut h = Harness::new(NOW - 15_000);
        h.links.set_params(HANDLE, params(7500));
        let (mut core, mut ep, _) = connected(&mut h, Direction::Source);

        ep.start(&mut core, &mut h.cx()).unwrap();
        assert!(core.is_running());
        assert_eq!(core.kick_mode, KickMode::Deferred);
        assert_eq!(ep.ticks(), 0x1000 + 2 * 24);
        assert_eq!(ep.kick_time(), Some(NOW + 1000));
        assert!(h.timers.next_deadline(NOW).is_some_and(|t| time_sub(t, NOW) > 0));
        assert!(h.links.run_state(HANDLE, LinkDirection::FromAir).running);
    }

    #[test]
    fn kicks_follow_the_slots() {
        let mut h = Harness::new(NOW + 100);
        h.links.set_params(HANDLE, params(7000));
        let (mut core, mut ep, _) = connected(&mut h, Direction::Source);
        ep.start(&mut core, &mut h.cx()).unwrap();

        let mut kicks = vec![ep.kick_time().unwrap()];
        for _ in 0..12 {
            let fire = *kicks.last().unwrap();
            h.clock.set(fire);
            assert!(h.timers.expire(fire).is_some());
            ep.sched_kick(&mut core, &mut h.cx());
            kicks.push(ep.kick_time().unwrap());
        }
        assert!(kicks.windows(2).all(|w| time_sub(w[1], w[0]) == 7000));
        assert_eq!(h.timers.len(), 1);
    }

    #[test]
    fn sink_kick_time() {
        let mut h = Harness::new(NOW + 10_000);
        h.links.set_params(HANDLE, params(7500));
        let (mut core, mut ep, _) = connected(&mut h, Direction::Sink);
        ep.configure(&mut core, &mut h.cx(), ConfigKey::ProcTime, 300).unwrap();

        ep.start(&mut core, &mut h.cx()).unwrap();
        assert_eq!(ep.kick_time(), Some(NOW + 10_000 - 500 - 300));
        assert_eq!(h.links.run_state(HANDLE, LinkDirection::ToAir).frame_length, 4);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut h = Harness::new(NOW + 100);
        h.links.set_params(HANDLE, params(7500));
        let (mut core, mut ep, _) = connected(&mut h, Direction::Source);
        ep.start(&mut core, &mut h.cx()).unwrap();

        assert!(ep.stop(&mut core, &mut h.cx()));
        assert!(!ep.stop(&mut core, &mut h.cx()));
        assert!(h.timers.is_empty());
        assert!(!core.is_running());
        assert_eq!(core.kick_mode, KickMode::Immediate);
    }

    #[test]
    fn source_kick_tags_arrival() {
        let mut h = Harness::new(NOW + 100);
        h.links.set_params(HANDLE, params(7500));
        let (mut core, mut ep, buffer) = connected(&mut h, Direction::Source);
        ep.start(&mut core, &mut h.cx()).unwrap();

        let hdr = RecordHeader::new(4, LinkStatus::Ok, 0x2000);
        assert!(write_record(&mut ep.link_buffer().borrow_mut(), &hdr, &[1, 2, 3, 4]));
        ep.sched_kick(&mut core, &mut h.cx());
        let next = ep.kick(&mut core, &mut h.cx(), KickDirection::Internal);

        assert_eq!(next, vec![Propagation { from: core.id, dir: KickDirection::Forwards }]);
        let tag = buffer.borrow_mut().remove_tag().unwrap();
        assert_eq!(tag.time_of_arrival(), Some(NOW + 100 + 1000));
        assert_eq!(ep.expected_timestamp(), Some(0x2018));
    }

    #[test]
    fn data_format_configuration() {
        let mut h = Harness::new(NOW);
        let mut core =
            EndpointCore::new(EndpointId::real(Direction::Sink, 1), 0, EndpointFlags::REAL);
        let mut ep = LinkEndpoint::new(LinkKind::Sco, HANDLE, Direction::Sink, 64, &h.config);
        assert_eq!(ep.link_buffer().borrow().read_shift(), 16);

        ep.configure(&mut core, &mut h.cx(), ConfigKey::DataFormat, 2).unwrap();
        assert_eq!(ep.link_buffer().borrow().read_shift(), 0);
        assert!(ep.link_buffer().borrow().read_byte_swap());
        assert_eq!(
            ep.get_config(&core, &h.cx(), ConfigKey::DataFormat),
            Ok(ConfigValue::Value(2))
        );
        assert_eq!(
            ep.configure(&mut core, &mut h.cx(), ConfigKey::DataFormat, 9),
            Err(Error::InvalidConfigValue(ConfigKey::DataFormat, 9))
        );

        let buffer = CBuffer::new(64).shared();
        ep.connect(&mut core, &mut h.cx(), &buffer, None).unwrap();
        assert_eq!(buffer.borrow().usable_octets(), 2);
        assert_eq!(
            ep.configure(&mut core, &mut h.cx(), ConfigKey::DataFormat, 0),
            Err(Error::AlreadyConnected(core.id))
        );

        ep.disconnect(&mut core, &mut h.cx()).unwrap();
        assert_eq!(ep.link_buffer().borrow().read_shift(), 0);
        assert!(!ep.link_buffer().borrow().read_byte_swap());
    }

    #[test]
    fn source_requires_metadata() {
        let mut h = Harness::new(NOW);
        let id = EndpointId::real(Direction::Source, 1);
        let mut core = EndpointCore::new(id, 0, EndpointFlags::REAL);
        let mut ep = LinkEndpoint::new(LinkKind::Sco, HANDLE, Direction::Source, 64, &h.config);

        let details = ep.buffer_details(&core, &h.cx());
        assert!(details.requires_metadata && details.supports_metadata);
        assert!(details.supplies_buffer.is_none());

        let buffer = CBuffer::new(64).shared();
        assert_eq!(
            ep.connect(&mut core, &mut h.cx(), &buffer, None),
            Err(Error::DriverConnect(core.id))
        );
    }

    #[test]
    fn link_configuration_queries() {
        let mut h = Harness::new(NOW);
        let mut p = params(7500);
        p.to_air_latency_us = -200;
        h.links.set_params(HANDLE, p);
        let (core, ep, _) = connected(&mut h, Direction::Source);

        let cx = h.cx();
        assert_eq!(ep.get_config(&core, &cx, ConfigKey::LocallyClocked), Ok(ConfigValue::Value(0)));
        assert_eq!(
            ep.get_config(&core, &cx, ConfigKey::RatematchRate),
            Ok(ConfigValue::Value(crate::rate::UNITY_RATE as u32))
        );
        assert_eq!(
            ep.get_config(&core, &cx, ConfigKey::RatematchMeasurement),
            Ok(ConfigValue::Measurement { sp_deviation: 0, valid: false })
        );
        assert_eq!(ep.get_config(&core, &cx, ConfigKey::SrcLateCount), Ok(ConfigValue::Value(0)));
        assert_eq!(
            ep.get_config(&core, &cx, ConfigKey::SinkLateCount),
            Err(Error::InvalidConfigKey(ConfigKey::SinkLateCount as u32))
        );
        assert_eq!(ep.clock_source(&core, &cx), Some(ClockSource::Wallclock(1)));
        assert!(!ep.get_timing(&core, &cx).wants_kicks);
    }
}
