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

//! Endpoint model
//!
//! An endpoint is made of a [`EndpointCore`], common to all kinds of endpoints,
//! and of a kind specific [`EndpointState`]. The behavior of each kind is
//! implemented through the [`EndpointOps`] trait, reached from the state.
//!
//! ```text
//!                     kick_target
//!        ___________  -------->  ___________
//!       |  source   |           |   sink    |
//!       | endpoint  |==buffer==>| endpoint  |
//!       |___________|  <------  |___________|
//!                     kick_target
//! ```

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};
use std::fmt;

use crate::audio::AudioEndpoint;
use crate::buffer::SharedBuffer;
use crate::clock::LocalClock;
use crate::error::Result;
use crate::link::LinkTable;
use crate::operator::{OperatorEndpoint, OperatorTable, Terminal};
use crate::sched::{DeferredQueue, KickMode, TimerQueue};
use crate::sco::LinkEndpoint;
use crate::transform::TransformId;

/// External identifier of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u16);

impl EndpointId {
    pub const SINK_BIT: u16 = 0x8000;
    pub const OPERATOR_BIT: u16 = 0x4000;
    pub const REAL_BIT: u16 = 0x2000;
    pub const INDEX_MASK: u16 = 0x1fff;

    /// Identifier of the real endpoint with index `index`
    pub fn real(dir: Direction, index: u16) -> Self {
        Self(dir.id_bit() | Self::REAL_BIT | (index & Self::INDEX_MASK))
    }

    /// Identifier of the endpoint of an operator terminal
    pub fn operator(opid: u16, terminal: Terminal) -> Self {
        Self(
            terminal.dir.id_bit()
                | Self::OPERATOR_BIT
                | (opid & 0xff) << 5
                | (terminal.index as u16 & 0x1f),
        )
    }

    pub fn direction(&self) -> Direction {
        if self.0 & Self::SINK_BIT != 0 {
            Direction::Sink
        } else {
            Direction::Source
        }
    }

    pub fn is_operator(&self) -> bool {
        self.0 & Self::OPERATOR_BIT != 0
    }

    /// Operator and terminal designated by an operator endpoint identifier
    pub fn operator_terminal(&self) -> Option<(u16, Terminal)> {
        if !self.is_operator() {
            return None;
        }
        let opid = (self.0 >> 5) & 0xff;
        Some((opid, Terminal { dir: self.direction(), index: (self.0 & 0x1f) as u8 }))
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Identifier of the client owning an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Source,
    Sink,
}

impl Direction {
    fn id_bit(self) -> u16 {
        match self {
            Direction::Source => 0,
            Direction::Sink => EndpointId::SINK_BIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointType {
    Audio,
    Sco,
    Iso,
    Operator,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EndpointFlags: u8 {
        /// A client can close the endpoint
        const CLOSABLE = 1 << 0;
        /// The endpoint is freed when closed
        const DESTROYABLE = 1 << 1;
        /// Terminal of a chain, as opposed to a processing node
        const REAL = 1 << 2;
        /// Freed with the transform it belongs to
        const DESTROY_ON_DISCONNECT = 1 << 3;
        const RUNNING = 1 << 4;
        /// Kicks are handled in the background queue once started
        const DEFERRED_KICK = 1 << 5;
    }
}

/// Part of an endpoint common to all kinds
#[derive(Debug)]
pub struct EndpointCore {
    pub id: EndpointId,
    /// Kind specific key, unique for a type and a direction
    pub key: u32,
    pub direction: Direction,
    pub con_id: Option<ConnectionId>,
    pub flags: EndpointFlags,
    pub connected_to: Option<EndpointId>,
    pub kick_target: Option<EndpointId>,
    pub transform: Option<TransformId>,
    /// Endpoint started and stopped together with this one
    pub sync_peer: Option<EndpointId>,
    pub kick_mode: KickMode,
}

impl EndpointCore {
    pub fn new(id: EndpointId, key: u32, flags: EndpointFlags) -> Self {
        Self {
            id,
            key,
            direction: id.direction(),
            con_id: None,
            flags,
            connected_to: None,
            kick_target: None,
            transform: None,
            sync_peer: None,
            kick_mode: KickMode::Immediate,
        }
    }

    pub fn is_running(&self) -> bool {
        self.flags.contains(EndpointFlags::RUNNING)
    }

    pub fn is_real(&self) -> bool {
        self.flags.contains(EndpointFlags::REAL)
    }

    pub fn is_connected(&self) -> bool {
        self.connected_to.is_some()
    }

    pub fn set_running(&mut self, running: bool) {
        self.flags.set(EndpointFlags::RUNNING, running);
    }
}

/// Format of the data exchanged through a transform buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum DataFormat {
    /// 32 bits fixed point audio
    Fixp = 0,
    /// 16 bits audio
    Pcm16 = 1,
    /// 16 bits audio, octets swapped
    Pcm16ByteSwap = 2,
    /// Encoded frames
    Encoded = 3,
}

impl DataFormat {
    /// Octets of a buffer word that carry data
    pub fn usable_octets(self) -> u8 {
        match self {
            DataFormat::Encoded => 4,
            _ => 2,
        }
    }
}

/// Configuration keys of `configure` and `get_config`
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ConfigKey {
    DataFormat = 0x0001,
    ProcTime = 0x0002,
    KickPeriod = 0x0003,
    RmUseRateAdjustOperator = 0x0004,
    ResyncThreshold = 0x0005,
    TtpMaxDeviation = 0x0006,
    AudioBufferSize = 0x0007,
    RatematchAbility = 0x0100,
    RatematchRate = 0x0101,
    RatematchMeasurement = 0x0102,
    LocallyClocked = 0x0103,
    SrcLateCount = 0x0200,
    SinkLateCount = 0x0201,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum RatematchAbility {
    None = 0,
    Software = 1,
    Hardware = 2,
}

/// Result of `get_config`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigValue {
    Value(u32),
    /// Sample period deviation, as a Q1.31 fraction
    Measurement { sp_deviation: i32, valid: bool },
}

/// Buffer requirements of an endpoint, when connected
#[derive(Debug, Clone)]
pub struct BufferDetails {
    pub supports_metadata: bool,
    pub requires_metadata: bool,
    /// Buffer the endpoint wants the transform to use
    pub supplies_buffer: Option<SharedBuffer>,
    pub min_size: usize,
    pub runs_in_place: bool,
}

/// Timing characteristics of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingInfo {
    pub block_size: usize,
    pub is_volatile: bool,
    pub locally_clocked: bool,
    /// Whether kicks propagated from the neighbour are of any use
    pub wants_kicks: bool,
}

/// Clock an endpoint consumes or produces data at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    Local,
    Wallclock(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickDirection {
    /// From the timer of the endpoint itself
    Internal,
    /// From upstream
    Forwards,
    /// From downstream
    Backwards,
}

/// Request to kick the `kick_target` of endpoint `from`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Propagation {
    pub from: EndpointId,
    pub dir: KickDirection,
}

/// Stream tunables
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Kick period of hardware audio endpoints
    pub audio_kick_period_us: u32,
    /// Transform buffer size asked by SCO and ISO endpoints
    pub link_transform_buffer_size: usize,
    /// Size of the buffers shared with the radio
    pub link_buffer_size: usize,
    /// Processing time budget of to-air endpoints
    pub sink_proc_time_us: u32,
    /// Consecutive late records before the from-air driver resynchronises
    pub resync_threshold: u16,
    /// Time to play window considered in time, around the slot
    pub ttp_max_deviation_us: u32,
    pub profile_kicks: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            audio_kick_period_us: 2000,
            link_transform_buffer_size: 512,
            link_buffer_size: 256,
            sink_proc_time_us: 250,
            resync_threshold: 4,
            ttp_max_deviation_us: 1000,
            profile_kicks: false,
        }
    }
}

/// Services of the stream available to the endpoint operations
pub struct Context<'a> {
    pub clock: &'a dyn LocalClock,
    pub timers: &'a mut TimerQueue,
    pub links: &'a mut LinkTable,
    pub operators: &'a mut OperatorTable,
    pub deferred: &'a mut DeferredQueue,
    pub config: &'a StreamConfig,
    /// Radio clock of the next kick of a running synchronised peer
    pub peer_ticks: Option<u32>,
}

/// Operations of a kind of endpoint
pub trait EndpointOps {
    /// Release the resources held for the owner of the endpoint
    fn close(&mut self, _core: &mut EndpointCore, _cx: &mut Context) -> Result<()> {
        Ok(())
    }

    /// Attach the transform buffer. Returns whether the endpoint wants to
    /// start as soon as connected.
    fn connect(
        &mut self,
        core: &mut EndpointCore,
        cx: &mut Context,
        buffer: &SharedBuffer,
        kick_target: Option<EndpointId>,
    ) -> Result<bool>;

    fn disconnect(&mut self, core: &mut EndpointCore, cx: &mut Context) -> Result<()>;

    fn buffer_details(&self, core: &EndpointCore, cx: &Context) -> BufferDetails;

    fn data_format(&self, core: &EndpointCore, cx: &Context) -> DataFormat;

    /// Move one unit of data, and tell where the kick goes next
    fn kick(
        &mut self,
        core: &mut EndpointCore,
        cx: &mut Context,
        dir: KickDirection,
    ) -> Vec<Propagation>;

    /// Compute and arm the next kick, called when the timer fires
    fn sched_kick(&mut self, _core: &mut EndpointCore, _cx: &mut Context) {}

    fn start(&mut self, core: &mut EndpointCore, cx: &mut Context) -> Result<()>;

    /// Returns true when something was actually stopped
    fn stop(&mut self, core: &mut EndpointCore, cx: &mut Context) -> bool;

    fn configure(
        &mut self,
        core: &mut EndpointCore,
        cx: &mut Context,
        key: ConfigKey,
        value: u32,
    ) -> Result<()>;

    fn get_config(&self, core: &EndpointCore, cx: &Context, key: ConfigKey) -> Result<ConfigValue>;

    fn get_timing(&self, core: &EndpointCore, cx: &Context) -> TimingInfo;

    /// Check that the endpoint can be synchronised with `peer`,
    /// or unsynchronised when `None`
    fn can_sync(&self, core: &EndpointCore, _cx: &Context, _peer: Option<&Endpoint>) -> Result<()> {
        Err(crate::Error::NotSupported(core.id))
    }

    fn clock_source(&self, core: &EndpointCore, cx: &Context) -> Option<ClockSource>;

    /// Radio clock of the next kick, for endpoints following a radio link
    fn next_kick_ticks(&self, _core: &EndpointCore) -> Option<u32> {
        None
    }
}

/// Kind specific state of an endpoint
pub enum EndpointState {
    Audio(AudioEndpoint),
    Sco(LinkEndpoint),
    Iso(LinkEndpoint),
    Operator(OperatorEndpoint),
}

impl EndpointState {
    pub fn ep_type(&self) -> EndpointType {
        match self {
            EndpointState::Audio(_) => EndpointType::Audio,
            EndpointState::Sco(_) => EndpointType::Sco,
            EndpointState::Iso(_) => EndpointType::Iso,
            EndpointState::Operator(_) => EndpointType::Operator,
        }
    }

    pub fn ops(&self) -> &dyn EndpointOps {
        match self {
            EndpointState::Audio(ep) => ep,
            EndpointState::Sco(ep) | EndpointState::Iso(ep) => ep,
            EndpointState::Operator(ep) => ep,
        }
    }

    pub fn ops_mut(&mut self) -> &mut dyn EndpointOps {
        match self {
            EndpointState::Audio(ep) => ep,
            EndpointState::Sco(ep) | EndpointState::Iso(ep) => ep,
            EndpointState::Operator(ep) => ep,
        }
    }

    pub fn as_link(&self) -> Option<&LinkEndpoint> {
        match self {
            EndpointState::Sco(ep) | EndpointState::Iso(ep) => Some(ep),
            _ => None,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioEndpoint> {
        match self {
            EndpointState::Audio(ep) => Some(ep),
            _ => None,
        }
    }
}

pub struct Endpoint {
    pub core: EndpointCore,
    pub state: EndpointState,
}

impl Endpoint {
    pub fn new(core: EndpointCore, state: EndpointState) -> Self {
        Self { core, state }
    }

    pub fn id(&self) -> EndpointId {
        self.core.id
    }

    pub fn ep_type(&self) -> EndpointType {
        self.state.ep_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_ids() {
        let id = EndpointId::real(Direction::Sink, 3);
        assert_eq!(id, EndpointId(0xa003));
        assert_eq!(id.direction(), Direction::Sink);
        assert!(!id.is_operator());
        assert_eq!(id.operator_terminal(), None);
        assert_eq!(id.to_string(), "0xa003");
    }

    #[test]
    fn operator_ids() {
        let id = EndpointId::operator(0x12, Terminal { dir: Direction::Source, index: 2 });
        assert_eq!(id, EndpointId(0x4242));
        assert_eq!(id.direction(), Direction::Source);
        assert_eq!(
            id.operator_terminal(),
            Some((0x12, Terminal { dir: Direction::Source, index: 2 }))
        );

        let id = EndpointId::operator(0x12, Terminal { dir: Direction::Sink, index: 0 });
        assert_eq!(id, EndpointId(0xc240));
    }

    #[test]
    fn core_flags() {
        let mut core = EndpointCore::new(
            EndpointId::real(Direction::Source, 1),
            0x40,
            EndpointFlags::REAL | EndpointFlags::DEFERRED_KICK,
        );
        assert!(core.is_real());
        assert!(!core.is_running());
        core.set_running(true);
        assert!(core.is_running());
        core.set_running(false);
        assert_eq!(core.flags, EndpointFlags::REAL | EndpointFlags::DEFERRED_KICK);
    }
}
