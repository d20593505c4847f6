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

//! Stream core: endpoints, transforms and the kick machinery
//!
//!   timer ---> sched_kick --+--> kick (immediate)
//!                           |
//!                           +--> deferred queue ---> kick (background)
//!
//!   kick(endpoint) ---> kick(kick_target) ---> ...
//!
//! A kick runs to completion along the chain before the next timer
//! or request is handled.

use num_traits::FromPrimitive;
use scopeguard::ScopeGuard;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use crate::audio::{audio_key, Acquire, AudioDevice, AudioEndpoint, AudioHardware};
use crate::buffer::{CBuffer, SharedBuffer};
use crate::clock::{ClockTranslation, LocalClock, Time};
use crate::endpoint::{
    BufferDetails, ConfigKey, ConfigValue, ConnectionId, Context, DataFormat, Direction, Endpoint,
    EndpointCore, EndpointFlags, EndpointId, EndpointOps, EndpointState, EndpointType,
    KickDirection, StreamConfig,
};
use crate::error::{Error, Result};
use crate::link::{LinkParams, LinkTable};
use crate::operator::{Operator, OperatorEndpoint, OperatorTable};
use crate::registry::Registry;
use crate::sched::{DeferredQueue, KickMode, KickObject, TimerId, TimerQueue};
use crate::sco::{LinkEndpoint, LinkKind};
use crate::transform::{Transform, TransformId, TransformTable};

/// Device an endpoint is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Sco { hci_handle: u16 },
    Iso { hci_handle: u16 },
    Audio { instance: u8, channel: u8 },
}

/// Outcome of `get_endpoint`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Ready(EndpointId),
    /// The endpoint exists, its hardware is being acquired
    Pending(EndpointId),
}

/// Services of the stream lent to an endpoint operation, borrowing the
/// fields of the stream other than the registry and the transforms
macro_rules! context {
    ($stream:expr) => {
        Context {
            clock: &*$stream.clock,
            timers: &mut $stream.timers,
            links: &mut $stream.links,
            operators: &mut $stream.operators,
            deferred: &mut $stream.deferred,
            config: &$stream.config,
            peer_ticks: None,
        }
    };
}

pub struct Stream {
    registry: Registry,
    transforms: TransformTable,
    timers: TimerQueue,
    deferred: DeferredQueue,
    clock: Rc<dyn LocalClock>,
    links: LinkTable,
    operators: OperatorTable,
    audio_hw: Option<Box<dyn AudioHardware>>,
    config: StreamConfig,
}

impl Stream {
    pub fn new(
        clock: Rc<dyn LocalClock>,
        clocks: Box<dyn ClockTranslation>,
        config: StreamConfig,
    ) -> Self {
        Self {
            registry: Registry::new(),
            transforms: TransformTable::new(),
            timers: TimerQueue::new(),
            deferred: Default::default(),
            clock,
            links: LinkTable::new(clocks),
            operators: OperatorTable::new(),
            audio_hw: None,
            config,
        }
    }

    pub fn set_audio_hardware(&mut self, hw: Box<dyn AudioHardware>) {
        self.audio_hw = Some(hw);
    }

    /// Register a processing operator; its terminals become reachable as
    /// operator endpoints
    pub fn add_operator(&mut self, opid: u16, op: Box<dyn Operator>) -> Result<()> {
        if opid == 0 || opid > 0xff || self.operators.contains(opid) {
            return Err(Error::UnknownOperator(opid));
        }
        self.operators.insert(opid, op);
        Ok(())
    }

    pub fn operator(&self, opid: u16) -> Option<&dyn Operator> {
        self.operators.get(opid)
    }

    pub fn now(&self) -> Time {
        self.clock.now()
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<&Endpoint> {
        self.registry.get(id)
    }

    pub fn transform(&self, id: TransformId) -> Option<&Transform> {
        self.transforms.get(id)
    }

    pub fn transforms(&self) -> &TransformTable {
        &self.transforms
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    pub fn lookup(&self, ep_type: EndpointType, dir: Direction, key: u32) -> Option<EndpointId> {
        self.registry.lookup(ep_type, dir, key)
    }

    /// Buffer shared with the radio by one direction of a link
    pub fn link_buffer(&self, hci_handle: u16, dir: Direction) -> Option<SharedBuffer> {
        [EndpointType::Sco, EndpointType::Iso]
            .into_iter()
            .find_map(|t| self.registry.lookup(t, dir, hci_handle as u32))
            .and_then(|id| self.registry.get(id)?.state.as_link().map(LinkEndpoint::link_buffer))
    }

    fn call<R>(
        &mut self,
        id: EndpointId,
        f: impl FnOnce(&mut EndpointCore, &mut dyn EndpointOps, &mut Context) -> R,
    ) -> Result<R> {
        let mut cx = context!(self);
        let ep = self.registry.get_mut(id).ok_or(Error::UnknownEndpoint(id))?;
        Ok(f(&mut ep.core, ep.state.ops_mut(), &mut cx))
    }

    fn query<R>(
        &mut self,
        id: EndpointId,
        f: impl FnOnce(&EndpointCore, &dyn EndpointOps, &Context) -> R,
    ) -> Result<R> {
        let cx = context!(self);
        let ep = self.registry.get(id).ok_or(Error::UnknownEndpoint(id))?;
        Ok(f(&ep.core, ep.state.ops(), &cx))
    }

    fn core(&self, id: EndpointId) -> Result<&EndpointCore> {
        Ok(&self.registry.get(id).ok_or(Error::UnknownEndpoint(id))?.core)
    }

    fn core_mut(&mut self, id: EndpointId) -> Result<&mut EndpointCore> {
        Ok(&mut self.registry.get_mut(id).ok_or(Error::UnknownEndpoint(id))?.core)
    }

    /// Operator endpoints are shared by all connections
    fn check_owner(&self, id: EndpointId, con: ConnectionId) -> Result<&EndpointCore> {
        let core = self.core(id)?;
        if !id.is_operator() && core.con_id != Some(con) {
            return Err(Error::NotOwner(id, con));
        }
        Ok(core)
    }

    // Link endpoints

    /// Create the source and sink endpoints of a link. Sizes of 0 select
    /// the default link buffer size.
    pub fn create_link_endpoints(
        &mut self,
        kind: LinkKind,
        hci_handle: u16,
        source_size: usize,
        sink_size: usize,
    ) -> Result<(EndpointId, EndpointId)> {
        if !self.link_endpoints(hci_handle).is_empty() {
            return Err(Error::LinkEndpointsExist(hci_handle));
        }

        let state = |dir, size: usize, config: &StreamConfig| {
            let size = if size == 0 { config.link_buffer_size } else { size };
            let ep = LinkEndpoint::new(kind, hci_handle, dir, size, config);
            match kind {
                LinkKind::Sco => EndpointState::Sco(ep),
                LinkKind::Iso => EndpointState::Iso(ep),
            }
        };
        let flags = EndpointFlags::DEFERRED_KICK;
        let key = hci_handle as u32;

        let source_state = state(Direction::Source, source_size, &self.config);
        let source = self.registry.create(Direction::Source, key, flags, source_state)?;
        let sink_state = state(Direction::Sink, sink_size, &self.config);
        let sink = match self.registry.create(Direction::Sink, key, flags, sink_state) {
            Ok(id) => id,
            Err(e) => {
                self.registry.remove(source);
                return Err(e);
            }
        };

        self.links.add(hci_handle);
        log::info!("link 0x{:03x} {:?}: endpoints {} and {}", hci_handle, kind, source, sink);
        Ok((source, sink))
    }

    fn link_endpoints(&self, hci_handle: u16) -> Vec<EndpointId> {
        [EndpointType::Sco, EndpointType::Iso]
            .into_iter()
            .flat_map(|t| {
                [Direction::Source, Direction::Sink]
                    .into_iter()
                    .filter_map(move |d| self.registry.lookup(t, d, hci_handle as u32))
            })
            .collect()
    }

    /// Tear down the endpoints of a link that went away
    pub fn delete_link_endpoints(&mut self, hci_handle: u16) -> Result<()> {
        let ids = self.link_endpoints(hci_handle);
        if ids.is_empty() {
            return Err(Error::UnknownLink(hci_handle));
        }
        for id in ids {
            if let Some(tid) = self.core(id)?.transform {
                self.disconnect_transform(tid)?;
            }
            self.destroy_endpoint(id);
        }
        self.links.remove(hci_handle);
        Ok(())
    }

    /// New parameters of a link. Its connected endpoints are stopped, and
    /// restarted when they were started or waiting for the parameters.
    pub fn link_params_update(&mut self, hci_handle: u16, params: LinkParams) -> Result<()> {
        if !self.links.contains(hci_handle) {
            return Err(Error::UnknownLink(hci_handle));
        }
        log::info!("link 0x{:03x}: parameters {:?}", hci_handle, params);
        self.links.set_params(hci_handle, params);

        let mut stopped = vec![];
        for id in self.link_endpoints(hci_handle) {
            if self.core(id)?.is_connected() && self.stop_one(id)? {
                stopped.push(id);
            }
        }
        for id in stopped {
            if let Err(e) = self.start_one(id) {
                log::error!("{} not restarted with the new parameters: {}", id, e);
            }
        }
        Ok(())
    }

    // Endpoint ownership

    pub fn get_endpoint(
        &mut self,
        con: ConnectionId,
        device: Device,
        dir: Direction,
    ) -> Result<Acquired> {
        let (ep_type, key) = match device {
            Device::Sco { hci_handle } => (EndpointType::Sco, hci_handle as u32),
            Device::Iso { hci_handle } => (EndpointType::Iso, hci_handle as u32),
            Device::Audio { instance, channel } => {
                (EndpointType::Audio, audio_key(instance, channel))
            }
        };

        if let Some(id) = self.registry.lookup(ep_type, dir, key) {
            let ep = self.registry.get_mut(id).ok_or(Error::UnknownEndpoint(id))?;
            match ep.core.con_id {
                Some(owner) if owner != con => return Err(Error::NotOwner(id, con)),
                _ => ep.core.con_id = Some(con),
            }
            return Ok(match ep.state.as_audio() {
                Some(audio) if !audio.has_device() => Acquired::Pending(id),
                _ => Acquired::Ready(id),
            });
        }

        let Device::Audio { instance, channel } = device else {
            return Err(Error::UnknownLink(key as u16));
        };
        let Some(hw) = self.audio_hw.as_mut() else {
            return Err(Error::HardwareUnavailable(instance, channel));
        };
        let mut audio = AudioEndpoint::new(instance, channel, dir, &self.config);
        let pending = match hw.acquire(instance, channel, dir) {
            Acquire::Ready(device) => {
                audio.set_device(device);
                false
            }
            Acquire::Pending => true,
            Acquire::Unavailable => return Err(Error::HardwareUnavailable(instance, channel)),
        };

        let flags = EndpointFlags::CLOSABLE | EndpointFlags::DESTROYABLE;
        let id = match self.registry.create(dir, key, flags, EndpointState::Audio(audio)) {
            Ok(id) => id,
            Err(e) => {
                hw.release(instance, channel, dir);
                return Err(e);
            }
        };
        self.core_mut(id)?.con_id = Some(con);
        Ok(match pending {
            true => Acquired::Pending(id),
            false => Acquired::Ready(id),
        })
    }

    /// Completion of a pending hardware acquisition. The endpoint is
    /// destroyed when the hardware could not be acquired.
    pub fn audio_acquired(
        &mut self,
        id: EndpointId,
        device: Option<Box<dyn AudioDevice>>,
    ) -> Result<()> {
        let ep = self.registry.get_mut(id).ok_or(Error::UnknownEndpoint(id))?;
        let EndpointState::Audio(audio) = &mut ep.state else {
            return Err(Error::NotSupported(id));
        };
        let (instance, channel) = (audio.instance(), audio.channel());
        match device {
            Some(device) => {
                audio.set_device(device);
                Ok(())
            }
            None => {
                self.destroy_endpoint(id);
                Err(Error::HardwareUnavailable(instance, channel))
            }
        }
    }

    pub fn close_endpoint(&mut self, con: ConnectionId, id: EndpointId) -> Result<()> {
        let core = self.check_owner(id, con)?;
        let (flags, transform) = (core.flags, core.transform);
        if !flags.contains(EndpointFlags::CLOSABLE) && !core.is_real() {
            return Err(Error::NotClosable(id));
        }

        if let Some(tid) = transform {
            self.disconnect_transform(tid)?;
        }
        if !flags.contains(EndpointFlags::CLOSABLE) {
            self.core_mut(id)?.con_id = None;
            log::info!("endpoint {} released by {:?}", id, con);
            return Ok(());
        }

        self.call(id, |core, ops, cx| ops.close(core, cx))??;
        if flags.contains(EndpointFlags::DESTROYABLE) {
            self.destroy_endpoint(id);
        } else {
            self.core_mut(id)?.con_id = None;
        }
        log::info!("endpoint {} closed by {:?}", id, con);
        Ok(())
    }

    fn destroy_endpoint(&mut self, id: EndpointId) {
        let _ = self.stop_one(id);
        let Some(ep) = self.registry.remove(id) else {
            return;
        };
        if let Some(peer) = ep.core.sync_peer {
            if let Some(peer) = self.registry.get_mut(peer) {
                peer.core.sync_peer = None;
            }
        }
        if let (EndpointState::Audio(audio), Some(hw)) = (&ep.state, self.audio_hw.as_mut()) {
            hw.release(audio.instance(), audio.channel(), ep.core.direction);
        }
    }

    // Connection

    /// Connect `source` to `sink`, creating the operator endpoints on first
    /// reference. Nothing created for the attempt survives a failure.
    pub fn connect(
        &mut self,
        con: ConnectionId,
        source: EndpointId,
        sink: EndpointId,
    ) -> Result<TransformId> {
        if source.direction() != Direction::Source {
            return Err(Error::WrongDirection(source));
        }
        if sink.direction() != Direction::Sink {
            return Err(Error::WrongDirection(sink));
        }

        let source_created = self.resolve(source)?;
        let sink_created = match self.resolve(sink) {
            Ok(created) => created,
            Err(e) => {
                if source_created {
                    self.registry.remove(source);
                }
                return Err(e);
            }
        };

        let result = self.connect_resolved(con, source, sink);
        if result.is_err() {
            for (id, created) in [(source, source_created), (sink, sink_created)] {
                if created {
                    self.registry.remove(id);
                }
            }
        }
        result
    }

    /// Make sure the endpoint exists. Returns whether it was created.
    fn resolve(&mut self, id: EndpointId) -> Result<bool> {
        if self.registry.contains(id) {
            return Ok(false);
        }
        let Some((opid, terminal)) = id.operator_terminal() else {
            return Err(Error::UnknownEndpoint(id));
        };
        if !self.operators.contains(opid) {
            return Err(Error::UnknownOperator(opid));
        }
        let core = EndpointCore::new(id, id.0 as u32, EndpointFlags::DESTROY_ON_DISCONNECT);
        let state = EndpointState::Operator(OperatorEndpoint::new(opid, terminal));
        self.registry.insert(Endpoint::new(core, state));
        Ok(true)
    }

    fn connect_resolved(
        &mut self,
        con: ConnectionId,
        source: EndpointId,
        sink: EndpointId,
    ) -> Result<TransformId> {
        if self.transforms.find(source, sink).is_some() {
            return Err(Error::AlreadyConnected(source));
        }
        for id in [source, sink] {
            if self.check_owner(id, con)?.is_connected() {
                return Err(Error::AlreadyConnected(id));
            }
        }

        let (src, src_format, _) = self.connection_details(source)?;
        let (snk, sink_format, sink_real) = self.connection_details(sink)?;

        if src.requires_metadata && !snk.supports_metadata {
            return Err(Error::MetadataUnsupported(source));
        }
        if snk.requires_metadata && !src.supports_metadata {
            return Err(Error::MetadataUnsupported(sink));
        }
        let buffer = Self::transform_buffer(&src, &snk)?;

        let adapted = match src_format != sink_format {
            true => Some(self.adapt_format(source, sink, src_format, sink_format, sink_real)?),
            false => None,
        };

        // A failed connect leaves the adapted side in its former format
        let mut this = scopeguard::guard(self, |this| {
            if let Some((target, format)) = adapted {
                this.restore_format(target, format);
            }
        });
        let sink_start =
            this.call(sink, |core, ops, cx| ops.connect(core, cx, &buffer, Some(source)))??;
        let source_start =
            match this.call(source, |core, ops, cx| ops.connect(core, cx, &buffer, Some(sink)))? {
                Ok(start) => start,
                Err(e) => {
                    let rollback = this.call(sink, |core, ops, cx| ops.disconnect(core, cx));
                    if let Err(re) = rollback.and_then(|r| r) {
                        log::error!("{} not detached after failed connect: {}", sink, re);
                    }
                    return Err(e);
                }
            };
        let this = ScopeGuard::into_inner(this);

        let tid = this.transforms.create(source, sink, buffer);
        for (id, peer) in [(source, sink), (sink, source)] {
            let core = this.core_mut(id)?;
            core.connected_to = Some(peer);
            core.kick_target = Some(peer);
            core.transform = Some(tid);
        }

        if source_start && sink_start {
            for id in [source, sink] {
                if let Err(e) = this.start_one(id) {
                    log::warn!("{} not started on connect: {}", id, e);
                }
            }
        }
        Ok(tid)
    }

    /// Configure the non-real side, or the real sink, with the format of
    /// its peer. Returns the adapted endpoint and its former format.
    fn adapt_format(
        &mut self,
        source: EndpointId,
        sink: EndpointId,
        src_format: DataFormat,
        sink_format: DataFormat,
        sink_real: bool,
    ) -> Result<(EndpointId, DataFormat)> {
        let (target, format, former) = match sink_real {
            true => (sink, src_format, sink_format),
            false => (source, sink_format, src_format),
        };
        self.call(target, |core, ops, cx| {
            ops.configure(core, cx, ConfigKey::DataFormat, format as u32)
        })?
        .map_err(|_| Error::FormatMismatch { source_ep: source, sink_ep: sink })?;
        log::debug!("{} adapted to {:?}", target, format);
        Ok((target, former))
    }

    fn restore_format(&mut self, id: EndpointId, format: DataFormat) {
        let restored = self.call(id, |core, ops, cx| {
            ops.configure(core, cx, ConfigKey::DataFormat, format as u32)
        });
        match restored.and_then(|r| r) {
            Ok(()) => log::debug!("{} back to {:?}", id, format),
            Err(e) => log::error!("{} not restored to {:?}: {}", id, format, e),
        }
    }

    fn connection_details(&mut self, id: EndpointId) -> Result<(BufferDetails, DataFormat, bool)> {
        self.query(id, |core, ops, cx| {
            (ops.buffer_details(core, cx), ops.data_format(core, cx), core.is_real())
        })
    }

    fn transform_buffer(src: &BufferDetails, snk: &BufferDetails) -> Result<SharedBuffer> {
        let buffer = match (&src.supplies_buffer, &snk.supplies_buffer) {
            (Some(_), Some(_)) => return Err(Error::BothSupplyBuffer),
            (Some(buffer), None) | (None, Some(buffer)) => buffer.clone(),
            (None, None) => CBuffer::new(src.min_size.max(snk.min_size)).shared(),
        };
        if src.supports_metadata && snk.supports_metadata {
            buffer.borrow_mut().enable_metadata();
        }
        Ok(buffer)
    }

    pub fn disconnect(&mut self, con: ConnectionId, tid: TransformId) -> Result<()> {
        let t = self.transforms.get(tid).ok_or(Error::UnknownTransform(tid.0))?;
        let (source, sink) = (t.source, t.sink);
        self.check_owner(source, con)?;
        self.check_owner(sink, con)?;
        self.disconnect_transform(tid)
    }

    pub fn disconnect_endpoints(
        &mut self,
        con: ConnectionId,
        source: EndpointId,
        sink: EndpointId,
    ) -> Result<()> {
        let tid = self.transforms.find(source, sink).ok_or(Error::NotConnected(source))?;
        self.disconnect(con, tid)
    }

    /// Stop the running real endpoints, then detach both sides from the
    /// buffer. The endpoints are restarted when a side fails to detach.
    fn disconnect_transform(&mut self, tid: TransformId) -> Result<()> {
        let t = self.transforms.get(tid).ok_or(Error::UnknownTransform(tid.0))?;
        let (source, sink) = (t.source, t.sink);

        let mut stopped = vec![];
        for id in [source, sink] {
            let core = self.core(id)?;
            if core.is_real() && core.is_running() && self.stop_one(id)? {
                stopped.push(id);
            }
        }

        let mut this = scopeguard::guard(self, |this| {
            for id in stopped {
                if let Err(e) = this.start_one(id) {
                    log::error!("{} not restarted: {}", id, e);
                }
            }
        });
        this.call(sink, |core, ops, cx| ops.disconnect(core, cx))??;
        this.call(source, |core, ops, cx| ops.disconnect(core, cx))??;
        let this = ScopeGuard::into_inner(this);

        this.transforms.remove(tid);
        for id in [source, sink] {
            let core = this.core_mut(id)?;
            core.connected_to = None;
            core.kick_target = None;
            core.transform = None;
            if core.flags.contains(EndpointFlags::DESTROY_ON_DISCONNECT) {
                this.destroy_endpoint(id);
            }
        }
        Ok(())
    }

    // Run control

    pub fn start_endpoint(&mut self, con: ConnectionId, id: EndpointId) -> Result<()> {
        let peer = self.check_owner(id, con)?.sync_peer;
        self.start_one(id)?;
        if let Some(peer) = peer {
            match self.core(peer)?.is_connected() {
                true => self.start_one(peer)?,
                false => log::debug!("{} not started with {}, not connected", peer, id),
            }
        }
        Ok(())
    }

    /// Returns whether something was actually stopped
    pub fn stop_endpoint(&mut self, con: ConnectionId, id: EndpointId) -> Result<bool> {
        let peer = self.check_owner(id, con)?.sync_peer;
        let mut stopped = self.stop_one(id)?;
        if let Some(peer) = peer {
            stopped |= self.stop_one(peer)?;
        }
        Ok(stopped)
    }

    fn start_one(&mut self, id: EndpointId) -> Result<()> {
        let core = self.core(id)?;
        if !core.is_connected() {
            return Err(Error::NotConnected(id));
        }
        let peer_ticks = core
            .sync_peer
            .and_then(|p| self.registry.get(p))
            .and_then(|p| p.state.ops().next_kick_ticks(&p.core));

        let mut cx = context!(self);
        cx.peer_ticks = peer_ticks;
        let ep = self.registry.get_mut(id).ok_or(Error::UnknownEndpoint(id))?;
        ep.state.ops_mut().start(&mut ep.core, &mut cx)
    }

    fn stop_one(&mut self, id: EndpointId) -> Result<bool> {
        self.call(id, |core, ops, cx| ops.stop(core, cx))
    }

    // Configuration

    pub fn configure(
        &mut self,
        con: ConnectionId,
        id: EndpointId,
        key: u32,
        value: u32,
    ) -> Result<()> {
        self.check_owner(id, con)?;
        let key = ConfigKey::from_u32(key).ok_or(Error::InvalidConfigKey(key))?;
        self.call(id, |core, ops, cx| ops.configure(core, cx, key, value))?
    }

    pub fn get_config(
        &mut self,
        con: ConnectionId,
        id: EndpointId,
        key: u32,
    ) -> Result<ConfigValue> {
        self.check_owner(id, con)?;
        let key = ConfigKey::from_u32(key).ok_or(Error::InvalidConfigKey(key))?;
        self.query(id, |core, ops, cx| ops.get_config(core, cx, key))?
    }

    pub fn data_format(&mut self, id: EndpointId) -> Result<DataFormat> {
        self.query(id, |core, ops, cx| ops.data_format(core, cx))
    }

    /// Synchronise `id` with `peer`, or break its synchronisation when `None`
    pub fn sync_sids(
        &mut self,
        con: ConnectionId,
        id: EndpointId,
        peer: Option<EndpointId>,
    ) -> Result<()> {
        let current = self.check_owner(id, con)?.sync_peer;
        let Some(peer) = peer else {
            self.query(id, |core, ops, cx| ops.can_sync(core, cx, None))??;
            if let Some(current) = current {
                self.query(current, |core, ops, cx| ops.can_sync(core, cx, None))??;
                self.core_mut(current)?.sync_peer = None;
            }
            self.core_mut(id)?.sync_peer = None;
            return Ok(());
        };

        self.check_owner(peer, con)?;
        if peer == id {
            return Err(Error::SyncRejected("endpoint cannot be synchronised with itself"));
        }
        if current.is_some_and(|p| p != peer)
            || self.core(peer)?.sync_peer.is_some_and(|p| p != id)
        {
            return Err(Error::SyncRejected("already synchronised with another endpoint"));
        }
        {
            let cx = context!(self);
            let ep = self.registry.get(id).ok_or(Error::UnknownEndpoint(id))?;
            let other = self.registry.get(peer).ok_or(Error::UnknownEndpoint(peer))?;
            ep.state.ops().can_sync(&ep.core, &cx, Some(other))?;
        }

        self.core_mut(id)?.sync_peer = Some(peer);
        self.core_mut(peer)?.sync_peer = Some(id);
        log::info!("{} synchronised with {}", id, peer);
        Ok(())
    }

    /// Whether the two endpoints consume or produce data at the same clock
    pub fn have_same_clock(&mut self, a: EndpointId, b: EndpointId) -> Result<bool> {
        let a = self.query(a, |core, ops, cx| ops.clock_source(core, cx))?;
        let b = self.query(b, |core, ops, cx| ops.clock_source(core, cx))?;
        Ok(matches!((a, b), (Some(a), Some(b)) if a == b))
    }

    // Kicks

    /// Kick `id`, and the chain of endpoints it propagates to
    pub fn kick(&mut self, id: EndpointId, dir: KickDirection) {
        let mut visited = HashSet::new();
        let mut work = VecDeque::from([(id, dir)]);
        while let Some((id, dir)) = work.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let propagations = match self.call(id, |core, ops, cx| ops.kick(core, cx, dir)) {
                Ok(propagations) => propagations,
                Err(_) => panic!("Kick of missing endpoint {}", id),
            };
            for p in propagations {
                let Some(target) = self.registry.get(p.from).and_then(|ep| ep.core.kick_target)
                else {
                    continue;
                };
                let wants_kicks =
                    self.query(target, |core, ops, cx| ops.get_timing(core, cx).wants_kicks);
                if wants_kicks.unwrap_or(false) {
                    work.push_back((target, p.dir));
                }
            }
        }
    }

    /// Earliest armed kick
    pub fn next_deadline(&self) -> Option<Time> {
        self.timers.next_deadline(self.clock.now())
    }

    /// Fire the expired timers, then run the deferred kicks
    pub fn service_timers(&mut self) {
        let now = self.clock.now();
        while let Some((timer, ko)) = self.timers.expire(now) {
            self.on_timer(timer, ko);
        }
        self.run_deferred();
    }

    fn on_timer(&mut self, timer: TimerId, ko: KickObject) {
        let id = ko.endpoint;
        let mode = self.call(id, |core, ops, cx| {
            ops.sched_kick(core, cx);
            core.kick_mode
        });
        match mode {
            Ok(KickMode::Immediate) => self.kick(id, KickDirection::Internal),
            Ok(KickMode::Deferred) => self.deferred.push(ko),
            Err(_) => panic!("Timer {} fired for missing endpoint {}", timer.get(), id),
        }
    }

    pub fn run_deferred(&mut self) {
        while let Some(ko) = self.deferred.pop() {
            if self.registry.contains(ko.endpoint) {
                self.kick(ko.endpoint, KickDirection::Internal);
            }
        }
    }
}
