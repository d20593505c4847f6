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

//! Processing nodes, and the endpoints standing for their terminals

use num_traits::ToPrimitive;
use std::collections::HashMap;

use crate::buffer::SharedBuffer;
use crate::endpoint::{
    BufferDetails, ClockSource, ConfigKey, ConfigValue, Context, DataFormat, Direction,
    EndpointCore, EndpointId, EndpointOps, KickDirection, Propagation, TimingInfo,
};
use crate::error::{Error, Result};

/// Input (sink) or output (source) terminal of an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Terminal {
    pub dir: Direction,
    pub index: u8,
}

impl Terminal {
    pub fn source(index: u8) -> Self {
        Self { dir: Direction::Source, index }
    }

    pub fn sink(index: u8) -> Self {
        Self { dir: Direction::Sink, index }
    }
}

/// A processing node connected between endpoints
pub trait Operator {
    fn data_format(&self, terminal: Terminal) -> DataFormat;

    fn supports_metadata(&self, _terminal: Terminal) -> bool {
        true
    }

    fn min_buffer_size(&self, _terminal: Terminal) -> usize {
        0
    }

    /// Attach a buffer to a terminal, returns false when refused
    fn connect(&mut self, terminal: Terminal, buffer: SharedBuffer) -> bool;

    fn disconnect(&mut self, terminal: Terminal);

    /// Size of the blocks produced on the outputs, in octets
    fn block_size(&self) -> usize {
        0
    }

    /// Process data following a kick received on `terminal`.
    /// Returns the terminals whose neighbours must be kicked.
    fn kick(&mut self, terminal: Terminal) -> Vec<Terminal>;

    /// Playback rate correction, for rate adjustment operators
    fn set_rate(&mut self, _warp: i32) {}

    fn set_passthrough(&mut self, _enable: bool) {}
}

#[derive(Default)]
pub struct OperatorTable {
    operators: HashMap<u16, Box<dyn Operator>>,
}

impl OperatorTable {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, opid: u16, op: Box<dyn Operator>) -> Option<Box<dyn Operator>> {
        self.operators.insert(opid, op)
    }

    pub fn contains(&self, opid: u16) -> bool {
        self.operators.contains_key(&opid)
    }

    pub fn get(&self, opid: u16) -> Option<&dyn Operator> {
        self.operators.get(&opid).map(|op| op.as_ref())
    }

    pub fn get_mut(&mut self, opid: u16) -> Option<&mut (dyn Operator + 'static)> {
        self.operators.get_mut(&opid).map(|op| op.as_mut())
    }

    pub fn block_size(&self, opid: u16) -> usize {
        self.get(opid).map_or(0, |op| op.block_size())
    }
}

/// Operator copying its input to its output, tags included.
/// As a rate adjustment stage, it keeps the last correction received.
#[derive(Debug)]
pub struct CopyOperator {
    format: DataFormat,
    block_size: usize,
    input: Option<SharedBuffer>,
    output: Option<SharedBuffer>,
    warp: i32,
    passthrough: bool,
}

impl CopyOperator {
    pub fn new(format: DataFormat, block_size: usize) -> Self {
        Self { format, block_size, input: None, output: None, warp: 0, passthrough: true }
    }

    pub fn warp(&self) -> i32 {
        self.warp
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    fn transfer(&mut self) {
        let (Some(input), Some(output)) = (&self.input, &self.output) else {
            return;
        };
        let mut input = input.borrow_mut();
        let mut output = output.borrow_mut();
        let mut chunk = vec![0u8; input.amount_data().min(output.amount_space())];

        if !input.has_metadata() {
            let n = input.read(&mut chunk);
            output.write(&chunk[..n]);
            return;
        }

        while let Some(tag) = input.peek_tag().cloned() {
            if tag.length > input.amount_data() || tag.length > output.amount_space() {
                break;
            }
            chunk.resize(tag.length, 0);
            input.read(&mut chunk);
            output.write(&chunk);
            output.append_tag(tag);
            input.remove_tag();
        }
    }
}

impl Operator for CopyOperator {
    fn data_format(&self, _terminal: Terminal) -> DataFormat {
        self.format
    }

    fn min_buffer_size(&self, _terminal: Terminal) -> usize {
        2 * self.block_size
    }

    fn connect(&mut self, terminal: Terminal, buffer: SharedBuffer) -> bool {
        let slot = match terminal {
            Terminal { dir: Direction::Sink, index: 0 } => &mut self.input,
            Terminal { dir: Direction::Source, index: 0 } => &mut self.output,
            _ => return false,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(buffer);
        true
    }

    fn disconnect(&mut self, terminal: Terminal) {
        match terminal.dir {
            Direction::Sink => self.input = None,
            Direction::Source => self.output = None,
        }
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn kick(&mut self, terminal: Terminal) -> Vec<Terminal> {
        self.transfer();
        match terminal.dir {
            Direction::Sink => vec![Terminal::source(0)],
            Direction::Source => vec![Terminal::sink(0)],
        }
    }

    fn set_rate(&mut self, warp: i32) {
        if !self.passthrough {
            self.warp = warp;
        }
    }

    fn set_passthrough(&mut self, enable: bool) {
        self.passthrough = enable;
        if enable {
            self.warp = 0;
        }
    }
}

/// Endpoint of an operator terminal
#[derive(Debug)]
pub struct OperatorEndpoint {
    opid: u16,
    terminal: Terminal,
    buffer: Option<SharedBuffer>,
}

impl OperatorEndpoint {
    pub fn new(opid: u16, terminal: Terminal) -> Self {
        Self { opid, terminal, buffer: None }
    }

    pub fn opid(&self) -> u16 {
        self.opid
    }

    pub fn terminal(&self) -> Terminal {
        self.terminal
    }
}

impl EndpointOps for OperatorEndpoint {
    fn close(&mut self, core: &mut EndpointCore, _cx: &mut Context) -> Result<()> {
        Err(Error::NotClosable(core.id))
    }

    fn connect(
        &mut self,
        core: &mut EndpointCore,
        cx: &mut Context,
        buffer: &SharedBuffer,
        _kick_target: Option<EndpointId>,
    ) -> Result<bool> {
        let op = cx.operators.get_mut(self.opid).ok_or(Error::UnknownOperator(self.opid))?;
        if !op.connect(self.terminal, buffer.clone()) {
            return Err(Error::DriverConnect(core.id));
        }
        self.buffer = Some(buffer.clone());
        Ok(true)
    }

    fn disconnect(&mut self, _core: &mut EndpointCore, cx: &mut Context) -> Result<()> {
        if let Some(op) = cx.operators.get_mut(self.opid) {
            op.disconnect(self.terminal);
        }
        self.buffer = None;
        Ok(())
    }

    fn buffer_details(&self, _core: &EndpointCore, cx: &Context) -> BufferDetails {
        let op = cx.operators.get(self.opid);
        BufferDetails {
            supports_metadata: op.map_or(false, |op| op.supports_metadata(self.terminal)),
            requires_metadata: false,
            supplies_buffer: None,
            min_size: op.map_or(0, |op| op.min_buffer_size(self.terminal)),
            runs_in_place: false,
        }
    }

    fn data_format(&self, _core: &EndpointCore, cx: &Context) -> DataFormat {
        cx.operators.get(self.opid).map_or(DataFormat::Fixp, |op| op.data_format(self.terminal))
    }

    fn kick(
        &mut self,
        _core: &mut EndpointCore,
        cx: &mut Context,
        _dir: KickDirection,
    ) -> Vec<Propagation> {
        let Some(op) = cx.operators.get_mut(self.opid) else {
            return vec![];
        };
        op.kick(self.terminal)
            .into_iter()
            .map(|t| Propagation {
                from: EndpointId::operator(self.opid, t),
                dir: match t.dir {
                    Direction::Source => KickDirection::Forwards,
                    Direction::Sink => KickDirection::Backwards,
                },
            })
            .collect()
    }

    fn start(&mut self, core: &mut EndpointCore, _cx: &mut Context) -> Result<()> {
        core.set_running(true);
        Ok(())
    }

    fn stop(&mut self, core: &mut EndpointCore, _cx: &mut Context) -> bool {
        let running = core.is_running();
        core.set_running(false);
        running
    }

    fn configure(
        &mut self,
        core: &mut EndpointCore,
        cx: &mut Context,
        key: ConfigKey,
        value: u32,
    ) -> Result<()> {
        match key {
            ConfigKey::DataFormat
                if self.data_format(core, cx).to_u32() == Some(value) =>
            {
                Ok(())
            }
            ConfigKey::DataFormat => Err(Error::InvalidConfigValue(key, value)),
            _ => Err(Error::InvalidConfigKey(key as u32)),
        }
    }

    fn get_config(&self, core: &EndpointCore, cx: &Context, key: ConfigKey) -> Result<ConfigValue> {
        match key {
            ConfigKey::DataFormat => {
                Ok(ConfigValue::Value(self.data_format(core, cx).to_u32().unwrap_or_default()))
            }
            _ => Err(Error::InvalidConfigKey(key as u32)),
        }
    }

    fn get_timing(&self, _core: &EndpointCore, cx: &Context) -> TimingInfo {
        TimingInfo {
            block_size: cx.operators.block_size(self.opid),
            is_volatile: false,
            locally_clocked: true,
            wants_kicks: true,
        }
    }

    fn clock_source(&self, _core: &EndpointCore, _cx: &Context) -> Option<ClockSource> {
        Some(ClockSource::Local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CBuffer;
    use crate::metadata::MetadataTag;

    #[test]
    fn copy_with_tags() {
        let input = CBuffer::with_metadata(64).shared();
        let output = CBuffer::with_metadata(24).shared();

        let mut op = CopyOperator::new(DataFormat::Pcm16, 10);
        assert!(op.connect(Terminal::sink(0), input.clone()));
        assert!(op.connect(Terminal::source(0), output.clone()));
        assert!(!op.connect(Terminal::source(0), output.clone()));
        assert!(!op.connect(Terminal::source(1), output.clone()));

        for n in 0..3u8 {
            input.borrow_mut().write(&[n; 10]);
            input.borrow_mut().append_tag(MetadataTag::ttp(10, n as u32 * 100));
        }

        assert_eq!(op.kick(Terminal::sink(0)), vec![Terminal::source(0)]);

        // Only whole tags are moved
        assert_eq!(output.borrow().amount_data(), 20);
        assert_eq!(output.borrow().tag_count(), 2);
        assert_eq!(input.borrow().amount_data(), 10);
        assert_eq!(input.borrow().peek_tag().and_then(|t| t.time_to_play()), Some(200));

        let mut out = [0u8; 20];
        output.borrow_mut().read(&mut out);
        assert_eq!(out[9..11], [0, 1]);
    }

    #[test]
    fn copy_without_metadata() {
        let input = CBuffer::new(16).shared();
        let output = CBuffer::new(4).shared();

        let mut op = CopyOperator::new(DataFormat::Fixp, 2);
        op.connect(Terminal::sink(0), input.clone());
        op.connect(Terminal::source(0), output.clone());
        input.borrow_mut().write(&[1, 2, 3, 4, 5, 6]);

        assert_eq!(op.kick(Terminal::source(0)), vec![Terminal::sink(0)]);
        assert_eq!(output.borrow().amount_data(), 4);
        assert_eq!(input.borrow().amount_data(), 2);
    }

    #[test]
    fn rate_adjustment() {
        let mut op = CopyOperator::new(DataFormat::Pcm16, 0);
        op.set_rate(100);
        assert_eq!(op.warp(), 0);

        op.set_passthrough(false);
        op.set_rate(100);
        assert_eq!(op.warp(), 100);

        op.set_passthrough(true);
        assert!(op.is_passthrough());
        assert_eq!(op.warp(), 0);
    }
}
