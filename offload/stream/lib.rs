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

//! Audio Stream module
//!
//! Moves audio between the radio links (SCO and ISO), the audio hardware
//! and the processing operators. Endpoints are joined by transforms, each
//! owning the buffer the two endpoints exchange data through. Kicks start
//! at the timer of a link or hardware endpoint and travel along the chain:
//!
//! ```text
//!      radio                                                audio
//!   link buffer                                           hardware
//!        |        ____________       ____________             ^
//!        |       |  transform |     |  transform |            |
//!   ___  v  ___  |   buffer   |  ___|    buffer  |  ___   ____|__
//!  |  SCO/ISO  |-|----------->|-| op |---------->|-|    audio   |
//!  |  source   | |____________| |____|___________| |    sink    |
//!  |___________|                                    |___________|
//!        ^                                                ^
//!        | timer                               kick       |
//!        `---- kick --------------------------------------'
//! ```
//!
//! The `service` runs the stream on its own thread, driven by the kick
//! timers and the requests of the clients.

mod audio;
mod buffer;
mod clock;
mod endpoint;
mod error;
mod iso;
mod link;
mod metadata;
mod operator;
mod rate;
mod record;
mod registry;
mod sched;
mod sco;
mod sco_sink;
mod sco_src;
mod service;
mod stream;
mod transform;


pub use audio::{audio_key, Acquire, AudioDevice, AudioHardware};
pub use buffer::{CBuffer, SharedBuffer};
pub use clock::{ClockTranslation, LinearWallclock, LocalClock, Time, VirtualClock, Wallclocks};
pub use endpoint::{
    ConfigKey, ConfigValue, ConnectionId, DataFormat, Direction, EndpointId, EndpointType,
    StreamConfig,
};
pub use error::{Error, Result, Status};
pub use link::{IsoParams, LinkParams};
pub use metadata::MetadataTag;
pub use operator::{CopyOperator, Operator, Terminal};
pub use rate::RateEstimator;
pub use sco::LinkKind;
pub use service::{MonotonicClock, StreamService, StreamViews};
pub use stream::{Acquired, Device, Stream};
pub use transform::TransformId;

/// Route `log` records to the standard error, filtered by `RUST_LOG`
pub fn init_logging() {
    env_logger::Builder::new().parse_default_env().try_init().ok();
}
