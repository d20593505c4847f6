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

use num_derive::{FromPrimitive, ToPrimitive};
use thiserror::Error;

use crate::endpoint::{ConnectionId, EndpointId};

/// Errors reported to the caller of a stream operation.
/// None of them leaves the stream in a partially modified state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),

    #[error("endpoint {0} is not owned by connection {1:?}")]
    NotOwner(EndpointId, ConnectionId),

    #[error("endpoint {0} has the wrong direction for this operation")]
    WrongDirection(EndpointId),

    #[error("endpoint {0} is already connected")]
    AlreadyConnected(EndpointId),

    #[error("endpoint {0} is not connected")]
    NotConnected(EndpointId),

    #[error("unknown transform {0}")]
    UnknownTransform(u16),

    #[error("both endpoints want to supply the transform buffer")]
    BothSupplyBuffer,

    #[error("endpoint {0} requires buffer metadata, which its peer does not support")]
    MetadataUnsupported(EndpointId),

    #[error("data format of {source_ep} cannot be adapted to {sink_ep}")]
    FormatMismatch { source_ep: EndpointId, sink_ep: EndpointId },

    #[error("invalid configuration key 0x{0:04x}")]
    InvalidConfigKey(u32),

    #[error("invalid value 0x{1:08x} for configuration key {0:?}")]
    InvalidConfigValue(crate::endpoint::ConfigKey, u32),

    #[error("endpoint {0} cannot be closed")]
    NotClosable(EndpointId),

    #[error("endpoint {0} is running")]
    Running(EndpointId),

    #[error("synchronisation rejected: {0}")]
    SyncRejected(&'static str),

    #[error("no link with handle 0x{0:03x}")]
    UnknownLink(u16),

    #[error("endpoints already exist for link 0x{0:03x}")]
    LinkEndpointsExist(u16),

    #[error("unknown operator {0}")]
    UnknownOperator(u16),

    #[error("audio hardware {0}:{1} is not available")]
    HardwareUnavailable(u8, u8),

    #[error("operation not supported by endpoint {0}")]
    NotSupported(EndpointId),

    #[error("driver of endpoint {0} rejected the transform buffer")]
    DriverConnect(EndpointId),

    #[error("no endpoint identifier left")]
    NoResources,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Status carried by the callbacks of the request interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Status {
    Ok = 0x0000,
    CmdFailed = 0x0001,
    CmdPending = 0x0002,
}

impl<T> From<&Result<T>> for Status {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(_) => Status::CmdFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::{FromPrimitive, ToPrimitive};

    #[test]
    fn status_codes() {
        assert_eq!(Status::from_u32(2), Some(Status::CmdPending));
        assert_eq!(Status::CmdFailed.to_u32(), Some(1));
        assert_eq!(Status::from_u32(7), None);

        let failed: Result<()> = Err(Error::BothSupplyBuffer);
        assert_eq!(Status::from(&failed), Status::CmdFailed);
        assert_eq!(Status::from(&Ok::<u8, Error>(3)), Status::Ok);
    }
}
