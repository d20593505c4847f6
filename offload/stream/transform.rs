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

use std::collections::HashMap;
use std::fmt;

use crate::buffer::SharedBuffer;
use crate::endpoint::EndpointId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformId(pub u16);

impl fmt::Display for TransformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Connection of a source endpoint to a sink endpoint, through a buffer
#[derive(Debug)]
pub struct Transform {
    pub id: TransformId,
    pub source: EndpointId,
    pub sink: EndpointId,
    pub buffer: SharedBuffer,
}

#[derive(Debug, Default)]
pub struct TransformTable {
    transforms: HashMap<TransformId, Transform>,
    last_id: u16,
}

impl TransformTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Bind `source` to `sink`; the pair must not be connected yet
    pub fn create(
        &mut self,
        source: EndpointId,
        sink: EndpointId,
        buffer: SharedBuffer,
    ) -> TransformId {
        assert!(self.find(source, sink).is_none(), "{} -> {} already connected", source, sink);
        let id = loop {
            self.last_id = self.last_id.wrapping_add(1).max(1);
            let id = TransformId(self.last_id);
            if !self.transforms.contains_key(&id) {
                break id;
            }
        };
        log::info!("transform {} created: {} -> {}", id, source, sink);
        self.transforms.insert(id, Transform { id, source, sink, buffer });
        id
    }

    pub fn remove(&mut self, id: TransformId) -> Option<Transform> {
        let t = self.transforms.remove(&id)?;
        log::info!("transform {} destroyed", id);
        Some(t)
    }

    pub fn get(&self, id: TransformId) -> Option<&Transform> {
        self.transforms.get(&id)
    }

    /// Transform binding `source` to `sink`
    pub fn find(&self, source: EndpointId, sink: EndpointId) -> Option<TransformId> {
        self.transforms.values().find(|t| t.source == source && t.sink == sink).map(|t| t.id)
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CBuffer;

    #[test]
    fn create_find_remove() {
        let mut transforms = TransformTable::new();
        let (a, b, c) = (EndpointId(0x2001), EndpointId(0xa001), EndpointId(0xa002));

        let t1 = transforms.create(a, b, CBuffer::new(16).shared());
        let t2 = transforms.create(a, c, CBuffer::new(16).shared());
        assert_ne!(t1, t2);
        assert_eq!(transforms.find(a, b), Some(t1));
        assert_eq!(transforms.find(b, a), None);
        assert_eq!(transforms.find(a, c), Some(t2));

        let t = transforms.remove(t1).unwrap();
        assert_eq!((t.source, t.sink), (a, b));
        assert_eq!(transforms.find(a, b), None);
        assert_eq!(transforms.len(), 1);
    }

    #[test]
    #[should_panic]
    fn one_transform_per_pair() {
        let mut transforms = TransformTable::new();
        transforms.create(EndpointId(1), EndpointId(0x8001), CBuffer::new(16).shared());
        transforms.create(EndpointId(1), EndpointId(0x8001), CBuffer::new(16).shared());
    }
}
