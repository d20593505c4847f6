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

use crate::endpoint::{
    Direction, Endpoint, EndpointCore, EndpointFlags, EndpointId, EndpointState, EndpointType,
};
use crate::error::{Error, Result};

/// Lookup key of an endpoint: unique for a type and a direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub ep_type: EndpointType,
    pub dir: Direction,
    pub key: u32,
}

/// All the endpoints, indexed by identifier and by key
#[derive(Default)]
pub struct Registry {
    endpoints: HashMap<EndpointId, Endpoint>,
    keys: HashMap<EndpointKey, EndpointId>,
    next_index: u16,
}

impl Registry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn lookup(&self, ep_type: EndpointType, dir: Direction, key: u32) -> Option<EndpointId> {
        self.keys.get(&EndpointKey { ep_type, dir, key }).copied()
    }

    /// Create a real endpoint, allocating its identifier
    pub fn create(
        &mut self,
        dir: Direction,
        key: u32,
        flags: EndpointFlags,
        state: EndpointState,
    ) -> Result<EndpointId> {
        let id = self.alloc_id(dir)?;
        self.insert(Endpoint::new(EndpointCore::new(id, key, flags | EndpointFlags::REAL), state));
        Ok(id)
    }

    /// Insert an endpoint whose identifier is already known
    pub fn insert(&mut self, ep: Endpoint) {
        let key = EndpointKey { ep_type: ep.ep_type(), dir: ep.core.direction, key: ep.core.key };
        let id = ep.id();
        if let Some(old) = self.keys.insert(key, id) {
            panic!("Endpoint {} already registered with key {:?}", old, key);
        }
        log::info!("endpoint {} created ({:?} {:?} 0x{:x})", id, key.ep_type, key.dir, key.key);
        self.endpoints.insert(id, ep);
    }

    pub fn remove(&mut self, id: EndpointId) -> Option<Endpoint> {
        let ep = self.endpoints.remove(&id)?;
        self.keys.remove(&EndpointKey {
            ep_type: ep.ep_type(),
            dir: ep.core.direction,
            key: ep.core.key,
        });
        log::info!("endpoint {} destroyed", id);
        Some(ep)
    }

    pub fn get(&self, id: EndpointId) -> Option<&Endpoint> {
        self.endpoints.get(&id)
    }

    pub fn get_mut(&mut self, id: EndpointId) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(&id)
    }

    pub fn contains(&self, id: EndpointId) -> bool {
        self.endpoints.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    fn alloc_id(&mut self, dir: Direction) -> Result<EndpointId> {
        for _ in 0..EndpointId::INDEX_MASK {
            self.next_index = (self.next_index % EndpointId::INDEX_MASK) + 1;
            let id = EndpointId::real(dir, self.next_index);
            if !self.endpoints.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Error::NoResources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{OperatorEndpoint, Terminal};

    fn operator_state(index: u8) -> EndpointState {
        EndpointState::Operator(OperatorEndpoint::new(1, Terminal { dir: Direction::Sink, index }))
    }

    #[test]
    fn create_and_lookup() {
        let mut registry = Registry::new();
        let a = registry
            .create(Direction::Sink, 7, EndpointFlags::CLOSABLE, operator_state(0))
            .unwrap();
        let b =
            registry.create(Direction::Sink, 8, EndpointFlags::empty(), operator_state(1)).unwrap();

        assert_ne!(a, b);
        assert_eq!(a.direction(), Direction::Sink);
        assert_eq!(registry.lookup(EndpointType::Operator, Direction::Sink, 7), Some(a));
        assert_eq!(registry.lookup(EndpointType::Operator, Direction::Source, 7), None);
        assert!(registry.get(a).unwrap().core.is_real());

        assert!(registry.remove(a).is_some());
        assert_eq!(registry.lookup(EndpointType::Operator, Direction::Sink, 7), None);
        assert!(!registry.contains(a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    #[should_panic]
    fn duplicate_key() {
        let mut registry = Registry::new();
        let _ = registry.create(Direction::Sink, 7, EndpointFlags::empty(), operator_state(0));
        let _ = registry.create(Direction::Sink, 7, EndpointFlags::empty(), operator_state(0));
    }
}
