// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Static mappings
//!
//! A static mapping binds a local (inside) address, and optionally a port, to an external
//! (outside) one. Mappings are stored in a pool and indexed twice, by local key and by external
//! key. Both indices are always updated together.

use crate::errors::NatError;
use crate::key::{FibIndex, MappingKey, TranslationKey};
use crate::pool::{Handle, Pool};
use ahash::RandomState;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracectl::{LevelFilter, trace_target};
use tracing::debug;

trace_target!("nat-static", LevelFilter::INFO, &["nat"]);

/// Handle of a [`StaticMapping`].
pub type StaticMappingId = Handle<StaticMapping>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticMapping {
    pub(crate) local_addr: Ipv4Addr,
    pub(crate) local_port: u16,
    pub(crate) external_addr: Ipv4Addr,
    pub(crate) external_port: u16,
    pub(crate) addr_only: bool,
    pub(crate) vrf_id: u32,
    pub(crate) fib_index: FibIndex,
}

impl StaticMapping {
    #[must_use]
    pub fn local_addr(&self) -> Ipv4Addr {
        self.local_addr
    }
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }
    #[must_use]
    pub fn external_addr(&self) -> Ipv4Addr {
        self.external_addr
    }
    #[must_use]
    pub fn external_port(&self) -> u16 {
        self.external_port
    }
    #[must_use]
    pub fn is_addr_only(&self) -> bool {
        self.addr_only
    }
    #[must_use]
    pub fn vrf_id(&self) -> u32 {
        self.vrf_id
    }
    /// FIB of the inside (local) side of the mapping.
    #[must_use]
    pub fn fib_index(&self) -> FibIndex {
        self.fib_index
    }

    #[must_use]
    pub fn local_key(&self) -> MappingKey {
        MappingKey::new(self.local_addr, self.local_port)
    }

    #[must_use]
    pub fn external_key(&self) -> MappingKey {
        MappingKey::new(self.external_addr, self.external_port)
    }
}

/// Side of a static mapping a key is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchDirection {
    /// The key is an inside key, matched against local addresses.
    ByLocal,
    /// The key is an outside key, matched against external addresses.
    ByExternal,
}

#[derive(Debug)]
pub struct StaticMappingTable {
    mappings: Pool<StaticMapping>,
    by_local: HashMap<MappingKey, StaticMappingId, RandomState>,
    by_external: HashMap<MappingKey, StaticMappingId, RandomState>,
}

impl StaticMappingTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            mappings: Pool::with_capacity(capacity),
            by_local: HashMap::with_capacity_and_hasher(
                capacity,
                RandomState::with_seeds(0, 0, 0, 0),
            ),
            by_external: HashMap::with_capacity_and_hasher(
                capacity,
                RandomState::with_seeds(0, 0, 0, 0),
            ),
        }
    }

    /// Insert a mapping in the pool and in both indices.
    ///
    /// # Errors
    ///
    /// Returns [`NatError::AlreadyExists`] if either key is already indexed. The table is left
    /// unchanged in that case.
    pub(crate) fn insert(&mut self, mapping: StaticMapping) -> Result<StaticMappingId, NatError> {
        let (local, external) = (mapping.local_key(), mapping.external_key());
        if self.by_local.contains_key(&local) || self.by_external.contains_key(&external) {
            return Err(NatError::AlreadyExists);
        }
        let id = self.mappings.insert(mapping);
        self.by_local.insert(local, id);
        self.by_external.insert(external, id);
        debug!("Inserted static mapping {id}: {local:?} <-> {external:?}");
        Ok(id)
    }

    /// Remove a mapping from both indices and from the pool.
    pub(crate) fn remove(&mut self, id: StaticMappingId) -> Option<StaticMapping> {
        let mapping = self.mappings.remove(id)?;
        self.by_local.remove(&mapping.local_key());
        self.by_external.remove(&mapping.external_key());
        debug!("Removed static mapping {id}");
        Some(mapping)
    }

    #[must_use]
    pub fn get(&self, id: StaticMappingId) -> Option<&StaticMapping> {
        self.mappings.get(id)
    }

    #[must_use]
    pub fn lookup_local(&self, key: &MappingKey) -> Option<(StaticMappingId, &StaticMapping)> {
        let id = *self.by_local.get(key)?;
        self.mappings.get(id).map(|m| (id, m))
    }

    #[must_use]
    pub fn lookup_external(&self, key: &MappingKey) -> Option<(StaticMappingId, &StaticMapping)> {
        let id = *self.by_external.get(key)?;
        self.mappings.get(id).map(|m| (id, m))
    }

    /// Find the mapping applying to `key`: exact (address, port) match first, then an
    /// address-only mapping.
    #[must_use]
    pub fn find(&self, key: &TranslationKey, direction: MatchDirection) -> Option<&StaticMapping> {
        let lookup = |key: &MappingKey| match direction {
            MatchDirection::ByLocal => self.lookup_local(key),
            MatchDirection::ByExternal => self.lookup_external(key),
        };
        lookup(&key.mapping_key())
            .or_else(|| lookup(&MappingKey::address_only(key.addr)))
            .map(|(_, mapping)| mapping)
    }

    /// Translate `key` through the static mapping that applies to it, if any.
    ///
    /// Address-only mappings keep the port of `key`. A local match is translated into the outside
    /// FIB `outside_fib`, an external match into the FIB of the mapping.
    #[must_use]
    pub fn match_key(
        &self,
        key: &TranslationKey,
        direction: MatchDirection,
        outside_fib: FibIndex,
    ) -> Option<TranslationKey> {
        let mapping = self.find(key, direction)?;
        let (addr, port, fib_index) = match direction {
            MatchDirection::ByLocal => (mapping.external_addr, mapping.external_port, outside_fib),
            MatchDirection::ByExternal => {
                (mapping.local_addr, mapping.local_port, mapping.fib_index)
            }
        };
        let port = if mapping.addr_only { key.port } else { port };
        Some(TranslationKey {
            fib_index,
            ..key.with_addr_port(addr, port)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (StaticMappingId, &StaticMapping)> {
        self.mappings.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Whether the indices and the pool agree. Only meant for tests and debug assertions.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.by_local.len() == self.mappings.len()
            && self.by_external.len() == self.mappings.len()
            && self.mappings.iter().all(|(id, m)| {
                self.by_local.get(&m.local_key()) == Some(&id)
                    && self.by_external.get(&m.external_key()) == Some(&id)
            })
    }
}
