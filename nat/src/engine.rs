// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The NAT44 translation engine
//!
//! [`NatEngine`] owns the outside address pool, the static mappings, the sessions and the users,
//! and keeps them consistent with each other. Administrative operations and per-packet lookups
//! both go through it.
//!
//! The engine does no locking: every mutation takes `&mut self`, and callers sharing an engine
//! between the control plane and packet processing serialize accesses themselves.

use crate::NatDirection;
use crate::addresses::{AddressIndex, AddressPool, NatAddress};
use crate::config::NatConfig;
use crate::errors::NatError;
use crate::fib::FibResolver;
use crate::key::{FibIndex, MappingKey, TranslationKey, UserKey};
use crate::sessions::{Session, SessionId, SessionTable};
use crate::static_mapping::{MatchDirection, StaticMapping, StaticMappingId, StaticMappingTable};
use crate::users::{User, UserId, UserIndex};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracectl::{LevelFilter, trace_target};
use tracing::{debug, info, warn};

trace_target!("nat-engine", LevelFilter::INFO, &["nat"]);

/// Parameters of a static mapping to add or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticMappingRequest {
    pub local_addr: Ipv4Addr,
    pub local_port: u16,
    pub external_addr: Ipv4Addr,
    pub external_port: u16,
    pub addr_only: bool,
    /// VRF of the local address. `None` means the configured inside VRF.
    pub vrf_id: Option<u32>,
}

impl StaticMappingRequest {
    /// A 1:1 mapping between two addresses, for all ports.
    #[must_use]
    pub fn address_only(local_addr: Ipv4Addr, external_addr: Ipv4Addr) -> Self {
        Self {
            local_addr,
            local_port: 0,
            external_addr,
            external_port: 0,
            addr_only: true,
            vrf_id: None,
        }
    }

    /// A mapping between a local and an external (address, port) pair.
    #[must_use]
    pub fn with_ports(
        local_addr: Ipv4Addr,
        local_port: u16,
        external_addr: Ipv4Addr,
        external_port: u16,
    ) -> Self {
        Self {
            local_addr,
            local_port,
            external_addr,
            external_port,
            addr_only: false,
            vrf_id: None,
        }
    }

    #[must_use]
    pub fn vrf(mut self, vrf_id: u32) -> Self {
        self.vrf_id = Some(vrf_id);
        self
    }

    fn external_key(&self) -> MappingKey {
        if self.addr_only {
            MappingKey::address_only(self.external_addr)
        } else {
            MappingKey::new(self.external_addr, self.external_port)
        }
    }

    fn local_key(&self) -> MappingKey {
        if self.addr_only {
            MappingKey::address_only(self.local_addr)
        } else {
            MappingKey::new(self.local_addr, self.local_port)
        }
    }
}

/// Result of a lookup: the translated key, and the session tracking the flow if there is one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatTranslation {
    pub key: TranslationKey,
    pub session: Option<SessionId>,
}

impl NatTranslation {
    fn new(key: TranslationKey, session: Option<SessionId>) -> Self {
        Self { key, session }
    }
}

/// Object counts, as reported by `show snat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NatCounters {
    pub users: usize,
    pub addresses: usize,
    pub sessions: usize,
    pub static_mappings: usize,
    pub list_nodes: usize,
}

#[derive(Debug)]
pub struct NatEngine<R: FibResolver> {
    config: NatConfig,
    fib: R,
    inside_fib: Option<FibIndex>,
    outside_fib: Option<FibIndex>,
    addresses: AddressPool,
    static_mappings: StaticMappingTable,
    sessions: SessionTable,
    users: UserIndex,
}

impl<R: FibResolver> NatEngine<R> {
    #[must_use]
    pub fn new(config: NatConfig, fib: R) -> Self {
        let capacity = |buckets: u32| usize::try_from(buckets).unwrap_or(0);
        info!(
            "Creating NAT engine, {}",
            if config.static_mapping_only {
                "static mapping only"
            } else {
                "dynamic translations enabled"
            }
        );
        Self {
            addresses: AddressPool::new(config.random_seed),
            static_mappings: StaticMappingTable::with_capacity(capacity(
                config.static_mapping_buckets,
            )),
            sessions: SessionTable::with_capacity(capacity(config.translation_buckets)),
            users: UserIndex::with_capacity(capacity(config.user_buckets)),
            inside_fib: None,
            outside_fib: None,
            config,
            fib,
        }
    }

    #[must_use]
    pub fn config(&self) -> &NatConfig {
        &self.config
    }

    #[must_use]
    pub fn fib_resolver(&self) -> &R {
        &self.fib
    }

    fn resolve_fib(&self, vrf_id: u32) -> Result<FibIndex, NatError> {
        self.fib
            .fib_index(vrf_id)
            .and_then(|index| FibIndex::new_checked(index).ok())
            .ok_or(NatError::NoSuchFib(vrf_id))
    }

    fn inside_fib(&mut self) -> Result<FibIndex, NatError> {
        if let Some(fib) = self.inside_fib {
            return Ok(fib);
        }
        let fib = self.resolve_fib(self.config.inside_vrf_id)?;
        self.inside_fib = Some(fib);
        Ok(fib)
    }

    fn outside_fib(&mut self) -> Result<FibIndex, NatError> {
        if let Some(fib) = self.outside_fib {
            return Ok(fib);
        }
        let fib = self.resolve_fib(self.config.outside_vrf_id)?;
        self.outside_fib = Some(fib);
        Ok(fib)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Outside addresses
    ///////////////////////////////////////////////////////////////////////////

    /// Add one outside address to the pool.
    pub fn add_address(&mut self, addr: Ipv4Addr) -> AddressIndex {
        info!("Adding outside address {addr}");
        self.addresses.add_address(addr)
    }

    /// Add outside addresses from `first` to `last`, both included.
    ///
    /// # Errors
    ///
    /// Fails with [`NatError::FeatureDisabled`] in static-mapping-only mode, and with
    /// [`NatError::InvalidRange`] if `last` is lower than `first`.
    pub fn add_address_range(&mut self, first: Ipv4Addr, last: Ipv4Addr) -> Result<u32, NatError> {
        if self.config.static_mapping_only {
            warn!("Refusing to add addresses in static mapping only mode");
            return Err(NatError::FeatureDisabled);
        }
        let count = self.addresses.add_address_range(first, last)?;
        info!("Added {count} outside addresses {first} - {last}");
        Ok(count)
    }

    #[must_use]
    pub fn addresses(&self) -> &AddressPool {
        &self.addresses
    }

    ///////////////////////////////////////////////////////////////////////////
    // Static mappings
    ///////////////////////////////////////////////////////////////////////////

    /// Add a static mapping.
    ///
    /// # Errors
    ///
    /// - [`NatError::AlreadyExists`] if the external pair, or the local pair, is already mapped
    /// - [`NatError::NoSuchFib`] if the VRF of the mapping, or the outside VRF, does not resolve
    /// - [`NatError::NoSuchEntry`] if the mapping reserves a port on an address that is not in the
    ///   pool
    /// - [`NatError::PortInUse`] if that port is already busy
    pub fn add_static_mapping(
        &mut self,
        request: &StaticMappingRequest,
    ) -> Result<StaticMappingId, NatError> {
        let external = request.external_key();
        if self.static_mappings.lookup_external(&external).is_some() {
            return Err(NatError::AlreadyExists);
        }
        let (vrf_id, fib_index) = match request.vrf_id {
            Some(vrf_id) => (vrf_id, self.resolve_fib(vrf_id)?),
            None => (self.config.inside_vrf_id, self.inside_fib()?),
        };
        self.outside_fib()?;
        if self
            .static_mappings
            .lookup_local(&request.local_key())
            .is_some()
        {
            return Err(NatError::AlreadyExists);
        }

        let reserve = !request.addr_only && !self.config.static_mapping_only;
        if reserve {
            self.addresses
                .reserve_port(request.external_addr, request.external_port)?;
        }
        let mapping = StaticMapping {
            local_addr: request.local_addr,
            local_port: significant_port(request, request.local_port),
            external_addr: request.external_addr,
            external_port: significant_port(request, request.external_port),
            addr_only: request.addr_only,
            vrf_id,
            fib_index,
        };
        match self.static_mappings.insert(mapping) {
            Ok(id) => {
                info!(
                    "Added static mapping {}:{} <-> {}:{} vrf {vrf_id}",
                    request.local_addr,
                    request.local_port,
                    request.external_addr,
                    request.external_port
                );
                Ok(id)
            }
            Err(e) => {
                if reserve {
                    self.addresses
                        .release_reserved_port(request.external_addr, request.external_port)?;
                }
                Err(e)
            }
        }
    }

    /// Delete a static mapping, identified by its external side, along with the sessions created
    /// from it.
    ///
    /// # Errors
    ///
    /// Fails with [`NatError::NoSuchEntry`] if no mapping uses the external pair of the request.
    pub fn del_static_mapping(&mut self, request: &StaticMappingRequest) -> Result<(), NatError> {
        let (id, mapping) = self
            .static_mappings
            .lookup_external(&request.external_key())
            .map(|(id, m)| (id, m.clone()))
            .ok_or(NatError::NoSuchEntry)?;

        if !mapping.addr_only && !self.config.static_mapping_only {
            self.addresses
                .release_reserved_port(mapping.external_addr, mapping.external_port)?;
        }
        self.static_mappings.remove(id);

        if self.config.session_tracking() {
            self.remove_mapping_sessions(&mapping);
        }
        info!(
            "Deleted static mapping {}:{} <-> {}:{} vrf {}",
            mapping.local_addr,
            mapping.local_port,
            mapping.external_addr,
            mapping.external_port,
            mapping.vrf_id
        );
        Ok(())
    }

    // Remove the static sessions of the local user created from `mapping`: all of them for an
    // address-only mapping, at most one for a port mapping.
    fn remove_mapping_sessions(&mut self, mapping: &StaticMapping) {
        let user_key = UserKey::new(mapping.local_addr, mapping.fib_index);
        let Some(user_id) = self.users.find(&user_key) else {
            return;
        };
        if self
            .users
            .get(user_id)
            .is_none_or(|user| user.nstaticsessions() == 0)
        {
            return;
        }
        let victims: Vec<SessionId> = self
            .users
            .sessions(user_id)
            .filter(|id| {
                self.sessions.get(*id).is_some_and(|s| {
                    s.is_static()
                        && s.out2in().addr == mapping.external_addr
                        && (mapping.addr_only || s.out2in().port == mapping.external_port)
                })
            })
            .take(if mapping.addr_only { usize::MAX } else { 1 })
            .collect();
        for id in victims {
            if let Err(e) = self.remove_session(id) {
                warn!("Failed to remove session {id} of deleted static mapping: {e}");
            }
        }
    }

    #[must_use]
    pub fn static_mappings(&self) -> &StaticMappingTable {
        &self.static_mappings
    }

    /// Translate `key` through a static mapping, if one applies.
    #[must_use]
    pub fn match_static(
        &self,
        key: &TranslationKey,
        direction: MatchDirection,
    ) -> Option<TranslationKey> {
        // Resolved when the first mapping was added, so no mapping exists without it.
        let outside_fib = self.outside_fib?;
        self.static_mappings.match_key(key, direction, outside_fib)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Sessions
    ///////////////////////////////////////////////////////////////////////////

    /// Find the translation of an inside key, creating a session for a new flow.
    ///
    /// # Errors
    ///
    /// - [`NatError::FeatureDisabled`] if no static mapping applies in static-mapping-only mode
    /// - [`NatError::UserSessionLimitExceeded`] if the user already has the maximum number of
    ///   dynamic sessions
    /// - [`NatError::Exhausted`] if no outside port is left
    /// - [`NatError::NoSuchFib`] if the outside VRF does not resolve
    pub fn lookup_or_create(&mut self, key: &TranslationKey) -> Result<NatTranslation, NatError> {
        if let Some(outside) = self.match_static(key, MatchDirection::ByLocal) {
            if !self.config.session_tracking() {
                return Ok(NatTranslation::new(outside, None));
            }
            if let Some(id) = self.sessions.lookup_in2out(key) {
                if self
                    .sessions
                    .get(id)
                    .is_some_and(|s| s.is_static() && *s.out2in() == outside)
                {
                    return Ok(NatTranslation::new(outside, Some(id)));
                }
                // The flow predates the mapping now covering it
                debug!("Replacing session {id} of {key:?} with a static translation");
                self.remove_session(id)?;
            }
            if let Some(id) = self.sessions.lookup_out2in(&outside) {
                debug!("{outside:?} is held by session {id}, not tracking {key:?}");
                return Ok(NatTranslation::new(outside, None));
            }
            let id = self.create_session(*key, outside, None)?;
            return Ok(NatTranslation::new(outside, Some(id)));
        }

        if self.config.static_mapping_only {
            debug!("No static mapping for {key:?}");
            return Err(NatError::FeatureDisabled);
        }

        if let Some(id) = self.sessions.lookup_in2out(key) {
            let outside = self.session_out2in(id)?;
            return Ok(NatTranslation::new(outside, Some(id)));
        }

        if let Some(user) = self.users.find(&key.user_key()).and_then(|id| self.users.get(id))
            && user.nsessions() >= self.config.max_translations_per_user
        {
            debug!(
                "User {} has reached {} translations",
                key.addr, self.config.max_translations_per_user
            );
            return Err(NatError::UserSessionLimitExceeded(key.addr));
        }

        let outside_fib = self.outside_fib()?;
        let (address_index, outside) =
            self.allocate_outside(key, outside_fib).inspect_err(|_| {
                warn!("Out of outside ports, cannot translate {key:?}");
            })?;
        match self.create_session(*key, outside, Some(address_index)) {
            Ok(id) => {
                debug!("New dynamic session {id}: {key:?} -> {outside:?}");
                Ok(NatTranslation::new(outside, Some(id)))
            }
            Err(e) => {
                self.addresses.release_port(address_index, outside.port);
                Err(e)
            }
        }
    }

    // Allocate an outside key for `key` that no session uses yet. Static sessions of address-only
    // mappings hold ports they never reserved, those are skipped and freed again afterwards.
    fn allocate_outside(
        &mut self,
        key: &TranslationKey,
        outside_fib: FibIndex,
    ) -> Result<(AddressIndex, TranslationKey), NatError> {
        let mut skipped = Vec::new();
        let result = loop {
            let (address_index, port) = match self.addresses.allocate_port_for_flow() {
                Ok(allocated) => allocated,
                Err(e) => break Err(e),
            };
            let outside_addr = self.addresses.get(address_index).map(NatAddress::addr);
            let Some(outside_addr) = outside_addr else {
                skipped.push((address_index, port));
                break Err(NatError::NoSuchEntry);
            };
            let outside = TranslationKey {
                fib_index: outside_fib,
                ..key.with_addr_port(outside_addr, port)
            };
            if self.sessions.lookup_out2in(&outside).is_none() {
                break Ok((address_index, outside));
            }
            debug!("Skipping {outside:?}, held by a static session");
            skipped.push((address_index, port));
        };
        for (address_index, port) in skipped {
            self.addresses.release_port(address_index, port);
        }
        result
    }

    /// Find the translation of an outside key, through an existing session or a static mapping.
    ///
    /// Dynamic sessions come first: an address-only mapping may share its external address with
    /// the pool, and must not capture the ports handed out to dynamic flows.
    ///
    /// # Errors
    ///
    /// Fails with [`NatError::NoSuchEntry`] if neither exists.
    pub fn reverse_lookup(&self, key: &TranslationKey) -> Result<NatTranslation, NatError> {
        if let Some((id, session)) = self
            .sessions
            .lookup_out2in(key)
            .and_then(|id| self.sessions.get(id).map(|s| (id, s)))
            .filter(|(_, s)| !s.is_static())
        {
            return Ok(NatTranslation::new(*session.in2out(), Some(id)));
        }
        if let Some(inside) = self.match_static(key, MatchDirection::ByExternal) {
            let session = self
                .sessions
                .lookup_out2in(key)
                .filter(|id| self.sessions.get(*id).is_some_and(Session::is_static));
            return Ok(NatTranslation::new(inside, session));
        }
        let id = self
            .sessions
            .lookup_out2in(key)
            .ok_or(NatError::NoSuchEntry)?;
        let inside = self
            .sessions
            .get(id)
            .map(|s| *s.in2out())
            .ok_or(NatError::NoSuchEntry)?;
        Ok(NatTranslation::new(inside, Some(id)))
    }

    /// Translate a key for a packet flowing in the given direction.
    ///
    /// # Errors
    ///
    /// See [`NatEngine::lookup_or_create`] and [`NatEngine::reverse_lookup`].
    pub fn translate(
        &mut self,
        direction: NatDirection,
        key: &TranslationKey,
    ) -> Result<NatTranslation, NatError> {
        match direction {
            NatDirection::In2Out => self.lookup_or_create(key),
            NatDirection::Out2In => self.reverse_lookup(key),
        }
    }

    /// Account for one packet of `len` bytes on a session.
    ///
    /// # Errors
    ///
    /// Fails with [`NatError::NoSuchEntry`] if the session does not exist.
    pub fn touch(&mut self, id: SessionId, len: usize, now: Instant) -> Result<(), NatError> {
        self.sessions
            .get_mut(id)
            .ok_or(NatError::NoSuchEntry)?
            .touch(len, now);
        Ok(())
    }

    fn session_out2in(&self, id: SessionId) -> Result<TranslationKey, NatError> {
        self.sessions
            .get(id)
            .map(|s| *s.out2in())
            .ok_or(NatError::NoSuchEntry)
    }

    fn create_session(
        &mut self,
        in2out: TranslationKey,
        out2in: TranslationKey,
        address_index: Option<AddressIndex>,
    ) -> Result<SessionId, NatError> {
        let user_id = self.users.find_or_create(in2out.user_key());
        let session = Session::new(in2out, out2in, user_id, address_index, Instant::now());
        let is_static = session.is_static();
        let id = match self.sessions.insert(session) {
            Ok(id) => id,
            Err(e) => {
                if self
                    .users
                    .get(user_id)
                    .is_some_and(|user| !user.has_sessions())
                {
                    self.users.remove(user_id);
                }
                return Err(e);
            }
        };
        let node = self
            .users
            .link_session(user_id, id, is_static)
            .ok_or(NatError::NoSuchEntry)?;
        if let Some(session) = self.sessions.get_mut(id) {
            session.set_list_node(node);
        }
        Ok(id)
    }

    /// Remove a session from every index, release its outside port and drop its user if it was
    /// the last session of that user.
    ///
    /// # Errors
    ///
    /// Fails with [`NatError::NoSuchEntry`] if the session does not exist.
    pub fn remove_session(&mut self, id: SessionId) -> Result<(), NatError> {
        let session = self.sessions.remove(id).ok_or(NatError::NoSuchEntry)?;
        if let Some(index) = session.address_index() {
            self.addresses.release_port(index, session.out2in().port);
        }
        if let Some(node) = session.list_node() {
            self.users
                .unlink_session(session.user(), node, session.is_static());
        }
        debug!("Removed session {id}");
        Ok(())
    }

    /// Remove every session idle for at least `timeout`. Returns the number of sessions removed.
    pub fn expire_idle(&mut self, now: Instant, timeout: Duration) -> usize {
        let idle: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_idle(now, timeout))
            .map(|(id, _)| id)
            .collect();
        for id in &idle {
            if let Err(e) = self.remove_session(*id) {
                warn!("Failed to expire session {id}: {e}");
            }
        }
        if !idle.is_empty() {
            debug!("Expired {} idle sessions", idle.len());
        }
        idle.len()
    }

    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    ///////////////////////////////////////////////////////////////////////////
    // Users
    ///////////////////////////////////////////////////////////////////////////

    #[must_use]
    pub fn user(&self, addr: Ipv4Addr, fib_index: FibIndex) -> Option<(UserId, &User)> {
        let id = self.users.find(&UserKey::new(addr, fib_index))?;
        self.users.get(id).map(|user| (id, user))
    }

    #[must_use]
    pub fn users(&self) -> &UserIndex {
        &self.users
    }

    /// Sessions of a user, in creation order.
    pub fn user_sessions(&self, id: UserId) -> impl Iterator<Item = (SessionId, &Session)> {
        self.users
            .sessions(id)
            .filter_map(|sid| self.sessions.get(sid).map(|s| (sid, s)))
    }

    #[must_use]
    pub fn counters(&self) -> NatCounters {
        NatCounters {
            users: self.users.len(),
            addresses: self.addresses.len(),
            sessions: self.sessions.len(),
            static_mappings: self.static_mappings.len(),
            list_nodes: self.users.list_nodes(),
        }
    }

    /// Whether all indices agree with each other. Only meant for tests and debug assertions.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let linked: usize = self
            .users
            .iter()
            .map(|(uid, _)| self.users.sessions(uid).count())
            .sum();
        self.static_mappings.is_consistent()
            && self.sessions.is_consistent()
            && self.users.is_consistent()
            && linked == self.sessions.len()
            && self
                .sessions
                .iter()
                .all(|(id, s)| self.users.sessions(s.user()).any(|sid| sid == id))
    }
}

// Ports of address-only mappings are not significant and stored as zero.
fn significant_port(request: &StaticMappingRequest, port: u16) -> u16 {
    if request.addr_only { 0 } else { port }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::PRIVILEGED_PORT_MAX;
    use crate::config::NatConfigBuilder;
    use crate::fib::FibTable;
    use crate::key::NatProtocol;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;
    use tracing_test::traced_test;

    fn addr_v4(ip: &str) -> Ipv4Addr {
        Ipv4Addr::from_str(ip).unwrap()
    }

    fn fib(index: u32) -> FibIndex {
        FibIndex::new_checked(index).unwrap()
    }

    fn tcp(ip: &str, port: u16, fib_index: u32) -> TranslationKey {
        TranslationKey::new(addr_v4(ip), port, NatProtocol::Tcp, fib(fib_index))
    }

    fn udp(ip: &str, port: u16, fib_index: u32) -> TranslationKey {
        TranslationKey::new(addr_v4(ip), port, NatProtocol::Udp, fib(fib_index))
    }

    fn vrfs() -> FibTable {
        let mut table = FibTable::identity([0, 10]);
        table.add_vrf(20, 2);
        table
    }

    fn engine_with(builder: &mut NatConfigBuilder) -> NatEngine<FibTable> {
        NatEngine::new(builder.random_seed(1234).build().unwrap(), vrfs())
    }

    fn engine() -> NatEngine<FibTable> {
        engine_with(&mut NatConfig::builder())
    }

    #[test]
    #[traced_test]
    fn test_static_port_mapping_scenario() {
        let mut nat = engine();
        nat.add_address(addr_v4("4.4.4.4"));
        let request = StaticMappingRequest::with_ports(
            addr_v4("10.0.0.3"),
            6303,
            addr_v4("4.4.4.4"),
            3606,
        );
        nat.add_static_mapping(&request).unwrap();
        assert!(nat.addresses().get(0).unwrap().is_port_busy(3606));
        assert_eq!(nat.addresses().get(0).unwrap().busy_count(), 1);

        assert_eq!(
            nat.match_static(&tcp("10.0.0.3", 6303, 0), MatchDirection::ByLocal),
            Some(tcp("4.4.4.4", 3606, 0))
        );
        assert_eq!(
            nat.match_static(&tcp("4.4.4.4", 3606, 0), MatchDirection::ByExternal),
            Some(tcp("10.0.0.3", 6303, 0))
        );

        // Static hit in dynamic mode creates a static session
        let out = nat.lookup_or_create(&tcp("10.0.0.3", 6303, 0)).unwrap();
        assert_eq!(out.key, tcp("4.4.4.4", 3606, 0));
        let session = nat.session(out.session.unwrap()).unwrap();
        assert!(session.is_static());
        let (_, user) = nat.user(addr_v4("10.0.0.3"), fib(0)).unwrap();
        assert_eq!((user.nsessions(), user.nstaticsessions()), (0, 1));
        assert!(nat.is_consistent());

        nat.del_static_mapping(&request).unwrap();
        assert!(nat.static_mappings().is_empty());
        assert!(nat.sessions().is_empty());
        assert!(nat.user(addr_v4("10.0.0.3"), fib(0)).is_none());
        let address = nat.addresses().get(0).unwrap();
        assert!(!address.is_port_busy(3606));
        assert_eq!(address.busy_count(), 0);
        assert!(nat.is_consistent());
        assert!(logs_contain("Deleted static mapping"));
    }

    #[test]
    fn test_static_mapping_errors() {
        let mut nat = engine();
        nat.add_address(addr_v4("4.4.4.4"));
        let request =
            StaticMappingRequest::with_ports(addr_v4("10.0.0.3"), 80, addr_v4("4.4.4.4"), 8080);

        // External address not in the pool
        assert_eq!(
            nat.add_static_mapping(&StaticMappingRequest::with_ports(
                addr_v4("10.0.0.3"),
                80,
                addr_v4("5.5.5.5"),
                8080
            )),
            Err(NatError::NoSuchEntry)
        );
        // Unknown VRF
        assert_eq!(
            nat.add_static_mapping(&request.vrf(99)),
            Err(NatError::NoSuchFib(99))
        );

        nat.add_static_mapping(&request).unwrap();
        assert_eq!(
            nat.add_static_mapping(&request),
            Err(NatError::AlreadyExists)
        );
        // Same local pair, other external port
        assert_eq!(
            nat.add_static_mapping(&StaticMappingRequest::with_ports(
                addr_v4("10.0.0.3"),
                80,
                addr_v4("4.4.4.4"),
                8081
            )),
            Err(NatError::AlreadyExists)
        );
        assert!(!nat.addresses().get(0).unwrap().is_port_busy(8081));

        // Unknown external pair
        nat.add_address(addr_v4("4.4.4.5"));
        assert_eq!(
            nat.del_static_mapping(&StaticMappingRequest::with_ports(
                addr_v4("10.0.0.3"),
                80,
                addr_v4("4.4.4.5"),
                8080
            )),
            Err(NatError::NoSuchEntry)
        );
        assert_eq!(nat.static_mappings().len(), 1);
        assert!(nat.is_consistent());
    }

    #[test]
    fn test_port_in_use() {
        let mut nat = engine();
        nat.add_address(addr_v4("4.4.4.4"));
        // A dynamic flow holds the port
        let out = nat.lookup_or_create(&udp("10.0.0.1", 5000, 0)).unwrap();
        assert_eq!(
            nat.add_static_mapping(&StaticMappingRequest::with_ports(
                addr_v4("10.0.0.9"),
                53,
                addr_v4("4.4.4.4"),
                out.key.port
            )),
            Err(NatError::PortInUse(out.key.port))
        );
    }

    #[test]
    fn test_static_mapping_vrf() {
        let mut nat = engine();
        nat.add_address(addr_v4("4.4.4.4"));
        let request =
            StaticMappingRequest::with_ports(addr_v4("10.0.0.3"), 80, addr_v4("4.4.4.4"), 8080)
                .vrf(20);
        let id = nat.add_static_mapping(&request).unwrap();
        let mapping = nat.static_mappings().get(id).unwrap();
        assert_eq!(mapping.vrf_id(), 20);
        assert_eq!(mapping.fib_index(), fib(2));

        assert_eq!(
            nat.match_static(&tcp("4.4.4.4", 8080, 0), MatchDirection::ByExternal),
            Some(tcp("10.0.0.3", 80, 2))
        );
        assert_eq!(
            nat.match_static(&tcp("10.0.0.3", 80, 2), MatchDirection::ByLocal),
            Some(tcp("4.4.4.4", 8080, 0))
        );
    }

    #[test]
    fn test_no_such_fib_for_outside_vrf() {
        let mut nat = engine_with(NatConfig::builder().outside_vrf_id(42));
        nat.add_address(addr_v4("4.4.4.4"));
        assert_eq!(
            nat.add_static_mapping(&StaticMappingRequest::address_only(
                addr_v4("10.0.0.3"),
                addr_v4("4.4.4.4")
            )),
            Err(NatError::NoSuchFib(42))
        );
        assert_eq!(
            nat.lookup_or_create(&udp("10.0.0.1", 1000, 0)),
            Err(NatError::NoSuchFib(42))
        );
        assert_eq!(nat.addresses().get(0).unwrap().busy_count(), 0);
    }

    #[test]
    fn test_address_only_removal_cascade() {
        let mut nat = engine();
        let request = StaticMappingRequest::address_only(addr_v4("10.0.0.5"), addr_v4("4.4.4.5"));
        nat.add_static_mapping(&request).unwrap();
        // No reservation needed: the external address is not in the pool
        assert!(nat.addresses().is_empty());

        for port in [1000, 2000, 3000] {
            let out = nat.lookup_or_create(&tcp("10.0.0.5", port, 0)).unwrap();
            assert_eq!(out.key, tcp("4.4.4.5", port, 0));
        }
        let (_, user) = nat.user(addr_v4("10.0.0.5"), fib(0)).unwrap();
        assert_eq!(user.nstaticsessions(), 3);

        nat.del_static_mapping(&request).unwrap();
        assert!(nat.sessions().is_empty());
        assert!(nat.users().is_empty());
        assert_eq!(nat.counters().list_nodes, 0);
        assert!(nat.is_consistent());
    }

    #[test]
    fn test_port_removal_removes_one_session() {
        let mut nat = engine();
        nat.add_address(addr_v4("4.4.4.4"));
        nat.add_address(addr_v4("4.4.4.5"));
        let by_port =
            StaticMappingRequest::with_ports(addr_v4("10.0.0.5"), 80, addr_v4("4.4.4.4"), 8080);
        nat.add_static_mapping(&by_port).unwrap();
        let by_port2 =
            StaticMappingRequest::with_ports(addr_v4("10.0.0.5"), 443, addr_v4("4.4.4.4"), 8443);
        nat.add_static_mapping(&by_port2).unwrap();

        nat.lookup_or_create(&tcp("10.0.0.5", 80, 0)).unwrap();
        nat.lookup_or_create(&tcp("10.0.0.5", 443, 0)).unwrap();
        nat.lookup_or_create(&udp("10.0.0.5", 80, 0)).unwrap();
        let dynamic = nat.lookup_or_create(&tcp("10.0.0.5", 5555, 0)).unwrap();
        let (_, user) = nat.user(addr_v4("10.0.0.5"), fib(0)).unwrap();
        assert_eq!((user.nsessions(), user.nstaticsessions()), (1, 3));

        // Two sessions (TCP and UDP) match 4.4.4.4:8080, only one goes
        nat.del_static_mapping(&by_port).unwrap();
        let (uid, user) = nat.user(addr_v4("10.0.0.5"), fib(0)).unwrap();
        assert_eq!((user.nsessions(), user.nstaticsessions()), (1, 2));
        assert_eq!(nat.user_sessions(uid).count(), 3);
        assert!(nat.session(dynamic.session.unwrap()).is_some());
        assert!(nat.is_consistent());
    }

    #[test]
    fn test_static_mapping_replaces_dynamic_session() {
        let mut nat = engine();
        nat.add_address(addr_v4("4.4.4.4"));
        let inside = tcp("10.0.0.5", 80, 0);
        let dynamic = nat.lookup_or_create(&inside).unwrap();
        let dynamic_port = dynamic.key.port;

        let request =
            StaticMappingRequest::with_ports(addr_v4("10.0.0.5"), 80, addr_v4("4.4.4.4"), 80);
        nat.add_static_mapping(&request).unwrap();

        let out = nat.lookup_or_create(&inside).unwrap();
        assert_eq!(out.key, tcp("4.4.4.4", 80, 0));
        let session = nat.session(out.session.unwrap()).unwrap();
        assert!(session.is_static());
        assert_eq!(*session.out2in(), out.key);
        assert_eq!(nat.sessions().len(), 1);
        assert_eq!(nat.reverse_lookup(&dynamic.key), Err(NatError::NoSuchEntry));

        // The dynamic port went back to the pool, only the reservation is left
        let address = nat.addresses().get(0).unwrap();
        assert!(!address.is_port_busy(dynamic_port));
        assert!(address.is_port_busy(80));
        assert_eq!(address.busy_count(), 0);
        let (_, user) = nat.user(addr_v4("10.0.0.5"), fib(0)).unwrap();
        assert_eq!((user.nsessions(), user.nstaticsessions()), (0, 1));

        // Packets are accounted on the static session
        nat.touch(out.session.unwrap(), 100, Instant::now()).unwrap();
        assert_eq!(nat.lookup_or_create(&inside).unwrap(), out);
        assert_eq!(nat.session(out.session.unwrap()).unwrap().total_pkts(), 1);
        assert_eq!(nat.reverse_lookup(&out.key).unwrap().key, inside);
        assert!(nat.is_consistent());
    }

    #[test]
    fn test_address_only_mapping_on_pool_address() {
        let mut nat = engine();
        nat.add_address(addr_v4("4.4.4.4"));
        let inside = udp("10.0.0.1", 5000, 0);
        let early = nat.lookup_or_create(&inside).unwrap();

        let request = StaticMappingRequest::address_only(addr_v4("10.0.0.9"), addr_v4("4.4.4.4"));
        nat.add_static_mapping(&request).unwrap();

        // Dynamic flows on the shared address still translate back to their own host
        assert_eq!(nat.reverse_lookup(&early.key).unwrap().key, inside);
        let other = udp("10.0.0.2", 6000, 0);
        let out = nat.lookup_or_create(&other).unwrap();
        assert_eq!(out.key.addr, addr_v4("4.4.4.4"));
        let back = nat.reverse_lookup(&out.key).unwrap();
        assert_eq!(back, NatTranslation::new(other, out.session));

        // Other ports of the address go to the mapped host
        assert_eq!(
            nat.reverse_lookup(&udp("4.4.4.4", 53, 0)).unwrap().key,
            udp("10.0.0.9", 53, 0)
        );

        // A static flow whose outside key a dynamic session holds is translated untracked
        let clash = udp("10.0.0.9", early.key.port, 0);
        assert_eq!(
            nat.lookup_or_create(&clash).unwrap(),
            NatTranslation::new(early.key, None)
        );
        assert_eq!(nat.reverse_lookup(&early.key).unwrap().key, inside);
        assert!(nat.is_consistent());
    }

    #[test]
    fn test_dynamic_allocation_skips_static_sessions() {
        let mut nat = engine();
        let address = addr_v4("4.4.4.4");
        nat.add_address(address);
        let request = StaticMappingRequest::address_only(addr_v4("10.0.0.9"), address);
        nat.add_static_mapping(&request).unwrap();
        let fixed = nat.lookup_or_create(&tcp("10.0.0.9", 40000, 0)).unwrap();
        assert_eq!(fixed.key, tcp("4.4.4.4", 40000, 0));

        for port in (PRIVILEGED_PORT_MAX + 1..=u16::MAX).filter(|p| *p != 40000 && *p != 40001) {
            nat.addresses.reserve_port(address, port).unwrap();
        }
        let out = nat.lookup_or_create(&tcp("10.0.0.1", 5000, 0)).unwrap();
        assert_eq!(out.key, tcp("4.4.4.4", 40001, 0));
        assert!(!nat.addresses().get(0).unwrap().is_port_busy(40000));

        // The only free port is held by the static session
        assert_eq!(
            nat.lookup_or_create(&tcp("10.0.0.2", 5000, 0)),
            Err(NatError::Exhausted)
        );
        assert!(!nat.addresses().get(0).unwrap().is_port_busy(40000));
        assert_eq!(
            nat.reverse_lookup(&fixed.key).unwrap(),
            NatTranslation::new(tcp("10.0.0.9", 40000, 0), fixed.session)
        );
        assert!(nat.is_consistent());
    }

    #[test]
    fn test_dynamic_round_trip() {
        let mut nat = engine();
        nat.add_address_range(addr_v4("4.4.4.1"), addr_v4("4.4.4.2"))
            .unwrap();
        let inside = udp("10.0.0.1", 4000, 0);
        let out = nat.lookup_or_create(&inside).unwrap();
        assert_eq!(out.key.addr, addr_v4("4.4.4.1"));
        assert!(out.key.port > PRIVILEGED_PORT_MAX);
        assert_eq!(out.key.protocol, NatProtocol::Udp);

        // Same flow, same session
        assert_eq!(nat.lookup_or_create(&inside).unwrap(), out);

        let back = nat.reverse_lookup(&out.key).unwrap();
        assert_eq!(back.key, inside);
        assert_eq!(back.session, out.session);
        assert_eq!(
            nat.translate(NatDirection::Out2In, &out.key).unwrap().key,
            inside
        );
        assert_eq!(
            nat.reverse_lookup(&udp("4.4.4.1", 1, 0)),
            Err(NatError::NoSuchEntry)
        );
    }

    #[test]
    fn test_round_trip_property() {
        bolero::check!()
            .with_type::<Vec<(u8, u16, bool)>>()
            .for_each(|flows| {
                let mut nat = engine_with(NatConfig::builder().max_translations_per_user(1000));
                nat.add_address(addr_v4("4.4.4.4"));
                for &(host, port, tcp_flow) in flows {
                    let protocol = if tcp_flow { NatProtocol::Tcp } else { NatProtocol::Udp };
                    let inside = TranslationKey::new(
                        Ipv4Addr::new(10, 0, 0, host),
                        port,
                        protocol,
                        fib(0),
                    );
                    let out = nat.lookup_or_create(&inside).unwrap();
                    assert!(out.key.port > PRIVILEGED_PORT_MAX);
                    assert_eq!(nat.reverse_lookup(&out.key).unwrap().key, inside);
                }
                assert!(nat.is_consistent());
            });
    }

    #[test]
    fn test_user_session_limit() {
        let mut nat = engine_with(NatConfig::builder().max_translations_per_user(2));
        nat.add_address(addr_v4("4.4.4.4"));
        nat.lookup_or_create(&udp("10.0.0.1", 1, 0)).unwrap();
        nat.lookup_or_create(&udp("10.0.0.1", 2, 0)).unwrap();
        assert_eq!(
            nat.lookup_or_create(&udp("10.0.0.1", 3, 0)),
            Err(NatError::UserSessionLimitExceeded(addr_v4("10.0.0.1")))
        );
        // Existing flows still translate, other users are not affected
        assert!(nat.lookup_or_create(&udp("10.0.0.1", 2, 0)).is_ok());
        assert!(nat.lookup_or_create(&udp("10.0.0.2", 3, 0)).is_ok());
        // Same address in another FIB is another user
        assert!(nat.lookup_or_create(&udp("10.0.0.1", 3, 10)).is_ok());
        assert_eq!(nat.counters().users, 3);
    }

    #[test]
    fn test_exhaustion() {
        let mut nat = engine();
        assert_eq!(
            nat.lookup_or_create(&udp("10.0.0.1", 1, 0)),
            Err(NatError::Exhausted)
        );
        assert!(nat.users().is_empty());
    }

    #[test]
    fn test_remove_session_releases_everything() {
        let mut nat = engine();
        nat.add_address(addr_v4("4.4.4.4"));
        let out = nat.lookup_or_create(&udp("10.0.0.1", 1, 0)).unwrap();
        let id = out.session.unwrap();
        nat.remove_session(id).unwrap();
        assert_eq!(nat.remove_session(id), Err(NatError::NoSuchEntry));
        assert_eq!(
            nat.counters(),
            NatCounters {
                addresses: 1,
                ..NatCounters::default()
            }
        );
        let address = nat.addresses().get(0).unwrap();
        assert!(!address.is_port_busy(out.key.port));
        assert_eq!(address.busy_count(), 0);
        assert_eq!(nat.reverse_lookup(&out.key), Err(NatError::NoSuchEntry));
    }

    #[test]
    fn test_touch_and_expire() {
        let mut nat = engine();
        nat.add_address(addr_v4("4.4.4.4"));
        let a = nat.lookup_or_create(&udp("10.0.0.1", 1, 0)).unwrap();
        let b = nat.lookup_or_create(&udp("10.0.0.1", 2, 0)).unwrap();
        let timeout = Duration::from_secs(300);
        let later = Instant::now() + Duration::from_secs(200);

        nat.touch(b.session.unwrap(), 1500, later).unwrap();
        let session = nat.session(b.session.unwrap()).unwrap();
        assert_eq!((session.total_pkts(), session.total_bytes()), (1, 1500));

        assert_eq!(nat.expire_idle(later + Duration::from_secs(150), timeout), 1);
        assert!(nat.session(a.session.unwrap()).is_none());
        assert!(nat.session(b.session.unwrap()).is_some());
        assert_eq!(nat.expire_idle(later + timeout, timeout), 1);
        assert!(nat.sessions().is_empty());
        assert!(nat.users().is_empty());
        assert_eq!(
            nat.touch(b.session.unwrap(), 10, later),
            Err(NatError::NoSuchEntry)
        );
    }

    #[test]
    fn test_static_mapping_only_mode() {
        let mut nat = engine_with(NatConfig::builder().static_mapping_only(true));
        assert_eq!(
            nat.add_address_range(addr_v4("4.4.4.1"), addr_v4("4.4.4.2")),
            Err(NatError::FeatureDisabled)
        );
        // No reservation in this mode, the external address need not be in the pool
        let request =
            StaticMappingRequest::with_ports(addr_v4("10.0.0.3"), 6303, addr_v4("4.4.4.4"), 3606);
        nat.add_static_mapping(&request).unwrap();

        let out = nat.lookup_or_create(&tcp("10.0.0.3", 6303, 0)).unwrap();
        assert_eq!(out, NatTranslation::new(tcp("4.4.4.4", 3606, 0), None));
        assert!(nat.sessions().is_empty());
        assert_eq!(
            nat.lookup_or_create(&tcp("10.0.0.3", 6304, 0)),
            Err(NatError::FeatureDisabled)
        );
        assert_eq!(
            nat.reverse_lookup(&tcp("4.4.4.4", 3606, 0)).unwrap().key,
            tcp("10.0.0.3", 6303, 0)
        );
        nat.del_static_mapping(&request).unwrap();
        assert!(nat.static_mappings().is_empty());
    }

    #[test]
    fn test_connection_tracking() {
        let mut nat = engine_with(
            NatConfig::builder()
                .static_mapping_only(true)
                .static_mapping_connection_tracking(true),
        );
        let request = StaticMappingRequest::address_only(addr_v4("10.0.0.3"), addr_v4("4.4.4.3"));
        nat.add_static_mapping(&request).unwrap();

        let out = nat.lookup_or_create(&tcp("10.0.0.3", 22, 0)).unwrap();
        let id = out.session.unwrap();
        assert_eq!(nat.lookup_or_create(&tcp("10.0.0.3", 22, 0)).unwrap(), out);
        let back = nat.reverse_lookup(&tcp("4.4.4.3", 22, 0)).unwrap();
        assert_eq!(back, NatTranslation::new(tcp("10.0.0.3", 22, 0), Some(id)));
        assert_eq!(nat.counters().sessions, 1);

        nat.del_static_mapping(&request).unwrap();
        assert!(nat.sessions().is_empty());
        assert!(nat.users().is_empty());
    }

    #[test]
    fn test_consistency_under_random_operations() {
        #[derive(Debug, Clone, Copy, bolero::TypeGenerator)]
        enum Op {
            Flow(u8, u16),
            AddMapping(u8, u8, bool),
            DelMapping(u8, u8, bool),
            Remove(u8),
            Expire(u8),
        }

        bolero::check!().with_type::<Vec<Op>>().for_each(|ops| {
            let mut nat = engine_with(NatConfig::builder().max_translations_per_user(4));
            nat.add_address_range(addr_v4("4.4.4.0"), addr_v4("4.4.4.3"))
                .unwrap();
            let start = Instant::now();
            let request = |host: u8, ext: u8, addr_only: bool| {
                if addr_only {
                    StaticMappingRequest::address_only(
                        Ipv4Addr::new(10, 0, 0, host % 8),
                        Ipv4Addr::new(4, 4, 4, ext % 4),
                    )
                } else {
                    StaticMappingRequest::with_ports(
                        Ipv4Addr::new(10, 0, 0, host % 8),
                        80,
                        Ipv4Addr::new(4, 4, 4, ext % 4),
                        8000 + u16::from(ext % 4),
                    )
                }
            };
            for op in ops {
                match *op {
                    Op::Flow(host, port) => {
                        let key = tcp_key(host % 8, port % 128);
                        if let Ok(out) = nat.lookup_or_create(&key)
                            && let Some(id) = out.session
                        {
                            assert_eq!(*nat.session(id).unwrap().out2in(), out.key);
                            assert_eq!(nat.reverse_lookup(&out.key).unwrap().key, key);
                        }
                    }
                    Op::AddMapping(host, ext, addr_only) => {
                        let _ = nat.add_static_mapping(&request(host, ext, addr_only));
                    }
                    Op::DelMapping(host, ext, addr_only) => {
                        let _ = nat.del_static_mapping(&request(host, ext, addr_only));
                    }
                    Op::Remove(n) => {
                        let ids: Vec<_> = nat.sessions().iter().map(|(id, _)| id).collect();
                        if !ids.is_empty() {
                            nat.remove_session(ids[usize::from(n) % ids.len()]).unwrap();
                        }
                    }
                    Op::Expire(secs) => {
                        nat.expire_idle(
                            start + Duration::from_secs(u64::from(secs)),
                            Duration::from_secs(60),
                        );
                    }
                }
                assert!(nat.is_consistent());
                let busy: u32 = nat.addresses().iter().map(NatAddress::busy_count).sum();
                let dynamic = nat
                    .sessions()
                    .iter()
                    .filter(|(_, s)| !s.is_static())
                    .count();
                let reserved = nat
                    .static_mappings()
                    .iter()
                    .filter(|(_, m)| !m.is_addr_only())
                    .count();
                assert_eq!(usize::try_from(busy).unwrap(), dynamic + reserved);
            }
        });

        fn tcp_key(host: u8, port: u16) -> TranslationKey {
            TranslationKey::new(Ipv4Addr::new(10, 0, 0, host), port, NatProtocol::Tcp, fib(0))
        }
    }
}
