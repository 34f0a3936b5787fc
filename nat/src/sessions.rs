// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Translation sessions
//!
//! A session records one translated flow. It is indexed both by its inside key (`in2out`) and by
//! its outside key (`out2in`), so that packets in either direction find it in O(1).

use crate::addresses::AddressIndex;
use crate::dlist::NodeId;
use crate::errors::NatError;
use crate::key::TranslationKey;
use crate::pool::{Handle, Pool};
use crate::users::UserId;
use ahash::RandomState;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Handle of a [`Session`].
pub type SessionId = Handle<Session>;

#[derive(Debug, Clone)]
pub struct Session {
    in2out: TranslationKey,
    out2in: TranslationKey,
    last_heard: Instant,
    total_pkts: u64,
    total_bytes: u64,
    is_static: bool,
    user: UserId,
    // Set for dynamic sessions only, the outside port is to be released on removal
    address_index: Option<AddressIndex>,
    list_node: Option<NodeId<SessionId>>,
}

impl Session {
    pub(crate) fn new(
        in2out: TranslationKey,
        out2in: TranslationKey,
        user: UserId,
        address_index: Option<AddressIndex>,
        now: Instant,
    ) -> Self {
        Self {
            in2out,
            out2in,
            last_heard: now,
            total_pkts: 0,
            total_bytes: 0,
            is_static: address_index.is_none(),
            user,
            address_index,
            list_node: None,
        }
    }

    #[must_use]
    pub fn in2out(&self) -> &TranslationKey {
        &self.in2out
    }
    #[must_use]
    pub fn out2in(&self) -> &TranslationKey {
        &self.out2in
    }
    #[must_use]
    pub fn last_heard(&self) -> Instant {
        self.last_heard
    }
    #[must_use]
    pub fn total_pkts(&self) -> u64 {
        self.total_pkts
    }
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
    /// Whether the session was created from a static mapping.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.is_static
    }
    #[must_use]
    pub fn user(&self) -> UserId {
        self.user
    }
    #[must_use]
    pub fn address_index(&self) -> Option<AddressIndex> {
        self.address_index
    }

    pub(crate) fn list_node(&self) -> Option<NodeId<SessionId>> {
        self.list_node
    }

    pub(crate) fn set_list_node(&mut self, node: NodeId<SessionId>) {
        self.list_node = Some(node);
    }

    /// Account for one packet of `len` bytes.
    pub fn touch(&mut self, len: usize, now: Instant) {
        self.last_heard = now;
        self.total_pkts += 1;
        self.total_bytes += len as u64;
    }

    #[must_use]
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heard) >= timeout
    }
}

#[derive(Debug)]
pub struct SessionTable {
    sessions: Pool<Session>,
    in2out: HashMap<TranslationKey, SessionId, RandomState>,
    out2in: HashMap<TranslationKey, SessionId, RandomState>,
}

impl SessionTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: Pool::with_capacity(capacity),
            in2out: HashMap::with_capacity_and_hasher(capacity, RandomState::with_seeds(0, 0, 0, 0)),
            out2in: HashMap::with_capacity_and_hasher(capacity, RandomState::with_seeds(0, 0, 0, 0)),
        }
    }

    /// Insert a session in the pool and in both indices.
    ///
    /// # Errors
    ///
    /// Returns [`NatError::AlreadyExists`] if either key is already in use. The table is left
    /// unchanged in that case.
    pub(crate) fn insert(&mut self, session: Session) -> Result<SessionId, NatError> {
        if self.in2out.contains_key(&session.in2out) || self.out2in.contains_key(&session.out2in) {
            return Err(NatError::AlreadyExists);
        }
        let (in2out, out2in) = (session.in2out, session.out2in);
        let id = self.sessions.insert(session);
        self.in2out.insert(in2out, id);
        self.out2in.insert(out2in, id);
        Ok(id)
    }

    pub(crate) fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        self.in2out.remove(&session.in2out);
        self.out2in.remove(&session.out2in);
        Some(session)
    }

    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    #[must_use]
    pub fn lookup_in2out(&self, key: &TranslationKey) -> Option<SessionId> {
        self.in2out.get(key).copied()
    }

    #[must_use]
    pub fn lookup_out2in(&self, key: &TranslationKey) -> Option<SessionId> {
        self.out2in.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessionId, &Session)> {
        self.sessions.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether the indices and the pool agree. Only meant for tests and debug assertions.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.in2out.len() == self.sessions.len()
            && self.out2in.len() == self.sessions.len()
            && self.sessions.iter().all(|(id, s)| {
                self.in2out.get(&s.in2out) == Some(&id) && self.out2in.get(&s.out2in) == Some(&id)
            })
    }
}
