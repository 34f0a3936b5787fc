// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Users: inside hosts owning sessions
//!
//! A user is an inside address in a given FIB. Each user keeps the list of its sessions in a
//! linked list whose nodes live in an arena shared by all users, and counts its dynamic and static
//! sessions separately.

use crate::dlist::{ListArena, NodeId};
use crate::key::{FibIndex, UserKey};
use crate::pool::{Handle, Pool};
use crate::sessions::SessionId;
use ahash::RandomState;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracectl::{LevelFilter, trace_target};
use tracing::debug;

trace_target!("nat-users", LevelFilter::INFO, &["nat"]);

/// Handle of a [`User`].
pub type UserId = Handle<User>;

#[derive(Debug, Clone)]
pub struct User {
    addr: Ipv4Addr,
    fib_index: FibIndex,
    nsessions: u32,
    nstaticsessions: u32,
    list_head: NodeId<SessionId>,
}

impl User {
    #[must_use]
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }
    #[must_use]
    pub fn fib_index(&self) -> FibIndex {
        self.fib_index
    }
    #[must_use]
    pub fn key(&self) -> UserKey {
        UserKey::new(self.addr, self.fib_index)
    }
    /// Number of dynamic sessions.
    #[must_use]
    pub fn nsessions(&self) -> u32 {
        self.nsessions
    }
    /// Number of static sessions.
    #[must_use]
    pub fn nstaticsessions(&self) -> u32 {
        self.nstaticsessions
    }
    #[must_use]
    pub fn has_sessions(&self) -> bool {
        self.nsessions + self.nstaticsessions > 0
    }
}

#[derive(Debug)]
pub struct UserIndex {
    users: Pool<User>,
    by_key: HashMap<UserKey, UserId, RandomState>,
    lists: ListArena<SessionId>,
}

impl UserIndex {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            users: Pool::with_capacity(capacity),
            by_key: HashMap::with_capacity_and_hasher(capacity, RandomState::with_seeds(0, 0, 0, 0)),
            lists: ListArena::new(),
        }
    }

    #[must_use]
    pub fn find(&self, key: &UserKey) -> Option<UserId> {
        self.by_key.get(key).copied()
    }

    pub(crate) fn find_or_create(&mut self, key: UserKey) -> UserId {
        if let Some(id) = self.find(&key) {
            return id;
        }
        let list_head = self.lists.new_list();
        let id = self.users.insert(User {
            addr: key.addr,
            fib_index: key.fib_index,
            nsessions: 0,
            nstaticsessions: 0,
            list_head,
        });
        self.by_key.insert(key, id);
        debug!("Created user {} in FIB {}", key.addr, key.fib_index);
        id
    }

    #[must_use]
    pub fn get(&self, id: UserId) -> Option<&User> {
        self.users.get(id)
    }

    /// Append a session to the list of a user and count it.
    pub(crate) fn link_session(
        &mut self,
        id: UserId,
        session: SessionId,
        is_static: bool,
    ) -> Option<NodeId<SessionId>> {
        let user = self.users.get_mut(id)?;
        if is_static {
            user.nstaticsessions += 1;
        } else {
            user.nsessions += 1;
        }
        Some(self.lists.push_tail(user.list_head, session))
    }

    /// Remove a session from the list of a user and stop counting it. The user is deleted when its
    /// last session goes away.
    pub(crate) fn unlink_session(&mut self, id: UserId, node: NodeId<SessionId>, is_static: bool) {
        let Some(user) = self.users.get_mut(id) else {
            return;
        };
        if is_static {
            user.nstaticsessions -= 1;
        } else {
            user.nsessions -= 1;
        }
        let (empty, head) = (!user.has_sessions(), user.list_head);
        self.lists.remove(node);
        if empty {
            debug_assert!(self.lists.is_empty(head));
            self.remove(id);
        }
    }

    /// Delete a user and its session list. Sessions themselves are not touched.
    pub(crate) fn remove(&mut self, id: UserId) -> Option<User> {
        let user = self.users.remove(id)?;
        self.by_key.remove(&user.key());
        self.lists.free_list(user.list_head);
        debug!("Removed user {} in FIB {}", user.addr, user.fib_index);
        Some(user)
    }

    /// Sessions of a user, in creation order.
    pub fn sessions(&self, id: UserId) -> impl Iterator<Item = SessionId> + '_ {
        self.users
            .get(id)
            .map(|user| self.lists.iter(user.list_head))
            .into_iter()
            .flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item = (UserId, &User)> {
        self.users.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Number of nodes in the shared list arena, list heads included.
    #[must_use]
    pub fn list_nodes(&self) -> usize {
        self.lists.len()
    }

    /// Whether the index agrees with the pool and every list matches its user's counters.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.by_key.len() == self.users.len()
            && self.users.iter().all(|(id, user)| {
                self.by_key.get(&user.key()) == Some(&id)
                    && u32::try_from(self.lists.iter(user.list_head).count())
                        .is_ok_and(|count| count == user.nsessions + user.nstaticsessions)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn user_key(last: u8) -> UserKey {
        UserKey::new(Ipv4Addr::new(10, 0, 0, last), FibIndex::default())
    }

    #[test]
    fn test_user_lifecycle() {
        let mut users = UserIndex::with_capacity(4);
        let id = users.find_or_create(user_key(1));
        assert_eq!(users.find_or_create(user_key(1)), id);
        assert_eq!(users.len(), 1);

        let s1 = SessionId::dangling();
        let n1 = users.link_session(id, s1, false).unwrap();
        let n2 = users.link_session(id, s1, true).unwrap();
        let user = users.get(id).unwrap();
        assert_eq!((user.nsessions(), user.nstaticsessions()), (1, 1));
        assert_eq!(users.sessions(id).count(), 2);
        assert!(users.is_consistent());

        users.unlink_session(id, n1, false);
        assert_eq!(users.get(id).unwrap().nsessions(), 0);
        assert!(users.is_consistent());

        users.unlink_session(id, n2, true);
        assert_eq!(users.find(&user_key(1)), None);
        assert!(users.is_empty());
        assert_eq!(users.list_nodes(), 0);
        assert_eq!(users.sessions(id).count(), 0);
    }

    #[test]
    fn test_users_are_per_fib() {
        let mut users = UserIndex::with_capacity(4);
        let a = users.find_or_create(user_key(1));
        let b = users.find_or_create(UserKey::new(
            Ipv4Addr::new(10, 0, 0, 1),
            FibIndex::new_checked(3).unwrap(),
        ));
        assert_ne!(a, b);
        assert_eq!(users.len(), 2);
        assert!(users.remove(a).is_some());
        assert_eq!(users.find(&user_key(1)), None);
        assert_eq!(users.len(), 1);
    }
}
