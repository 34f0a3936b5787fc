// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Circular doubly-linked lists in a shared node arena
//!
//! Each list starts with a sentinel head node carrying no value. Nodes refer to each other through
//! [`NodeId`] handles, so that an element can be unlinked in O(1) given its node.

use crate::pool::{Handle, Pool};

#[derive(Debug)]
pub struct ListNode<V> {
    prev: NodeId<V>,
    next: NodeId<V>,
    value: Option<V>,
}

pub type NodeId<V> = Handle<ListNode<V>>;

#[derive(Debug)]
pub(crate) struct ListArena<V> {
    nodes: Pool<ListNode<V>>,
}

impl<V: Copy> ListArena<V> {
    pub(crate) fn new() -> Self {
        Self { nodes: Pool::new() }
    }

    // Nodes are only referenced by the lists that own them: a dangling id is a bug.
    fn node(&self, id: NodeId<V>) -> &ListNode<V> {
        self.nodes
            .get(id)
            .unwrap_or_else(|| unreachable!("dangling list node {id:?}"))
    }

    fn node_mut(&mut self, id: NodeId<V>) -> &mut ListNode<V> {
        self.nodes
            .get_mut(id)
            .unwrap_or_else(|| unreachable!("dangling list node {id:?}"))
    }

    /// Create an empty list, returning its head.
    pub(crate) fn new_list(&mut self) -> NodeId<V> {
        let head = self.nodes.insert(ListNode {
            prev: Handle::dangling(),
            next: Handle::dangling(),
            value: None,
        });
        let node = self.node_mut(head);
        node.prev = head;
        node.next = head;
        head
    }

    /// Append a value at the tail of the list starting at `head`.
    pub(crate) fn push_tail(&mut self, head: NodeId<V>, value: V) -> NodeId<V> {
        let tail = self.node(head).prev;
        let id = self.nodes.insert(ListNode {
            prev: tail,
            next: head,
            value: Some(value),
        });
        self.node_mut(tail).next = id;
        self.node_mut(head).prev = id;
        id
    }

    /// Unlink and free a node, returning its value.
    pub(crate) fn remove(&mut self, id: NodeId<V>) -> Option<V> {
        let (prev, next) = {
            let node = self.node(id);
            debug_assert!(node.value.is_some(), "removing a list head");
            (node.prev, node.next)
        };
        self.node_mut(prev).next = next;
        self.node_mut(next).prev = prev;
        self.nodes.remove(id).and_then(|node| node.value)
    }

    /// Free a list head and every node still linked to it.
    pub(crate) fn free_list(&mut self, head: NodeId<V>) {
        let mut current = self.node(head).next;
        while current != head {
            let next = self.node(current).next;
            self.nodes.remove(current);
            current = next;
        }
        self.nodes.remove(head);
    }

    pub(crate) fn iter(&self, head: NodeId<V>) -> ListIter<'_, V> {
        ListIter {
            arena: self,
            head,
            current: self.node(head).next,
        }
    }

    pub(crate) fn is_empty(&self, head: NodeId<V>) -> bool {
        self.node(head).next == head
    }

    /// Number of nodes in the arena, heads included.
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }
}

pub(crate) struct ListIter<'a, V> {
    arena: &'a ListArena<V>,
    head: NodeId<V>,
    current: NodeId<V>,
}

impl<V: Copy> Iterator for ListIter<'_, V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        if self.current == self.head {
            return None;
        }
        let node = self.arena.node(self.current);
        self.current = node.next;
        node.value
    }
}
