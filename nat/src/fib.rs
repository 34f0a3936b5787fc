// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! VRF to FIB resolution
//!
//! The engine does not own routing tables: it only needs to know which forwarding table a VRF id
//! refers to, and asks a [`FibResolver`] for it.

use std::collections::HashMap;

pub trait FibResolver {
    /// Index of the FIB of the given VRF, if the VRF exists.
    fn fib_index(&self, vrf_id: u32) -> Option<u32>;
}

impl<F: FibResolver + ?Sized> FibResolver for &F {
    fn fib_index(&self, vrf_id: u32) -> Option<u32> {
        (**self).fib_index(vrf_id)
    }
}

/// A [`FibResolver`] backed by an explicit table of VRFs.
#[derive(Debug, Clone, Default)]
pub struct FibTable {
    fibs: HashMap<u32, u32>,
}

impl FibTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table mapping each VRF of `vrf_ids` to a FIB index equal to its id.
    #[must_use]
    pub fn identity(vrf_ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            fibs: vrf_ids.into_iter().map(|id| (id, id)).collect(),
        }
    }

    pub fn add_vrf(&mut self, vrf_id: u32, fib_index: u32) -> &mut Self {
        self.fibs.insert(vrf_id, fib_index);
        self
    }

    pub fn del_vrf(&mut self, vrf_id: u32) -> Option<u32> {
        self.fibs.remove(&vrf_id)
    }
}

impl FibResolver for FibTable {
    fn fib_index(&self, vrf_id: u32) -> Option<u32> {
        self.fibs.get(&vrf_id).copied()
    }
}
