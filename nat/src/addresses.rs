// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Outside addresses and allocation of their ports
//!
//! Each outside address owns a bitmap of its 65536 ports. Dynamic allocation only hands out ports
//! above 1024: it picks the first address that still has free dynamic ports, then draws random
//! candidates until one of them is free. Static mappings reserve their external port in the same
//! bitmap, so that dynamic allocation never collides with them.

use crate::errors::NatError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::Ipv4Addr;
use tracectl::{LevelFilter, trace_target};
use tracing::{debug, warn};

trace_target!("nat-addresses", LevelFilter::INFO, &["nat"]);

/// Highest port that dynamic allocation never uses.
pub const PRIVILEGED_PORT_MAX: u16 = 1024;

/// Number of ports available for dynamic allocation on one address.
pub const DYNAMIC_PORTS: u32 = 65535 - 1024;

/// Above this number of addresses, adding a range logs a warning.
const LARGE_RANGE: u32 = 1024;

///////////////////////////////////////////////////////////////////////////////
// PortBitmap
///////////////////////////////////////////////////////////////////////////////

/// [`PortBitmap`] is a bitmap of 65536 bits, one per port value. Port `p` is bit `p % 64` of word
/// `p / 64`.
#[derive(Clone)]
struct PortBitmap(Box<[u64; 1024]>);

impl PortBitmap {
    fn new() -> Self {
        Self(Box::new([0; 1024]))
    }

    fn location(port: u16) -> (usize, u64) {
        (usize::from(port / 64), 1 << (port % 64))
    }

    fn get(&self, port: u16) -> bool {
        let (word, mask) = Self::location(port);
        self.0[word] & mask != 0
    }

    // Returns false if the bit was already set.
    fn set(&mut self, port: u16) -> bool {
        let (word, mask) = Self::location(port);
        let was_set = self.0[word] & mask != 0;
        self.0[word] |= mask;
        !was_set
    }

    // Returns false if the bit was already clear.
    fn clear(&mut self, port: u16) -> bool {
        let (word, mask) = Self::location(port);
        let was_set = self.0[word] & mask != 0;
        self.0[word] &= !mask;
        was_set
    }

    fn count_ones(&self) -> u32 {
        self.0.iter().map(|word| word.count_ones()).sum()
    }
}

impl std::fmt::Debug for PortBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PortBitmap({} ports set)", self.count_ones())
    }
}

///////////////////////////////////////////////////////////////////////////////
// NatAddress
///////////////////////////////////////////////////////////////////////////////

/// An outside address and the state of its ports.
#[derive(Debug, Clone)]
pub struct NatAddress {
    addr: Ipv4Addr,
    busy_ports: PortBitmap,
    // Only counts ports above PRIVILEGED_PORT_MAX
    busy_count: u32,
}

impl NatAddress {
    fn new(addr: Ipv4Addr) -> Self {
        Self {
            addr,
            busy_ports: PortBitmap::new(),
            busy_count: 0,
        }
    }

    #[must_use]
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Number of busy ports above 1024.
    #[must_use]
    pub fn busy_count(&self) -> u32 {
        self.busy_count
    }

    #[must_use]
    pub fn is_port_busy(&self, port: u16) -> bool {
        self.busy_ports.get(port)
    }

    fn has_free_dynamic_ports(&self) -> bool {
        self.busy_count < DYNAMIC_PORTS
    }
}

///////////////////////////////////////////////////////////////////////////////
// AddressPool
///////////////////////////////////////////////////////////////////////////////

/// Index of an address in the [`AddressPool`]. Addresses are never removed, so indices are stable.
pub type AddressIndex = usize;

#[derive(Debug)]
pub struct AddressPool {
    addresses: Vec<NatAddress>,
    rng: StdRng,
}

impl AddressPool {
    /// Create an empty pool. With a seed, port allocation is deterministic.
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self {
            addresses: Vec::new(),
            rng,
        }
    }

    /// Append an address to the pool. Duplicates are not checked.
    pub fn add_address(&mut self, addr: Ipv4Addr) -> AddressIndex {
        debug!("Adding outside address {addr}");
        self.addresses.push(NatAddress::new(addr));
        self.addresses.len() - 1
    }

    /// Add all addresses from `first` to `last`, both included. Returns the number of addresses
    /// added.
    ///
    /// # Errors
    ///
    /// Returns [`NatError::InvalidRange`] if `last` is lower than `first`.
    pub fn add_address_range(&mut self, first: Ipv4Addr, last: Ipv4Addr) -> Result<u32, NatError> {
        let (start, end) = (first.to_bits(), last.to_bits());
        if end < start {
            return Err(NatError::InvalidRange(first, last));
        }
        let count = end - start + 1;
        if count > LARGE_RANGE {
            warn!("{first} - {last} is a wide range: {count} addresses");
        }
        for bits in start..=end {
            self.add_address(Ipv4Addr::from_bits(bits));
        }
        Ok(count)
    }

    #[must_use]
    pub fn find(&self, addr: Ipv4Addr) -> Option<AddressIndex> {
        self.addresses.iter().position(|a| a.addr == addr)
    }

    #[must_use]
    pub fn get(&self, index: AddressIndex) -> Option<&NatAddress> {
        self.addresses.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NatAddress> {
        self.addresses.iter()
    }

    /// Allocate a free port above 1024 on the first address that has one.
    ///
    /// # Errors
    ///
    /// Returns [`NatError::Exhausted`] if all dynamic ports of all addresses are busy.
    pub fn allocate_port_for_flow(&mut self) -> Result<(AddressIndex, u16), NatError> {
        let Some((index, address)) = self
            .addresses
            .iter_mut()
            .enumerate()
            .find(|(_, a)| a.has_free_dynamic_ports())
        else {
            debug!("No outside address with free ports left");
            return Err(NatError::Exhausted);
        };
        // At least one dynamic port is free, so this terminates.
        loop {
            let port = self.rng.random_range(PRIVILEGED_PORT_MAX + 1..=u16::MAX);
            if address.busy_ports.set(port) {
                address.busy_count += 1;
                return Ok((index, port));
            }
        }
    }

    /// Release a port obtained from [`AddressPool::allocate_port_for_flow`].
    ///
    /// # Panics
    ///
    /// Panics if the address does not exist or if the port is not busy.
    pub fn release_port(&mut self, index: AddressIndex, port: u16) {
        let address = &mut self.addresses[index];
        assert!(
            address.busy_ports.clear(port),
            "Releasing free port {port} of {}",
            address.addr
        );
        if port > PRIVILEGED_PORT_MAX {
            address.busy_count -= 1;
        }
    }

    /// Reserve the external port of a static mapping.
    ///
    /// # Errors
    ///
    /// Returns [`NatError::NoSuchEntry`] if the address is not in the pool, or
    /// [`NatError::PortInUse`] if the port is already busy.
    pub fn reserve_port(&mut self, addr: Ipv4Addr, port: u16) -> Result<(), NatError> {
        let address = self
            .addresses
            .iter_mut()
            .find(|a| a.addr == addr)
            .ok_or(NatError::NoSuchEntry)?;
        if !address.busy_ports.set(port) {
            return Err(NatError::PortInUse(port));
        }
        if port > PRIVILEGED_PORT_MAX {
            address.busy_count += 1;
        }
        Ok(())
    }

    /// Release the external port of a static mapping.
    ///
    /// # Errors
    ///
    /// Returns [`NatError::NoSuchEntry`] if the address is not in the pool.
    pub fn release_reserved_port(&mut self, addr: Ipv4Addr, port: u16) -> Result<(), NatError> {
        let address = self
            .addresses
            .iter_mut()
            .find(|a| a.addr == addr)
            .ok_or(NatError::NoSuchEntry)?;
        if address.busy_ports.clear(port) && port > PRIVILEGED_PORT_MAX {
            address.busy_count -= 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::str::FromStr;
    use tracing_test::traced_test;

    fn addr_v4(ip: &str) -> Ipv4Addr {
        Ipv4Addr::from_str(ip).unwrap()
    }

    #[test]
    fn test_bitmap() {
        let mut bitmap = PortBitmap::new();
        assert!(!bitmap.get(0));
        assert!(bitmap.set(0));
        assert!(!bitmap.set(0));
        assert!(bitmap.set(u16::MAX));
        assert!(bitmap.set(64));
        assert!(bitmap.get(64) && !bitmap.get(63) && !bitmap.get(65));
        assert_eq!(bitmap.count_ones(), 3);
        assert!(bitmap.clear(64));
        assert!(!bitmap.clear(64));
        assert_eq!(bitmap.count_ones(), 2);
    }

    #[test]
    fn test_add_range() {
        let mut pool = AddressPool::new(Some(1));
        assert_eq!(
            pool.add_address_range(addr_v4("10.0.0.1"), addr_v4("10.0.0.4")),
            Ok(4)
        );
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.find(addr_v4("10.0.0.3")), Some(2));
        assert_eq!(
            pool.add_address_range(addr_v4("10.0.0.4"), addr_v4("10.0.0.1")),
            Err(NatError::InvalidRange(
                addr_v4("10.0.0.4"),
                addr_v4("10.0.0.1")
            ))
        );
        assert_eq!(
            pool.add_address_range(addr_v4("10.0.0.9"), addr_v4("10.0.0.9")),
            Ok(1)
        );
        // No de-duplication
        pool.add_address(addr_v4("10.0.0.1"));
        assert_eq!(pool.len(), 6);
    }

    #[test]
    #[traced_test]
    fn test_wide_range_warns() {
        let mut pool = AddressPool::new(Some(1));
        assert_eq!(
            pool.add_address_range(addr_v4("10.0.0.0"), addr_v4("10.0.4.0")),
            Ok(1025)
        );
        assert!(logs_contain("wide range"));
    }

    #[test]
    fn test_dynamic_ports_above_1024_and_unique() {
        bolero::check!()
            .with_type::<(u64, u16)>()
            .for_each(|&(seed, count)| {
                let mut pool = AddressPool::new(Some(seed));
                pool.add_address(addr_v4("4.4.4.4"));
                let mut seen = HashSet::new();
                for _ in 0..(count % 2048) {
                    let (index, port) = pool.allocate_port_for_flow().unwrap();
                    assert_eq!(index, 0);
                    assert!(port > PRIVILEGED_PORT_MAX);
                    assert!(seen.insert(port));
                    assert!(pool.get(0).unwrap().is_port_busy(port));
                }
                assert_eq!(pool.get(0).unwrap().busy_count() as usize, seen.len());
            });
    }

    #[test]
    fn test_release_makes_port_available() {
        let mut pool = AddressPool::new(Some(7));
        pool.add_address(addr_v4("4.4.4.4"));
        let (index, port) = pool.allocate_port_for_flow().unwrap();
        pool.release_port(index, port);
        let address = pool.get(index).unwrap();
        assert!(!address.is_port_busy(port));
        assert_eq!(address.busy_count(), 0);
    }

    #[test]
    #[should_panic(expected = "Releasing free port")]
    fn test_release_free_port_panics() {
        let mut pool = AddressPool::new(Some(7));
        pool.add_address(addr_v4("4.4.4.4"));
        pool.release_port(0, 5000);
    }

    #[test]
    fn test_single_free_port_then_exhausted() {
        let mut pool = AddressPool::new(Some(42));
        pool.add_address(addr_v4("4.4.4.4"));
        for port in PRIVILEGED_PORT_MAX + 1..=u16::MAX {
            if port != 50000 {
                pool.reserve_port(addr_v4("4.4.4.4"), port).unwrap();
            }
        }
        assert_eq!(pool.get(0).unwrap().busy_count(), DYNAMIC_PORTS - 1);

        assert_eq!(pool.allocate_port_for_flow(), Ok((0, 50000)));
        assert_eq!(pool.allocate_port_for_flow(), Err(NatError::Exhausted));
    }

    #[test]
    fn test_next_address_when_first_is_full() {
        let mut pool = AddressPool::new(Some(3));
        pool.add_address(addr_v4("4.4.4.4"));
        pool.add_address(addr_v4("4.4.4.5"));
        for port in PRIVILEGED_PORT_MAX + 1..=u16::MAX {
            pool.reserve_port(addr_v4("4.4.4.4"), port).unwrap();
        }
        let (index, port) = pool.allocate_port_for_flow().unwrap();
        assert_eq!(index, 1);
        assert!(port > PRIVILEGED_PORT_MAX);
    }

    #[test]
    fn test_static_reservations() {
        let mut pool = AddressPool::new(None);
        pool.add_address(addr_v4("4.4.4.4"));
        assert_eq!(
            pool.reserve_port(addr_v4("5.5.5.5"), 3606),
            Err(NatError::NoSuchEntry)
        );

        pool.reserve_port(addr_v4("4.4.4.4"), 3606).unwrap();
        pool.reserve_port(addr_v4("4.4.4.4"), 80).unwrap();
        assert_eq!(
            pool.reserve_port(addr_v4("4.4.4.4"), 3606),
            Err(NatError::PortInUse(3606))
        );
        // Privileged ports are reserved but not counted
        assert_eq!(pool.get(0).unwrap().busy_count(), 1);
        assert!(pool.get(0).unwrap().is_port_busy(80));

        pool.release_reserved_port(addr_v4("4.4.4.4"), 80).unwrap();
        assert_eq!(pool.get(0).unwrap().busy_count(), 1);
        pool.release_reserved_port(addr_v4("4.4.4.4"), 3606).unwrap();
        assert_eq!(pool.get(0).unwrap().busy_count(), 0);
        assert!(!pool.get(0).unwrap().is_port_busy(3606));
    }
}
