// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Lookup keys for the NAT tables
//!
//! All keys are small value types. [`TranslationKey`] is compared and hashed through its packed
//! 64-bit representation, `addr:32 | port:16 | protocol:3 | fib_index:13`, which is also how it is
//! stored in the session and static-mapping indices.

use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("FIB index {0} does not fit in a translation key")]
    FibIndexOutOfRange(u32),
    #[error("invalid protocol '{0}'")]
    InvalidProtocol(String),
    #[error("invalid protocol value ({0})")]
    InvalidProtocolValue(u8),
}

/// Transport protocol of a translated flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(test, derive(bolero::TypeGenerator))]
#[repr(u8)]
pub enum NatProtocol {
    Udp = 0,
    Tcp = 1,
    Icmp = 2,
}

impl NatProtocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            NatProtocol::Udp => "UDP",
            NatProtocol::Tcp => "TCP",
            NatProtocol::Icmp => "ICMP",
        }
    }
}

impl TryFrom<u8> for NatProtocol {
    type Error = KeyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NatProtocol::Udp),
            1 => Ok(NatProtocol::Tcp),
            2 => Ok(NatProtocol::Icmp),
            v => Err(KeyError::InvalidProtocolValue(v)),
        }
    }
}

impl FromStr for NatProtocol {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(NatProtocol::Udp),
            "tcp" => Ok(NatProtocol::Tcp),
            "icmp" => Ok(NatProtocol::Icmp),
            _ => Err(KeyError::InvalidProtocol(s.to_string())),
        }
    }
}

impl Display for NatProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index of a forwarding table, as obtained from a [`crate::FibResolver`]. It is limited to 13 bits
/// so that it can be packed in a [`TranslationKey`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FibIndex(u16);

impl FibIndex {
    pub const MAX: u16 = (1 << 13) - 1;

    /// Build a [`FibIndex`] from a raw index.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::FibIndexOutOfRange`] if the index does not fit in 13 bits.
    pub fn new_checked(index: u32) -> Result<Self, KeyError> {
        match u16::try_from(index) {
            Ok(index) if index <= Self::MAX => Ok(Self(index)),
            _ => Err(KeyError::FibIndexOutOfRange(index)),
        }
    }

    #[must_use]
    pub fn as_u32(self) -> u32 {
        u32::from(self.0)
    }
}

impl Display for FibIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of a session or of a static-mapping match: address, port, protocol and FIB.
///
/// For ICMP, the port holds the query identifier.
#[derive(Debug, Clone, Copy)]
pub struct TranslationKey {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub protocol: NatProtocol,
    pub fib_index: FibIndex,
}

impl TranslationKey {
    #[must_use]
    pub fn new(addr: Ipv4Addr, port: u16, protocol: NatProtocol, fib_index: FibIndex) -> Self {
        Self {
            addr,
            port,
            protocol,
            fib_index,
        }
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        (u64::from(self.addr.to_bits()) << 32)
            | (u64::from(self.port) << 16)
            | (u64::from(self.protocol as u8) << 13)
            | u64::from(self.fib_index.0)
    }

    /// Same key, with the address and port replaced.
    #[must_use]
    pub fn with_addr_port(&self, addr: Ipv4Addr, port: u16) -> Self {
        Self {
            addr,
            port,
            ..*self
        }
    }

    #[must_use]
    pub fn user_key(&self) -> UserKey {
        UserKey::new(self.addr, self.fib_index)
    }

    #[must_use]
    pub fn mapping_key(&self) -> MappingKey {
        MappingKey::new(self.addr, self.port)
    }
}

impl PartialEq for TranslationKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_u64() == other.as_u64()
    }
}

impl Eq for TranslationKey {}

impl Hash for TranslationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.as_u64());
    }
}

impl From<TranslationKey> for u64 {
    fn from(key: TranslationKey) -> Self {
        key.as_u64()
    }
}

impl TryFrom<u64> for TranslationKey {
    type Error = KeyError;

    #[allow(clippy::cast_possible_truncation)]
    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(Self {
            addr: Ipv4Addr::from_bits((value >> 32) as u32),
            port: (value >> 16) as u16,
            protocol: NatProtocol::try_from(((value >> 13) & 0x7) as u8)?,
            fib_index: FibIndex((value as u16) & FibIndex::MAX),
        })
    }
}

/// Key of the static-mapping indices: an address and a port, the port being 0 for address-only
/// mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl MappingKey {
    #[must_use]
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }

    #[must_use]
    pub fn address_only(addr: Ipv4Addr) -> Self {
        Self { addr, port: 0 }
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        (u64::from(self.addr.to_bits()) << 32) | (u64::from(self.port) << 16)
    }
}

/// Key of the user index: an inside address in a given FIB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserKey {
    pub addr: Ipv4Addr,
    pub fib_index: FibIndex,
}

impl UserKey {
    #[must_use]
    pub fn new(addr: Ipv4Addr, fib_index: FibIndex) -> Self {
        Self { addr, fib_index }
    }
}
