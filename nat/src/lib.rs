// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]
#![deny(rustdoc::all)]

//! Stateful source NAT for IPv4 (NAT44)
//!
//! This package translates inside (private) flows to outside (public) addresses and ports, either
//! through administratively configured static mappings or through sessions created on the fly
//! with a port picked at random from a pool of outside addresses.
//!
//! # Example
//!
//! ```
//! use snat_nat::{FibIndex, FibTable, NatConfig, NatEngine, NatProtocol, TranslationKey};
//! use std::net::Ipv4Addr;
//!
//! let mut nat = NatEngine::new(NatConfig::default(), FibTable::identity([0]));
//! nat.add_address(Ipv4Addr::new(4, 4, 4, 4));
//!
//! let inside = TranslationKey::new(
//!     Ipv4Addr::new(10, 0, 0, 1),
//!     5000,
//!     NatProtocol::Udp,
//!     FibIndex::default(),
//! );
//! let outside = nat.lookup_or_create(&inside).unwrap();
//! assert_eq!(outside.key.addr, Ipv4Addr::new(4, 4, 4, 4));
//! assert_eq!(nat.reverse_lookup(&outside.key).unwrap().key, inside);
//! ```
//!
//! # Limitations
//!
//! - Only NAT44 is supported
//! - Sessions are not aged out on their own: an external task is expected to call
//!   [`NatEngine::expire_idle`] periodically
//! - The engine does no locking, callers serialize mutations against lookups

pub mod addresses;
pub mod config;
mod display;
mod dlist;
pub mod engine;
pub mod errors;
pub mod fib;
pub mod key;
mod pool;
pub mod sessions;
pub mod static_mapping;
pub mod users;

pub use addresses::{AddressIndex, AddressPool, NatAddress};
pub use config::{NatConfig, NatConfigBuilder, NatConfigError};
pub use display::{NatShow, ShowLevel};
pub use engine::{NatCounters, NatEngine, NatTranslation, StaticMappingRequest};
pub use errors::NatError;
pub use fib::{FibResolver, FibTable};
pub use key::{FibIndex, KeyError, MappingKey, NatProtocol, TranslationKey, UserKey};
pub use pool::Handle;
pub use sessions::{Session, SessionId, SessionTable};
pub use static_mapping::{MatchDirection, StaticMapping, StaticMappingId, StaticMappingTable};
pub use users::{User, UserId, UserIndex};

/// Direction of the packet being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatDirection {
    /// From the inside network to the outside: the source is translated
    In2Out,
    /// From the outside network to the inside: the destination is translated back
    Out2In,
}
