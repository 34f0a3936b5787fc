// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Display implementations for NAT objects, in the layout of `show snat`

use crate::config::NatConfig;
use crate::engine::{NatCounters, NatEngine};
use crate::fib::FibResolver;
use crate::key::{MappingKey, TranslationKey};
use crate::sessions::Session;
use crate::static_mapping::StaticMapping;
use crate::users::{User, UserId};
use std::fmt::{Display, Formatter};

impl Display for TranslationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} proto {} port {} fib {}",
            self.addr, self.protocol, self.port, self.fib_index
        )
    }
}

impl Display for MappingKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl Display for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "  i2o {}", self.in2out())?;
        writeln!(f, "    o2i {}", self.out2in())?;
        writeln!(
            f,
            "       last heard {:.2}s ago",
            self.last_heard().elapsed().as_secs_f64()
        )?;
        writeln!(
            f,
            "       total pkts {}, total bytes {}",
            self.total_pkts(),
            self.total_bytes()
        )?;
        if self.is_static() {
            writeln!(f, "       static translation")
        } else {
            writeln!(f, "       dynamic translation")
        }
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} dynamic translations, {} static translations",
            self.addr(),
            self.nsessions(),
            self.nstaticsessions()
        )
    }
}

impl Display for StaticMapping {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_addr_only() {
            write!(
                f,
                "local {} external {} vrf {}",
                self.local_addr(),
                self.external_addr(),
                self.vrf_id()
            )
        } else {
            write!(
                f,
                "local {} external {} vrf {}",
                self.local_key(),
                self.external_key(),
                self.vrf_id()
            )
        }
    }
}

impl Display for NatCounters {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} users, {} outside addresses, {} active sessions, {} static mappings",
            self.users, self.addresses, self.sessions, self.static_mappings
        )
    }
}

/// Prints the configuration as a startup stanza, which parses back into the same configuration.
impl Display for NatConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "snat {{")?;
        writeln!(f, "  translation hash buckets {}", self.translation_buckets)?;
        writeln!(f, "  translation hash memory {}", self.translation_memory_size)?;
        writeln!(f, "  user hash buckets {}", self.user_buckets)?;
        writeln!(f, "  user hash memory {}", self.user_memory_size)?;
        writeln!(
            f,
            "  max translations per user {}",
            self.max_translations_per_user
        )?;
        writeln!(f, "  outside VRF id {}", self.outside_vrf_id)?;
        writeln!(f, "  inside VRF id {}", self.inside_vrf_id)?;
        if self.static_mapping_only {
            if self.static_mapping_connection_tracking {
                writeln!(f, "  static mapping only connection tracking")?;
            } else {
                writeln!(f, "  static mapping only")?;
            }
        }
        write!(f, "}}")
    }
}

/// Verbosity of [`NatEngine::show`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShowLevel {
    /// Counters only
    #[default]
    Summary,
    /// Counters, users and static mappings
    Detail,
    /// Everything, sessions included
    Verbose,
}

/// `show snat` output for an engine.
pub struct NatShow<'a, R: FibResolver> {
    engine: &'a NatEngine<R>,
    level: ShowLevel,
}

impl<R: FibResolver> NatEngine<R> {
    /// Render the state of the engine.
    #[must_use]
    pub fn show(&self, level: ShowLevel) -> NatShow<'_, R> {
        NatShow {
            engine: self,
            level,
        }
    }
}

impl<R: FibResolver> NatShow<'_, R> {
    fn fmt_user(&self, f: &mut Formatter<'_>, id: UserId, user: &User) -> std::fmt::Result {
        writeln!(f, "{user}")?;
        if self.level >= ShowLevel::Verbose {
            for (_, session) in self.engine.user_sessions(id) {
                write!(f, "{session}")?;
            }
        }
        Ok(())
    }

    fn fmt_static_mappings(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (_, mapping) in self.engine.static_mappings().iter() {
            writeln!(f, "{mapping}")?;
        }
        Ok(())
    }
}

impl<R: FibResolver> Display for NatShow<'_, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let config = self.engine.config();
        let counters = self.engine.counters();
        let mode = match (
            config.static_mapping_only,
            config.static_mapping_connection_tracking,
        ) {
            (false, _) => "dynamic translations enabled",
            (true, false) => "static mapping only",
            (true, true) => "static mapping only connection tracking",
        };
        writeln!(f, "SNAT mode: {mode}")?;

        if !config.session_tracking() {
            writeln!(f, "{} static mappings", counters.static_mappings)?;
            if self.level > ShowLevel::Summary {
                self.fmt_static_mappings(f)?;
            }
            return Ok(());
        }

        writeln!(f, "{counters}")?;
        if self.level == ShowLevel::Summary {
            return Ok(());
        }
        writeln!(f, "{} list pool elements", counters.list_nodes)?;
        for (id, user) in self.engine.users().iter() {
            self.fmt_user(f, id, user)?;
        }
        if counters.static_mappings > 0 {
            writeln!(f, "static mappings:")?;
            self.fmt_static_mappings(f)?;
        }
        Ok(())
    }
}
