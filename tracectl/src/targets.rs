// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Link-time registry of tracing targets

use crate::LevelFilter;
use linkme::distributed_slice;

/// A tracing target, as declared by [`trace_target!`](crate::trace_target) or
/// [`custom_target!`](crate::custom_target).
#[derive(Debug)]
pub struct LogTarget {
    pub(crate) target: &'static str,
    pub(crate) name: &'static str,
    pub(crate) level: LevelFilter,
    pub(crate) tags: &'static [&'static str],
}

impl LogTarget {
    #[must_use]
    pub const fn new(
        target: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) -> Self {
        Self {
            target,
            name,
            level,
            tags,
        }
    }
}

#[distributed_slice]
pub static LOG_TARGETS: [LogTarget];

/// Declare the current module as a tracing target, with a short name, a default level and tags.
///
/// The short name is also usable as a tag, to change the level from the command line.
#[macro_export]
macro_rules! trace_target {
    ($name:expr, $level:expr, $tags:expr) => {
        const _: () = {
            use linkme::distributed_slice;
            use $crate::targets::{LOG_TARGETS, LogTarget};

            #[distributed_slice(LOG_TARGETS)]
            static LOG_TARGET: LogTarget =
                LogTarget::new(module_path!(), $name, $level, $tags);
        };
    };
}

/// Declare a target that is not a module path, typically one from an external crate.
#[macro_export]
macro_rules! custom_target {
    ($target:expr, $level:expr, $tags:expr) => {
        const _: () = {
            use linkme::distributed_slice;
            use $crate::targets::{LOG_TARGETS, LogTarget};

            #[distributed_slice(LOG_TARGETS)]
            static LOG_TARGET: LogTarget = LogTarget::new($target, $target, $level, $tags);
        };
    };
}
