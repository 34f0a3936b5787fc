// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tracing targets for the NAT engine and its tools, and the runtime control of their log levels.
//!
//! Every module that logs declares its target once with [`trace_target!`]. Declarations are
//! collected at link time, so that [`get_trace_ctl`] knows all of them before the first log line
//! is emitted, and log levels can later be changed per target or per tag.

#![deny(clippy::all, clippy::pedantic)]

pub mod control;
pub mod display;
pub mod targets;

pub use control::{TraceCtl, TraceCtlError, get_trace_ctl};
pub use tracing::level_filters::LevelFilter;
