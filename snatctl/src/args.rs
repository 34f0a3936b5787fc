// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

pub(crate) use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;

/// A VRF and the FIB it resolves to, given as `<vrf-id>=<fib-index>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VrfArg {
    pub(crate) vrf_id: u32,
    pub(crate) fib_index: u32,
}

impl FromStr for VrfArg {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (vrf, fib) = input
            .split_once('=')
            .ok_or_else(|| format!("expected <vrf-id>=<fib-index>, got '{input}'"))?;
        let parse = |s: &str| {
            s.trim()
                .parse::<u32>()
                .map_err(|e| format!("invalid id '{s}': {e}"))
        };
        Ok(Self {
            vrf_id: parse(vrf)?,
            fib_index: parse(fib)?,
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "snatctl")]
#[command(version = "0.1")]
#[command(about = "Drive a NAT44 engine from a command script", long_about = None)]
pub(crate) struct CmdArgs {
    #[arg(long, value_name = "path", help = "Startup configuration (snat { ... } stanza)")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "path",
        help = "Command script, one command per line. Commands are read from stdin if not set"
    )]
    script: Option<PathBuf>,

    #[arg(
        long,
        value_name = "vrf-id=fib-index",
        help = "Declare a VRF. The inside and outside VRFs of the configuration are declared with identical FIB indices by default"
    )]
    vrf: Vec<VrfArg>,

    #[arg(long, value_name = "seed", help = "Seed of the outside port allocator")]
    seed: Option<u64>,

    #[arg(
        long,
        default_value_t = false,
        help = "Keep executing the script after a command fails"
    )]
    keep_going: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Show configurable tracing targets and exit"
    )]
    show_tracing_targets: bool,

    #[arg(
        long,
        value_name = "tracing configuration",
        help = "Tracing config string as comma-separated sequence of tag=level, with level one in [off,error,warn,info,debug,trace].
Passing default=level sets the default log-level.
Passing all=level allows setting the log-level of all targets to level.
E.g. default=error,all=info,nat=debug will set the default target to error, and all the registered targets to info, but enable debug for nat"
    )]
    tracing: Option<String>,
}

impl CmdArgs {
    pub(crate) fn config(&self) -> Option<&PathBuf> {
        self.config.as_ref()
    }
    pub(crate) fn script(&self) -> Option<&PathBuf> {
        self.script.as_ref()
    }
    pub(crate) fn vrfs(&self) -> &[VrfArg] {
        &self.vrf
    }
    pub(crate) fn seed(&self) -> Option<u64> {
        self.seed
    }
    pub(crate) fn keep_going(&self) -> bool {
        self.keep_going
    }
    pub(crate) fn show_tracing_targets(&self) -> bool {
        self.show_tracing_targets
    }
    pub(crate) fn tracing(&self) -> Option<&String> {
        self.tracing.as_ref()
    }
}
