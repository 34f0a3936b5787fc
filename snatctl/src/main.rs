// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]
#![deny(rustdoc::all)]
#![allow(rustdoc::missing_crate_level_docs)]

mod args;
mod command;
mod shell;

use crate::args::{CmdArgs, Parser};
use crate::command::CommandError;
use crate::shell::Shell;

use nat::{FibTable, NatConfig, NatConfigError, NatEngine};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracectl::{get_trace_ctl, trace_target};
use tracing::{error, info, level_filters::LevelFilter};

trace_target!("snatctl", LevelFilter::INFO, &["snatctl"]);

#[derive(Debug, Error)]
enum CtlError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Bad configuration: {0}")]
    Config(#[from] NatConfigError),
    #[error("line {line}: {source}")]
    Command { line: usize, source: CommandError },
    #[error("{0} commands failed")]
    Failed(usize),
}

fn io_error(path: Option<&PathBuf>) -> impl FnOnce(std::io::Error) -> CtlError {
    let path = path.map_or_else(|| "standard input".to_string(), |p| p.display().to_string());
    move |source| CtlError::Io { path, source }
}

fn load_config(args: &CmdArgs) -> Result<NatConfig, CtlError> {
    let mut config = match args.config() {
        Some(path) => std::fs::read_to_string(path)
            .map_err(io_error(Some(path)))?
            .parse::<NatConfig>()?,
        None => NatConfig::default(),
    };
    if let Some(seed) = args.seed() {
        config.random_seed = Some(seed);
    }
    Ok(config)
}

fn build_fib_table(args: &CmdArgs, config: &NatConfig) -> FibTable {
    let mut fibs = FibTable::identity([config.inside_vrf_id, config.outside_vrf_id]);
    for vrf in args.vrfs() {
        fibs.add_vrf(vrf.vrf_id, vrf.fib_index);
    }
    fibs
}

fn run(args: &CmdArgs) -> Result<(), CtlError> {
    let config = load_config(args)?;
    let fibs = build_fib_table(args, &config);
    info!("Starting with configuration:\n{config}");
    let mut shell = Shell::new(NatEngine::new(config, fibs));

    let input: Box<dyn BufRead> = match args.script() {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path).map_err(io_error(Some(path)))?,
        )),
        None => Box::new(std::io::stdin().lock()),
    };
    let mut stdout = std::io::stdout().lock();
    let mut failed = 0;
    for (n, line) in input.lines().enumerate() {
        let line = line.map_err(io_error(args.script()))?;
        match shell.execute_line(&line) {
            Ok(out) => stdout
                .write_all(out.as_bytes())
                .map_err(|source| CtlError::Io {
                    path: "standard output".to_string(),
                    source,
                })?,
            Err(source) if args.keep_going() => {
                error!("line {}: {source}", n + 1);
                failed += 1;
            }
            Err(source) => return Err(CtlError::Command { line: n + 1, source }),
        }
    }
    if failed > 0 {
        return Err(CtlError::Failed(failed));
    }
    Ok(())
}

fn main() {
    let args = CmdArgs::parse();
    if let Some(tracing) = args.tracing()
        && let Err(e) = get_trace_ctl().setup_from_string(tracing)
    {
        error!("Invalid tracing configuration: {e}");
        std::process::exit(1);
    }
    if args.show_tracing_targets() {
        println!("{}", get_trace_ctl().dump());
        std::process::exit(0);
    }
    /* install the subscriber before anything logs */
    get_trace_ctl();

    if let Err(e) = run(&args) {
        error!("{e}");
        std::process::exit(1);
    }
}
