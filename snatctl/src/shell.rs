// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Execution of control commands against an engine

use crate::command::{Command, CommandError};
use nat::{FibResolver, NatEngine, NatError, NatTranslation};
use std::time::Instant;
use tracectl::{LevelFilter, trace_target};
use tracing::debug;

trace_target!("snatctl-shell", LevelFilter::INFO, &["snatctl"]);

pub(crate) struct Shell<R: FibResolver> {
    engine: NatEngine<R>,
}

impl<R: FibResolver> Shell<R> {
    pub(crate) fn new(engine: NatEngine<R>) -> Self {
        Self { engine }
    }

    #[cfg(test)]
    pub(crate) fn engine(&self) -> &NatEngine<R> {
        &self.engine
    }

    /// Run one command, returning what it prints.
    pub(crate) fn execute(&mut self, command: &Command) -> Result<String, CommandError> {
        debug!("Executing {command:?}");
        let out = match command {
            Command::AddAddress { first, last } => {
                self.engine.add_address_range(*first, *last)?;
                String::new()
            }
            Command::StaticMapping { request, is_add } => {
                let result = if *is_add {
                    self.engine.add_static_mapping(request).map(|_| ())
                } else {
                    self.engine.del_static_mapping(request)
                };
                result.map_err(|e| match e {
                    NatError::PortInUse(_) => CommandError::PortInUse,
                    NatError::NoSuchEntry if *is_add => CommandError::ExternalNotAllocated,
                    e => CommandError::Nat(e),
                })?;
                String::new()
            }
            Command::Show(level) => self.engine.show(*level).to_string(),
            Command::ShowConfig => format!("{}\n", self.engine.config()),
            Command::Translate {
                direction,
                key,
                len,
            } => {
                let NatTranslation { key, session } = self.engine.translate(*direction, key)?;
                if let Some(id) = session {
                    self.engine.touch(id, *len, Instant::now())?;
                    format!("{key} session {id}\n")
                } else {
                    format!("{key}\n")
                }
            }
            Command::Expire(timeout) => {
                let expired = self.engine.expire_idle(Instant::now(), *timeout);
                format!("{expired} sessions expired\n")
            }
        };
        Ok(out)
    }

    /// Parse and run one script line. Blank lines and `#` comments print nothing.
    pub(crate) fn execute_line(&mut self, line: &str) -> Result<String, CommandError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(String::new());
        }
        self.execute(&line.parse()?)
    }
}
