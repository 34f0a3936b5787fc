// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Display implementations

use crate::control::{TargetCfg, TargetDb};
use std::fmt::Display;

macro_rules! TARGET_FMT {
    () => {
        "{:>40} │ {:>6} │ {}"
    };
}

impl Display for TargetCfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            TARGET_FMT!(),
            self.target,
            self.level.to_string(),
            self.tags.join(",")
        )
    }
}

impl Display for TargetDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:─^70}", " Log levels ")?;
        writeln!(f, TARGET_FMT!(), "TARGET", "LEVEL", "TAGS")?;
        for cfg in self.targets.values() {
            writeln!(f, "{cfg}")?;
        }
        write!(f, TARGET_FMT!(), "(default)", self.default.to_string(), "--")
    }
}
