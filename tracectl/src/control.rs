// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Runtime control of log levels

use crate::LevelFilter;
use crate::targets::LOG_TARGETS;
use crate::trace_target;
use ordermap::OrderMap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, OnceLock};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, Registry, prelude::*, reload};

trace_target!("tracectl", LevelFilter::INFO, &[]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceCtlError {
    #[error("invalid syntax '{0}': expected tag=level")]
    InvalidSyntax(String),
    #[error("invalid log level '{0}'")]
    InvalidLevel(String),
    #[error("unknown tag '{0}'")]
    UnknownTag(String),
}

/// Configuration for one registered target
#[derive(Debug, Clone)]
pub struct TargetCfg {
    pub(crate) target: &'static str,
    pub(crate) level: LevelFilter,
    pub(crate) tags: Vec<&'static str>,
}

impl TargetCfg {
    #[must_use]
    pub fn target(&self) -> &'static str {
        self.target
    }
    #[must_use]
    pub fn level(&self) -> LevelFilter {
        self.level
    }
    #[must_use]
    pub fn tags(&self) -> &[&'static str] {
        &self.tags
    }
}

#[derive(Debug)]
pub(crate) struct TargetDb {
    pub(crate) default: LevelFilter,
    pub(crate) targets: OrderMap<&'static str, TargetCfg>,
    pub(crate) tags: OrderMap<&'static str, Vec<&'static str>>,
}

impl TargetDb {
    fn from_registry(default: LevelFilter) -> Self {
        let mut db = Self {
            default,
            targets: OrderMap::new(),
            tags: OrderMap::new(),
        };
        for t in LOG_TARGETS {
            db.register(t.target, t.name, t.level, t.tags);
        }
        db
    }

    fn register(
        &mut self,
        target: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) {
        // the short name always doubles as a tag
        let mut all_tags = tags.to_vec();
        if !all_tags.contains(&name) {
            all_tags.push(name);
        }
        for tag in &all_tags {
            let members = self.tags.entry(*tag).or_default();
            if !members.contains(&target) {
                members.push(target);
            }
        }
        let cfg = TargetCfg {
            target,
            level,
            tags: all_tags,
        };
        if self.targets.insert(target, cfg).is_some() {
            warn!("Tracing target {target} declared more than once");
        }
    }

    fn env_filter(&self) -> EnvFilter {
        self.targets.values().fold(
            EnvFilter::new(self.default.to_string()),
            |filter, cfg| match format!("{}={}", cfg.target, cfg.level).parse() {
                Ok(directive) => filter.add_directive(directive),
                Err(_) => filter,
            },
        )
    }

    fn set_tag_level(&mut self, tag: &str, level: LevelFilter) -> Result<usize, TraceCtlError> {
        let members = self
            .tags
            .get(tag)
            .ok_or_else(|| TraceCtlError::UnknownTag(tag.to_string()))?
            .clone();
        let mut changed = 0;
        for target in members {
            if let Some(cfg) = self.targets.get_mut(target)
                && cfg.level != level
            {
                cfg.level = level;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

/// Parse a comma-separated list of `tag=level` items.
pub(crate) fn parse_levels(input: &str) -> Result<Vec<(String, LevelFilter)>, TraceCtlError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (tag, level) = item
                .split_once('=')
                .ok_or_else(|| TraceCtlError::InvalidSyntax(item.to_string()))?;
            let level = LevelFilter::from_str(level.trim())
                .map_err(|_| TraceCtlError::InvalidLevel(level.trim().to_string()))?;
            Ok((tag.trim().to_string(), level))
        })
        .collect()
}

/// Owner of the log-level database and of the reload handle of the installed filter.
#[derive(Debug)]
pub struct TraceCtl {
    db: Mutex<TargetDb>,
    reload: reload::Handle<EnvFilter, Registry>,
}

static TRACE_CTL: OnceLock<TraceCtl> = OnceLock::new();

/// Get the process-wide [`TraceCtl`], installing the tracing subscriber on first use.
pub fn get_trace_ctl() -> &'static TraceCtl {
    TRACE_CTL.get_or_init(TraceCtl::install)
}

impl TraceCtl {
    fn install() -> Self {
        let db = TargetDb::from_registry(LevelFilter::INFO);
        let (filter, reload) = reload::Layer::new(db.env_filter());
        let fmt = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_line_number(true)
            .with_thread_names(true);
        if tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .try_init()
            .is_err()
        {
            // tests may have installed their own subscriber already
            debug!("A global tracing subscriber was already installed");
        }
        Self {
            db: Mutex::new(db),
            reload,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TargetDb> {
        self.db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn apply(&self, db: &TargetDb) {
        if let Err(e) = self.reload.reload(db.env_filter()) {
            warn!("Failed to reload tracing filter: {e}");
        }
    }

    /// Set the level of all targets carrying `tag`.
    ///
    /// # Errors
    ///
    /// Fails with [`TraceCtlError::UnknownTag`] if no target carries the tag.
    pub fn set_tag_level(&self, tag: &str, level: LevelFilter) -> Result<(), TraceCtlError> {
        let mut db = self.lock();
        let changed = db.set_tag_level(tag, level)?;
        if changed > 0 {
            self.apply(&db);
        }
        info!("Log level for tag '{tag}' set to {level} ({changed} targets changed)");
        Ok(())
    }

    pub fn set_level_all(&self, level: LevelFilter) {
        let mut db = self.lock();
        db.targets.values_mut().for_each(|cfg| cfg.level = level);
        self.apply(&db);
    }

    pub fn set_default_level(&self, level: LevelFilter) {
        let mut db = self.lock();
        if db.default != level {
            db.default = level;
            self.apply(&db);
        }
    }

    #[must_use]
    pub fn default_level(&self) -> LevelFilter {
        self.lock().default
    }

    /// Apply a `tag=level,...` configuration string. The pseudo-tags `default` and `all` set the
    /// default level and the level of every target; other tags are applied afterwards, so that
    /// `all=warn,nat=debug` works as expected.
    ///
    /// # Errors
    ///
    /// Fails if the string is malformed or names an unknown tag. Nothing is applied in that case.
    pub fn setup_from_string(&self, input: &str) -> Result<(), TraceCtlError> {
        let levels = parse_levels(input)?;
        {
            let db = self.lock();
            if let Some((tag, _)) = levels.iter().find(|(tag, _)| {
                tag != "default" && tag != "all" && !db.tags.contains_key(tag.as_str())
            }) {
                return Err(TraceCtlError::UnknownTag(tag.clone()));
            }
        }
        for (tag, level) in &levels {
            match tag.as_str() {
                "default" => self.set_default_level(*level),
                "all" => self.set_level_all(*level),
                _ => {}
            }
        }
        for (tag, level) in levels
            .iter()
            .filter(|(tag, _)| tag != "default" && tag != "all")
        {
            self.set_tag_level(tag, *level)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn target(&self, target: &str) -> Option<TargetCfg> {
        self.lock().targets.get(target).cloned()
    }

    #[must_use]
    pub fn targets_by_tag(&self, tag: &str) -> Vec<TargetCfg> {
        let db = self.lock();
        db.tags
            .get(tag)
            .into_iter()
            .flatten()
            .filter_map(|target| db.targets.get(target).cloned())
            .collect()
    }

    /// Render the current configuration as a table.
    #[must_use]
    pub fn dump(&self) -> String {
        self.lock().to_string()
    }
}
