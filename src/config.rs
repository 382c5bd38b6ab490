//! Ambient runner settings from the environment or a JSON file

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{env_vars, SPAWN_SERVER_ENV};
use crate::dataset::{Dataset, SubsampleCacheStrategy};
use crate::error::{Result, RunnerError};
use crate::limiter::LimiterSettings;
use crate::logging::ExecutionContext;
use crate::runner::RunOptions;

/// Settings shared by every run of one process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Parent directory for mailboxes; the current directory when unset
    pub working_dir: Option<PathBuf>,
    pub spawn_server: Option<PathBuf>,
    /// Run every candidate in-process
    pub disable_limits: bool,
    pub subsample_strategy: Option<SubsampleCacheStrategy>,
    /// Child log level; `info` when unset
    pub log_verbosity: Option<String>,
}

impl RunnerSettings {
    /// Settings from the `KOLOSAL_RUNNER_*` and `KOLOSAL_SPAWN_SERVER` variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Settings from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let settings = Self {
            working_dir: non_empty(env_vars::WORKING_DIR).map(PathBuf::from),
            spawn_server: non_empty(SPAWN_SERVER_ENV).map(PathBuf::from),
            disable_limits: non_empty(env_vars::DISABLE_LIMITS)
                .map(|v| parse_flag(env_vars::DISABLE_LIMITS, &v))
                .transpose()?
                .unwrap_or(false),
            subsample_strategy: non_empty(env_vars::SUBSAMPLE_STRATEGY)
                .map(|v| v.parse())
                .transpose()?,
            log_verbosity: non_empty(env_vars::LOG_VERBOSITY),
        };
        debug!(settings = ?settings, "Loaded runner settings from the environment");
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Fill unset fields from `other`
    pub fn or(self, other: RunnerSettings) -> Self {
        Self {
            working_dir: self.working_dir.or(other.working_dir),
            spawn_server: self.spawn_server.or(other.spawn_server),
            disable_limits: self.disable_limits || other.disable_limits,
            subsample_strategy: self.subsample_strategy.or(other.subsample_strategy),
            log_verbosity: self.log_verbosity.or(other.log_verbosity),
        }
    }

    pub fn execution_context(&self) -> ExecutionContext {
        match &self.log_verbosity {
            Some(level) => ExecutionContext::default().with_verbosity(level.clone()),
            None => ExecutionContext::default(),
        }
    }

    pub fn limiter_settings(&self) -> LimiterSettings {
        let base = if self.disable_limits {
            LimiterSettings::disabled()
        } else {
            LimiterSettings::default()
        };
        let base = base.with_context(self.execution_context());
        match &self.spawn_server {
            Some(path) => base.with_server_path(path),
            None => base,
        }
    }

    /// `options` with the working dir and limit switch applied
    pub fn apply_to_options(&self, mut options: RunOptions) -> RunOptions {
        if options.working_dir.is_none() {
            options.working_dir = self.working_dir.clone();
        }
        if self.disable_limits {
            options.enforce_limits = false;
        }
        options
    }

    pub fn apply_to_dataset(&self, dataset: &mut Dataset) {
        if let Some(strategy) = self.subsample_strategy {
            dataset.set_subsample_strategy(strategy);
        }
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(RunnerError::invalid_option(key, other, "expected a boolean flag")),
    }
}
