//! Logging setup for the binaries and the spawned child
//!
//! The parent describes how the child should log through an
//! [`ExecutionContext`], written to the mailbox `config` file. The child
//! applies it with [`init_child_logging`] before any task code runs.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::constants::{CHILD_LOG_FILE_ENV, DEFAULT_LOG_FILTER};
use crate::error::Result;

/// Ambient state carried from the parent into the child process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Directories the child should search for side-channel files
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
    /// Log targets enabled in the child, e.g. `kolosal_runner`
    #[serde(default)]
    pub logger_names: Vec<String>,
    /// One of `error`, `warn`, `info`, `debug`, `trace`
    pub log_verbosity: String,
    /// Extra fields stamped on the child's root span
    #[serde(default)]
    pub custom_dimensions: BTreeMap<String, String>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            logger_names: vec!["kolosal_runner".to_string()],
            log_verbosity: "info".to_string(),
            custom_dimensions: BTreeMap::new(),
        }
    }
}

impl ExecutionContext {
    pub fn with_verbosity(mut self, verbosity: impl Into<String>) -> Self {
        self.log_verbosity = verbosity.into();
        self
    }

    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_dimensions.insert(key.into(), value.into());
        self
    }

    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// `EnvFilter` directive string, e.g. `kolosal_runner=debug`
    pub fn filter_directives(&self) -> String {
        if self.logger_names.is_empty() {
            return self.log_verbosity.clone();
        }
        self.logger_names
            .iter()
            .map(|name| format!("{}={}", name, self.log_verbosity))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Install the subscriber for the CLI: `RUST_LOG`, else `kolosal_runner=info`
pub fn init_cli_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .try_init();
}

/// Install the child's subscriber from `context`
///
/// Output goes to the file named by `KOLOSAL_RUNNER_LOG_FILE` when it is set
/// and can be opened, else to stderr, which the parent captures. Returns the
/// log file in use, if any. Calling this twice is harmless.
pub fn init_child_logging(context: &ExecutionContext) -> Option<PathBuf> {
    let filter = EnvFilter::try_new(context.filter_directives())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let log_file = std::env::var_os(CHILD_LOG_FILE_ENV).map(PathBuf::from);
    let opened = log_file.as_deref().and_then(open_append);

    let installed = match opened {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .try_init()
            .is_ok(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok(),
    };
    if installed && !context.custom_dimensions.is_empty() {
        tracing::info!(dimensions = ?context.custom_dimensions, "Child logging configured");
    }
    log_file.filter(|p| p.exists())
}

fn open_append(path: &Path) -> Option<std::fs::File> {
    OpenOptions::new().create(true).append(true).open(path).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        let ctx = ExecutionContext::default().with_verbosity("debug");
        assert_eq!(ctx.filter_directives(), "kolosal_runner=debug");

        let bare = ExecutionContext {
            logger_names: Vec::new(),
            ..ExecutionContext::default()
        };
        assert_eq!(bare.filter_directives(), "info");
    }

    #[test]
    fn test_context_json_roundtrip() {
        let ctx = ExecutionContext::default()
            .with_dimension("run_id", "r-17")
            .with_search_path("/tmp/models");
        let back = ExecutionContext::from_json(&ctx.to_json().unwrap()).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let ctx = ExecutionContext::from_json(r#"{"log_verbosity": "warn"}"#).unwrap();
        assert!(ctx.logger_names.is_empty());
        assert_eq!(ctx.filter_directives(), "warn");
    }
}
