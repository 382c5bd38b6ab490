//! Kolosal Runner - AutoML pipeline execution core
//!
//! Runs one candidate pipeline at a time against a dataset and returns its
//! scores, isolated in a resource-limited child process.
//!
//! # Modules
//!
//! ## Execution
//! - [`runner`] - Train / predict / score one candidate per regime
//! - [`limiter`] - Wall, CPU, memory and process caps around a child process
//!
//! ## Data
//! - [`dataset`] - Splits, CV folds, subsampling and scoped caching
//! - [`data`] - Dense, sparse and labelled tabular views
//! - [`cache`] - Byte stores backing a dataset's heavy fields
//! - [`problem_info`] - Problem description and time-budget bookkeeping
//!
//! ## Pipelines
//! - [`pipeline`] - Pipeline specs and their instantiation
//! - [`estimators`] - Learners, preprocessors and ensembles
//! - [`metrics`] - Classification, regression and forecasting scorers
//!
//! ## Ambient
//! - [`config`] - Environment and file settings
//! - [`logging`] - Subscriber setup for the binaries and the child
//! - [`cli`] - Command-line interface

// Core error handling
pub mod error;
pub mod constants;

// Data
pub mod cache;
pub mod data;
pub mod dataset;
pub mod problem_info;

// Pipelines
pub mod estimators;
pub mod metrics;
pub mod pipeline;

// Execution
pub mod limiter;
pub mod runner;

// Ambient
pub mod cli;
pub mod config;
pub mod logging;

pub use error::{Result, RunnerError};

/// Prelude for common imports
pub mod prelude {
    pub use crate::dataset::{Dataset, DatasetBuilder, SubsampleCacheStrategy};
    pub use crate::error::{Result, RunnerError};
    pub use crate::limiter::{LimiterSettings, ResourceCaps, ResourceLimiter};
    pub use crate::logging::ExecutionContext;
    pub use crate::metrics::{MetricMap, MetricValue};
    pub use crate::pipeline::{ObjectSpec, PipelineSpec, SpecClass};
    pub use crate::problem_info::{ProblemInfo, Task};
    pub use crate::runner::{ClientRunner, Regime, RunOptions, TrainingResult};
}
