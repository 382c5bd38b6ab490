//! Error types for the candidate execution core
//!
//! Every failure a caller can observe is a [`RunnerError`]. The enum is
//! serializable because errors raised inside the spawned child travel back to
//! the parent through the `error` mailbox file.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limiter::traceback::TracebackSurrogate;

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Configuration failures
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigErrorKind {
    #[error("Model not supported: {class_name}")]
    ModelNotSupported { class_name: String },

    #[error("Invalid option {name} = {value}: {reason}")]
    InvalidOption {
        name: String,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Other(String),
}

/// Coarse category used for telemetry and exit reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Config,
    Data,
    Fit,
    Predict,
    Resource,
    Timeout,
    Subprocess,
    Pipeline,
    System,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Config => "config",
            ErrorCategory::Data => "data",
            ErrorCategory::Fit => "fit",
            ErrorCategory::Predict => "predict",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Subprocess => "subprocess",
            ErrorCategory::Pipeline => "pipeline",
            ErrorCategory::System => "system",
        };
        f.write_str(name)
    }
}

/// Main error type for the runner
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    ConfigError(ConfigErrorKind),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Fit error in {learner}: {message}")]
    FitError { learner: String, message: String },

    #[error("Predict error: {0}")]
    PredictError(String),

    #[error("Insufficient memory: {detail}")]
    InsufficientMemory {
        pid: Option<u32>,
        anon_rss_kb: Option<u64>,
        detail: String,
    },

    #[error("Insufficient memory likely: process {pid} terminated by signal {signal}")]
    InsufficientMemoryLikely { pid: u32, signal: i32 },

    #[error("Iteration timed out after {wall_time_s:.3}s")]
    IterationTimeout { wall_time_s: f64 },

    #[error("CPU time limit of {cpu_time_s:?}s exceeded")]
    CpuTimeout { cpu_time_s: Option<f64> },

    #[error("Subprocess exited with code {return_code}: {stderr}")]
    SubprocessError { return_code: i32, stderr: String },

    #[error("Pipeline error: {message}")]
    PipelineError {
        message: String,
        traceback: Option<TracebackSurrogate>,
    },

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Model not fitted")]
    ModelNotFitted,

    #[error("Computation error: {0}")]
    ComputationError(String),

    #[error("Task panicked: {0}")]
    Panic(String),

    #[error("Traceback surrogates cannot be resumed")]
    TracebackNotResumable,
}

impl RunnerError {
    /// Shorthand for an unsupported class
    pub fn model_not_supported(class_name: impl Into<String>) -> Self {
        RunnerError::ConfigError(ConfigErrorKind::ModelNotSupported {
            class_name: class_name.into(),
        })
    }

    /// Shorthand for an invalid constructor option
    pub fn invalid_option(
        name: impl Into<String>,
        value: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        RunnerError::ConfigError(ConfigErrorKind::InvalidOption {
            name: name.into(),
            value: value.to_string(),
            reason: reason.into(),
        })
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            RunnerError::ConfigError(_) => ErrorCategory::Config,
            RunnerError::DataError(_) | RunnerError::ShapeError { .. } => ErrorCategory::Data,
            RunnerError::FitError { .. } | RunnerError::ModelNotFitted => ErrorCategory::Fit,
            RunnerError::PredictError(_) => ErrorCategory::Predict,
            RunnerError::InsufficientMemory { .. } | RunnerError::InsufficientMemoryLikely { .. } => {
                ErrorCategory::Resource
            }
            RunnerError::IterationTimeout { .. } | RunnerError::CpuTimeout { .. } => {
                ErrorCategory::Timeout
            }
            RunnerError::SubprocessError { .. } => ErrorCategory::Subprocess,
            RunnerError::PipelineError { .. } | RunnerError::Panic(_) => ErrorCategory::Pipeline,
            RunnerError::IoError(_)
            | RunnerError::SerializationError(_)
            | RunnerError::ComputationError(_)
            | RunnerError::TracebackNotResumable => ErrorCategory::System,
        }
    }

    /// Whether this error is one of the runner's own classifications.
    ///
    /// Unclassified errors coming out of a task are wrapped in
    /// [`RunnerError::PipelineError`] by the limiter.
    pub fn is_classified(&self) -> bool {
        matches!(
            self,
            RunnerError::ConfigError(_)
                | RunnerError::DataError(_)
                | RunnerError::FitError { .. }
                | RunnerError::PredictError(_)
                | RunnerError::InsufficientMemory { .. }
                | RunnerError::InsufficientMemoryLikely { .. }
                | RunnerError::IterationTimeout { .. }
                | RunnerError::CpuTimeout { .. }
                | RunnerError::SubprocessError { .. }
                | RunnerError::PipelineError { .. }
        )
    }

    /// Message with user data scrubbed, suitable for telemetry
    pub fn generic_message(&self) -> String {
        match self {
            RunnerError::ConfigError(ConfigErrorKind::ModelNotSupported { class_name }) => {
                format!("The model {} is not supported by this runner.", class_name)
            }
            RunnerError::ConfigError(ConfigErrorKind::InvalidOption { name, .. }) => {
                format!("The option {} has an unsupported value.", name)
            }
            RunnerError::ConfigError(_) => "The pipeline configuration is invalid.".to_string(),
            RunnerError::DataError(_) | RunnerError::ShapeError { .. } => {
                "The input data is invalid for this pipeline.".to_string()
            }
            RunnerError::FitError { learner, .. } => {
                format!("Failed to fit the input data using {}.", learner)
            }
            RunnerError::ModelNotFitted => "A pipeline step was used before fitting.".to_string(),
            RunnerError::PredictError(_) => "The fitted pipeline failed to predict.".to_string(),
            RunnerError::InsufficientMemory { .. } => {
                "The iteration ran out of memory.".to_string()
            }
            RunnerError::InsufficientMemoryLikely { .. } => {
                "The iteration was terminated, most likely for lack of memory.".to_string()
            }
            RunnerError::IterationTimeout { .. } => {
                "The iteration exceeded its wall-clock time limit.".to_string()
            }
            RunnerError::CpuTimeout { .. } => "The iteration exceeded its CPU time limit.".to_string(),
            RunnerError::SubprocessError { return_code, .. } => {
                format!("The training subprocess exited with code {}.", return_code)
            }
            RunnerError::PipelineError { .. } | RunnerError::Panic(_) => {
                "The pipeline raised an unexpected error.".to_string()
            }
            RunnerError::IoError(_)
            | RunnerError::SerializationError(_)
            | RunnerError::ComputationError(_)
            | RunnerError::TracebackNotResumable => "An internal system error occurred.".to_string(),
        }
    }

    /// Traceback captured on the child side, if any
    pub fn traceback(&self) -> Option<&TracebackSurrogate> {
        match self {
            RunnerError::PipelineError { traceback, .. } => traceback.as_ref(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RunnerError {
    fn from(err: std::io::Error) -> Self {
        RunnerError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for RunnerError {
    fn from(err: serde_json::Error) -> Self {
        RunnerError::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for RunnerError {
    fn from(err: bincode::Error) -> Self {
        RunnerError::SerializationError(err.to_string())
    }
}

impl From<polars::prelude::PolarsError> for RunnerError {
    fn from(err: polars::prelude::PolarsError) -> Self {
        RunnerError::DataError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for RunnerError {
    fn from(err: ndarray::ShapeError) -> Self {
        RunnerError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RunnerError::DataError("test error".to_string());
        assert_eq!(err.to_string(), "Data error: test error");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RunnerError = io_err.into();
        assert!(matches!(err, RunnerError::IoError(_)));
        assert_eq!(err.category(), ErrorCategory::System);
        assert!(!err.is_classified());
    }

    #[test]
    fn test_model_not_supported_generic_message() {
        let err = RunnerError::model_not_supported("MysteryNet");
        assert_eq!(err.category(), ErrorCategory::Config);
        assert!(err.generic_message().contains("MysteryNet"));
    }

    #[test]
    fn test_fit_error_scrubs_learner_message() {
        let err = RunnerError::FitError {
            learner: "Ridge".to_string(),
            message: "row 17 contains customer_id=991".to_string(),
        };
        let generic = err.generic_message();
        assert!(generic.contains("Ridge"));
        assert!(!generic.contains("customer_id"));
    }

    #[test]
    fn test_error_bincode_roundtrip() {
        let err = RunnerError::IterationTimeout { wall_time_s: 1.5 };
        let bytes = bincode::serialize(&err).unwrap();
        let back: RunnerError = bincode::deserialize(&bytes).unwrap();
        assert!(matches!(back, RunnerError::IterationTimeout { wall_time_s } if wall_time_s == 1.5));
    }
}
