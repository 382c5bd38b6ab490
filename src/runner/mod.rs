//! Client runner: train, predict and score one candidate pipeline
//!
//! [`ClientRunner::run`] ships the dataset, the pipeline spec and the problem
//! description to the [`TrainCandidateTask`] through a [`ResourceLimiter`].
//! Regimes run inside that task, in the order given, and fill one
//! [`TrainingResult`]. Nothing escapes `run`: every failure comes back in the
//! error slot.

mod regimes;
mod result;
mod task;

pub use result::TrainingResult;
pub use task::{TrainCandidateInput, TrainCandidateTask, TRAIN_CANDIDATE_TASK};

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::dataset::Dataset;
use crate::error::{Result, RunnerError};
use crate::limiter::{LimiterSettings, ResourceCaps, ResourceLimiter};
use crate::logging::ExecutionContext;
use crate::pipeline::PipelineSpec;
use crate::problem_info::{ProblemInfo, Task};

/// How a candidate is trained and evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    TrainAndValidation,
    TrainValidateTest,
    TrainFull,
    MeanCrossValidation,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Regime::TrainAndValidation => "train-validate",
            Regime::TrainValidateTest => "train-validate-test",
            Regime::TrainFull => "train-full",
            Regime::MeanCrossValidation => "cv",
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Regime {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "train-validate" | "trainandvalidation" => Ok(Regime::TrainAndValidation),
            "train-validate-test" | "trainvalidatetest" => Ok(Regime::TrainValidateTest),
            "train-full" | "trainfull" => Ok(Regime::TrainFull),
            "cv" | "meancrossvalidation" => Ok(Regime::MeanCrossValidation),
            other => Err(RunnerError::invalid_option(
                "regime",
                other,
                "expected train-validate, train-validate-test, train-full or cv",
            )),
        }
    }
}

/// Per-call options of [`ClientRunner::run`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    /// Train on this percentage of the training split; `None` keeps all rows
    pub subsample_percent: Option<f64>,
    /// Run in a resource-limited child process
    pub enforce_limits: bool,
    pub is_ensemble: bool,
    pub random_state: u64,
    /// Return the fitted chains with the metrics
    pub include_models: bool,
    pub subsample_seed: u64,
    /// Where the mailbox is created; the current directory when unset
    pub working_dir: Option<PathBuf>,
    /// Score the full-data model on the data it was trained on
    pub compute_metrics_for_train_full: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            subsample_percent: None,
            enforce_limits: true,
            is_ensemble: false,
            random_state: 0,
            include_models: false,
            subsample_seed: 0,
            working_dir: None,
            compute_metrics_for_train_full: false,
        }
    }
}

impl RunOptions {
    pub fn with_subsample(mut self, percent: f64, seed: u64) -> Self {
        self.subsample_percent = Some(percent);
        self.subsample_seed = seed;
        self
    }

    pub fn with_enforce_limits(mut self, enforce: bool) -> Self {
        self.enforce_limits = enforce;
        self
    }

    pub fn with_ensemble(mut self, is_ensemble: bool) -> Self {
        self.is_ensemble = is_ensemble;
        self
    }

    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = seed;
        self
    }

    pub fn with_models(mut self, include: bool) -> Self {
        self.include_models = include;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_train_full_metrics(mut self, compute: bool) -> Self {
        self.compute_metrics_for_train_full = compute;
        self
    }
}

/// What the scorers need, shipped to the child with every task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringSettings {
    pub metrics: Vec<String>,
    pub task: Task,
    pub use_binary_metrics: bool,
    pub enable_metric_confidence: bool,
}

/// Runs candidates for one experiment
#[derive(Debug, Clone)]
pub struct ClientRunner {
    scoring: ScoringSettings,
    execution_context: ExecutionContext,
    limiter_settings: LimiterSettings,
}

impl ClientRunner {
    pub fn new(
        metrics: Vec<String>,
        task: Task,
        execution_context: ExecutionContext,
        use_binary_metrics: bool,
        enable_metric_confidence: bool,
    ) -> Self {
        Self {
            scoring: ScoringSettings {
                metrics,
                task,
                use_binary_metrics,
                enable_metric_confidence,
            },
            execution_context,
            limiter_settings: LimiterSettings::default(),
        }
    }

    /// Spawn server location, poll interval and child log file for limited runs
    pub fn with_limiter_settings(mut self, settings: LimiterSettings) -> Self {
        self.limiter_settings = settings;
        self
    }

    pub fn scoring(&self) -> &ScoringSettings {
        &self.scoring
    }

    /// Limiter for this candidate
    ///
    /// A spec that stops itself on a deadline runs in-process with unbounded
    /// caps, as does any run with `enforce_limits` off.
    pub fn limiter_for(&self, spec: &PipelineSpec, problem_info: &ProblemInfo, enforce_limits: bool) -> ResourceLimiter {
        if spec.supports_constrained_fit() || !enforce_limits {
            return ResourceLimiter::new(
                ResourceCaps::default(),
                LimiterSettings::disabled().with_context(self.execution_context.clone()),
            );
        }
        ResourceLimiter::new(
            problem_info.runtime_constraints.clone(),
            self.limiter_settings
                .clone()
                .with_context(self.execution_context.clone()),
        )
    }

    /// Train and score `spec` on `dataset` for every regime, in order
    pub fn run(
        &self,
        dataset: &Dataset,
        spec: &PipelineSpec,
        problem_info: &ProblemInfo,
        regimes: &[Regime],
        options: &RunOptions,
    ) -> (Option<TrainingResult>, Option<RunnerError>) {
        let working_dir = match resolve_working_dir(options.working_dir.as_deref()) {
            Ok(dir) => dir,
            Err(e) => return (None, Some(e)),
        };
        let input = match TrainCandidateInput::new(dataset, spec, problem_info, regimes, options, &self.scoring) {
            Ok(input) => input,
            Err(e) => return (None, Some(e)),
        };

        let limiter = self.limiter_for(spec, problem_info, options.enforce_limits);
        info!(
            pipeline_id = %spec.pipeline_id,
            pipeline = %spec.summary(),
            isolated = limiter.settings().enabled,
            ensemble = options.is_ensemble,
            "Running candidate"
        );

        let outcome = limiter.execute(&working_dir, &TrainCandidateTask, input);
        match (outcome.value, outcome.error) {
            (_, Some(e)) => {
                error!(pipeline_id = %spec.pipeline_id, error = %e, category = ?e.category(), "Candidate failed");
                (None, Some(e))
            }
            (Some(mut result), None) => {
                result.wall_time = Some(outcome.wall_time_s);
                (Some(result), None)
            }
            (None, None) => (
                None,
                Some(RunnerError::PipelineError {
                    message: "candidate produced neither a result nor an error".to_string(),
                    traceback: None,
                }),
            ),
        }
    }
}

fn resolve_working_dir(dir: Option<&Path>) -> Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir.to_path_buf()),
        None => Ok(std::env::current_dir()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ObjectSpec, SpecClass};

    #[test]
    fn test_regime_parse() {
        assert_eq!("cv".parse::<Regime>().unwrap(), Regime::MeanCrossValidation);
        assert_eq!("train_full".parse::<Regime>().unwrap(), Regime::TrainFull);
        assert!("holdout".parse::<Regime>().is_err());
    }

    #[test]
    fn test_self_terminating_spec_runs_in_process() {
        let runner = ClientRunner::new(vec![], Task::Regression, ExecutionContext::default(), false, false);
        let mut info = ProblemInfo::new(Task::Regression);
        info.runtime_constraints = ResourceCaps::default().with_wall_time(5.0);

        let plain = PipelineSpec::new(
            "p",
            vec![ObjectSpec::new(SpecClass::Estimator, "kolosal.estimators", "Ridge")],
        );
        let limited = runner.limiter_for(&plain, &info, true);
        assert!(limited.settings().enabled);
        assert_eq!(limited.caps().wall_time_in_s, Some(5.0));

        let constrained = PipelineSpec::new(
            "p",
            vec![ObjectSpec::new(SpecClass::Estimator, "kolosal.estimators", "Ridge").with_constrained_fit()],
        );
        let free = runner.limiter_for(&constrained, &info, true);
        assert!(!free.settings().enabled);
        assert!(free.caps().is_unbounded());
        assert!(!runner.limiter_for(&plain, &info, false).settings().enabled);
    }
}
