//! Problem metadata and runtime constraints for one candidate
//!
//! A [`ProblemInfo`] is handed to every component of a run. Most fields are
//! set once from the dataset; the runtime constraints and time tracking are
//! updated while the search progresses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::limiter::ResourceCaps;

/// Learning task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Classification,
    Regression,
    Forecasting,
}

impl Task {
    /// Forecasting is scored as regression on the target
    pub fn is_regression_like(self) -> bool {
        matches!(self, Task::Regression | Task::Forecasting)
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Task::Classification => "classification",
            Task::Regression => "regression",
            Task::Forecasting => "forecasting",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Task {
    type Err = crate::error::RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "classification" => Ok(Task::Classification),
            "regression" => Ok(Task::Regression),
            "forecasting" => Ok(Task::Forecasting),
            other => Err(crate::error::RunnerError::invalid_option(
                "task",
                other,
                "expected classification, regression or forecasting",
            )),
        }
    }
}

/// Which clocks bound the search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeConstraintMode {
    /// Only the per-iteration wall time is enforced
    #[default]
    Iteration,
    /// Only the total experiment time is enforced
    Total,
    /// Both the per-iteration and the total time are enforced
    TotalAndIteration,
}

impl TimeConstraintMode {
    pub fn tracks_total(self) -> bool {
        matches!(self, TimeConstraintMode::Total | TimeConstraintMode::TotalAndIteration)
    }
}

/// Signals sent by the orchestrating service between iterations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ServerCode {
    Continue = 0,
    IncreaseTimeThreshold = 1,
}

impl ServerCode {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ServerCode::Continue),
            1 => Some(ServerCode::IncreaseTimeThreshold),
            _ => None,
        }
    }
}

/// Number of threshold signals absorbed before the time constraint grows
const SERVER_CODE_BUFFER_LIMIT: u32 = 3;
const TIME_CONSTRAINT_GROWTH: f64 = 1.5;

/// Column bindings used by streaming learners
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnNames {
    pub feature: Vec<String>,
    pub label: Option<String>,
    pub weight: Option<String>,
}

/// Timeseries settings shared by the dataset, the estimators and the scorers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesParams {
    pub time_column_name: Option<String>,
    #[serde(default)]
    pub grain_column_names: Vec<String>,
    #[serde(default = "default_max_horizon")]
    pub max_horizon: usize,
    #[serde(default)]
    pub seasonality: Option<usize>,
    /// Column flagging rows whose target was imputed during featurization
    #[serde(default)]
    pub target_imputed_column: Option<String>,
    /// Column holding each row's forecast horizon
    #[serde(default)]
    pub horizon_column: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

fn default_max_horizon() -> usize {
    1
}

impl TimeseriesParams {
    pub fn new(time_column_name: impl Into<String>) -> Self {
        Self {
            time_column_name: Some(time_column_name.into()),
            max_horizon: 1,
            ..Default::default()
        }
    }

    pub fn with_grains(mut self, grains: Vec<String>) -> Self {
        self.grain_column_names = grains;
        self
    }

    pub fn with_max_horizon(mut self, max_horizon: usize) -> Self {
        self.max_horizon = max_horizon;
        self
    }

    pub fn with_seasonality(mut self, seasonality: usize) -> Self {
        self.seasonality = Some(seasonality);
        self
    }

    pub fn with_horizon_column(mut self, column: impl Into<String>) -> Self {
        self.horizon_column = Some(column.into());
        self
    }
}

/// Pipeline profile, stored as a scalar until a second profile arrives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PipelineProfile {
    Single(String),
    Many(Vec<String>),
}

/// Dataset cardinalities plus runtime constraints for one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemInfo {
    pub task: Task,
    pub num_samples: usize,
    pub num_features: usize,
    pub num_classes: Option<usize>,
    pub num_categorical: usize,
    pub y_std: Option<f64>,
    pub is_sparse: bool,
    pub enable_streaming: bool,
    pub num_threads: usize,
    pub dataset_categoricals: Option<Vec<bool>>,
    pub pipeline_categoricals: Option<Vec<bool>>,
    pub pipeline_profile: Option<PipelineProfile>,
    pub column_names: Option<ColumnNames>,
    pub timeseries_param_dict: Option<TimeseriesParams>,
    pub gpu_training_param_dict: BTreeMap<String, String>,
    pub runtime_constraints: ResourceCaps,
    pub time_constraint_mode: TimeConstraintMode,
    pub start_time: f64,
    pub current_time: f64,
    pub max_time: Option<f64>,
    pub server_code_buffer: u32,
    pub model_names_whitelisted: Vec<String>,
    pub model_names_blacklisted: Vec<String>,
}

impl Default for ProblemInfo {
    fn default() -> Self {
        Self::new(Task::Classification)
    }
}

impl ProblemInfo {
    pub fn new(task: Task) -> Self {
        let now = now_seconds();
        Self {
            task,
            num_samples: 0,
            num_features: 0,
            num_classes: None,
            num_categorical: 0,
            y_std: None,
            is_sparse: false,
            enable_streaming: false,
            num_threads: 1,
            dataset_categoricals: None,
            pipeline_categoricals: None,
            pipeline_profile: None,
            column_names: None,
            timeseries_param_dict: None,
            gpu_training_param_dict: BTreeMap::new(),
            runtime_constraints: ResourceCaps::default(),
            time_constraint_mode: TimeConstraintMode::default(),
            start_time: now,
            current_time: now,
            max_time: None,
            server_code_buffer: 0,
            model_names_whitelisted: Vec::new(),
            model_names_blacklisted: Vec::new(),
        }
    }

    pub fn with_shape(mut self, num_samples: usize, num_features: usize) -> Self {
        self.num_samples = num_samples;
        self.num_features = num_features;
        self
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = Some(num_classes);
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    pub fn with_dataset_categoricals(mut self, mask: Vec<bool>) -> Self {
        self.num_categorical = mask.iter().filter(|&&c| c).count();
        self.dataset_categoricals = Some(mask);
        self
    }

    pub fn with_streaming(mut self, column_names: ColumnNames) -> Self {
        self.enable_streaming = true;
        self.column_names = Some(column_names);
        self
    }

    pub fn with_timeseries_params(mut self, params: TimeseriesParams) -> Self {
        self.timeseries_param_dict = Some(params);
        self
    }

    pub fn with_runtime_constraints(mut self, caps: ResourceCaps) -> Self {
        self.runtime_constraints = caps;
        self
    }

    pub fn with_time_constraint_mode(mut self, mode: TimeConstraintMode, max_time: Option<f64>) -> Self {
        self.time_constraint_mode = mode;
        self.max_time = max_time;
        self
    }

    /// Per-iteration wall time constraint in seconds
    pub fn get_time_constraint(&self) -> Option<f64> {
        self.runtime_constraints.wall_time_in_s
    }

    pub fn set_time_constraint(&mut self, seconds: Option<f64>) {
        self.runtime_constraints.wall_time_in_s = seconds;
    }

    /// Update only the constraints present in `partial`
    pub fn set_runtime_constraint(&mut self, partial: &ResourceCaps) {
        self.runtime_constraints.merge_from(partial);
    }

    /// React to a signal from the orchestrating service
    ///
    /// In per-iteration mode every third "increase time threshold" signal
    /// multiplies the time constraint by 1.5.
    pub fn handle_server_code(&mut self, code: i32) {
        if ServerCode::from_code(code) != Some(ServerCode::IncreaseTimeThreshold) {
            return;
        }
        if self.time_constraint_mode != TimeConstraintMode::Iteration {
            return;
        }
        self.server_code_buffer += 1;
        if self.server_code_buffer >= SERVER_CODE_BUFFER_LIMIT {
            self.server_code_buffer = 0;
            if let Some(current) = self.get_time_constraint() {
                let grown = current * TIME_CONSTRAINT_GROWTH;
                info!(from = current, to = grown, "increasing iteration time constraint");
                self.set_time_constraint(Some(grown));
            }
        }
    }

    /// Recompute the remaining total time after an iteration
    pub fn update_time(&mut self, now: f64, training_times: f64, predict_times: f64) {
        self.current_time = now;
        if !self.time_constraint_mode.tracks_total() {
            return;
        }
        if let Some(max_time) = self.max_time {
            let elapsed = now - self.start_time - training_times + predict_times;
            let remaining = max_time - elapsed;
            debug!(remaining, "updated total time constraint");
            self.runtime_constraints.total_wall_time_in_s = Some(remaining);
        }
    }

    /// Whether the total time budget cannot fit another final fit
    pub fn done(&self, expected_final_fit_time: Option<f64>) -> bool {
        if !self.time_constraint_mode.tracks_total() {
            return false;
        }
        match self.runtime_constraints.total_wall_time_in_s {
            Some(remaining) => remaining <= expected_final_fit_time.unwrap_or(0.0),
            None => false,
        }
    }

    /// Record another pipeline profile
    pub fn update_pipeline_profile(&mut self, profile: impl Into<String>) {
        let profile = profile.into();
        self.pipeline_profile = Some(match self.pipeline_profile.take() {
            None => PipelineProfile::Single(profile),
            Some(PipelineProfile::Single(existing)) => PipelineProfile::Many(vec![existing, profile]),
            Some(PipelineProfile::Many(mut all)) => {
                all.push(profile);
                PipelineProfile::Many(all)
            }
        });
    }

    /// Drop user-shaped categorical masks before the info leaves the process
    pub fn clean_dataset_info(&mut self) {
        self.dataset_categoricals = None;
        self.pipeline_categoricals = None;
    }

    pub fn to_dict(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_dict(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Seconds since the Unix epoch
pub fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_third_threshold_signal_grows_constraint() {
        let mut info = ProblemInfo::new(Task::Regression);
        info.set_time_constraint(Some(10.0));
        info.handle_server_code(1);
        info.handle_server_code(1);
        assert_eq!(info.get_time_constraint(), Some(10.0));
        info.handle_server_code(1);
        assert_eq!(info.get_time_constraint(), Some(15.0));
        assert_eq!(info.server_code_buffer, 0);
    }

    #[test]
    fn test_threshold_ignored_in_total_mode() {
        let mut info = ProblemInfo::new(Task::Regression)
            .with_time_constraint_mode(TimeConstraintMode::Total, Some(100.0));
        info.set_time_constraint(Some(10.0));
        for _ in 0..3 {
            info.handle_server_code(1);
        }
        assert_eq!(info.get_time_constraint(), Some(10.0));
    }

    #[test]
    fn test_update_time_and_done() {
        let mut info = ProblemInfo::new(Task::Classification)
            .with_time_constraint_mode(TimeConstraintMode::TotalAndIteration, Some(100.0));
        info.start_time = 1000.0;
        info.update_time(1050.0, 20.0, 5.0);
        assert_eq!(info.runtime_constraints.total_wall_time_in_s, Some(100.0 - (50.0 - 20.0 + 5.0)));
        assert!(!info.done(None));
        assert!(info.done(Some(70.0)));
    }

    #[test]
    fn test_update_time_iteration_mode_untouched() {
        let mut info = ProblemInfo::new(Task::Classification);
        info.update_time(1.0e9, 0.0, 0.0);
        assert_eq!(info.runtime_constraints.total_wall_time_in_s, None);
        assert!(!info.done(Some(1.0)));
    }

    #[test]
    fn test_pipeline_profile_coercion() {
        let mut info = ProblemInfo::default();
        info.update_pipeline_profile("a");
        assert_eq!(info.pipeline_profile, Some(PipelineProfile::Single("a".to_string())));
        info.update_pipeline_profile("b");
        info.update_pipeline_profile("c");
        assert_eq!(
            info.pipeline_profile,
            Some(PipelineProfile::Many(vec!["a".into(), "b".into(), "c".into()]))
        );
    }

    #[test]
    fn test_dict_roundtrip_and_clean() {
        let mut info = ProblemInfo::new(Task::Forecasting)
            .with_shape(10, 3)
            .with_dataset_categoricals(vec![true, false, false])
            .with_timeseries_params(TimeseriesParams::new("date").with_max_horizon(4));
        let back = ProblemInfo::from_dict(&info.to_dict().unwrap()).unwrap();
        assert_eq!(back, info);

        info.clean_dataset_info();
        assert!(info.dataset_categoricals.is_none());
        assert_eq!(info.num_categorical, 1);
    }

    #[test]
    fn test_set_runtime_constraint_is_partial() {
        let mut info = ProblemInfo::default();
        info.runtime_constraints = ResourceCaps::default().with_wall_time(30.0).with_memory_mb(512);
        info.set_runtime_constraint(&ResourceCaps::default().with_cpu_time(5.0));
        assert_eq!(info.runtime_constraints.wall_time_in_s, Some(30.0));
        assert_eq!(info.runtime_constraints.mem_in_mb, Some(512));
        assert_eq!(info.runtime_constraints.cpu_time_in_s, Some(5.0));
    }
}
