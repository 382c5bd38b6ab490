//! Scoring façade
//!
//! Every scorer takes actuals, predictions and a list of metric names and
//! returns a [`MetricMap`]. Scalar metrics are plain `f64`; charts and
//! per-horizon breakdowns are [`MetricValue::Table`]. A metric whose
//! computation fails never fails the call: scalars become NaN, tables become
//! [`MetricValue::Error`], and the failure is logged.

mod aggregate;
mod classification;
mod confidence;
mod forecasting;
mod regression;

pub use aggregate::aggregate_scores;
pub use classification::{score_classification, ClassificationInput};
pub use confidence::{bootstrap_extras, BOOTSTRAP_ITERATIONS};
pub use forecasting::{score_forecasting, ForecastInput, UNKNOWN_HORIZON};
pub use regression::{score_regression, RegressionInput};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::constants::timing;
use crate::error::Result;

/// Metric names understood by the scorers
pub mod names {
    pub const ACCURACY: &str = "accuracy";
    pub const BALANCED_ACCURACY: &str = "balanced_accuracy";
    pub const PRECISION_MACRO: &str = "precision_score_macro";
    pub const PRECISION_WEIGHTED: &str = "precision_score_weighted";
    pub const PRECISION_BINARY: &str = "precision_score_binary";
    pub const RECALL_MACRO: &str = "recall_score_macro";
    pub const RECALL_WEIGHTED: &str = "recall_score_weighted";
    pub const RECALL_BINARY: &str = "recall_score_binary";
    pub const F1_MACRO: &str = "f1_score_macro";
    pub const F1_WEIGHTED: &str = "f1_score_weighted";
    pub const F1_BINARY: &str = "f1_score_binary";
    pub const LOG_LOSS: &str = "log_loss";
    pub const AUC_MACRO: &str = "AUC_macro";
    pub const AUC_WEIGHTED: &str = "AUC_weighted";
    pub const AUC_BINARY: &str = "AUC_binary";
    pub const NORM_MACRO_RECALL: &str = "norm_macro_recall";
    pub const CONFUSION_MATRIX: &str = "confusion_matrix";

    pub const R2: &str = "r2_score";
    pub const MAE: &str = "mean_absolute_error";
    pub const RMSE: &str = "root_mean_squared_error";
    pub const RMSLE: &str = "root_mean_squared_log_error";
    pub const MEDIAN_AE: &str = "median_absolute_error";
    pub const NORMALIZED_MAE: &str = "normalized_mean_absolute_error";
    pub const NORMALIZED_RMSE: &str = "normalized_root_mean_squared_error";
    pub const NORMALIZED_RMSLE: &str = "normalized_root_mean_squared_log_error";
    pub const NORMALIZED_MEDIAN_AE: &str = "normalized_median_absolute_error";
    pub const EXPLAINED_VARIANCE: &str = "explained_variance";
    pub const SPEARMAN: &str = "spearman_correlation";
    pub const MAPE: &str = "mean_absolute_percentage_error";
    pub const RESIDUALS: &str = "residuals";
    pub const PREDICTED_TRUE: &str = "predicted_true";

    pub const FORECAST_MAPE: &str = "forecast_mean_absolute_percentage_error";
    pub const FORECAST_RESIDUALS: &str = "forecast_residuals";

    /// Suffix of the sibling key carrying confidence bounds
    pub const EXTRAS_SUFFIX: &str = "_extras";

    pub fn extras_of(metric: &str) -> String {
        format!("{}{}", metric, EXTRAS_SUFFIX)
    }
}

/// One scored metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Scalar(f64),
    /// Row-labelled numeric table, e.g. a confusion matrix or a histogram
    Table { labels: Vec<String>, values: Vec<Vec<f64>> },
    /// Sentinel for a non-scalar metric that could not be computed
    Error { metric: String, message: String },
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// JSON rendering with NaN and infinities as null
    pub fn to_json(&self) -> Value {
        match self {
            MetricValue::Scalar(v) => finite_or_null(*v),
            MetricValue::Table { labels, values } => json!({
                "labels": labels,
                "values": values.iter().map(|row| row.iter().map(|v| finite_or_null(*v)).collect::<Vec<_>>()).collect::<Vec<_>>(),
            }),
            MetricValue::Error { metric, message } => json!({"metric": metric, "error": message}),
        }
    }
}

pub(crate) fn finite_or_null(v: f64) -> Value {
    if v.is_finite() {
        json!(v)
    } else {
        Value::Null
    }
}

pub type MetricMap = BTreeMap<String, MetricValue>;

/// Whether `name` yields a table rather than a scalar
pub fn is_table_metric(name: &str) -> bool {
    matches!(
        name,
        names::CONFUSION_MATRIX
            | names::RESIDUALS
            | names::PREDICTED_TRUE
            | names::FORECAST_MAPE
            | names::FORECAST_RESIDUALS
    )
}

/// Store a computed metric, folding failures into NaN or an error sentinel
pub(crate) fn record(out: &mut MetricMap, name: &str, computed: Result<MetricValue>) {
    let value = match computed {
        Ok(v) => v,
        Err(e) => {
            warn!(metric = name, error = %e, "Metric computation failed");
            if is_table_metric(name) {
                MetricValue::Error {
                    metric: name.to_string(),
                    message: e.generic_message(),
                }
            } else {
                MetricValue::Scalar(f64::NAN)
            }
        }
    };
    out.insert(name.to_string(), value);
}

/// Attach `fit_time`, `predict_time` and `train_time = fit + predict`
pub fn attach_timing(scores: &mut MetricMap, fit_time: f64, predict_time: f64) {
    scores.insert(timing::FIT_TIME.to_string(), MetricValue::Scalar(fit_time));
    scores.insert(timing::PREDICT_TIME.to_string(), MetricValue::Scalar(predict_time));
    scores.insert(timing::TRAIN_TIME.to_string(), MetricValue::Scalar(fit_time + predict_time));
}

/// JSON object form of a metric map
pub fn to_json(scores: &MetricMap) -> Value {
    Value::Object(scores.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunnerError;

    #[test]
    fn test_record_folds_failures() {
        let mut out = MetricMap::new();
        record(&mut out, names::R2, Err(RunnerError::ComputationError("boom".into())));
        record(&mut out, names::RESIDUALS, Err(RunnerError::ComputationError("boom".into())));
        assert!(out[names::R2].as_f64().unwrap().is_nan());
        assert!(matches!(out[names::RESIDUALS], MetricValue::Error { .. }));
    }

    #[test]
    fn test_timing_and_json() {
        let mut out = MetricMap::new();
        attach_timing(&mut out, 0.5, 0.25);
        out.insert("x".into(), MetricValue::Scalar(f64::NAN));
        let v = to_json(&out);
        assert_eq!(v["train_time"], json!(0.75));
        assert!(v["x"].is_null());
    }
}
