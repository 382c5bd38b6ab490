//! Per-candidate result record

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::constants::result_keys;
use crate::error::Result;
use crate::metrics::{self, MetricMap};
use crate::pipeline::Chain;

/// Metrics of every regime that ran, plus run bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    pub validation_metrics: Option<MetricMap>,
    pub train_metrics: Option<MetricMap>,
    pub test_metrics: Option<MetricMap>,
    pub train_from_full_metrics: Option<MetricMap>,
    pub cv_metrics: Option<Vec<MetricMap>>,
    pub cv_mean_metrics: Option<MetricMap>,
    /// Fitted chains keyed by regime, when requested
    pub models: Option<BTreeMap<String, Vec<Chain>>>,
    pub train_percent: f64,
    pub train_validate_status: Option<i32>,
    pub train_full_status: Option<i32>,
    pub cv_status: Option<i32>,
    /// Parent-side wall time of the whole run
    pub wall_time: Option<f64>,
}

impl Default for TrainingResult {
    fn default() -> Self {
        Self {
            validation_metrics: None,
            train_metrics: None,
            test_metrics: None,
            train_from_full_metrics: None,
            cv_metrics: None,
            cv_mean_metrics: None,
            models: None,
            train_percent: 100.0,
            train_validate_status: None,
            train_full_status: None,
            cv_status: None,
            wall_time: None,
        }
    }
}

impl TrainingResult {
    pub(crate) fn add_models(&mut self, regime: &str, chains: Vec<Chain>) {
        self.models
            .get_or_insert_with(BTreeMap::new)
            .insert(regime.to_string(), chains);
    }

    /// Nested mapping keyed by the result key names; NaN renders as null
    pub fn to_dict(&self) -> Result<Value> {
        let mut out = Map::new();
        let sections = [
            (result_keys::VALIDATION_METRICS, &self.validation_metrics),
            (result_keys::TRAIN_METRICS, &self.train_metrics),
            (result_keys::TEST_METRICS, &self.test_metrics),
            (result_keys::TRAIN_FROM_FULL_METRICS, &self.train_from_full_metrics),
            (result_keys::CV_MEAN_METRICS, &self.cv_mean_metrics),
        ];
        for (key, section) in sections {
            if let Some(scores) = section {
                out.insert(key.to_string(), metrics::to_json(scores));
            }
        }
        if let Some(folds) = &self.cv_metrics {
            out.insert(
                result_keys::CV_METRICS.to_string(),
                Value::Array(folds.iter().map(metrics::to_json).collect()),
            );
        }
        if let Some(models) = &self.models {
            out.insert(result_keys::MODELS.to_string(), serde_json::to_value(models)?);
        }
        out.insert(result_keys::TRAIN_PERCENT.to_string(), json!(self.train_percent));
        let statuses = [
            (result_keys::TRAIN_VALIDATE_STATUS, self.train_validate_status),
            (result_keys::TRAIN_FULL_STATUS, self.train_full_status),
            (result_keys::CV_STATUS, self.cv_status),
        ];
        for (key, status) in statuses {
            if let Some(code) = status {
                out.insert(key.to_string(), json!(code));
            }
        }
        if let Some(wall) = self.wall_time {
            out.insert(result_keys::WALL_TIME.to_string(), metrics::finite_or_null(wall));
        }
        Ok(Value::Object(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricValue;

    #[test]
    fn test_to_dict_keys_and_nan() {
        let mut scores = MetricMap::new();
        scores.insert("r2_score".to_string(), MetricValue::Scalar(f64::NAN));
        scores.insert("fit_time".to_string(), MetricValue::Scalar(0.5));
        let result = TrainingResult {
            validation_metrics: Some(scores.clone()),
            cv_metrics: Some(vec![scores]),
            train_validate_status: Some(0),
            wall_time: Some(1.25),
            ..TrainingResult::default()
        };
        let dict = result.to_dict().unwrap();
        assert!(dict["validation-metrics"]["r2_score"].is_null());
        assert_eq!(dict["validation-metrics"]["fit_time"], json!(0.5));
        assert_eq!(dict["cv-metrics"].as_array().unwrap().len(), 1);
        assert_eq!(dict["train-percent"], json!(100.0));
        assert_eq!(dict["train-validate-status"], json!(0));
        assert_eq!(dict["wall-time"], json!(1.25));
        assert!(dict.get("test-metrics").is_none());
    }
}
