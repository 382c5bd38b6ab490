//! Classical forecasters
//!
//! These consume the target as one ordered series and ignore the feature
//! values; the rows passed to `predict` are taken as consecutive future
//! steps.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use super::Learner;
use crate::constants::TIMESERIES_PARAM_DICT;
use crate::error::{Result, RunnerError};
use crate::pipeline::Params;
use crate::problem_info::TimeseriesParams;

/// Simple or Holt (additive trend) exponential smoothing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialSmoothing {
    pub smoothing_level: f64,
    /// `Some` enables an additive trend
    pub smoothing_trend: Option<f64>,
    pub params: Option<TimeseriesParams>,
    state: Option<(f64, f64)>,
}

impl ExponentialSmoothing {
    pub const PARAMS: &'static [&'static str] = &["smoothing_level", "smoothing_trend", "trend", TIMESERIES_PARAM_DICT];

    pub fn new(smoothing_level: f64) -> Self {
        Self {
            smoothing_level,
            smoothing_trend: None,
            params: None,
            state: None,
        }
    }

    pub fn from_params(p: &mut Params) -> Result<Self> {
        let level = p.f64_or("smoothing_level", 0.5)?;
        if !(level > 0.0 && level <= 1.0) {
            return Err(RunnerError::invalid_option("smoothing_level", level, "must lie in (0, 1]"));
        }
        let mut model = Self::new(level);
        let trend = p.opt_string("trend")?;
        let beta = p.opt_f64("smoothing_trend")?;
        model.smoothing_trend = match (trend.as_deref(), beta) {
            (Some("add") | Some("additive"), b) => Some(b.unwrap_or(0.1)),
            (None, Some(b)) => Some(b),
            (None, None) => None,
            (Some(other), _) => return Err(RunnerError::invalid_option("trend", other, "only additive trends are supported")),
        };
        if let Some(value) = p.take(TIMESERIES_PARAM_DICT) {
            model.params = Some(serde_json::from_value(value)?);
        }
        Ok(model)
    }
}

impl Learner for ExponentialSmoothing {
    fn fit(&mut self, _x: &Array2<f64>, y: &Array1<f64>, _sample_weight: Option<&Array1<f64>>) -> Result<()> {
        let first = *y
            .iter()
            .next()
            .ok_or_else(|| RunnerError::DataError("cannot smooth an empty series".to_string()))?;
        let alpha = self.smoothing_level;
        let mut level = first;
        let mut trend = match (self.smoothing_trend, y.len()) {
            (Some(_), n) if n > 1 => y[1] - y[0],
            _ => 0.0,
        };
        for &obs in y.iter().skip(1) {
            let prev_level = level;
            level = alpha * obs + (1.0 - alpha) * (level + trend);
            if let Some(beta) = self.smoothing_trend {
                trend = beta * (level - prev_level) + (1.0 - beta) * trend;
            }
        }
        self.state = Some((level, trend));
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let (level, trend) = self.state.ok_or(RunnerError::ModelNotFitted)?;
        Ok((1..=x.nrows()).map(|h| level + h as f64 * trend).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use serde_json::json;

    #[test]
    fn test_flat_series_forecasts_level() {
        let mut es = ExponentialSmoothing::new(0.3);
        es.fit(&Array2::zeros((4, 0)), &array![5.0, 5.0, 5.0, 5.0], None).unwrap();
        assert_eq!(es.predict(&Array2::zeros((2, 0))).unwrap(), array![5.0, 5.0]);
    }

    #[test]
    fn test_trend_extrapolates() {
        let mut es = ExponentialSmoothing::new(1.0);
        es.smoothing_trend = Some(1.0);
        es.fit(&Array2::zeros((4, 0)), &array![1.0, 2.0, 3.0, 4.0], None).unwrap();
        let pred = es.predict(&Array2::zeros((2, 0))).unwrap();
        assert!((pred[0] - 5.0).abs() < 1e-12 && (pred[1] - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_params_receive_timeseries_dict() {
        let map = match json!({"timeseries_param_dict": {"time_column_name": "t", "max_horizon": 3}}) {
            serde_json::Value::Object(m) => m,
            _ => unreachable!(),
        };
        let es = ExponentialSmoothing::from_params(&mut Params::new(map)).unwrap();
        assert_eq!(es.params.unwrap().max_horizon, 3);
    }
}
