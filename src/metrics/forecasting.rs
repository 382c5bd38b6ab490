//! Forecasting metrics: per-horizon breakdowns and grain-normalized scores

use std::collections::BTreeMap;

use ndarray::Array1;
use tracing::debug;

use super::aggregate::aggregate_scores;
use super::regression::{score_regression, RegressionInput};
use super::{names, record, MetricMap, MetricValue};
use crate::error::{Result, RunnerError};

/// Label of samples whose horizon is unknown
pub const UNKNOWN_HORIZON: &str = "unknown";

/// Forecast output plus the per-sample horizon and series identifiers
pub struct ForecastInput<'a> {
    pub regression: RegressionInput<'a>,
    /// Horizon of each sample; NaN marks an unknown horizon
    pub horizons: Option<&'a [f64]>,
    /// Series identifier of each held-out sample
    pub grain_ids: Option<&'a [f64]>,
    /// Training targets and identifiers, used for per-series ranges
    pub train_y: Option<&'a Array1<f64>>,
    pub train_grain_ids: Option<&'a [f64]>,
}

impl<'a> ForecastInput<'a> {
    pub fn new(regression: RegressionInput<'a>) -> Self {
        Self {
            regression,
            horizons: None,
            grain_ids: None,
            train_y: None,
            train_grain_ids: None,
        }
    }
}

fn is_grain_normalized(name: &str) -> bool {
    matches!(
        name,
        names::NORMALIZED_MAE | names::NORMALIZED_RMSE | names::NORMALIZED_RMSLE | names::NORMALIZED_MEDIAN_AE
    )
}

/// Sample positions per horizon label; known horizons sort numerically and
/// the unknown group comes last
fn horizon_groups(input: &ForecastInput<'_>) -> Vec<(String, Vec<usize>)> {
    let n = input.regression.y_true.len();
    let mut known: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    let mut unknown = Vec::new();
    for i in 0..n {
        match input.horizons.and_then(|h| h.get(i)).copied() {
            Some(h) if h.is_finite() => known.entry(h.round() as i64).or_default().push(i),
            _ => unknown.push(i),
        }
    }
    let mut groups: Vec<(String, Vec<usize>)> = known.into_iter().map(|(h, rows)| (h.to_string(), rows)).collect();
    if !unknown.is_empty() {
        groups.push((UNKNOWN_HORIZON.to_string(), unknown));
    }
    groups
}

fn per_horizon(input: &ForecastInput<'_>, mape: bool) -> Result<MetricValue> {
    let y = input.regression.y_true;
    let p = input.regression.y_pred;
    let mut labels = Vec::new();
    let mut values = Vec::new();
    for (label, rows) in horizon_groups(input) {
        let row = if mape {
            let terms: Vec<f64> = rows
                .iter()
                .filter(|&&i| y[i] != 0.0)
                .map(|&i| ((y[i] - p[i]) / y[i]).abs() * 100.0)
                .collect();
            let v = if terms.is_empty() {
                f64::NAN
            } else {
                terms.iter().sum::<f64>() / terms.len() as f64
            };
            vec![v]
        } else {
            let res: Vec<f64> = rows.iter().map(|&i| y[i] - p[i]).collect();
            let count = res.len() as f64;
            let mean = res.iter().sum::<f64>() / count;
            let std = (res.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / count).sqrt();
            vec![mean, std, count]
        };
        labels.push(label);
        values.push(row);
    }
    if labels.is_empty() {
        return Err(RunnerError::ComputationError("no forecast samples to score".to_string()));
    }
    Ok(MetricValue::Table { labels, values })
}

/// Score each series with its own target range and average across series
fn grain_normalized(input: &ForecastInput<'_>, grains: &[f64], metrics: &[String]) -> Result<MetricMap> {
    let y = input.regression.y_true;
    let p = input.regression.y_pred;
    if grains.len() != y.len() {
        return Err(RunnerError::ShapeError {
            expected: format!("{} grain ids", y.len()),
            actual: format!("{} grain ids", grains.len()),
        });
    }
    let mut rows: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    for (i, g) in grains.iter().enumerate() {
        rows.entry(g.to_bits()).or_default().push(i);
    }
    let per_grain: Vec<MetricMap> = rows
        .iter()
        .map(|(&bits, idx)| {
            let gy: Array1<f64> = idx.iter().map(|&i| y[i]).collect();
            let gp: Array1<f64> = idx.iter().map(|&i| p[i]).collect();
            let gw: Option<Array1<f64>> = input.regression.sample_weight.map(|w| idx.iter().map(|&i| w[i]).collect());
            let train_vals: Vec<f64> = match (input.train_y, input.train_grain_ids) {
                (Some(ty), Some(tg)) => ty
                    .iter()
                    .zip(tg)
                    .filter(|(_, g)| g.to_bits() == bits)
                    .map(|(v, _)| *v)
                    .collect(),
                _ => Vec::new(),
            };
            let (lo, hi) = train_vals
                .iter()
                .chain(gy.iter())
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            let group = RegressionInput {
                y_true: &gy,
                y_pred: &gp,
                y_min: Some(lo),
                y_max: Some(hi),
                y_std: input.regression.y_std,
                bin_info: None,
                sample_weight: gw.as_ref(),
            };
            score_regression(&group, metrics)
        })
        .collect();
    debug!(grains = per_grain.len(), "Scored grain-normalized metrics");
    Ok(aggregate_scores(&per_grain, metrics))
}

/// Score forecaster output
///
/// Per-horizon metrics are tables keyed by horizon. With grain ids the
/// normalized metrics are computed per series and averaged; everything else
/// is delegated to the regression scorer.
pub fn score_forecasting(input: &ForecastInput<'_>, metrics: &[String]) -> MetricMap {
    let mut out = MetricMap::new();
    let mut plain = Vec::new();
    let mut normalized = Vec::new();
    for m in metrics {
        match m.as_str() {
            names::FORECAST_MAPE => record(&mut out, m, per_horizon(input, true)),
            names::FORECAST_RESIDUALS => record(&mut out, m, per_horizon(input, false)),
            name if is_grain_normalized(name) && input.grain_ids.is_some() => normalized.push(m.clone()),
            _ => plain.push(m.clone()),
        }
    }
    out.extend(score_regression(&input.regression, &plain));
    if let Some(grains) = input.grain_ids {
        if !normalized.is_empty() {
            match grain_normalized(input, grains, &normalized) {
                Ok(scores) => out.extend(scores),
                Err(e) => {
                    for m in &normalized {
                        record(&mut out, m, Err(e.clone()));
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn all(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_per_horizon_tables_with_unknown() {
        let y = array![10.0, 10.0, 20.0, 20.0];
        let p = array![11.0, 9.0, 22.0, 20.0];
        let horizons = [1.0, 1.0, 2.0, f64::NAN];
        let mut input = ForecastInput::new(RegressionInput::new(&y, &p));
        input.horizons = Some(&horizons);
        let out = score_forecasting(&input, &all(&[names::FORECAST_MAPE, names::FORECAST_RESIDUALS]));
        match &out[names::FORECAST_MAPE] {
            MetricValue::Table { labels, values } => {
                assert_eq!(labels, &vec!["1".to_string(), "2".to_string(), UNKNOWN_HORIZON.to_string()]);
                assert!((values[0][0] - 10.0).abs() < 1e-12);
                assert!((values[1][0] - 10.0).abs() < 1e-12);
                assert_eq!(values[2][0], 0.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &out[names::FORECAST_RESIDUALS] {
            MetricValue::Table { values, .. } => assert_eq!(values[0], vec![0.0, 1.0, 2.0]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_grain_normalized_uses_per_series_range() {
        // Series 0 spans 0..10 and series 1 spans 0..100 across train and valid
        let y = array![5.0, 50.0];
        let p = array![6.0, 60.0];
        let grains = [0.0, 1.0];
        let train_y = array![0.0, 10.0, 0.0, 100.0];
        let train_grains = [0.0, 0.0, 1.0, 1.0];
        let mut input = ForecastInput::new(RegressionInput::new(&y, &p));
        input.grain_ids = Some(&grains);
        input.train_y = Some(&train_y);
        input.train_grain_ids = Some(&train_grains);
        let out = score_forecasting(&input, &all(&[names::NORMALIZED_MAE, names::MAE]));
        assert!((out[names::NORMALIZED_MAE].as_f64().unwrap() - 0.1).abs() < 1e-12);
        assert!((out[names::MAE].as_f64().unwrap() - 5.5).abs() < 1e-12);
    }
}
