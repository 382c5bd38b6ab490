//! Regression metrics

use ndarray::Array1;
use tracing::debug;

use super::{names, record, MetricMap, MetricValue};
use crate::dataset::binning::percentile;
use crate::dataset::BinInfo;
use crate::error::{Result, RunnerError};

/// Residual histogram bins between -2σ and 2σ
const RESIDUAL_BINS: usize = 10;

/// Everything a regression scorer reads
#[derive(Clone, Copy)]
pub struct RegressionInput<'a> {
    pub y_true: &'a Array1<f64>,
    pub y_pred: &'a Array1<f64>,
    /// Target range of the whole corpus, used by the normalized metrics
    pub y_min: Option<f64>,
    pub y_max: Option<f64>,
    pub y_std: Option<f64>,
    pub bin_info: Option<&'a BinInfo>,
    pub sample_weight: Option<&'a Array1<f64>>,
}

impl<'a> RegressionInput<'a> {
    pub fn new(y_true: &'a Array1<f64>, y_pred: &'a Array1<f64>) -> Self {
        Self {
            y_true,
            y_pred,
            y_min: None,
            y_max: None,
            y_std: None,
            bin_info: None,
            sample_weight: None,
        }
    }

    fn weight(&self, i: usize) -> f64 {
        self.sample_weight.map_or(1.0, |w| w[i])
    }

    fn weighted_mean(&self, values: impl Iterator<Item = (usize, f64)>) -> Result<f64> {
        let (sum, total) = values.fold((0.0, 0.0), |(s, t), (i, v)| {
            let w = self.weight(i);
            (s + w * v, t + w)
        });
        if total <= 0.0 {
            Err(RunnerError::ComputationError("no weighted samples to score".to_string()))
        } else {
            Ok(sum / total)
        }
    }

    fn errors(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.y_true
            .iter()
            .zip(self.y_pred.iter())
            .enumerate()
            .map(|(i, (t, p))| (i, t - p))
    }

    /// `(y_min, y_max)`, falling back to the range of the actuals
    fn range(&self) -> (f64, f64) {
        let lo = self.y_min.unwrap_or_else(|| self.y_true.fold(f64::INFINITY, |a, &b| a.min(b)));
        let hi = self.y_max.unwrap_or_else(|| self.y_true.fold(f64::NEG_INFINITY, |a, &b| a.max(b)));
        (lo, hi)
    }
}

fn mae(input: &RegressionInput<'_>) -> Result<f64> {
    input.weighted_mean(input.errors().map(|(i, e)| (i, e.abs())))
}

fn rmse(input: &RegressionInput<'_>) -> Result<f64> {
    Ok(input.weighted_mean(input.errors().map(|(i, e)| (i, e * e)))?.sqrt())
}

fn rmsle(input: &RegressionInput<'_>) -> Result<f64> {
    if input.y_true.iter().chain(input.y_pred.iter()).any(|&v| v < 0.0) {
        return Err(RunnerError::ComputationError(
            "log error is undefined for negative values".to_string(),
        ));
    }
    let sq = input
        .y_true
        .iter()
        .zip(input.y_pred.iter())
        .enumerate()
        .map(|(i, (t, p))| (i, (t.ln_1p() - p.ln_1p()).powi(2)));
    Ok(input.weighted_mean(sq)?.sqrt())
}

fn median(mut values: Vec<f64>) -> Result<f64> {
    if values.is_empty() {
        return Err(RunnerError::ComputationError("median of an empty sample".to_string()));
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Ok(percentile(&values, 50.0))
}

fn median_ae(input: &RegressionInput<'_>) -> Result<f64> {
    median(input.errors().map(|(_, e)| e.abs()).collect())
}

fn normalize(value: f64, span: f64) -> Result<f64> {
    if span > 0.0 && span.is_finite() {
        Ok(value / span)
    } else {
        Err(RunnerError::ComputationError(format!("cannot normalize by a target range of {}", span)))
    }
}

fn r2(input: &RegressionInput<'_>) -> Result<f64> {
    let mean = input.weighted_mean(input.y_true.iter().copied().enumerate())?;
    let ss_res: f64 = input.errors().map(|(i, e)| input.weight(i) * e * e).sum();
    let ss_tot: f64 = input
        .y_true
        .iter()
        .enumerate()
        .map(|(i, t)| input.weight(i) * (t - mean).powi(2))
        .sum();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 {
            Ok(1.0)
        } else {
            Err(RunnerError::ComputationError("r2 is undefined for a constant target".to_string()))
        };
    }
    Ok(1.0 - ss_res / ss_tot)
}

fn explained_variance(input: &RegressionInput<'_>) -> Result<f64> {
    let err_mean = input.weighted_mean(input.errors())?;
    let err_var = input.weighted_mean(input.errors().map(|(i, e)| (i, (e - err_mean).powi(2))))?;
    let y_mean = input.weighted_mean(input.y_true.iter().copied().enumerate())?;
    let y_var = input.weighted_mean(input.y_true.iter().map(|t| (t - y_mean).powi(2)).enumerate())?;
    if y_var == 0.0 {
        return Err(RunnerError::ComputationError(
            "explained variance is undefined for a constant target".to_string(),
        ));
    }
    Ok(1.0 - err_var / y_var)
}

/// Ranks starting at 1, ties sharing their average rank
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap_or(std::cmp::Ordering::Equal));
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }
    ranks
}

fn pearson(a: &[f64], b: &[f64]) -> Result<f64> {
    let n = a.len() as f64;
    let ma = a.iter().sum::<f64>() / n;
    let mb = b.iter().sum::<f64>() / n;
    let cov: f64 = a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum();
    let va: f64 = a.iter().map(|x| (x - ma).powi(2)).sum();
    let vb: f64 = b.iter().map(|y| (y - mb).powi(2)).sum();
    if va == 0.0 || vb == 0.0 {
        return Err(RunnerError::ComputationError("correlation of a constant series".to_string()));
    }
    Ok(cov / (va.sqrt() * vb.sqrt()))
}

fn spearman(input: &RegressionInput<'_>) -> Result<f64> {
    if input.y_true.len() < 2 {
        return Err(RunnerError::ComputationError("correlation needs two samples".to_string()));
    }
    let rt = average_ranks(&input.y_true.to_vec());
    let rp = average_ranks(&input.y_pred.to_vec());
    pearson(&rt, &rp)
}

/// Mean absolute percentage error in percent, skipping zero actuals
fn mape(input: &RegressionInput<'_>) -> Result<f64> {
    let terms = input
        .y_true
        .iter()
        .zip(input.y_pred.iter())
        .enumerate()
        .filter(|(_, (t, _))| **t != 0.0)
        .map(|(i, (t, p))| (i, ((t - p) / t).abs() * 100.0));
    input.weighted_mean(terms)
}

fn residual_edges(y_std: Option<f64>) -> Vec<f64> {
    match y_std.filter(|s| *s > 0.0 && s.is_finite()) {
        Some(sigma) => {
            let lo = -2.0 * sigma;
            let step = 4.0 * sigma / RESIDUAL_BINS as f64;
            let mut edges: Vec<f64> = (0..=RESIDUAL_BINS).map(|i| lo + step * i as f64).collect();
            edges[0] = f64::NEG_INFINITY;
            edges[RESIDUAL_BINS] = f64::INFINITY;
            edges
        }
        None => vec![f64::NEG_INFINITY, f64::INFINITY],
    }
}

/// Histogram of `y_true - y_pred` with open outer bins
fn residuals(input: &RegressionInput<'_>) -> Result<MetricValue> {
    let edges = residual_edges(input.y_std);
    let n_bins = edges.len() - 1;
    let mut counts = vec![0.0; n_bins];
    for (i, e) in input.errors() {
        if !e.is_finite() {
            continue;
        }
        let bin = (1..n_bins).position(|k| e < edges[k]).unwrap_or(n_bins - 1);
        counts[bin] += input.weight(i);
    }
    Ok(MetricValue::Table {
        labels: vec!["edges".to_string(), "counts".to_string()],
        values: vec![edges, counts],
    })
}

/// Predictions grouped by the bin of their actual value
fn predicted_true(input: &RegressionInput<'_>) -> Result<MetricValue> {
    let bins = input
        .bin_info
        .ok_or_else(|| RunnerError::ComputationError("no bin info for this dataset".to_string()))?;
    let n = bins.number_of_bins;
    let mut sums = vec![0.0; n];
    let mut squares = vec![0.0; n];
    let mut counts = vec![0.0; n];
    for (t, p) in input.y_true.iter().zip(input.y_pred.iter()) {
        let b = bins.bin_of(*t);
        sums[b] += p;
        squares[b] += p * p;
        counts[b] += 1.0;
    }
    let means: Vec<f64> = sums.iter().zip(&counts).map(|(s, c)| if *c > 0.0 { s / c } else { f64::NAN }).collect();
    let stds: Vec<f64> = squares
        .iter()
        .zip(&counts)
        .zip(&means)
        .map(|((sq, c), m)| if *c > 0.0 { (sq / c - m * m).max(0.0).sqrt() } else { f64::NAN })
        .collect();
    Ok(MetricValue::Table {
        labels: ["bin_start", "bin_end", "mean_predicted", "std_predicted", "count"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        values: vec![bins.bin_starts.clone(), bins.bin_ends.clone(), means, stds, counts],
    })
}

fn compute(name: &str, input: &RegressionInput<'_>) -> Result<MetricValue> {
    let value = match name {
        names::R2 => r2(input)?,
        names::MAE => mae(input)?,
        names::RMSE => rmse(input)?,
        names::RMSLE => rmsle(input)?,
        names::MEDIAN_AE => median_ae(input)?,
        names::NORMALIZED_MAE => {
            let (lo, hi) = input.range();
            normalize(mae(input)?, hi - lo)?
        }
        names::NORMALIZED_RMSE => {
            let (lo, hi) = input.range();
            normalize(rmse(input)?, hi - lo)?
        }
        names::NORMALIZED_MEDIAN_AE => {
            let (lo, hi) = input.range();
            normalize(median_ae(input)?, hi - lo)?
        }
        names::NORMALIZED_RMSLE => {
            let (lo, hi) = input.range();
            normalize(rmsle(input)?, hi.ln_1p() - lo.ln_1p())?
        }
        names::EXPLAINED_VARIANCE => explained_variance(input)?,
        names::SPEARMAN => spearman(input)?,
        names::MAPE => mape(input)?,
        names::RESIDUALS => return residuals(input),
        names::PREDICTED_TRUE => return predicted_true(input),
        other => {
            return Err(RunnerError::ComputationError(format!(
                "'{}' is not a regression metric",
                other
            )))
        }
    };
    Ok(MetricValue::Scalar(if value.is_finite() { value } else { f64::NAN }))
}

/// Score regressor output
pub fn score_regression(input: &RegressionInput<'_>, metrics: &[String]) -> MetricMap {
    let mut out = MetricMap::new();
    if input.y_true.len() != input.y_pred.len() {
        let err = RunnerError::ShapeError {
            expected: format!("{} predictions", input.y_true.len()),
            actual: format!("{} predictions", input.y_pred.len()),
        };
        for m in metrics {
            record(&mut out, m, Err(err.clone()));
        }
        return out;
    }
    debug!(n = input.y_true.len(), "Scoring regression");
    for m in metrics {
        record(&mut out, m, compute(m, input));
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
    fn test_basic_errors() {
        let y = array![1.0, 2.0, 3.0, 4.0];
        let p = array![1.0, 2.0, 3.0, 6.0];
        let mut input = RegressionInput::new(&y, &p);
        input.y_min = Some(0.0);
        input.y_max = Some(10.0);
        let out = score_regression(
            &input,
            &all(&[names::MAE, names::RMSE, names::MEDIAN_AE, names::NORMALIZED_MAE, names::R2]),
        );
        assert!((out[names::MAE].as_f64().unwrap() - 0.5).abs() < 1e-12);
        assert!((out[names::RMSE].as_f64().unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(out[names::MEDIAN_AE].as_f64().unwrap(), 0.0);
        assert!((out[names::NORMALIZED_MAE].as_f64().unwrap() - 0.05).abs() < 1e-12);
        assert!((out[names::R2].as_f64().unwrap() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_zero_range_normalization_is_nan() {
        let y = array![2.0, 2.0];
        let p = array![1.0, 3.0];
        let out = score_regression(&RegressionInput::new(&y, &p), &all(&[names::NORMALIZED_RMSE]));
        assert!(out[names::NORMALIZED_RMSE].as_f64().unwrap().is_nan());
    }

    #[test]
    fn test_mape_skips_zero_actuals_and_rmsle_rejects_negatives() {
        let y = array![0.0, 10.0, -1.0];
        let p = array![5.0, 12.0, -1.0];
        let out = score_regression(&RegressionInput::new(&y, &p), &all(&[names::MAPE, names::RMSLE]));
        assert!((out[names::MAPE].as_f64().unwrap() - 10.0).abs() < 1e-9);
        assert!(out[names::RMSLE].as_f64().unwrap().is_nan());
    }

    #[test]
    fn test_spearman_is_rank_based() {
        let y = array![1.0, 2.0, 3.0, 4.0];
        let p = array![1.0, 10.0, 100.0, 1000.0];
        let out = score_regression(&RegressionInput::new(&y, &p), &all(&[names::SPEARMAN]));
        assert!((out[names::SPEARMAN].as_f64().unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_residual_histogram() {
        let y = array![0.0, 0.0, 0.0, 0.0];
        let p = array![0.0, 0.1, -5.0, 5.0];
        let mut input = RegressionInput::new(&y, &p);
        input.y_std = Some(1.0);
        let out = score_regression(&input, &all(&[names::RESIDUALS]));
        match &out[names::RESIDUALS] {
            MetricValue::Table { labels, values } => {
                assert_eq!(labels, &vec!["edges".to_string(), "counts".to_string()]);
                assert_eq!(values[0].len(), RESIDUAL_BINS + 1);
                assert_eq!(values[1].iter().sum::<f64>(), 4.0);
                assert_eq!(values[1][0], 1.0);
                assert_eq!(values[1][RESIDUAL_BINS - 1], 1.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_predicted_true_without_bins_is_error_sentinel() {
        let y = array![1.0, 2.0];
        let out = score_regression(&RegressionInput::new(&y, &y), &all(&[names::PREDICTED_TRUE]));
        assert!(matches!(out[names::PREDICTED_TRUE], MetricValue::Error { .. }));
    }
}
