//! Histogram bins for regression targets
//!
//! Bins standardize the edges of chart metrics so per-fold histograms can be
//! aggregated. The first and last bins absorb outliers beyond the chosen
//! percentiles.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Upper bound on the number of bins
pub const MAX_BINS: usize = 100;
/// Average number of held-out samples per bin
pub const SAMPLES_PER_BIN: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinInfo {
    pub number_of_bins: usize,
    pub bin_starts: Vec<f64>,
    pub bin_ends: Vec<f64>,
}

impl BinInfo {
    /// Bin index holding `value`, clamped to the outer bins
    pub fn bin_of(&self, value: f64) -> usize {
        let last = self.number_of_bins.saturating_sub(1);
        self.bin_ends
            .iter()
            .position(|&end| value <= end)
            .unwrap_or(last)
            .min(last)
    }
}

/// Linear-interpolated percentile of sorted data, `q` in `[0, 100]`
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Compute bins for `n_valid` held-out points drawn from targets `y`
///
/// The number of bins is `min(100, max(1, n_valid / 10))`. With three or
/// more bins the inner edges are spread evenly between the `percentile` and
/// `100 - percentile` quantiles of `y`.
pub fn make_bin_info(n_valid: usize, y: &Array1<f64>, percentile_q: f64) -> BinInfo {
    let number_of_bins = (n_valid / SAMPLES_PER_BIN).clamp(1, MAX_BINS);
    let mut sorted: Vec<f64> = y.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let (y_min, y_max) = match (sorted.first(), sorted.last()) {
        (Some(&lo), Some(&hi)) => (lo, hi),
        _ => (0.0, 0.0),
    };

    let edges: Vec<f64> = if number_of_bins < 3 || y_min == y_max {
        linspace(y_min, y_max, number_of_bins + 1)
    } else {
        let lower = percentile(&sorted, percentile_q);
        let upper = percentile(&sorted, 100.0 - percentile_q);
        let mut edges = Vec::with_capacity(number_of_bins + 1);
        edges.push(y_min);
        edges.extend(linspace(lower, upper, number_of_bins - 1));
        edges.push(y_max);
        edges
    };

    BinInfo {
        number_of_bins,
        bin_starts: edges[..number_of_bins].to_vec(),
        bin_ends: edges[1..].to_vec(),
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..n)
            .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_count_rule() {
        let y: Array1<f64> = (0..5000).map(|i| i as f64).collect();
        assert_eq!(make_bin_info(5, &y, 1.0).number_of_bins, 1);
        assert_eq!(make_bin_info(250, &y, 1.0).number_of_bins, 25);
        assert_eq!(make_bin_info(5000, &y, 1.0).number_of_bins, 100);
    }

    #[test]
    fn test_outer_bins_capture_outliers() {
        let y: Array1<f64> = (0..=100).map(|i| i as f64).collect();
        let bins = make_bin_info(100, &y, 1.0);
        assert_eq!(bins.number_of_bins, 10);
        assert_eq!(bins.bin_starts[0], 0.0);
        assert_eq!(bins.bin_ends[0], 1.0);
        assert_eq!(*bins.bin_ends.last().unwrap(), 100.0);
        assert_eq!(*bins.bin_starts.last().unwrap(), 99.0);
        assert_eq!(bins.bin_of(-5.0), 0);
        assert_eq!(bins.bin_of(500.0), 9);
    }

    #[test]
    fn test_constant_target() {
        let y = Array1::from_elem(50, 3.0);
        let bins = make_bin_info(50, &y, 1.0);
        assert_eq!(bins.number_of_bins, 5);
        assert!(bins.bin_starts.iter().all(|&s| s == 3.0));
    }
}
