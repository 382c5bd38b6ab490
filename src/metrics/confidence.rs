//! Bootstrap confidence intervals for scalar metrics

use rand::Rng;
use rayon::prelude::*;

use super::{is_table_metric, names, MetricMap, MetricValue};
use crate::dataset::binning::percentile;
use crate::dataset::sampling::rng_for;

/// Resamples drawn per interval
pub const BOOTSTRAP_ITERATIONS: usize = 100;

const LOWER: &str = "lower_ci_95";
const UPPER: &str = "upper_ci_95";

/// 95% bootstrap intervals as `<metric>_extras` tables
///
/// `score` is called once per resample with row positions drawn with
/// replacement from `0..n`. Resample `i` is seeded with `seed + i` so the
/// result does not depend on thread scheduling.
pub fn bootstrap_extras<F>(n: usize, seed: u64, metrics: &[String], score: F) -> MetricMap
where
    F: Fn(&[usize]) -> MetricMap + Sync,
{
    let mut out = MetricMap::new();
    if n == 0 {
        return out;
    }
    let scored: Vec<MetricMap> = (0..BOOTSTRAP_ITERATIONS)
        .into_par_iter()
        .map(|i| {
            let mut rng = rng_for(seed.wrapping_add(i as u64));
            let rows: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            score(&rows)
        })
        .collect();

    for m in metrics.iter().filter(|m| !is_table_metric(m)) {
        let mut samples: Vec<f64> = scored
            .iter()
            .filter_map(|s| s.get(m).and_then(MetricValue::as_f64))
            .filter(|v| v.is_finite())
            .collect();
        if samples.is_empty() {
            continue;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        out.insert(
            names::extras_of(m),
            MetricValue::Table {
                labels: vec![LOWER.to_string(), UPPER.to_string()],
                values: vec![vec![percentile(&samples, 2.5)], vec![percentile(&samples, 97.5)]],
            },
        );
    }
    out
}
