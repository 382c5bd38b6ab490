//! Fold aggregation of metric maps

use tracing::warn;

use super::{names, MetricMap, MetricValue};
use crate::constants::timing;

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        f64::NAN
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn tables<'a>(values: &[&'a MetricValue]) -> Option<Vec<(&'a Vec<String>, &'a Vec<Vec<f64>>)>> {
    values
        .iter()
        .map(|v| match *v {
            MetricValue::Table { labels, values } => Some((labels, values)),
            _ => None,
        })
        .collect()
}

fn mismatch(metric: &str, why: &str) -> MetricValue {
    warn!(metric, reason = why, "Cannot aggregate metric across folds");
    MetricValue::Error {
        metric: metric.to_string(),
        message: format!("cannot aggregate across folds: {}", why),
    }
}

/// Cell-wise sum of same-labelled tables
fn sum_tables(metric: &str, parts: &[(&Vec<String>, &Vec<Vec<f64>>)]) -> MetricValue {
    let (labels, first) = parts[0];
    let mut acc = first.clone();
    for (other_labels, other) in &parts[1..] {
        if *other_labels != labels || other.len() != acc.len() {
            return mismatch(metric, "label sets differ");
        }
        for (row, other_row) in acc.iter_mut().zip(other.iter()) {
            if row.len() != other_row.len() {
                return mismatch(metric, "row lengths differ");
            }
            row.iter_mut().zip(other_row).for_each(|(a, b)| *a += b);
        }
    }
    MetricValue::Table {
        labels: labels.clone(),
        values: acc,
    }
}

/// Histograms share their edges; counts add up
fn sum_histograms(metric: &str, parts: &[(&Vec<String>, &Vec<Vec<f64>>)]) -> MetricValue {
    let (labels, first) = parts[0];
    let Some(edges_at) = labels.iter().position(|l| l == "edges") else {
        return mismatch(metric, "no edges row");
    };
    if parts
        .iter()
        .any(|(l, v)| *l != labels || v.get(edges_at) != first.get(edges_at))
    {
        return mismatch(metric, "histogram edges differ");
    }
    let mut acc = first.clone();
    for (_, other) in &parts[1..] {
        for (k, (row, other_row)) in acc.iter_mut().zip(other.iter()).enumerate() {
            if k != edges_at {
                row.iter_mut().zip(other_row).for_each(|(a, b)| *a += b);
            }
        }
    }
    MetricValue::Table {
        labels: labels.clone(),
        values: acc,
    }
}

/// Element-wise mean by row label, rows in order of first appearance
fn mean_by_label(metric: &str, parts: &[(&Vec<String>, &Vec<Vec<f64>>)]) -> MetricValue {
    let mut labels: Vec<String> = Vec::new();
    let mut sums: Vec<Vec<f64>> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();
    for (part_labels, part_values) in parts {
        for (label, row) in part_labels.iter().zip(part_values.iter()) {
            match labels.iter().position(|l| l == label) {
                Some(k) => {
                    if sums[k].len() != row.len() {
                        return mismatch(metric, "row lengths differ");
                    }
                    sums[k].iter_mut().zip(row).for_each(|(a, b)| *a += b);
                    counts[k] += 1;
                }
                None => {
                    labels.push(label.clone());
                    sums.push(row.clone());
                    counts.push(1);
                }
            }
        }
    }
    let values = sums
        .into_iter()
        .zip(counts)
        .map(|(row, c)| row.into_iter().map(|v| v / c as f64).collect())
        .collect();
    MetricValue::Table { labels, values }
}

fn aggregate_one(metric: &str, values: &[&MetricValue]) -> MetricValue {
    if let Some(err) = values.iter().find(|v| matches!(v, MetricValue::Error { .. })) {
        return (*err).clone();
    }
    if let Some(scalars) = values.iter().map(|v| v.as_f64()).collect::<Option<Vec<f64>>>() {
        return MetricValue::Scalar(mean(&scalars));
    }
    let Some(parts) = tables(values) else {
        return mismatch(metric, "mixed scalar and table values");
    };
    match metric {
        names::CONFUSION_MATRIX => sum_tables(metric, &parts),
        names::RESIDUALS => sum_histograms(metric, &parts),
        _ => mean_by_label(metric, &parts),
    }
}

/// Combine per-fold metric maps into one
///
/// Every requested metric, every `<metric>_extras` sibling, every timing key
/// and any other key present in a fold appears in the result. Scalars are
/// arithmetic means; confusion matrices and residual counts are summed; other
/// tables are averaged row by row.
pub fn aggregate_scores(per_fold: &[MetricMap], metrics: &[String]) -> MetricMap {
    let mut keys: Vec<String> = metrics.to_vec();
    for key in timing::ALL {
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }
    for fold in per_fold {
        for key in fold.keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
    }

    let mut out = MetricMap::new();
    for key in keys {
        let values: Vec<&MetricValue> = per_fold.iter().filter_map(|f| f.get(&key)).collect();
        if values.is_empty() {
            if metrics.contains(&key) {
                out.insert(key, MetricValue::Scalar(f64::NAN));
            }
            continue;
        }
        let aggregated = aggregate_one(&key, &values);
        out.insert(key, aggregated);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::attach_timing;

    fn fold(acc: f64, fit: f64, predict: f64) -> MetricMap {
        let mut m = MetricMap::new();
        m.insert(names::ACCURACY.to_string(), MetricValue::Scalar(acc));
        m.insert(
            names::CONFUSION_MATRIX.to_string(),
            MetricValue::Table {
                labels: vec!["0".into(), "1".into()],
                values: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            },
        );
        m.insert(
            names::extras_of(names::ACCURACY),
            MetricValue::Table {
                labels: vec!["lower_ci_95".into(), "upper_ci_95".into()],
                values: vec![vec![acc - 0.1], vec![acc + 0.1]],
            },
        );
        attach_timing(&mut m, fit, predict);
        m
    }

    #[test]
    fn test_scalar_means_and_summed_confusion() {
        let folds = vec![fold(0.5, 1.0, 0.5), fold(1.0, 3.0, 1.5)];
        let metrics = vec![names::ACCURACY.to_string(), names::CONFUSION_MATRIX.to_string()];
        let out = aggregate_scores(&folds, &metrics);
        assert_eq!(out[names::ACCURACY].as_f64(), Some(0.75));
        assert_eq!(out[timing::FIT_TIME].as_f64(), Some(2.0));
        assert_eq!(out[timing::PREDICT_TIME].as_f64(), Some(1.0));
        assert_eq!(out[timing::TRAIN_TIME].as_f64(), Some(3.0));
        match &out[names::CONFUSION_MATRIX] {
            MetricValue::Table { values, .. } => assert_eq!(values, &vec![vec![2.0, 0.0], vec![0.0, 2.0]]),
            other => panic!("unexpected {:?}", other),
        }
        match &out[&names::extras_of(names::ACCURACY)] {
            MetricValue::Table { values, .. } => assert!((values[0][0] - 0.65).abs() < 1e-12),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_residual_counts_add_and_edges_must_match() {
        let hist = |counts: Vec<f64>, hi: f64| {
            let mut m = MetricMap::new();
            m.insert(
                names::RESIDUALS.to_string(),
                MetricValue::Table {
                    labels: vec!["edges".into(), "counts".into()],
                    values: vec![vec![-hi, 0.0, hi], counts],
                },
            );
            m
        };
        let metrics = vec![names::RESIDUALS.to_string()];
        let out = aggregate_scores(&[hist(vec![1.0, 2.0], 1.0), hist(vec![3.0, 4.0], 1.0)], &metrics);
        match &out[names::RESIDUALS] {
            MetricValue::Table { values, .. } => assert_eq!(values[1], vec![4.0, 6.0]),
            other => panic!("unexpected {:?}", other),
        }
        let out = aggregate_scores(&[hist(vec![1.0, 2.0], 1.0), hist(vec![3.0, 4.0], 2.0)], &metrics);
        assert!(matches!(out[names::RESIDUALS], MetricValue::Error { .. }));
    }
}
