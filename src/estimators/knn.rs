//! K-nearest-neighbour classifier and regressor

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{unique_classes, Learner};
use crate::error::{Result, RunnerError};
use crate::pipeline::Params;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    Manhattan,
    Minkowski(f64),
    Cosine,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum WeightScheme {
    #[default]
    Uniform,
    /// Inverse distance
    Distance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Neighbours {
    n_neighbors: usize,
    metric: DistanceMetric,
    weights: WeightScheme,
    x_train: Option<Array2<f64>>,
    y_train: Option<Array1<f64>>,
}

impl Neighbours {
    const PARAMS: &'static [&'static str] = &["n_neighbors", "weights", "metric", "p", "n_jobs"];

    fn from_params(p: &mut Params) -> Result<Self> {
        let n_neighbors = p.usize_or("n_neighbors", 5)?;
        if n_neighbors == 0 {
            return Err(RunnerError::invalid_option("n_neighbors", 0, "must be positive"));
        }
        let weights = match p.string_or("weights", "uniform")?.as_str() {
            "uniform" => WeightScheme::Uniform,
            "distance" => WeightScheme::Distance,
            other => return Err(RunnerError::invalid_option("weights", other, "expected uniform or distance")),
        };
        let minkowski_p = p.f64_or("p", 2.0)?;
        let metric = match p.string_or("metric", "minkowski")?.as_str() {
            "euclidean" => DistanceMetric::Euclidean,
            "manhattan" => DistanceMetric::Manhattan,
            "cosine" => DistanceMetric::Cosine,
            "minkowski" if minkowski_p == 2.0 => DistanceMetric::Euclidean,
            "minkowski" if minkowski_p == 1.0 => DistanceMetric::Manhattan,
            "minkowski" => DistanceMetric::Minkowski(minkowski_p),
            other => return Err(RunnerError::invalid_option("metric", other, "unsupported distance")),
        };
        // rayon sizes its own pool
        let _ = p.opt_usize("n_jobs")?;
        Ok(Self::with_k(n_neighbors).with_metric(metric).with_weights(weights))
    }

    fn with_k(k: usize) -> Self {
        Self {
            n_neighbors: k,
            metric: DistanceMetric::default(),
            weights: WeightScheme::default(),
            x_train: None,
            y_train: None,
        }
    }

    fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    fn with_weights(mut self, weights: WeightScheme) -> Self {
        self.weights = weights;
        self
    }

    fn store(&mut self, x: &Array2<f64>, y: &Array1<f64>) {
        self.x_train = Some(x.clone());
        self.y_train = Some(y.clone());
    }

    fn fitted(&self) -> Result<(&Array2<f64>, &Array1<f64>)> {
        match (&self.x_train, &self.y_train) {
            (Some(x), Some(y)) => Ok((x, y)),
            _ => Err(RunnerError::ModelNotFitted),
        }
    }

    /// Apply `f` to the neighbour list of every row of `x`, in parallel
    fn map_rows<T: Send>(&self, x: &Array2<f64>, f: impl Fn(&[(f64, f64)]) -> T + Sync) -> Result<Vec<T>> {
        let (x_train, y_train) = self.fitted()?;
        if x.ncols() != x_train.ncols() {
            return Err(RunnerError::ShapeError {
                expected: format!("{} features", x_train.ncols()),
                actual: format!("{} features", x.ncols()),
            });
        }
        let k = self.n_neighbors.min(x_train.nrows());
        let metric = self.metric;
        Ok((0..x.nrows())
            .into_par_iter()
            .map(|i| {
                let row: Vec<f64> = x.row(i).to_vec();
                f(&find_k_nearest(&row, x_train, y_train, k, metric))
            })
            .collect())
    }
}

/// Nearest-neighbour vote classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KNeighborsClassifier {
    inner: Neighbours,
    classes: Vec<f64>,
}

impl KNeighborsClassifier {
    pub const PARAMS: &'static [&'static str] = Neighbours::PARAMS;

    pub fn with_k(k: usize) -> Self {
        Self {
            inner: Neighbours::with_k(k),
            classes: Vec::new(),
        }
    }

    pub fn with_weights(mut self, weights: WeightScheme) -> Self {
        self.inner = self.inner.with_weights(weights);
        self
    }

    pub fn from_params(p: &mut Params) -> Result<Self> {
        Ok(Self {
            inner: Neighbours::from_params(p)?,
            classes: Vec::new(),
        })
    }
}

impl Learner for KNeighborsClassifier {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, _sample_weight: Option<&Array1<f64>>) -> Result<()> {
        self.inner.store(x, y);
        self.classes = unique_classes(y);
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let weights = self.inner.weights;
        let classes = &self.classes;
        let labels = self.inner.map_rows(x, |nb| {
            let probs = class_probs_from(nb, classes, weights);
            let best = probs
                .iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |acc, (i, &p)| if p > acc.1 { (i, p) } else { acc })
                .0;
            classes.get(best).copied().unwrap_or(f64::NAN)
        })?;
        Ok(Array1::from_vec(labels))
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Option<Array2<f64>>> {
        let weights = self.inner.weights;
        let classes = &self.classes;
        let rows = self.inner.map_rows(x, |nb| class_probs_from(nb, classes, weights))?;
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        Ok(Some(Array2::from_shape_vec((x.nrows(), classes.len()), flat)?))
    }

    fn classes(&self) -> Option<&[f64]> {
        Some(&self.classes)
    }
}

/// Nearest-neighbour mean regressor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KNeighborsRegressor {
    inner: Neighbours,
}

impl KNeighborsRegressor {
    pub const PARAMS: &'static [&'static str] = Neighbours::PARAMS;

    pub fn with_k(k: usize) -> Self {
        Self {
            inner: Neighbours::with_k(k),
        }
    }

    pub fn from_params(p: &mut Params) -> Result<Self> {
        Ok(Self {
            inner: Neighbours::from_params(p)?,
        })
    }
}

impl Learner for KNeighborsRegressor {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, _sample_weight: Option<&Array1<f64>>) -> Result<()> {
        self.inner.store(x, y);
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let weights = self.inner.weights;
        let values = self.inner.map_rows(x, |nb| weighted_mean_from(nb, weights))?;
        Ok(Array1::from_vec(values))
    }
}

/// Max-heap entry keeping the k smallest distances
#[derive(PartialEq)]
struct DistLabel(f64, f64);

impl Eq for DistLabel {}

impl PartialOrd for DistLabel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DistLabel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

/// `(distance, label)` of the k nearest training rows, O(n log k)
fn find_k_nearest(
    point: &[f64],
    x_train: &Array2<f64>,
    y_train: &Array1<f64>,
    k: usize,
    metric: DistanceMetric,
) -> Vec<(f64, f64)> {
    let mut heap = BinaryHeap::with_capacity(k + 1);
    for (i, row) in x_train.rows().into_iter().enumerate() {
        let dist = compute_distance(point, row.iter().copied(), metric);
        if heap.len() < k {
            heap.push(DistLabel(dist, y_train[i]));
        } else if let Some(top) = heap.peek() {
            if dist < top.0 {
                heap.pop();
                heap.push(DistLabel(dist, y_train[i]));
            }
        }
    }
    heap.into_iter().map(|dl| (dl.0, dl.1)).collect()
}

fn compute_distance(a: &[f64], b: impl Iterator<Item = f64>, metric: DistanceMetric) -> f64 {
    let pairs = a.iter().copied().zip(b);
    match metric {
        DistanceMetric::Euclidean => pairs.map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt(),
        DistanceMetric::Manhattan => pairs.map(|(x, y)| (x - y).abs()).sum(),
        DistanceMetric::Minkowski(p) => pairs.map(|(x, y)| (x - y).abs().powf(p)).sum::<f64>().powf(1.0 / p),
        DistanceMetric::Cosine => {
            let (mut dot, mut na, mut nb) = (0.0, 0.0, 0.0);
            for (x, y) in pairs {
                dot += x * y;
                na += x * x;
                nb += y * y;
            }
            let denom = na.sqrt() * nb.sqrt();
            if denom > 0.0 {
                1.0 - dot / denom
            } else {
                1.0
            }
        }
    }
}

fn neighbour_weight(dist: f64, weights: WeightScheme) -> f64 {
    match weights {
        WeightScheme::Uniform => 1.0,
        WeightScheme::Distance => 1.0 / (dist + 1e-10),
    }
}

fn class_probs_from(neighbours: &[(f64, f64)], classes: &[f64], weights: WeightScheme) -> Vec<f64> {
    let mut counts = vec![0.0; classes.len()];
    let mut total = 0.0;
    for &(dist, label) in neighbours {
        let w = neighbour_weight(dist, weights);
        if let Some(idx) = classes.iter().position(|&c| c == label) {
            counts[idx] += w;
            total += w;
        }
    }
    if total > 0.0 {
        counts.iter_mut().for_each(|c| *c /= total);
    }
    counts
}

fn weighted_mean_from(neighbours: &[(f64, f64)], weights: WeightScheme) -> f64 {
    let (sum, total) = neighbours.iter().fold((0.0, 0.0), |(s, t), &(dist, y)| {
        let w = neighbour_weight(dist, weights);
        (s + w * y, t + w)
    });
    if total > 0.0 {
        sum / total
    } else {
        f64::NAN
    }
}
