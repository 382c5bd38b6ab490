//! Classification metrics

use ndarray::{Array1, Array2};
use tracing::debug;

use super::{names, record, MetricMap, MetricValue};
use crate::dataset::LabelEncoder;
use crate::error::{Result, RunnerError};

const PROBA_EPS: f64 = 1e-15;

/// Everything a classification scorer reads
pub struct ClassificationInput<'a> {
    pub y_true: &'a Array1<f64>,
    pub y_pred: &'a Array1<f64>,
    /// Columns ordered as `train_labels`
    pub y_proba: Option<&'a Array2<f64>>,
    /// Classes the fitted model saw
    pub train_labels: &'a [f64],
    /// Classes of the whole corpus
    pub class_labels: &'a [f64],
    /// Maps encoded labels back to their original values for reporting
    pub y_transformer: Option<&'a LabelEncoder>,
    /// Score binary metrics on the positive class only
    pub use_binary: bool,
    pub sample_weight: Option<&'a Array1<f64>>,
}

/// Weighted confusion matrix over a fixed label order
struct Confusion {
    labels: Vec<f64>,
    cells: Array2<f64>,
}

impl Confusion {
    fn new(input: &ClassificationInput<'_>) -> Self {
        let mut labels: Vec<f64> = input.class_labels.to_vec();
        labels.extend(input.y_true.iter().chain(input.y_pred.iter()).copied());
        labels.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        labels.dedup();

        let mut cells = Array2::zeros((labels.len(), labels.len()));
        for (i, (t, p)) in input.y_true.iter().zip(input.y_pred.iter()).enumerate() {
            let w = input.sample_weight.map_or(1.0, |w| w[i]);
            if let (Some(r), Some(c)) = (position(&labels, *t), position(&labels, *p)) {
                cells[[r, c]] += w;
            }
        }
        Self { labels, cells }
    }

    fn support(&self, k: usize) -> f64 {
        self.cells.row(k).sum()
    }

    fn predicted(&self, k: usize) -> f64 {
        self.cells.column(k).sum()
    }

    fn total(&self) -> f64 {
        self.cells.sum()
    }

    /// (precision, recall, f1) of class `k`; empty denominators give 0
    fn prf(&self, k: usize) -> (f64, f64, f64) {
        let tp = self.cells[[k, k]];
        let precision = ratio(tp, self.predicted(k));
        let recall = ratio(tp, self.support(k));
        let f1 = ratio(2.0 * precision * recall, precision + recall);
        (precision, recall, f1)
    }

    /// Classes present in the actuals or the predictions
    fn active(&self) -> Vec<usize> {
        (0..self.labels.len())
            .filter(|&k| self.support(k) > 0.0 || self.predicted(k) > 0.0)
            .collect()
    }

    fn macro_avg(&self, pick: impl Fn((f64, f64, f64)) -> f64) -> Result<f64> {
        let active = self.active();
        if active.is_empty() {
            return Err(RunnerError::ComputationError("no samples to score".to_string()));
        }
        Ok(active.iter().map(|&k| pick(self.prf(k))).sum::<f64>() / active.len() as f64)
    }

    fn weighted_avg(&self, pick: impl Fn((f64, f64, f64)) -> f64) -> Result<f64> {
        let total = self.total();
        if total <= 0.0 {
            return Err(RunnerError::ComputationError("no samples to score".to_string()));
        }
        Ok((0..self.labels.len())
            .map(|k| pick(self.prf(k)) * self.support(k))
            .sum::<f64>()
            / total)
    }

    fn present(&self) -> Vec<usize> {
        (0..self.labels.len()).filter(|&k| self.support(k) > 0.0).collect()
    }

    fn macro_recall(&self) -> Result<f64> {
        let present = self.present();
        if present.is_empty() {
            return Err(RunnerError::ComputationError("no samples to score".to_string()));
        }
        Ok(present.iter().map(|&k| self.prf(k).1).sum::<f64>() / present.len() as f64)
    }

    /// Positive class of a two-class problem
    fn positive(&self) -> Result<usize> {
        if self.labels.len() == 2 {
            Ok(1)
        } else {
            Err(RunnerError::ComputationError(format!(
                "binary metrics need exactly two classes, found {}",
                self.labels.len()
            )))
        }
    }
}

fn position(labels: &[f64], v: f64) -> Option<usize> {
    labels.iter().position(|&l| l == v)
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

/// Probabilities re-indexed from `train_labels` onto `labels`
fn aligned_proba(input: &ClassificationInput<'_>, labels: &[f64]) -> Result<Array2<f64>> {
    let proba = input
        .y_proba
        .ok_or_else(|| RunnerError::ComputationError("model does not produce probabilities".to_string()))?;
    if proba.ncols() != input.train_labels.len() || proba.nrows() != input.y_true.len() {
        return Err(RunnerError::ShapeError {
            expected: format!("{} x {}", input.y_true.len(), input.train_labels.len()),
            actual: format!("{} x {}", proba.nrows(), proba.ncols()),
        });
    }
    let mut out = Array2::zeros((proba.nrows(), labels.len()));
    for (j, label) in input.train_labels.iter().enumerate() {
        if let Some(k) = position(labels, *label) {
            out.column_mut(k).assign(&proba.column(j));
        }
    }
    Ok(out)
}

fn log_loss(input: &ClassificationInput<'_>, cm: &Confusion) -> Result<f64> {
    let proba = aligned_proba(input, &cm.labels)?;
    let mut total = 0.0;
    let mut weight = 0.0;
    for (i, t) in input.y_true.iter().enumerate() {
        let k = position(&cm.labels, *t).ok_or_else(|| RunnerError::ComputationError(format!("unknown label {}", t)))?;
        let row_sum: f64 = proba.row(i).sum();
        let p = if row_sum > 0.0 { proba[[i, k]] / row_sum } else { 0.0 };
        let w = input.sample_weight.map_or(1.0, |w| w[i]);
        total -= w * p.clamp(PROBA_EPS, 1.0 - PROBA_EPS).ln();
        weight += w;
    }
    if weight <= 0.0 {
        return Err(RunnerError::ComputationError("no samples to score".to_string()));
    }
    Ok(total / weight)
}

/// Mann-Whitney AUC of `scores` for `positives`, ties counted half
fn binary_auc(scores: &[f64], positives: &[bool]) -> Option<f64> {
    let n_pos = positives.iter().filter(|&&p| p).count();
    let n_neg = positives.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].partial_cmp(&scores[b]).unwrap_or(std::cmp::Ordering::Equal));
    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg_rank;
        }
        i = j + 1;
    }
    let pos_rank_sum: f64 = ranks.iter().zip(positives).filter(|(_, &p)| p).map(|(r, _)| r).sum();
    let u = pos_rank_sum - (n_pos * (n_pos + 1)) as f64 / 2.0;
    Some(u / (n_pos * n_neg) as f64)
}

/// One-vs-rest AUC per class with both positives and negatives, with support
fn per_class_auc(input: &ClassificationInput<'_>, cm: &Confusion) -> Result<Vec<(f64, f64)>> {
    let proba = aligned_proba(input, &cm.labels)?;
    let out: Vec<(f64, f64)> = (0..cm.labels.len())
        .filter_map(|k| {
            let positives: Vec<bool> = input.y_true.iter().map(|&t| t == cm.labels[k]).collect();
            let scores = proba.column(k).to_vec();
            binary_auc(&scores, &positives).map(|auc| (auc, cm.support(k)))
        })
        .collect();
    if out.is_empty() {
        Err(RunnerError::ComputationError("AUC needs both positive and negative samples".to_string()))
    } else {
        Ok(out)
    }
}

fn label_text(input: &ClassificationInput<'_>, labels: &[f64]) -> Vec<String> {
    let originals = match input.y_transformer {
        Some(encoder) => encoder.inverse_transform(&Array1::from_vec(labels.to_vec())).to_vec(),
        None => labels.to_vec(),
    };
    originals.iter().map(|v| v.to_string()).collect()
}

fn compute(name: &str, input: &ClassificationInput<'_>, cm: &Confusion) -> Result<MetricValue> {
    let scalar = |v: f64| Ok(MetricValue::Scalar(v));
    match name {
        names::ACCURACY => {
            let total = cm.total();
            if total <= 0.0 {
                return Err(RunnerError::ComputationError("no samples to score".to_string()));
            }
            scalar(cm.cells.diag().sum() / total)
        }
        names::BALANCED_ACCURACY => scalar(cm.macro_recall()?),
        names::PRECISION_MACRO => scalar(cm.macro_avg(|(p, _, _)| p)?),
        names::RECALL_MACRO => scalar(cm.macro_avg(|(_, r, _)| r)?),
        names::F1_MACRO => scalar(cm.macro_avg(|(_, _, f)| f)?),
        names::PRECISION_WEIGHTED => scalar(cm.weighted_avg(|(p, _, _)| p)?),
        names::RECALL_WEIGHTED => scalar(cm.weighted_avg(|(_, r, _)| r)?),
        names::F1_WEIGHTED => scalar(cm.weighted_avg(|(_, _, f)| f)?),
        names::PRECISION_BINARY | names::RECALL_BINARY | names::F1_BINARY | names::AUC_BINARY if !input.use_binary => {
            Err(RunnerError::ComputationError("binary metrics are disabled for this run".to_string()))
        }
        names::PRECISION_BINARY => scalar(cm.prf(cm.positive()?).0),
        names::RECALL_BINARY => scalar(cm.prf(cm.positive()?).1),
        names::F1_BINARY => scalar(cm.prf(cm.positive()?).2),
        names::AUC_BINARY => {
            let k = cm.positive()?;
            let proba = aligned_proba(input, &cm.labels)?;
            let positives: Vec<bool> = input.y_true.iter().map(|&t| t == cm.labels[k]).collect();
            binary_auc(&proba.column(k).to_vec(), &positives)
                .map(MetricValue::Scalar)
                .ok_or_else(|| RunnerError::ComputationError("AUC needs both classes present".to_string()))
        }
        names::LOG_LOSS => scalar(log_loss(input, cm)?),
        names::AUC_MACRO => {
            let aucs = per_class_auc(input, cm)?;
            scalar(aucs.iter().map(|(a, _)| a).sum::<f64>() / aucs.len() as f64)
        }
        names::AUC_WEIGHTED => {
            let aucs = per_class_auc(input, cm)?;
            let support: f64 = aucs.iter().map(|(_, s)| s).sum();
            scalar(aucs.iter().map(|(a, s)| a * s).sum::<f64>() / support)
        }
        names::NORM_MACRO_RECALL => {
            let r = cm.present().len() as f64;
            if r < 2.0 {
                return Err(RunnerError::ComputationError("needs at least two classes in the actuals".to_string()));
            }
            let chance = 1.0 / r;
            scalar(((cm.macro_recall()? - chance) / (1.0 - chance)).max(0.0))
        }
        names::CONFUSION_MATRIX => Ok(MetricValue::Table {
            labels: label_text(input, &cm.labels),
            values: cm.cells.rows().into_iter().map(|r| r.to_vec()).collect(),
        }),
        other => Err(RunnerError::ComputationError(format!("'{}' is not a classification metric", other))),
    }
}

/// Score classifier output
pub fn score_classification(input: &ClassificationInput<'_>, metrics: &[String]) -> MetricMap {
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
    let cm = Confusion::new(input);
    debug!(n = input.y_true.len(), n_classes = cm.labels.len(), "Scoring classification");
    for m in metrics {
        record(&mut out, m, compute(m, input, &cm));
    }
    out
}
