//! CART decision trees with native categorical splits
//!
//! Numeric columns split on `x <= threshold`; columns flagged categorical in
//! the problem info split on `x == category`. The flags come from the
//! pipeline's categorical mask when one was recorded during instantiation,
//! else from the dataset's mask.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{unique_classes, weights_or_ones, Learner};
use crate::error::{Result, RunnerError};
use crate::pipeline::Params;

/// Test applied at an internal node; true goes left
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SplitRule {
    Threshold(f64),
    Equals(f64),
}

impl SplitRule {
    fn goes_left(self, value: f64) -> bool {
        match self {
            SplitRule::Threshold(t) => value <= t,
            SplitRule::Equals(c) => value == c,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TreeNode {
    Leaf {
        value: f64,
        /// Class weight fractions, classification only
        distribution: Vec<f64>,
        n_samples: usize,
    },
    Split {
        feature_idx: usize,
        rule: SplitRule,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
        n_samples: usize,
    },
}

impl TreeNode {
    fn leaf_for(&self, row: &[f64]) -> &TreeNode {
        let mut node = self;
        while let TreeNode::Split {
            feature_idx,
            rule,
            left,
            right,
            ..
        } = node
        {
            node = if rule.goes_left(row[*feature_idx]) { left } else { right };
        }
        node
    }

    pub fn depth(&self) -> usize {
        match self {
            TreeNode::Leaf { .. } => 0,
            TreeNode::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Criterion {
    Gini,
    Entropy,
    SquaredError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub criterion: Criterion,
    categorical: Option<Vec<bool>>,
    is_classification: bool,
    classes: Vec<f64>,
    n_features: usize,
    root: Option<TreeNode>,
}

impl DecisionTree {
    pub const PARAMS: &'static [&'static str] = &[
        "max_depth",
        "min_samples_split",
        "min_samples_leaf",
        "criterion",
        "random_state",
        "problem_info",
    ];

    pub fn classifier() -> Self {
        Self {
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            criterion: Criterion::Gini,
            categorical: None,
            is_classification: true,
            classes: Vec::new(),
            n_features: 0,
            root: None,
        }
    }

    pub fn regressor() -> Self {
        Self {
            criterion: Criterion::SquaredError,
            is_classification: false,
            ..Self::classifier()
        }
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn with_categorical(mut self, mask: Vec<bool>) -> Self {
        self.categorical = Some(mask);
        self
    }

    pub fn from_params(p: &mut Params, is_classification: bool) -> Result<Self> {
        let mut tree = if is_classification {
            Self::classifier()
        } else {
            Self::regressor()
        };
        tree.max_depth = p.opt_usize("max_depth")?;
        tree.min_samples_split = p.usize_or("min_samples_split", 2)?.max(2);
        tree.min_samples_leaf = p.usize_or("min_samples_leaf", 1)?.max(1);
        if let Some(name) = p.opt_string("criterion")? {
            tree.criterion = match (name.as_str(), is_classification) {
                ("gini", true) => Criterion::Gini,
                ("entropy", true) => Criterion::Entropy,
                ("squared_error" | "mse", false) => Criterion::SquaredError,
                (other, _) => return Err(RunnerError::invalid_option("criterion", other, "unsupported criterion")),
            };
        }
        let _ = p.opt_u64("random_state")?;
        p.take("problem_info");
        tree.categorical = p
            .problem_info()
            .and_then(|info| info.pipeline_categoricals.clone().or_else(|| info.dataset_categoricals.clone()));
        Ok(tree)
    }

    pub fn root(&self) -> Option<&TreeNode> {
        self.root.as_ref()
    }

    fn is_categorical(&self, feature: usize) -> bool {
        self.categorical
            .as_ref()
            .and_then(|m| m.get(feature).copied())
            .unwrap_or(false)
    }

    fn class_index(&self, label: f64) -> usize {
        self.classes.iter().position(|&c| c == label).unwrap_or(0)
    }

    /// Weighted statistics of a node
    fn stats(&self, y: &Array1<f64>, w: &Array1<f64>, rows: &[usize]) -> NodeStats {
        let mut stats = NodeStats::new(self.classes.len());
        for &i in rows {
            stats.push(y[i], w[i], self.is_classification.then(|| self.class_index(y[i])));
        }
        stats
    }

    fn impurity(&self, s: &NodeStats) -> f64 {
        if s.weight <= 0.0 {
            return 0.0;
        }
        match self.criterion {
            Criterion::Gini => 1.0 - s.class_weights.iter().map(|c| (c / s.weight).powi(2)).sum::<f64>(),
            Criterion::Entropy => -s
                .class_weights
                .iter()
                .filter(|&&c| c > 0.0)
                .map(|c| {
                    let p = c / s.weight;
                    p * p.log2()
                })
                .sum::<f64>(),
            Criterion::SquaredError => {
                let mean = s.sum / s.weight;
                (s.sq_sum / s.weight - mean * mean).max(0.0)
            }
        }
    }

    fn leaf(&self, s: &NodeStats, n_samples: usize) -> TreeNode {
        if self.is_classification {
            let distribution: Vec<f64> = if s.weight > 0.0 {
                s.class_weights.iter().map(|c| c / s.weight).collect()
            } else {
                vec![0.0; self.classes.len()]
            };
            let best = distribution
                .iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |acc, (i, &p)| if p > acc.1 { (i, p) } else { acc })
                .0;
            let value = self.classes.get(best).copied().unwrap_or(f64::NAN);
            TreeNode::Leaf {
                value,
                distribution,
                n_samples,
            }
        } else {
            let value = if s.weight > 0.0 { s.sum / s.weight } else { f64::NAN };
            TreeNode::Leaf {
                value,
                distribution: Vec::new(),
                n_samples,
            }
        }
    }

    fn build(&self, x: &Array2<f64>, y: &Array1<f64>, w: &Array1<f64>, rows: &[usize], depth: usize) -> TreeNode {
        let stats = self.stats(y, w, rows);
        let parent = self.impurity(&stats);
        let stop = rows.len() < self.min_samples_split
            || rows.len() < 2 * self.min_samples_leaf
            || self.max_depth.map_or(false, |d| depth >= d)
            || parent <= 1e-12;
        if stop {
            return self.leaf(&stats, rows.len());
        }

        let best = (0..x.ncols())
            .into_par_iter()
            .filter_map(|f| self.best_split_for(x, y, w, rows, f, parent, &stats))
            .max_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((feature_idx, rule, _gain)) => {
                let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
                    rows.iter().partition(|&&i| rule.goes_left(x[[i, feature_idx]]));
                TreeNode::Split {
                    feature_idx,
                    rule,
                    left: Box::new(self.build(x, y, w, &left_rows, depth + 1)),
                    right: Box::new(self.build(x, y, w, &right_rows, depth + 1)),
                    n_samples: rows.len(),
                }
            }
            None => self.leaf(&stats, rows.len()),
        }
    }

    /// Best `(feature, rule, gain)` for one column
    #[allow(clippy::too_many_arguments)]
    fn best_split_for(
        &self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        w: &Array1<f64>,
        rows: &[usize],
        feature: usize,
        parent: f64,
        total: &NodeStats,
    ) -> Option<(usize, SplitRule, f64)> {
        let mut sorted: Vec<usize> = rows.to_vec();
        sorted.sort_by(|&a, &b| x[[a, feature]].partial_cmp(&x[[b, feature]]).unwrap_or(std::cmp::Ordering::Equal));

        let mut best: Option<(SplitRule, f64)> = None;
        let mut consider = |rule: SplitRule, left: &NodeStats, n_left: usize| {
            let n_right = rows.len() - n_left;
            if n_left < self.min_samples_leaf || n_right < self.min_samples_leaf {
                return;
            }
            let right = total.minus(left);
            let weighted = (left.weight * self.impurity(left) + right.weight * self.impurity(&right)) / total.weight;
            let gain = parent - weighted;
            if gain > 1e-12 && best.map_or(true, |(_, g)| gain > g) {
                best = Some((rule, gain));
            }
        };

        if self.is_categorical(feature) {
            let mut groups: BTreeMap<u64, (f64, Vec<usize>)> = BTreeMap::new();
            for &i in &sorted {
                let v = x[[i, feature]];
                groups.entry(v.to_bits()).or_insert_with(|| (v, Vec::new())).1.push(i);
            }
            if groups.len() < 2 {
                return None;
            }
            for (value, members) in groups.values() {
                let left = self.stats(y, w, members);
                consider(SplitRule::Equals(*value), &left, members.len());
            }
        } else {
            let mut left = NodeStats::new(self.classes.len());
            for (pos, window) in sorted.windows(2).enumerate() {
                let i = window[0];
                left.push(y[i], w[i], self.is_classification.then(|| self.class_index(y[i])));
                let (a, b) = (x[[i, feature]], x[[window[1], feature]]);
                if a < b {
                    consider(SplitRule::Threshold((a + b) / 2.0), &left, pos + 1);
                }
            }
        }
        best.map(|(rule, gain)| (feature, rule, gain))
    }

    fn fitted_root(&self, x: &Array2<f64>) -> Result<&TreeNode> {
        let root = self.root.as_ref().ok_or(RunnerError::ModelNotFitted)?;
        if x.ncols() != self.n_features {
            return Err(RunnerError::ShapeError {
                expected: format!("{} features", self.n_features),
                actual: format!("{} features", x.ncols()),
            });
        }
        Ok(root)
    }
}

/// Running weighted sums for one side of a split
#[derive(Debug, Clone)]
struct NodeStats {
    weight: f64,
    sum: f64,
    sq_sum: f64,
    class_weights: Vec<f64>,
}

impl NodeStats {
    fn new(n_classes: usize) -> Self {
        Self {
            weight: 0.0,
            sum: 0.0,
            sq_sum: 0.0,
            class_weights: vec![0.0; n_classes],
        }
    }

    fn push(&mut self, y: f64, w: f64, class: Option<usize>) {
        self.weight += w;
        self.sum += w * y;
        self.sq_sum += w * y * y;
        if let Some(c) = class {
            self.class_weights[c] += w;
        }
    }

    fn minus(&self, other: &NodeStats) -> NodeStats {
        NodeStats {
            weight: self.weight - other.weight,
            sum: self.sum - other.sum,
            sq_sum: self.sq_sum - other.sq_sum,
            class_weights: self
                .class_weights
                .iter()
                .zip(&other.class_weights)
                .map(|(a, b)| a - b)
                .collect(),
        }
    }
}

impl Learner for DecisionTree {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        if let Some(mask) = &self.categorical {
            if mask.len() != x.ncols() {
                warn!(mask_len = mask.len(), n_features = x.ncols(), "categorical mask does not match the features, ignoring it");
                self.categorical = None;
            }
        }
        if self.is_classification {
            self.classes = unique_classes(y);
        }
        self.n_features = x.ncols();
        let w = weights_or_ones(sample_weight, x.nrows());
        let rows: Vec<usize> = (0..x.nrows()).collect();
        self.root = Some(self.build(x, y, &w, &rows, 0));
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let root = self.fitted_root(x)?;
        Ok(x.rows()
            .into_iter()
            .map(|row| match root.leaf_for(&row.to_vec()) {
                TreeNode::Leaf { value, .. } => *value,
                TreeNode::Split { .. } => f64::NAN,
            })
            .collect())
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Option<Array2<f64>>> {
        if !self.is_classification {
            return Ok(None);
        }
        let root = self.fitted_root(x)?;
        let k = self.classes.len();
        let mut proba = Array2::zeros((x.nrows(), k));
        for (i, row) in x.rows().into_iter().enumerate() {
            if let TreeNode::Leaf { distribution, .. } = root.leaf_for(&row.to_vec()) {
                for (j, p) in distribution.iter().enumerate().take(k) {
                    proba[[i, j]] = *p;
                }
            }
        }
        Ok(Some(proba))
    }

    fn classes(&self) -> Option<&[f64]> {
        self.is_classification.then_some(self.classes.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_classifier_separates_on_informative_feature() {
        let x = array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
        let y = array![0.0, 0.0, 1.0, 1.0];
        let mut tree = DecisionTree::classifier();
        tree.fit(&x, &y, None).unwrap();
        assert_eq!(tree.predict(&x).unwrap(), y);
        let proba = tree.predict_proba(&x).unwrap().unwrap();
        assert_eq!(proba.row(2).to_vec(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_regressor_respects_max_depth() {
        let x = array![[1.0], [2.0], [3.0], [4.0], [5.0], [6.0]];
        let y = array![1.0, 1.0, 1.0, 9.0, 9.0, 9.0];
        let mut tree = DecisionTree::regressor().with_max_depth(1);
        tree.fit(&x, &y, None).unwrap();
        assert_eq!(tree.root().unwrap().depth(), 1);
        assert_eq!(tree.predict(&array![[2.5], [5.5]]).unwrap(), array![1.0, 9.0]);
        assert!(tree.classes().is_none());
    }

    #[test]
    fn test_categorical_column_uses_equality_split() {
        // category 2.0 sits between 1.0 and 3.0 numerically but has its own label
        let x = array![[1.0], [1.0], [2.0], [2.0], [3.0], [3.0]];
        let y = array![0.0, 0.0, 1.0, 1.0, 0.0, 0.0];
        let mut tree = DecisionTree::classifier().with_max_depth(1).with_categorical(vec![true]);
        tree.fit(&x, &y, None).unwrap();
        match tree.root().unwrap() {
            TreeNode::Split { rule, .. } => assert_eq!(*rule, SplitRule::Equals(2.0)),
            other => panic!("expected a split, got {:?}", other),
        }
        assert_eq!(tree.predict(&x).unwrap(), y);
    }

    #[test]
    fn test_mismatched_mask_is_ignored() {
        let x = array![[0.0], [1.0]];
        let y = array![0.0, 1.0];
        let mut tree = DecisionTree::classifier().with_categorical(vec![true, false]);
        tree.fit(&x, &y, None).unwrap();
        assert_eq!(tree.predict(&x).unwrap(), y);
    }
}
