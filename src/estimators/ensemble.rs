//! Voting and stacking ensembles over fitted chains

use std::path::Path;

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{argmax_rows, unique_classes, ElasticNet, Estimator, Learner, LogisticRegression};
use crate::dataset::sampling;
use crate::error::{Result, RunnerError};
use crate::pipeline::Chain;

/// Member probabilities re-indexed onto the ensemble's class order
///
/// Members without `predict_proba` contribute a one-hot of their predictions.
fn aligned_proba(member: &Chain, x: &Array2<f64>, classes: &[f64]) -> Result<Array2<f64>> {
    let mut out = Array2::zeros((x.nrows(), classes.len()));
    match (member.predict_proba(x)?, member.classes()) {
        (Some(proba), Some(member_classes)) => {
            for (j, c) in member_classes.iter().enumerate() {
                if let Some(k) = classes.iter().position(|e| e == c) {
                    out.column_mut(k).assign(&proba.column(j));
                }
            }
        }
        _ => {
            for (i, label) in member.predict(x)?.iter().enumerate() {
                if let Some(k) = classes.iter().position(|e| e == label) {
                    out[[i, k]] = 1.0;
                }
            }
        }
    }
    Ok(out)
}

fn union_classes(members: &[Chain], y: &Array1<f64>) -> Vec<f64> {
    let mut classes = unique_classes(y);
    for m in members {
        if let Some(c) = m.classes() {
            classes.extend_from_slice(c);
        }
    }
    classes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    classes.dedup();
    classes
}

/// Weighted soft vote (classification) or weighted mean (regression)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingEnsemble {
    pub members: Vec<Chain>,
    pub weights: Vec<f64>,
    pub is_classification: bool,
    classes: Vec<f64>,
    fitted: bool,
}

impl VotingEnsemble {
    pub fn new(members: Vec<Chain>, weights: Option<Vec<f64>>, is_classification: bool) -> Result<Self> {
        if members.is_empty() {
            return Err(RunnerError::invalid_option("pipelines", "[]", "an ensemble needs at least one member"));
        }
        let weights = weights.unwrap_or_else(|| vec![1.0; members.len()]);
        if weights.len() != members.len() {
            return Err(RunnerError::invalid_option(
                "weights",
                weights.len(),
                format!("expected one weight per member ({})", members.len()),
            ));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(RunnerError::invalid_option("weights", format!("{:?}", weights), "weights must be non-negative with a positive sum"));
        }
        Ok(Self {
            members,
            weights,
            is_classification,
            classes: Vec::new(),
            fitted: false,
        })
    }

    fn total_weight(&self) -> f64 {
        self.weights.iter().sum()
    }
}

impl Learner for VotingEnsemble {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        for (i, member) in self.members.iter_mut().enumerate() {
            debug!(member = i, "Fitting voting member");
            member.fit(x, y, sample_weight)?;
        }
        if self.is_classification {
            self.classes = union_classes(&self.members, y);
        }
        self.fitted = true;
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        if !self.fitted {
            return Err(RunnerError::ModelNotFitted);
        }
        if self.is_classification {
            let proba = self.predict_proba(x)?.ok_or(RunnerError::ModelNotFitted)?;
            return Ok(argmax_rows(&proba).into_iter().map(|k| self.classes[k]).collect());
        }
        let mut acc = Array1::zeros(x.nrows());
        for (member, w) in self.members.iter().zip(&self.weights) {
            acc = acc + member.predict(x)? * *w;
        }
        Ok(acc / self.total_weight())
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Option<Array2<f64>>> {
        if !self.is_classification {
            return Ok(None);
        }
        if !self.fitted {
            return Err(RunnerError::ModelNotFitted);
        }
        let mut acc = Array2::zeros((x.nrows(), self.classes.len()));
        for (member, w) in self.members.iter().zip(&self.weights) {
            acc = acc + aligned_proba(member, x, &self.classes)? * *w;
        }
        Ok(Some(acc / self.total_weight()))
    }

    fn classes(&self) -> Option<&[f64]> {
        if self.is_classification {
            Some(&self.classes)
        } else {
            None
        }
    }
}

/// Serialized form of a pre-trained meta-learner
///
/// When coefficients are present the meta-learner is used as-is and is not
/// retrained on out-of-fold predictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetaLearnerDescriptor {
    ElasticNet {
        #[serde(default = "default_alpha")]
        alpha: f64,
        #[serde(default = "default_l1_ratio")]
        l1_ratio: f64,
        #[serde(default)]
        coef: Option<Vec<f64>>,
        #[serde(default)]
        intercept: Option<f64>,
    },
    LogisticRegression {
        #[serde(rename = "C", default = "default_c")]
        c: f64,
        #[serde(default)]
        classes: Option<Vec<f64>>,
        #[serde(default)]
        coef: Option<Vec<Vec<f64>>>,
        #[serde(default)]
        intercept: Option<Vec<f64>>,
    },
}

fn default_alpha() -> f64 {
    1e-3
}

fn default_l1_ratio() -> f64 {
    0.5
}

fn default_c() -> f64 {
    1.0
}

impl MetaLearnerDescriptor {
    /// Meta-learner and whether it arrives already trained
    pub fn into_meta_learner(self) -> Result<(MetaLearner, bool)> {
        match self {
            MetaLearnerDescriptor::ElasticNet {
                alpha,
                l1_ratio,
                coef: Some(coef),
                intercept,
            } => Ok((
                MetaLearner::ElasticNet(ElasticNet::prefitted(alpha, l1_ratio, Array1::from_vec(coef), intercept.unwrap_or(0.0))),
                true,
            )),
            MetaLearnerDescriptor::ElasticNet { alpha, l1_ratio, .. } => {
                Ok((MetaLearner::ElasticNet(ElasticNet::new(alpha, l1_ratio)), false))
            }
            MetaLearnerDescriptor::LogisticRegression {
                c,
                classes: Some(classes),
                coef: Some(coef),
                intercept,
            } => {
                let n_rows = coef.len();
                let n_cols = coef.first().map_or(0, Vec::len);
                let flat: Vec<f64> = coef.into_iter().flatten().collect();
                let coef = Array2::from_shape_vec((n_rows, n_cols), flat)?;
                let intercept = Array1::from_vec(intercept.unwrap_or_else(|| vec![0.0; n_rows]));
                Ok((MetaLearner::LogisticRegression(LogisticRegression::prefitted(classes, coef, intercept, c)?), true))
            }
            MetaLearnerDescriptor::LogisticRegression { c, .. } => {
                let model = LogisticRegression {
                    c,
                    ..LogisticRegression::default()
                };
                Ok((MetaLearner::LogisticRegression(model), false))
            }
        }
    }
}

/// Learner trained on base-learner outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetaLearner {
    ElasticNet(ElasticNet),
    LogisticRegression(LogisticRegression),
    /// Loaded from a side-channel file, always treated as trained
    Loaded(Box<Estimator>),
}

impl MetaLearner {
    pub fn default_for(is_classification: bool) -> Self {
        if is_classification {
            MetaLearner::LogisticRegression(LogisticRegression::default())
        } else {
            MetaLearner::ElasticNet(ElasticNet::new(default_alpha(), default_l1_ratio()))
        }
    }

    /// Read a bincode-serialized [`Estimator`] from disk
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            RunnerError::invalid_option("meta_learner_file", path.display(), format!("unreadable: {}", e))
        })?;
        let estimator: Estimator = bincode::deserialize(&bytes)?;
        Ok(MetaLearner::Loaded(Box::new(estimator)))
    }

    fn learner(&self) -> &dyn Learner {
        match self {
            MetaLearner::ElasticNet(m) => m,
            MetaLearner::LogisticRegression(m) => m,
            MetaLearner::Loaded(m) => m.as_ref(),
        }
    }

    fn learner_mut(&mut self) -> &mut dyn Learner {
        match self {
            MetaLearner::ElasticNet(m) => m,
            MetaLearner::LogisticRegression(m) => m,
            MetaLearner::Loaded(m) => m.as_mut(),
        }
    }

    /// Same kind, untrained
    fn fresh(&self, is_classification: bool) -> Self {
        match self {
            MetaLearner::ElasticNet(m) => MetaLearner::ElasticNet(ElasticNet::new(m.alpha, m.l1_ratio)),
            MetaLearner::LogisticRegression(m) => MetaLearner::LogisticRegression(LogisticRegression {
                c: m.c,
                max_iter: m.max_iter,
                tol: m.tol,
                learning_rate: m.learning_rate,
                fit_intercept: m.fit_intercept,
                ..LogisticRegression::default()
            }),
            MetaLearner::Loaded(_) => MetaLearner::default_for(is_classification),
        }
    }
}

/// Base chains combined by a meta-learner over their out-of-fold outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackEnsemble {
    pub base: Vec<Chain>,
    pub meta: MetaLearner,
    pub is_classification: bool,
    pub n_folds: usize,
    pub seed: u64,
    /// Untrained copies of the base chains used for out-of-fold fits
    templates: Vec<Chain>,
    meta_trained: bool,
    classes: Vec<f64>,
    fitted: bool,
}

impl StackEnsemble {
    pub fn new(base: Vec<Chain>, meta: MetaLearner, meta_trained: bool, is_classification: bool, seed: u64) -> Result<Self> {
        if base.is_empty() {
            return Err(RunnerError::invalid_option("pipelines", "[]", "an ensemble needs at least one member"));
        }
        Ok(Self {
            templates: base.clone(),
            base,
            meta,
            is_classification,
            n_folds: 5,
            seed,
            meta_trained,
            classes: Vec::new(),
            fitted: false,
        })
    }

    pub fn meta_is_pretrained(&self) -> bool {
        self.meta_trained
    }

    /// Untrained copy whose meta-learner will be relearned on fit
    ///
    /// Metrics for a stack are computed on this copy so that a pre-trained
    /// meta-learner never scores rows it was trained on.
    pub fn fit_for_scoring(&self) -> Self {
        Self {
            base: self.templates.clone(),
            templates: self.templates.clone(),
            meta: self.meta.fresh(self.is_classification),
            is_classification: self.is_classification,
            n_folds: self.n_folds,
            seed: self.seed,
            meta_trained: false,
            classes: Vec::new(),
            fitted: false,
        }
    }

    /// Base outputs laid side by side: aligned probabilities for classifiers,
    /// one prediction column per member for regressors
    fn meta_features(&self, members: &[Chain], x: &Array2<f64>) -> Result<Array2<f64>> {
        let blocks = members
            .iter()
            .map(|m| {
                if self.is_classification {
                    aligned_proba(m, x, &self.classes)
                } else {
                    Ok(m.predict(x)?.insert_axis(Axis(1)))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
        Ok(ndarray::concatenate(Axis(1), &views)?)
    }

    fn out_of_fold_features(&self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<Array2<f64>> {
        let n = x.nrows();
        let n_folds = self.n_folds.min(n);
        let ids: Vec<usize> = (0..n).collect();
        let folds = sampling::k_fold(&ids, n_folds, self.seed)?;
        let width = if self.is_classification {
            self.classes.len() * self.templates.len()
        } else {
            self.templates.len()
        };
        let mut oof = Array2::zeros((n, width));
        for (k, fold) in folds.iter().enumerate() {
            debug!(fold = k, n_train = fold.train.len(), "Out-of-fold stacking pass");
            let x_tr = x.select(Axis(0), &fold.train);
            let y_tr = y.select(Axis(0), &fold.train);
            let w_tr = sample_weight.map(|w| w.select(Axis(0), &fold.train));
            let mut members = self.templates.clone();
            for m in members.iter_mut() {
                m.fit(&x_tr, &y_tr, w_tr.as_ref())?;
            }
            let block = self.meta_features(&members, &x.select(Axis(0), &fold.test))?;
            for (row, &id) in fold.test.iter().enumerate() {
                oof.row_mut(id).assign(&block.row(row));
            }
        }
        Ok(oof)
    }
}

impl Learner for StackEnsemble {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        if self.is_classification {
            self.classes = unique_classes(y);
        }
        if !self.meta_trained {
            let oof = self.out_of_fold_features(x, y, sample_weight)?;
            self.meta.learner_mut().fit(&oof, y, sample_weight)?;
            self.meta_trained = true;
        } else {
            debug!("Meta-learner is pre-trained; skipping out-of-fold pass");
        }
        for m in self.base.iter_mut() {
            m.fit(x, y, sample_weight)?;
        }
        if self.is_classification {
            self.classes = union_classes(&self.base, y);
            if let Some(meta_classes) = self.meta.learner().classes() {
                if meta_classes != self.classes.as_slice() {
                    warn!(meta = ?meta_classes, base = ?self.classes, "Meta-learner classes differ from base classes");
                }
            }
        }
        self.fitted = true;
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        if !self.fitted {
            return Err(RunnerError::ModelNotFitted);
        }
        let features = self.meta_features(&self.base, x)?;
        self.meta.learner().predict(&features)
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Option<Array2<f64>>> {
        if !self.is_classification {
            return Ok(None);
        }
        if !self.fitted {
            return Err(RunnerError::ModelNotFitted);
        }
        let features = self.meta_features(&self.base, x)?;
        self.meta.learner().predict_proba(&features)
    }

    fn classes(&self) -> Option<&[f64]> {
        if !self.is_classification {
            None
        } else {
            self.meta.learner().classes().or(Some(&self.classes))
        }
    }
}
