//! Stochastic gradient descent learners, trainable on row batches

use ndarray::{Array1, Array2, ArrayView1};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::{weights_or_ones, Learner, StreamingLearner};
use crate::error::{Result, RunnerError};
use crate::pipeline::Params;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SgdLoss {
    Hinge,
    LogLoss,
    SquaredError,
    Huber,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LearningRateSchedule {
    Constant,
    /// `1 / (alpha * (t + t0))`
    Optimal,
    /// `eta0 / t^power_t`
    InvScaling,
}

/// Hyperparameters shared by the classifier and the regressor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgdConfig {
    pub loss: SgdLoss,
    pub learning_rate: LearningRateSchedule,
    pub eta0: f64,
    /// L2 penalty
    pub alpha: f64,
    pub max_iter: usize,
    pub tol: f64,
    pub power_t: f64,
    pub epsilon: f64,
    pub random_state: u64,
    /// Column bindings forwarded for streaming input
    pub feature_column_names: Vec<String>,
    pub label_column_name: Option<String>,
    pub weight_column_name: Option<String>,
    pub enable_cache: bool,
}

impl SgdConfig {
    fn regression() -> Self {
        Self {
            loss: SgdLoss::SquaredError,
            learning_rate: LearningRateSchedule::InvScaling,
            eta0: 0.01,
            alpha: 1e-4,
            max_iter: 1000,
            tol: 1e-4,
            power_t: 0.25,
            epsilon: 0.1,
            random_state: 42,
            feature_column_names: Vec::new(),
            label_column_name: None,
            weight_column_name: None,
            enable_cache: false,
        }
    }

    fn classification() -> Self {
        Self {
            loss: SgdLoss::LogLoss,
            learning_rate: LearningRateSchedule::Optimal,
            ..Self::regression()
        }
    }

    fn from_params(p: &mut Params, mut base: SgdConfig) -> Result<Self> {
        if let Some(loss) = p.opt_string("loss")? {
            base.loss = match loss.as_str() {
                "hinge" => SgdLoss::Hinge,
                "log" | "log_loss" => SgdLoss::LogLoss,
                "squared_error" | "squared_loss" => SgdLoss::SquaredError,
                "huber" => SgdLoss::Huber,
                other => return Err(RunnerError::invalid_option("loss", other, "unsupported loss")),
            };
        }
        if let Some(schedule) = p.opt_string("learning_rate")? {
            base.learning_rate = match schedule.as_str() {
                "constant" => LearningRateSchedule::Constant,
                "optimal" => LearningRateSchedule::Optimal,
                "invscaling" => LearningRateSchedule::InvScaling,
                other => return Err(RunnerError::invalid_option("learning_rate", other, "unsupported schedule")),
            };
        }
        base.eta0 = p.f64_or("eta0", base.eta0)?;
        base.alpha = p.f64_or("alpha", base.alpha)?;
        base.max_iter = p.usize_or("max_iter", base.max_iter)?.max(1);
        base.tol = p.f64_or("tol", base.tol)?;
        base.power_t = p.f64_or("power_t", base.power_t)?;
        base.epsilon = p.f64_or("epsilon", base.epsilon)?;
        base.random_state = p.opt_u64("random_state")?.unwrap_or(base.random_state);
        if let Some(serde_json::Value::Array(names)) = p.take("feature_column_names") {
            base.feature_column_names = names.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
        }
        base.label_column_name = p.opt_string("label_column_name")?;
        base.weight_column_name = p.opt_string("weight_column_name")?;
        base.enable_cache = p.bool_or("enable_cache", false)?;
        if base.eta0 <= 0.0 && base.learning_rate != LearningRateSchedule::Optimal {
            return Err(RunnerError::invalid_option("eta0", base.eta0, "must be positive"));
        }
        Ok(base)
    }

    fn lr(&self, t: usize) -> f64 {
        match self.learning_rate {
            LearningRateSchedule::Constant => self.eta0,
            LearningRateSchedule::Optimal => {
                let alpha = self.alpha.max(1e-12);
                let t0 = 1.0 / (alpha * self.eta0.max(1e-2));
                1.0 / (alpha * (t as f64 + t0))
            }
            LearningRateSchedule::InvScaling => self.eta0 / (t as f64).powf(self.power_t),
        }
    }

    /// d(loss)/d(prediction) for one sample
    fn dloss(&self, pred: f64, target: f64) -> f64 {
        match self.loss {
            SgdLoss::SquaredError => pred - target,
            SgdLoss::Huber => {
                let diff = pred - target;
                if diff.abs() <= self.epsilon {
                    diff
                } else {
                    self.epsilon * diff.signum()
                }
            }
            // targets are +1 / -1
            SgdLoss::Hinge => {
                if target * pred < 1.0 {
                    -target
                } else {
                    0.0
                }
            }
            SgdLoss::LogLoss => {
                let z = (target * pred).clamp(-30.0, 30.0);
                -target / (1.0 + z.exp())
            }
        }
    }
}

/// One linear unit updated sample by sample
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinearUnit {
    w: Array1<f64>,
    b: f64,
}

impl LinearUnit {
    fn zeros(n_features: usize) -> Self {
        Self {
            w: Array1::zeros(n_features),
            b: 0.0,
        }
    }

    fn score(&self, row: ArrayView1<f64>) -> f64 {
        row.dot(&self.w) + self.b
    }

    fn step(&mut self, cfg: &SgdConfig, row: ArrayView1<f64>, target: f64, weight: f64, lr: f64) -> f64 {
        let g = cfg.dloss(self.score(row), target) * weight;
        self.w.mapv_inplace(|v| v * (1.0 - lr * cfg.alpha));
        self.w.scaled_add(-lr * g, &row);
        self.b -= lr * g;
        g * g
    }
}

/// Shared epoch driver; `targets(i)` yields each unit's target for row `i`
fn run_epoch(
    cfg: &SgdConfig,
    units: &mut [LinearUnit],
    x: &Array2<f64>,
    w: &Array1<f64>,
    order: &[usize],
    t: &mut usize,
    targets: impl Fn(usize, usize) -> f64,
) -> f64 {
    let mut total = 0.0;
    for &i in order {
        let lr = cfg.lr(*t);
        for (k, unit) in units.iter_mut().enumerate() {
            total += unit.step(cfg, x.row(i), targets(i, k), w[i], lr);
        }
        *t += 1;
    }
    total / order.len().max(1) as f64
}

fn check_features(units: &[LinearUnit], x: &Array2<f64>) -> Result<()> {
    match units.first() {
        Some(u) if u.w.len() != x.ncols() => Err(RunnerError::ShapeError {
            expected: format!("{} features", u.w.len()),
            actual: format!("{} features", x.ncols()),
        }),
        _ => Ok(()),
    }
}

/// Linear classifier trained by SGD, one-vs-rest for more than two classes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgdClassifier {
    pub config: SgdConfig,
    classes: Vec<f64>,
    units: Vec<LinearUnit>,
    t: usize,
}

impl SgdClassifier {
    pub const PARAMS: &'static [&'static str] = &[
        "loss",
        "learning_rate",
        "eta0",
        "alpha",
        "max_iter",
        "tol",
        "power_t",
        "epsilon",
        "random_state",
        "feature_column_names",
        "label_column_name",
        "weight_column_name",
        "enable_cache",
    ];

    pub fn new() -> Self {
        Self {
            config: SgdConfig::classification(),
            classes: Vec::new(),
            units: Vec::new(),
            t: 1,
        }
    }

    pub fn from_params(p: &mut Params) -> Result<Self> {
        Ok(Self {
            config: SgdConfig::from_params(p, SgdConfig::classification())?,
            ..Self::new()
        })
    }

    /// Register unseen labels, keeping classes sorted
    fn absorb_classes(&mut self, y: &Array1<f64>, n_features: usize) {
        for &label in y.iter() {
            if let Err(pos) = self
                .classes
                .binary_search_by(|c| c.partial_cmp(&label).unwrap_or(std::cmp::Ordering::Less))
            {
                self.classes.insert(pos, label);
                self.units.insert(pos, LinearUnit::zeros(n_features));
            }
        }
    }

    fn epoch(&mut self, x: &Array2<f64>, y: &Array1<f64>, w: &Array1<f64>, order: &[usize]) -> f64 {
        let classes = self.classes.clone();
        let binary = classes.len() == 2;
        let units = if binary { &mut self.units[1..2] } else { &mut self.units[..] };
        run_epoch(&self.config, units, x, w, order, &mut self.t, |i, k| {
            let class = if binary { classes[1] } else { classes[k] };
            if y[i] == class {
                1.0
            } else {
                -1.0
            }
        })
    }

    fn scores(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if self.units.is_empty() {
            return Err(RunnerError::ModelNotFitted);
        }
        check_features(&self.units, x)?;
        let mut out = Array2::zeros((x.nrows(), self.units.len()));
        for (i, row) in x.rows().into_iter().enumerate() {
            for (k, unit) in self.units.iter().enumerate() {
                out[[i, k]] = unit.score(row);
            }
        }
        Ok(out)
    }
}

impl Default for SgdClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Learner for SgdClassifier {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        self.classes.clear();
        self.units.clear();
        self.t = 1;
        self.absorb_classes(y, x.ncols());
        let w = weights_or_ones(sample_weight, x.nrows());
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.random_state);
        let mut order: Vec<usize> = (0..x.nrows()).collect();
        let mut prev = f64::MAX;
        for _ in 0..self.config.max_iter {
            order.shuffle(&mut rng);
            let loss = self.epoch(x, y, &w, &order);
            if (prev - loss).abs() < self.config.tol {
                break;
            }
            prev = loss;
        }
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let scores = self.scores(x)?;
        if self.classes.len() == 2 {
            return Ok(scores
                .column(1)
                .mapv(|s| if s > 0.0 { self.classes[1] } else { self.classes[0] }));
        }
        Ok(super::argmax_rows(&scores)
            .into_iter()
            .map(|k| self.classes[k])
            .collect())
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Option<Array2<f64>>> {
        if self.config.loss != SgdLoss::LogLoss {
            return Ok(None);
        }
        let scores = self.scores(x)?;
        let sigmoid = |s: f64| 1.0 / (1.0 + (-s).exp());
        if self.classes.len() == 2 {
            let mut proba = Array2::zeros((x.nrows(), 2));
            for (i, &s) in scores.column(1).iter().enumerate() {
                proba[[i, 1]] = sigmoid(s);
                proba[[i, 0]] = 1.0 - proba[[i, 1]];
            }
            return Ok(Some(proba));
        }
        let mut proba = scores.mapv(sigmoid);
        for mut row in proba.rows_mut() {
            let sum = row.sum();
            if sum > 0.0 {
                row.mapv_inplace(|v| v / sum);
            }
        }
        Ok(Some(proba))
    }

    fn classes(&self) -> Option<&[f64]> {
        Some(&self.classes)
    }
}

impl StreamingLearner for SgdClassifier {
    fn partial_fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        check_features(&self.units, x)?;
        self.absorb_classes(y, x.ncols());
        let w = weights_or_ones(sample_weight, x.nrows());
        let order: Vec<usize> = (0..x.nrows()).collect();
        self.epoch(x, y, &w, &order);
        Ok(())
    }
}

/// Linear regressor trained by SGD
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgdRegressor {
    pub config: SgdConfig,
    unit: Option<LinearUnit>,
    t: usize,
}

impl SgdRegressor {
    pub const PARAMS: &'static [&'static str] = SgdClassifier::PARAMS;

    pub fn new() -> Self {
        Self {
            config: SgdConfig::regression(),
            unit: None,
            t: 1,
        }
    }

    pub fn from_params(p: &mut Params) -> Result<Self> {
        Ok(Self {
            config: SgdConfig::from_params(p, SgdConfig::regression())?,
            ..Self::new()
        })
    }

    fn epoch(&mut self, x: &Array2<f64>, y: &Array1<f64>, w: &Array1<f64>, order: &[usize]) -> f64 {
        let unit = self.unit.get_or_insert_with(|| LinearUnit::zeros(x.ncols()));
        run_epoch(&self.config, std::slice::from_mut(unit), x, w, order, &mut self.t, |i, _| y[i])
    }
}

impl Default for SgdRegressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Learner for SgdRegressor {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        self.unit = Some(LinearUnit::zeros(x.ncols()));
        self.t = 1;
        let w = weights_or_ones(sample_weight, x.nrows());
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.random_state);
        let mut order: Vec<usize> = (0..x.nrows()).collect();
        let mut prev = f64::MAX;
        for _ in 0..self.config.max_iter {
            order.shuffle(&mut rng);
            let loss = self.epoch(x, y, &w, &order);
            if (prev - loss).abs() < self.config.tol {
                break;
            }
            prev = loss;
        }
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let unit = self.unit.as_ref().ok_or(RunnerError::ModelNotFitted)?;
        check_features(std::slice::from_ref(unit), x)?;
        Ok(x.rows().into_iter().map(|row| unit.score(row)).collect())
    }
}

impl StreamingLearner for SgdRegressor {
    fn partial_fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        if let Some(unit) = &self.unit {
            check_features(std::slice::from_ref(unit), x)?;
        }
        let w = weights_or_ones(sample_weight, x.nrows());
        let order: Vec<usize> = (0..x.nrows()).collect();
        self.epoch(x, y, &w, &order);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_regressor_learns_slope() {
        let x = Array2::from_shape_fn((50, 1), |(i, _)| i as f64 / 50.0);
        let y = x.column(0).mapv(|v| 3.0 * v + 1.0);
        let mut sgd = SgdRegressor::new();
        sgd.config.learning_rate = LearningRateSchedule::Constant;
        sgd.config.eta0 = 0.05;
        sgd.config.alpha = 0.0;
        sgd.config.tol = 1e-12;
        sgd.config.max_iter = 500;
        sgd.fit(&x, &y, None).unwrap();
        let pred = sgd.predict(&array![[0.5]]).unwrap();
        assert!((pred[0] - 2.5).abs() < 0.05, "{}", pred[0]);
    }

    #[test]
    fn test_classifier_streams_new_classes() {
        let mut sgd = SgdClassifier::new();
        sgd.partial_fit(&array![[0.0], [0.1]], &array![2.0, 2.0], None).unwrap();
        sgd.partial_fit(&array![[3.0], [3.1]], &array![0.0, 0.0], None).unwrap();
        assert_eq!(sgd.classes().unwrap(), &[0.0, 2.0]);
        assert!(sgd.partial_fit(&array![[1.0, 2.0]], &array![0.0], None).is_err());
    }

    #[test]
    fn test_classifier_separates_two_clusters() {
        let x = array![[-2.0], [-1.5], [-1.0], [1.0], [1.5], [2.0]];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let mut sgd = SgdClassifier::new();
        sgd.fit(&x, &y, None).unwrap();
        assert_eq!(sgd.predict(&x).unwrap(), y);
        let proba = sgd.predict_proba(&x).unwrap().unwrap();
        assert!(proba[[0, 0]] > 0.5 && proba[[5, 1]] > 0.5);
    }
}
