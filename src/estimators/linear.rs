//! Linear models: least squares, ridge, elastic net and logistic regression

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use super::{unique_classes, weights_or_ones, Learner};
use crate::error::{Result, RunnerError};
use crate::pipeline::Params;

/// Solve the symmetric positive-definite system `a x = b` by Cholesky
///
/// A non-positive pivot triggers one retry with a small diagonal ridge.
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return None;
    }
    cholesky_factor(a)
        .or_else(|| {
            let ridge = 1e-8 * a.diag().iter().map(|v| v.abs()).sum::<f64>().max(1.0) / n.max(1) as f64;
            let mut a_reg = a.clone();
            a_reg.diag_mut().mapv_inplace(|d| d + ridge);
            cholesky_factor(&a_reg)
        })
        .map(|l| {
            let mut y = Array1::zeros(n);
            for i in 0..n {
                let sum: f64 = (0..i).map(|j| l[[i, j]] * y[j]).sum();
                y[i] = (b[i] - sum) / l[[i, i]];
            }
            let mut x = Array1::zeros(n);
            for i in (0..n).rev() {
                let sum: f64 = ((i + 1)..n).map(|j| l[[j, i]] * x[j]).sum();
                x[i] = (y[i] - sum) / l[[i, i]];
            }
            x
        })
}

/// Lower-triangular `l` with `a = l l^T`
fn cholesky_factor(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut l = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[[i, k]] * l[[j, k]]).sum();
            if i == j {
                let diag = a[[i, i]] - sum;
                if diag <= 0.0 {
                    return None;
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// Gauss-Jordan inverse with partial pivoting
fn matrix_inverse(m: &Array2<f64>) -> Option<Array2<f64>> {
    let n = m.nrows();
    if n != m.ncols() {
        return None;
    }
    let mut aug = Array2::zeros((n, 2 * n));
    aug.slice_mut(ndarray::s![.., ..n]).assign(m);
    for i in 0..n {
        aug[[i, n + i]] = 1.0;
    }
    for col in 0..n {
        let pivot_row = (col..n).max_by(|&a, &b| {
            aug[[a, col]]
                .abs()
                .partial_cmp(&aug[[b, col]].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if pivot_row != col {
            for j in 0..2 * n {
                aug.swap([col, j], [pivot_row, j]);
            }
        }
        let pivot = aug[[col, col]];
        if pivot.abs() < 1e-10 {
            return None;
        }
        aug.row_mut(col).mapv_inplace(|v| v / pivot);
        let pivot_vals = aug.row(col).to_owned();
        for row in 0..n {
            if row != col {
                let factor = aug[[row, col]];
                if factor != 0.0 {
                    aug.row_mut(row).scaled_add(-factor, &pivot_vals);
                }
            }
        }
    }
    Some(aug.slice(ndarray::s![.., n..]).to_owned())
}

/// Solve `(X^T X + alpha I) w = X^T y`
fn solve_normal_equations(x: &Array2<f64>, y: &Array1<f64>, alpha: f64) -> Result<Array1<f64>> {
    let mut xtx = x.t().dot(x);
    if alpha > 0.0 {
        xtx.diag_mut().mapv_inplace(|d| d + alpha);
    }
    let xty = x.t().dot(y);
    if let Some(w) = cholesky_solve(&xtx, &xty) {
        return Ok(w);
    }
    matrix_inverse(&xtx)
        .map(|inv| inv.dot(&xty))
        .ok_or_else(|| RunnerError::ComputationError("normal equations are singular".to_string()))
}

/// Weighted column means of `x` and mean of `y`
struct Centering {
    x_mean: Array1<f64>,
    y_mean: f64,
}

impl Centering {
    fn compute(x: &Array2<f64>, y: &Array1<f64>, w: &Array1<f64>, fit_intercept: bool) -> Result<Self> {
        if !fit_intercept {
            return Ok(Self {
                x_mean: Array1::zeros(x.ncols()),
                y_mean: 0.0,
            });
        }
        let total = w.sum();
        if total <= 0.0 {
            return Err(RunnerError::DataError("sample weights sum to zero".to_string()));
        }
        let x_mean = x.t().dot(w) / total;
        let y_mean = y.dot(w) / total;
        Ok(Self { x_mean, y_mean })
    }

    /// Centered copies, rows scaled by `sqrt(w)`
    fn apply(&self, x: &Array2<f64>, y: &Array1<f64>, w: &Array1<f64>) -> (Array2<f64>, Array1<f64>) {
        let sw = w.mapv(f64::sqrt);
        let xc = (x - &self.x_mean.view().insert_axis(Axis(0))) * &sw.view().insert_axis(Axis(1));
        let yc = (y - self.y_mean) * &sw;
        (xc, yc)
    }

    fn intercept(&self, coef: &Array1<f64>) -> f64 {
        self.y_mean - coef.dot(&self.x_mean)
    }
}

/// Fitted linear coefficients shared by the regressors
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LinearFit {
    coef: Option<Array1<f64>>,
    intercept: f64,
}

impl LinearFit {
    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let coef = self.coef.as_ref().ok_or(RunnerError::ModelNotFitted)?;
        if x.ncols() != coef.len() {
            return Err(RunnerError::ShapeError {
                expected: format!("{} features", coef.len()),
                actual: format!("{} features", x.ncols()),
            });
        }
        Ok(x.dot(coef) + self.intercept)
    }
}

/// Ordinary least squares
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearRegression {
    pub fit_intercept: bool,
    fitted: LinearFit,
}

impl Default for LinearRegression {
    fn default() -> Self {
        Self {
            fit_intercept: true,
            fitted: LinearFit::default(),
        }
    }
}

impl LinearRegression {
    pub const PARAMS: &'static [&'static str] = &["fit_intercept", "n_jobs"];

    pub fn from_params(p: &mut Params) -> Result<Self> {
        let fit_intercept = p.bool_or("fit_intercept", true)?;
        let _ = p.opt_usize("n_jobs")?;
        Ok(Self {
            fit_intercept,
            ..Default::default()
        })
    }

    pub fn coefficients(&self) -> Option<&Array1<f64>> {
        self.fitted.coef.as_ref()
    }
}

impl Learner for LinearRegression {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        let w = weights_or_ones(sample_weight, x.nrows());
        let centering = Centering::compute(x, y, &w, self.fit_intercept)?;
        let (xc, yc) = centering.apply(x, y, &w);
        let coef = solve_normal_equations(&xc, &yc, 0.0)?;
        self.fitted.intercept = centering.intercept(&coef);
        self.fitted.coef = Some(coef);
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        self.fitted.predict(x)
    }
}

/// L2-regularized least squares
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ridge {
    pub alpha: f64,
    pub fit_intercept: bool,
    fitted: LinearFit,
}

impl Default for Ridge {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Ridge {
    pub const PARAMS: &'static [&'static str] = &["alpha", "fit_intercept", "random_state"];

    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            fit_intercept: true,
            fitted: LinearFit::default(),
        }
    }

    pub fn from_params(p: &mut Params) -> Result<Self> {
        let alpha = p.f64_or("alpha", 1.0)?;
        if !(alpha >= 0.0) {
            return Err(RunnerError::invalid_option("alpha", alpha, "must be non-negative"));
        }
        let mut ridge = Self::new(alpha);
        ridge.fit_intercept = p.bool_or("fit_intercept", true)?;
        let _ = p.opt_u64("random_state")?;
        Ok(ridge)
    }
}

impl Learner for Ridge {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        let w = weights_or_ones(sample_weight, x.nrows());
        let centering = Centering::compute(x, y, &w, self.fit_intercept)?;
        let (xc, yc) = centering.apply(x, y, &w);
        let coef = solve_normal_equations(&xc, &yc, self.alpha)?;
        self.fitted.intercept = centering.intercept(&coef);
        self.fitted.coef = Some(coef);
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        self.fitted.predict(x)
    }
}

fn soft_threshold(val: f64, threshold: f64) -> f64 {
    if val > threshold {
        val - threshold
    } else if val < -threshold {
        val + threshold
    } else {
        0.0
    }
}

/// L1 + L2 regularized least squares by coordinate descent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticNet {
    pub alpha: f64,
    /// 0.0 is pure ridge, 1.0 pure lasso
    pub l1_ratio: f64,
    pub max_iter: usize,
    pub tol: f64,
    pub fit_intercept: bool,
    fitted: LinearFit,
}

impl Default for ElasticNet {
    fn default() -> Self {
        Self::new(1.0, 0.5)
    }
}

impl ElasticNet {
    pub const PARAMS: &'static [&'static str] =
        &["alpha", "l1_ratio", "max_iter", "tol", "fit_intercept", "random_state"];

    pub fn new(alpha: f64, l1_ratio: f64) -> Self {
        Self {
            alpha,
            l1_ratio: l1_ratio.clamp(0.0, 1.0),
            max_iter: 1000,
            tol: 1e-4,
            fit_intercept: true,
            fitted: LinearFit::default(),
        }
    }

    pub fn from_params(p: &mut Params) -> Result<Self> {
        let mut enet = Self::new(p.f64_or("alpha", 1.0)?, p.f64_or("l1_ratio", 0.5)?);
        enet.max_iter = p.usize_or("max_iter", 1000)?;
        enet.tol = p.f64_or("tol", 1e-4)?;
        enet.fit_intercept = p.bool_or("fit_intercept", true)?;
        let _ = p.opt_u64("random_state")?;
        Ok(enet)
    }

    /// Model restored from known coefficients, no fit required
    pub fn prefitted(alpha: f64, l1_ratio: f64, coef: Array1<f64>, intercept: f64) -> Self {
        let mut enet = Self::new(alpha, l1_ratio);
        enet.fitted = LinearFit {
            coef: Some(coef),
            intercept,
        };
        enet
    }

    pub fn coefficients(&self) -> Option<(&Array1<f64>, f64)> {
        self.fitted.coef.as_ref().map(|c| (c, self.fitted.intercept))
    }
}

impl Learner for ElasticNet {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        let n_features = x.ncols();
        let w_rows = weights_or_ones(sample_weight, x.nrows());
        let centering = Centering::compute(x, y, &w_rows, self.fit_intercept)?;
        let (xc, yc) = centering.apply(x, y, &w_rows);

        let col_norms: Vec<f64> = (0..n_features).map(|j| xc.column(j).mapv(|v| v * v).sum()).collect();
        let n = w_rows.sum();
        let l1_penalty = self.alpha * self.l1_ratio * n;
        let l2_penalty = self.alpha * (1.0 - self.l1_ratio) * n;

        let mut w = Array1::<f64>::zeros(n_features);
        let mut r = yc.clone();
        for _ in 0..self.max_iter {
            let mut max_step: f64 = 0.0;
            for j in 0..n_features {
                let denom = col_norms[j] + l2_penalty;
                let old = w[j];
                if denom < 1e-15 {
                    w[j] = 0.0;
                } else {
                    let rho = xc.column(j).dot(&r) + col_norms[j] * old;
                    w[j] = soft_threshold(rho, l1_penalty) / denom;
                }
                let delta = old - w[j];
                if delta != 0.0 {
                    r.scaled_add(delta, &xc.column(j));
                    max_step = max_step.max(delta.abs());
                }
            }
            if max_step < self.tol {
                break;
            }
        }

        self.fitted.intercept = centering.intercept(&w);
        self.fitted.coef = Some(w);
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        self.fitted.predict(x)
    }
}

/// Logistic regression: sigmoid for two classes, softmax otherwise
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticRegression {
    /// Inverse regularization strength
    pub c: f64,
    pub max_iter: usize,
    pub tol: f64,
    pub learning_rate: f64,
    pub fit_intercept: bool,
    pub(crate) classes: Vec<f64>,
    /// One row per class, or a single row for the binary case
    pub(crate) coef: Option<Array2<f64>>,
    pub(crate) intercept: Array1<f64>,
}

impl Default for LogisticRegression {
    fn default() -> Self {
        Self {
            c: 1.0,
            max_iter: 1000,
            tol: 1e-6,
            learning_rate: 0.1,
            fit_intercept: true,
            classes: Vec::new(),
            coef: None,
            intercept: Array1::zeros(0),
        }
    }
}

impl LogisticRegression {
    pub const PARAMS: &'static [&'static str] = &["C", "max_iter", "tol", "fit_intercept", "random_state", "n_jobs"];

    pub fn from_params(p: &mut Params) -> Result<Self> {
        let c = p.f64_or("C", 1.0)?;
        if !(c > 0.0) {
            return Err(RunnerError::invalid_option("C", c, "must be positive"));
        }
        let model = Self {
            c,
            max_iter: p.usize_or("max_iter", 1000)?,
            tol: p.f64_or("tol", 1e-6)?,
            fit_intercept: p.bool_or("fit_intercept", true)?,
            ..Default::default()
        };
        let _ = p.opt_u64("random_state")?;
        let _ = p.opt_usize("n_jobs")?;
        Ok(model)
    }

    /// Model restored from known coefficients, no fit required
    pub fn prefitted(classes: Vec<f64>, coef: Array2<f64>, intercept: Array1<f64>, c: f64) -> Result<Self> {
        let binary_rows = classes.len() == 2 && coef.nrows() == 1;
        if !(binary_rows || coef.nrows() == classes.len()) || intercept.len() != coef.nrows() {
            return Err(RunnerError::ShapeError {
                expected: format!("coefficients for {} classes", classes.len()),
                actual: format!("{} rows, {} intercepts", coef.nrows(), intercept.len()),
            });
        }
        Ok(Self {
            c,
            classes,
            coef: Some(coef),
            intercept,
            ..Default::default()
        })
    }

    fn decision(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let coef = self.coef.as_ref().ok_or(RunnerError::ModelNotFitted)?;
        if x.ncols() != coef.ncols() {
            return Err(RunnerError::ShapeError {
                expected: format!("{} features", coef.ncols()),
                actual: format!("{} features", x.ncols()),
            });
        }
        Ok(x.dot(&coef.t()) + &self.intercept.view().insert_axis(Axis(0)))
    }

    fn fit_binary(&mut self, x: &Array2<f64>, target: &Array1<f64>, w: &Array1<f64>) {
        let n = w.sum();
        let reg = 1.0 / (self.c * n);
        let mut coef = Array1::<f64>::zeros(x.ncols());
        let mut bias = 0.0;
        for _ in 0..self.max_iter {
            let p = (x.dot(&coef) + bias).mapv(sigmoid);
            let err = (&p - target) * w;
            let dw = x.t().dot(&err) / n + &coef * reg;
            let db = if self.fit_intercept { err.sum() / n } else { 0.0 };
            let grad_norm = (dw.mapv(|v| v * v).sum() + db * db).sqrt();
            if grad_norm < self.tol {
                break;
            }
            coef.scaled_add(-self.learning_rate, &dw);
            bias -= self.learning_rate * db;
        }
        self.coef = Some(coef.insert_axis(Axis(0)));
        self.intercept = Array1::from_vec(vec![bias]);
    }

    fn fit_multinomial(&mut self, x: &Array2<f64>, onehot: &Array2<f64>, w: &Array1<f64>) {
        let k = onehot.ncols();
        let n = w.sum();
        let reg = 1.0 / (self.c * n);
        let mut coef = Array2::<f64>::zeros((k, x.ncols()));
        let mut bias = Array1::<f64>::zeros(k);
        for _ in 0..self.max_iter {
            let logits = x.dot(&coef.t()) + &bias.view().insert_axis(Axis(0));
            let err = (softmax_rows(logits) - onehot) * &w.view().insert_axis(Axis(1));
            let dw = err.t().dot(x) / n + &coef * reg;
            let db = if self.fit_intercept {
                err.sum_axis(Axis(0)) / n
            } else {
                Array1::zeros(k)
            };
            let grad_norm = (dw.mapv(|v| v * v).sum() + db.mapv(|v| v * v).sum()).sqrt();
            if grad_norm < self.tol {
                break;
            }
            coef.scaled_add(-self.learning_rate, &dw);
            bias.scaled_add(-self.learning_rate, &db);
        }
        self.coef = Some(coef);
        self.intercept = bias;
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

pub(crate) fn softmax_rows(mut logits: Array2<f64>) -> Array2<f64> {
    for mut row in logits.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    logits
}

impl Learner for LogisticRegression {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        self.classes = unique_classes(y);
        let w = weights_or_ones(sample_weight, x.nrows());
        match self.classes.len() {
            0 | 1 => {
                return Err(RunnerError::FitError {
                    learner: "LogisticRegression".to_string(),
                    message: format!("needs at least two classes, got {}", self.classes.len()),
                })
            }
            2 => {
                let positive = self.classes[1];
                let target = y.mapv(|v| if v == positive { 1.0 } else { 0.0 });
                self.fit_binary(x, &target, &w);
            }
            k => {
                let mut onehot = Array2::zeros((x.nrows(), k));
                for (i, v) in y.iter().enumerate() {
                    if let Some(c) = self.classes.iter().position(|c| c == v) {
                        onehot[[i, c]] = 1.0;
                    }
                }
                self.fit_multinomial(x, &onehot, &w);
            }
        }
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let proba = self.predict_proba(x)?.ok_or(RunnerError::ModelNotFitted)?;
        Ok(super::argmax_rows(&proba)
            .into_iter()
            .map(|i| self.classes.get(i).copied().unwrap_or(f64::NAN))
            .collect())
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Option<Array2<f64>>> {
        let scores = self.decision(x)?;
        if scores.ncols() == 1 {
            let mut proba = Array2::zeros((x.nrows(), 2));
            for (i, &s) in scores.column(0).iter().enumerate() {
                let p = sigmoid(s);
                proba[[i, 0]] = 1.0 - p;
                proba[[i, 1]] = p;
            }
            return Ok(Some(proba));
        }
        Ok(Some(softmax_rows(scores)))
    }

    fn classes(&self) -> Option<&[f64]> {
        Some(&self.classes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_ols_recovers_line() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![1.0, 3.0, 5.0, 7.0];
        let mut lr = LinearRegression::default();
        lr.fit(&x, &y, None).unwrap();
        let coef = lr.coefficients().unwrap();
        assert!((coef[0] - 2.0).abs() < 1e-8);
        assert!((lr.predict(&array![[10.0]]).unwrap()[0] - 21.0).abs() < 1e-6);
    }

    #[test]
    fn test_ridge_shrinks() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![0.0, 1.0, 2.0, 3.0];
        let mut ols = Ridge::new(0.0);
        let mut ridge = Ridge::new(10.0);
        ols.fit(&x, &y, None).unwrap();
        ridge.fit(&x, &y, None).unwrap();
        let slope = |m: &Ridge| m.predict(&array![[1.0]]).unwrap()[0] - m.predict(&array![[0.0]]).unwrap()[0];
        assert!(slope(&ridge) < slope(&ols));
    }

    #[test]
    fn test_elastic_net_zero_penalty_matches_ols() {
        let x = array![[0.0, 1.0], [1.0, 0.0], [2.0, 1.0], [3.0, 0.0], [4.0, 1.0]];
        let y = array![1.0, 2.0, 5.0, 6.0, 9.0];
        let mut enet = ElasticNet::new(0.0, 0.5);
        enet.max_iter = 5000;
        enet.tol = 1e-10;
        enet.fit(&x, &y, None).unwrap();
        let mut ols = LinearRegression::default();
        ols.fit(&x, &y, None).unwrap();
        let a = enet.predict(&x).unwrap();
        let b = ols.predict(&x).unwrap();
        for (u, v) in a.iter().zip(b.iter()) {
            assert!((u - v).abs() < 1e-4);
        }
    }

    #[test]
    fn test_logistic_binary_and_multiclass() {
        let x = array![[-2.0], [-1.8], [-1.6], [1.6], [1.8], [2.0]];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let mut lr = LogisticRegression::default();
        lr.fit(&x, &y, None).unwrap();
        assert_eq!(lr.predict(&x).unwrap(), y);

        let x3 = array![[0.0], [0.1], [1.0], [1.1], [2.0], [2.1]];
        let y3 = array![0.0, 0.0, 1.0, 1.0, 2.0, 2.0];
        let mut lr3 = LogisticRegression {
            max_iter: 3000,
            ..Default::default()
        };
        lr3.fit(&x3, &y3, None).unwrap();
        let proba = lr3.predict_proba(&x3).unwrap().unwrap();
        assert_eq!(proba.ncols(), 3);
        for row in proba.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_logistic_single_class_is_fit_error() {
        let mut lr = LogisticRegression::default();
        let err = lr.fit(&array![[0.0], [1.0]], &array![1.0, 1.0], None).unwrap_err();
        assert!(matches!(err, RunnerError::FitError { .. }));
    }

    #[test]
    fn test_prefitted_logistic_shape_check() {
        let ok = LogisticRegression::prefitted(vec![0.0, 1.0], array![[1.0, -1.0]], array![0.0], 1.0);
        assert!(ok.is_ok());
        let bad = LogisticRegression::prefitted(vec![0.0, 1.0, 2.0], array![[1.0, -1.0]], array![0.0], 1.0);
        assert!(bad.is_err());
    }

    #[test]
    fn test_matrix_inverse() {
        let m = array![[4.0, 7.0], [2.0, 6.0]];
        let inv = matrix_inverse(&m).unwrap();
        let id = m.dot(&inv);
        assert!((id[[0, 0]] - 1.0).abs() < 1e-10 && id[[0, 1]].abs() < 1e-10);
    }
}
