//! Feature transforms applied ahead of the estimator
//!
//! Missing values are NaN throughout. Scalers compute their statistics over
//! the non-missing entries of each column and leave NaN in place; the
//! imputer is what replaces them.

use ndarray::{concatenate, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use super::Transformer;
use crate::error::{Result, RunnerError};
use crate::pipeline::Params;

/// Per-column statistics over the finite entries
fn column_stats(x: &Array2<f64>, f: impl Fn(&[f64]) -> f64) -> Array1<f64> {
    x.columns()
        .into_iter()
        .map(|col| {
            let present: Vec<f64> = col.iter().copied().filter(|v| !v.is_nan()).collect();
            f(&present)
        })
        .collect()
}

fn check_width(expected: usize, x: &Array2<f64>) -> Result<()> {
    if x.ncols() != expected {
        return Err(RunnerError::ShapeError {
            expected: format!("{} features", expected),
            actual: format!("{} features", x.ncols()),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    pub with_mean: bool,
    pub with_std: bool,
    mean: Option<Array1<f64>>,
    scale: Option<Array1<f64>>,
}

impl Default for StandardScaler {
    fn default() -> Self {
        Self {
            with_mean: true,
            with_std: true,
            mean: None,
            scale: None,
        }
    }
}

impl StandardScaler {
    pub fn from_params(p: &mut Params) -> Result<Self> {
        Ok(Self {
            with_mean: p.bool_or("with_mean", true)?,
            with_std: p.bool_or("with_std", true)?,
            ..Default::default()
        })
    }
}

impl Transformer for StandardScaler {
    fn fit(&mut self, x: &Array2<f64>) -> Result<()> {
        let mean = column_stats(x, |v| if v.is_empty() { 0.0 } else { v.iter().sum::<f64>() / v.len() as f64 });
        let scale = column_stats(x, |v| {
            if v.is_empty() {
                return 1.0;
            }
            let m = v.iter().sum::<f64>() / v.len() as f64;
            let std = (v.iter().map(|x| (x - m).powi(2)).sum::<f64>() / v.len() as f64).sqrt();
            if std > 1e-12 {
                std
            } else {
                1.0
            }
        });
        self.mean = Some(mean);
        self.scale = Some(scale);
        Ok(())
    }

    fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let (mean, scale) = match (&self.mean, &self.scale) {
            (Some(m), Some(s)) => (m, s),
            _ => return Err(RunnerError::ModelNotFitted),
        };
        check_width(mean.len(), x)?;
        let mut out = x.clone();
        for (j, mut col) in out.columns_mut().into_iter().enumerate() {
            let (m, s) = (
                if self.with_mean { mean[j] } else { 0.0 },
                if self.with_std { scale[j] } else { 1.0 },
            );
            col.mapv_inplace(|v| (v - m) / s);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinMaxScaler {
    pub feature_range: (f64, f64),
    min: Option<Array1<f64>>,
    range: Option<Array1<f64>>,
}

impl Default for MinMaxScaler {
    fn default() -> Self {
        Self {
            feature_range: (0.0, 1.0),
            min: None,
            range: None,
        }
    }
}

impl MinMaxScaler {
    pub fn from_params(p: &mut Params) -> Result<Self> {
        let feature_range = match p.opt_f64_vec("feature_range")? {
            None => (0.0, 1.0),
            Some(v) if v.len() == 2 && v[0] < v[1] => (v[0], v[1]),
            Some(v) => return Err(RunnerError::invalid_option("feature_range", format!("{:?}", v), "expected [low, high]")),
        };
        Ok(Self {
            feature_range,
            ..Default::default()
        })
    }
}

impl Transformer for MinMaxScaler {
    fn fit(&mut self, x: &Array2<f64>) -> Result<()> {
        let min = column_stats(x, |v| v.iter().copied().fold(f64::INFINITY, f64::min));
        let max = column_stats(x, |v| v.iter().copied().fold(f64::NEG_INFINITY, f64::max));
        let range = (&max - &min).mapv(|r| if r.is_finite() && r > 1e-12 { r } else { 1.0 });
        self.min = Some(min.mapv(|m| if m.is_finite() { m } else { 0.0 }));
        self.range = Some(range);
        Ok(())
    }

    fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let (min, range) = match (&self.min, &self.range) {
            (Some(m), Some(r)) => (m, r),
            _ => return Err(RunnerError::ModelNotFitted),
        };
        check_width(min.len(), x)?;
        let (lo, hi) = self.feature_range;
        let mut out = x.clone();
        for (j, mut col) in out.columns_mut().into_iter().enumerate() {
            col.mapv_inplace(|v| lo + (v - min[j]) / range[j] * (hi - lo));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ImputeStrategy {
    Mean,
    Median,
    Constant(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleImputer {
    pub strategy: ImputeStrategy,
    fill: Option<Array1<f64>>,
}

impl SimpleImputer {
    pub fn new(strategy: ImputeStrategy) -> Self {
        Self { strategy, fill: None }
    }

    pub fn from_params(p: &mut Params) -> Result<Self> {
        let strategy = match p.string_or("strategy", "mean")?.as_str() {
            "mean" => ImputeStrategy::Mean,
            "median" => ImputeStrategy::Median,
            "constant" => ImputeStrategy::Constant(p.f64_or("fill_value", 0.0)?),
            other => return Err(RunnerError::invalid_option("strategy", other, "expected mean, median or constant")),
        };
        Ok(Self::new(strategy))
    }
}

impl Transformer for SimpleImputer {
    fn fit(&mut self, x: &Array2<f64>) -> Result<()> {
        let fill = match self.strategy {
            ImputeStrategy::Constant(c) => Array1::from_elem(x.ncols(), c),
            ImputeStrategy::Mean => column_stats(x, |v| {
                if v.is_empty() {
                    0.0
                } else {
                    v.iter().sum::<f64>() / v.len() as f64
                }
            }),
            ImputeStrategy::Median => column_stats(x, |v| {
                let mut s = v.to_vec();
                s.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                match s.len() {
                    0 => 0.0,
                    n if n % 2 == 1 => s[n / 2],
                    n => (s[n / 2 - 1] + s[n / 2]) / 2.0,
                }
            }),
        };
        self.fill = Some(fill);
        Ok(())
    }

    fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let fill = self.fill.as_ref().ok_or(RunnerError::ModelNotFitted)?;
        check_width(fill.len(), x)?;
        let mut out = x.clone();
        for (j, mut col) in out.columns_mut().into_iter().enumerate() {
            col.mapv_inplace(|v| if v.is_nan() { fill[j] } else { v });
        }
        Ok(out)
    }
}

/// Categorical columns passed through, `inner` applied to the rest
///
/// Output columns are the categorical ones first, then the transformed
/// numerical ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnUnion {
    pub categorical: Vec<usize>,
    pub numerical: Vec<usize>,
    pub inner: Box<Preprocessor>,
}

impl ColumnUnion {
    /// Split `mask` into categorical and numerical column positions
    pub fn from_mask(mask: &[bool], inner: Preprocessor) -> Self {
        let (categorical, numerical): (Vec<usize>, Vec<usize>) = (0..mask.len()).partition(|&j| mask[j]);
        Self {
            categorical,
            numerical,
            inner: Box::new(inner),
        }
    }

    /// Mask of the output layout
    pub fn output_mask(&self) -> Vec<bool> {
        let mut mask = vec![true; self.categorical.len()];
        mask.extend(std::iter::repeat(false).take(self.numerical.len()));
        mask
    }

    fn select(x: &Array2<f64>, cols: &[usize]) -> Array2<f64> {
        x.select(Axis(1), cols)
    }
}

impl Transformer for ColumnUnion {
    fn fit(&mut self, x: &Array2<f64>) -> Result<()> {
        check_width(self.categorical.len() + self.numerical.len(), x)?;
        self.inner.fit(&Self::select(x, &self.numerical))
    }

    fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        check_width(self.categorical.len() + self.numerical.len(), x)?;
        let passthrough = Self::select(x, &self.categorical);
        let transformed = self.inner.transform(&Self::select(x, &self.numerical))?;
        Ok(concatenate(Axis(1), &[passthrough.view(), transformed.view()])?)
    }
}

/// Pass-through step that records the column layout it expects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnIdentity {
    pub mask: Vec<bool>,
}

impl Transformer for ColumnIdentity {
    fn fit(&mut self, x: &Array2<f64>) -> Result<()> {
        check_width(self.mask.len(), x)
    }

    fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        check_width(self.mask.len(), x)?;
        Ok(x.clone())
    }
}

/// Every feature transform the pipeline layer can instantiate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Preprocessor {
    Identity,
    StandardScaler(StandardScaler),
    MinMaxScaler(MinMaxScaler),
    SimpleImputer(SimpleImputer),
    ColumnUnion(ColumnUnion),
    ColumnIdentity(ColumnIdentity),
}

impl Preprocessor {
    pub fn name(&self) -> &'static str {
        match self {
            Preprocessor::Identity => "Identity",
            Preprocessor::StandardScaler(_) => "StandardScaler",
            Preprocessor::MinMaxScaler(_) => "MinMaxScaler",
            Preprocessor::SimpleImputer(_) => "SimpleImputer",
            Preprocessor::ColumnUnion(_) => "ColumnUnion",
            Preprocessor::ColumnIdentity(_) => "ColumnIdentity",
        }
    }
}

impl Transformer for Preprocessor {
    fn fit(&mut self, x: &Array2<f64>) -> Result<()> {
        match self {
            Preprocessor::Identity => Ok(()),
            Preprocessor::StandardScaler(t) => t.fit(x),
            Preprocessor::MinMaxScaler(t) => t.fit(x),
            Preprocessor::SimpleImputer(t) => t.fit(x),
            Preprocessor::ColumnUnion(t) => t.fit(x),
            Preprocessor::ColumnIdentity(t) => t.fit(x),
        }
    }

    fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        match self {
            Preprocessor::Identity => Ok(x.clone()),
            Preprocessor::StandardScaler(t) => t.transform(x),
            Preprocessor::MinMaxScaler(t) => t.transform(x),
            Preprocessor::SimpleImputer(t) => t.transform(x),
            Preprocessor::ColumnUnion(t) => t.transform(x),
            Preprocessor::ColumnIdentity(t) => t.transform(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_standard_scaler_ignores_missing() {
        let x = array![[1.0, 10.0], [3.0, f64::NAN], [5.0, 30.0]];
        let mut s = StandardScaler::default();
        let out = s.fit_transform(&x).unwrap();
        assert!((out[[1, 0]]).abs() < 1e-12);
        assert!(out[[1, 1]].is_nan());
        assert!((out[[0, 1]] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_minmax_range() {
        let mut s = MinMaxScaler::default();
        let out = s.fit_transform(&array![[2.0], [4.0], [6.0]]).unwrap();
        assert_eq!(out.column(0).to_vec(), vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_imputer_median() {
        let mut imp = SimpleImputer::new(ImputeStrategy::Median);
        let out = imp.fit_transform(&array![[1.0], [f64::NAN], [3.0], [10.0]]).unwrap();
        assert_eq!(out[[1, 0]], 3.0);
    }

    #[test]
    fn test_column_union_passes_categoricals_first() {
        let x = array![[1.0, 7.0, 100.0], [2.0, 8.0, 300.0]];
        let mut union = ColumnUnion::from_mask(
            &[false, true, false],
            Preprocessor::MinMaxScaler(MinMaxScaler::default()),
        );
        assert_eq!(union.output_mask(), vec![true, false, false]);
        let out = union.fit_transform(&x).unwrap();
        assert_eq!(out.row(0).to_vec(), vec![7.0, 0.0, 0.0]);
        assert_eq!(out.row(1).to_vec(), vec![8.0, 1.0, 1.0]);
    }

    #[test]
    fn test_unfitted_and_width_errors() {
        let s = StandardScaler::default();
        assert!(matches!(s.transform(&array![[1.0]]), Err(RunnerError::ModelNotFitted)));
        let id = ColumnIdentity { mask: vec![true] };
        assert!(id.transform(&array![[1.0, 2.0]]).is_err());
    }
}
