//! Baseline learners that ignore the features

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use super::{unique_classes, weights_or_ones, Learner};
use crate::error::{Result, RunnerError};
use crate::pipeline::Params;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ClassifierStrategy {
    MostFrequent,
    Prior,
    Constant(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DummyClassifier {
    pub strategy: ClassifierStrategy,
    classes: Vec<f64>,
    priors: Vec<f64>,
}

impl DummyClassifier {
    pub const PARAMS: &'static [&'static str] = &["strategy", "constant", "random_state"];

    pub fn new(strategy: ClassifierStrategy) -> Self {
        Self {
            strategy,
            classes: Vec::new(),
            priors: Vec::new(),
        }
    }

    pub fn from_params(p: &mut Params) -> Result<Self> {
        let strategy = match p.string_or("strategy", "prior")?.as_str() {
            "most_frequent" => ClassifierStrategy::MostFrequent,
            "prior" => ClassifierStrategy::Prior,
            "constant" => ClassifierStrategy::Constant(
                p.opt_f64("constant")?
                    .ok_or_else(|| RunnerError::invalid_option("constant", "None", "required by the constant strategy"))?,
            ),
            other => return Err(RunnerError::invalid_option("strategy", other, "unsupported strategy")),
        };
        let _ = p.opt_u64("random_state")?;
        Ok(Self::new(strategy))
    }

    fn fitted(&self) -> Result<()> {
        if self.classes.is_empty() {
            Err(RunnerError::ModelNotFitted)
        } else {
            Ok(())
        }
    }
}

impl Learner for DummyClassifier {
    fn fit(&mut self, _x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        self.classes = unique_classes(y);
        let w = weights_or_ones(sample_weight, y.len());
        let mut counts = vec![0.0; self.classes.len()];
        for (label, weight) in y.iter().zip(w.iter()) {
            if let Some(k) = self.classes.iter().position(|c| c == label) {
                counts[k] += weight;
            }
        }
        let total: f64 = counts.iter().sum();
        self.priors = counts.iter().map(|c| if total > 0.0 { c / total } else { 0.0 }).collect();
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        self.fitted()?;
        let label = match self.strategy {
            ClassifierStrategy::Constant(c) => c,
            ClassifierStrategy::MostFrequent | ClassifierStrategy::Prior => {
                let best = self
                    .priors
                    .iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |acc, (i, &p)| if p > acc.1 { (i, p) } else { acc })
                    .0;
                self.classes[best]
            }
        };
        Ok(Array1::from_elem(x.nrows(), label))
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Option<Array2<f64>>> {
        self.fitted()?;
        let row: Vec<f64> = match self.strategy {
            ClassifierStrategy::Prior => self.priors.clone(),
            ClassifierStrategy::MostFrequent => {
                let best = self.predict(&Array2::zeros((1, 0)))?[0];
                self.classes.iter().map(|&c| if c == best { 1.0 } else { 0.0 }).collect()
            }
            ClassifierStrategy::Constant(k) => self.classes.iter().map(|&c| if c == k { 1.0 } else { 0.0 }).collect(),
        };
        let mut proba = Array2::zeros((x.nrows(), row.len()));
        for mut r in proba.rows_mut() {
            r.assign(&Array1::from_vec(row.clone()));
        }
        Ok(Some(proba))
    }

    fn classes(&self) -> Option<&[f64]> {
        Some(&self.classes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RegressorStrategy {
    Mean,
    Median,
    /// A NaN constant makes every prediction NaN
    Constant(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DummyRegressor {
    pub strategy: RegressorStrategy,
    value: Option<f64>,
}

impl DummyRegressor {
    pub const PARAMS: &'static [&'static str] = &["strategy", "constant"];

    pub fn new(strategy: RegressorStrategy) -> Self {
        Self { strategy, value: None }
    }

    pub fn from_params(p: &mut Params) -> Result<Self> {
        let strategy = match p.string_or("strategy", "mean")?.as_str() {
            "mean" => RegressorStrategy::Mean,
            "median" => RegressorStrategy::Median,
            "constant" => RegressorStrategy::Constant(
                p.opt_f64("constant")?
                    .ok_or_else(|| RunnerError::invalid_option("constant", "None", "required by the constant strategy"))?,
            ),
            other => return Err(RunnerError::invalid_option("strategy", other, "unsupported strategy")),
        };
        Ok(Self::new(strategy))
    }
}

impl Learner for DummyRegressor {
    fn fit(&mut self, _x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        let value = match self.strategy {
            RegressorStrategy::Constant(c) => c,
            RegressorStrategy::Mean => {
                let w = weights_or_ones(sample_weight, y.len());
                let total = w.sum();
                if total > 0.0 {
                    y.dot(&w) / total
                } else {
                    f64::NAN
                }
            }
            RegressorStrategy::Median => {
                let mut sorted = y.to_vec();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let n = sorted.len();
                match n {
                    0 => f64::NAN,
                    _ if n % 2 == 1 => sorted[n / 2],
                    _ => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
                }
            }
        };
        self.value = Some(value);
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let value = self.value.ok_or(RunnerError::ModelNotFitted)?;
        Ok(Array1::from_elem(x.nrows(), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_prior_classifier() {
        let mut d = DummyClassifier::new(ClassifierStrategy::Prior);
        d.fit(&Array2::zeros((4, 1)), &array![1.0, 1.0, 1.0, 0.0], None).unwrap();
        assert_eq!(d.predict(&Array2::zeros((2, 1))).unwrap(), array![1.0, 1.0]);
        let proba = d.predict_proba(&Array2::zeros((1, 1))).unwrap().unwrap();
        assert_eq!(proba.row(0).to_vec(), vec![0.25, 0.75]);
    }

    #[test]
    fn test_median_and_nan_constant() {
        let mut d = DummyRegressor::new(RegressorStrategy::Median);
        d.fit(&Array2::zeros((4, 1)), &array![1.0, 9.0, 3.0, 5.0], None).unwrap();
        assert_eq!(d.predict(&Array2::zeros((1, 1))).unwrap()[0], 4.0);

        let mut nan = DummyRegressor::new(RegressorStrategy::Constant(f64::NAN));
        nan.fit(&Array2::zeros((2, 1)), &array![1.0, 2.0], None).unwrap();
        assert!(nan.predict(&Array2::zeros((3, 1))).unwrap().iter().all(|v| v.is_nan()));
    }
}
