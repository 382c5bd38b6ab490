//! Learner adapters
//!
//! Every learner implements one capability, [`Learner`]; the pipeline layer
//! holds them behind the serializable [`Estimator`] enum so trained chains can
//! be shipped back from a child process. Feature transforms implement
//! [`Transformer`] and live in [`Preprocessor`]; target transforms live in
//! [`YTransformer`].

mod dummy;
mod ensemble;
mod knn;
mod linear;
mod preprocessing;
mod sgd;
mod timeseries;
mod tree;
mod y_transform;

pub use dummy::{DummyClassifier, DummyRegressor};
pub use ensemble::{MetaLearner, MetaLearnerDescriptor, StackEnsemble, VotingEnsemble};
pub use knn::{DistanceMetric, KNeighborsClassifier, KNeighborsRegressor, WeightScheme};
pub use linear::{ElasticNet, LinearRegression, LogisticRegression, Ridge};
pub use preprocessing::{ColumnIdentity, ColumnUnion, MinMaxScaler, Preprocessor, SimpleImputer, StandardScaler};
pub use sgd::{SgdClassifier, SgdRegressor};
pub use timeseries::ExponentialSmoothing;
pub use tree::{DecisionTree, TreeNode};
pub use y_transform::YTransformer;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnerError};

/// Capability shared by every learner
pub trait Learner {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()>;

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>>;

    /// Class membership probabilities, columns ordered as [`Learner::classes`]
    fn predict_proba(&self, _x: &Array2<f64>) -> Result<Option<Array2<f64>>> {
        Ok(None)
    }

    /// Classes seen during fit; `None` for regressors
    fn classes(&self) -> Option<&[f64]> {
        None
    }
}

/// Learners that can also train on successive row batches
pub trait StreamingLearner: Learner {
    fn partial_fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()>;
}

/// Feature transform fitted on training rows
pub trait Transformer {
    fn fit(&mut self, x: &Array2<f64>) -> Result<()>;

    fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>>;

    fn fit_transform(&mut self, x: &Array2<f64>) -> Result<Array2<f64>> {
        self.fit(x)?;
        self.transform(x)
    }
}

/// Every learner the pipeline layer can instantiate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Estimator {
    KNeighborsClassifier(KNeighborsClassifier),
    KNeighborsRegressor(KNeighborsRegressor),
    LinearRegression(LinearRegression),
    Ridge(Ridge),
    ElasticNet(ElasticNet),
    LogisticRegression(LogisticRegression),
    DecisionTreeClassifier(DecisionTree),
    DecisionTreeRegressor(DecisionTree),
    SgdClassifier(SgdClassifier),
    SgdRegressor(SgdRegressor),
    DummyClassifier(DummyClassifier),
    DummyRegressor(DummyRegressor),
    ExponentialSmoothing(ExponentialSmoothing),
    VotingEnsemble(VotingEnsemble),
    StackEnsemble(StackEnsemble),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            Estimator::KNeighborsClassifier($inner) => $body,
            Estimator::KNeighborsRegressor($inner) => $body,
            Estimator::LinearRegression($inner) => $body,
            Estimator::Ridge($inner) => $body,
            Estimator::ElasticNet($inner) => $body,
            Estimator::LogisticRegression($inner) => $body,
            Estimator::DecisionTreeClassifier($inner) => $body,
            Estimator::DecisionTreeRegressor($inner) => $body,
            Estimator::SgdClassifier($inner) => $body,
            Estimator::SgdRegressor($inner) => $body,
            Estimator::DummyClassifier($inner) => $body,
            Estimator::DummyRegressor($inner) => $body,
            Estimator::ExponentialSmoothing($inner) => $body,
            Estimator::VotingEnsemble($inner) => $body,
            Estimator::StackEnsemble($inner) => $body,
        }
    };
}

impl Estimator {
    /// Class name the estimator is registered under
    pub fn name(&self) -> &'static str {
        match self {
            Estimator::KNeighborsClassifier(_) => "KNeighborsClassifier",
            Estimator::KNeighborsRegressor(_) => "KNeighborsRegressor",
            Estimator::LinearRegression(_) => "LinearRegression",
            Estimator::Ridge(_) => "Ridge",
            Estimator::ElasticNet(_) => "ElasticNet",
            Estimator::LogisticRegression(_) => "LogisticRegression",
            Estimator::DecisionTreeClassifier(_) => "DecisionTreeClassifier",
            Estimator::DecisionTreeRegressor(_) => "DecisionTreeRegressor",
            Estimator::SgdClassifier(_) => "SGDClassifier",
            Estimator::SgdRegressor(_) => "SGDRegressor",
            Estimator::DummyClassifier(_) => "DummyClassifier",
            Estimator::DummyRegressor(_) => "DummyRegressor",
            Estimator::ExponentialSmoothing(_) => "ExponentialSmoothing",
            Estimator::VotingEnsemble(_) => "VotingEnsemble",
            Estimator::StackEnsemble(_) => "StackEnsemble",
        }
    }

    pub fn as_streaming_mut(&mut self) -> Option<&mut dyn StreamingLearner> {
        match self {
            Estimator::SgdClassifier(e) => Some(e),
            Estimator::SgdRegressor(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Estimator::SgdClassifier(_) | Estimator::SgdRegressor(_))
    }
}

impl Learner for Estimator {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        check_rows(x, y)?;
        dispatch!(self, e => e.fit(x, y, sample_weight))
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        dispatch!(self, e => e.predict(x))
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Option<Array2<f64>>> {
        dispatch!(self, e => e.predict_proba(x))
    }

    fn classes(&self) -> Option<&[f64]> {
        dispatch!(self, e => e.classes())
    }
}

pub(crate) fn check_rows(x: &Array2<f64>, y: &Array1<f64>) -> Result<()> {
    if x.nrows() != y.len() {
        return Err(RunnerError::ShapeError {
            expected: format!("y length = {}", x.nrows()),
            actual: format!("y length = {}", y.len()),
        });
    }
    if x.nrows() == 0 {
        return Err(RunnerError::DataError("cannot fit on zero rows".to_string()));
    }
    Ok(())
}

/// Sorted distinct class labels
pub(crate) fn unique_classes(y: &Array1<f64>) -> Vec<f64> {
    let mut classes: Vec<f64> = y.iter().copied().collect();
    classes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    classes.dedup();
    classes
}

/// Weights of one per row when none are given
pub(crate) fn weights_or_ones(sample_weight: Option<&Array1<f64>>, n: usize) -> Array1<f64> {
    sample_weight.cloned().unwrap_or_else(|| Array1::ones(n))
}

/// Index of the largest entry of each row
pub(crate) fn argmax_rows(proba: &Array2<f64>) -> Vec<usize> {
    proba
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best })
                .0
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_dispatch_and_names() {
        let mut est = Estimator::LinearRegression(LinearRegression::default());
        assert_eq!(est.name(), "LinearRegression");
        est.fit(&array![[0.0], [1.0], [2.0]], &array![1.0, 3.0, 5.0], None).unwrap();
        let pred = est.predict(&array![[3.0]]).unwrap();
        assert!((pred[0] - 7.0).abs() < 1e-8);
        assert!(est.classes().is_none());
        assert!(!est.is_streaming());
    }

    #[test]
    fn test_fit_checks_rows() {
        let mut est = Estimator::Ridge(Ridge::default());
        assert!(est.fit(&array![[0.0], [1.0]], &array![1.0], None).is_err());
    }

    #[test]
    fn test_argmax_rows() {
        assert_eq!(argmax_rows(&array![[0.1, 0.9], [0.7, 0.3]]), vec![1, 0]);
    }
}
