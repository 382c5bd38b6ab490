//! Module/class lookup for pipeline components
//!
//! The registry is the only place a class name turns into a constructor.
//! Lookups try the exact `(module, class_name)` pair first and then fall back
//! to a class name registered exactly once, so specs written against older
//! module paths still resolve.

use crate::error::{Result, RunnerError};
use crate::estimators::{
    DecisionTree, DummyClassifier, DummyRegressor, ElasticNet, Estimator, ExponentialSmoothing, KNeighborsClassifier,
    KNeighborsRegressor, LinearRegression, LogisticRegression, MinMaxScaler, Preprocessor, Ridge, SgdClassifier,
    SgdRegressor, SimpleImputer, StandardScaler, YTransformer,
};
use crate::pipeline::Params;

pub const PREPROCESSING_MODULE: &str = "kolosal.preprocessing";
pub const ESTIMATORS_MODULE: &str = "kolosal.estimators";
pub const TIMESERIES_MODULE: &str = "kolosal.timeseries";
pub const ENSEMBLE_MODULE: &str = "kolosal.ensemble";
pub const Y_TRANSFORMERS_MODULE: &str = "kolosal.y_transformers";

pub type PreprocessorCtor = fn(&mut Params) -> Result<Preprocessor>;
pub type EstimatorCtor = fn(&mut Params) -> Result<Estimator>;
pub type YTransformerCtor = fn(&mut Params) -> Result<YTransformer>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsembleKind {
    Voting,
    Stack,
}

/// How a registered component is constructed
#[derive(Debug, Clone, Copy)]
pub enum Builder {
    Preprocessor(PreprocessorCtor),
    Estimator(EstimatorCtor),
    YTransformer(YTransformerCtor),
    /// Built by the instantiator, which owns recursive spec handling
    Ensemble(EnsembleKind),
}

#[derive(Debug, Clone)]
pub struct ComponentEntry {
    pub module: String,
    pub class_name: String,
    /// Constructor keys the adapter reads
    pub declared: &'static [&'static str],
    pub builder: Builder,
}

impl ComponentEntry {
    pub fn declares(&self, key: &str) -> bool {
        self.declared.contains(&key)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    entries: Vec<ComponentEntry>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every adapter shipped with the crate
    pub fn builtin() -> Self {
        let mut r = Self::new();

        r.register(PREPROCESSING_MODULE, "Identity", &[], Builder::Preprocessor(|_| Ok(Preprocessor::Identity)));
        r.register(
            PREPROCESSING_MODULE,
            "StandardScaler",
            &["with_mean", "with_std"],
            Builder::Preprocessor(|p| StandardScaler::from_params(p).map(Preprocessor::StandardScaler)),
        );
        r.register(
            PREPROCESSING_MODULE,
            "MinMaxScaler",
            &["feature_range"],
            Builder::Preprocessor(|p| MinMaxScaler::from_params(p).map(Preprocessor::MinMaxScaler)),
        );
        r.register(
            PREPROCESSING_MODULE,
            "SimpleImputer",
            &["strategy", "fill_value"],
            Builder::Preprocessor(|p| SimpleImputer::from_params(p).map(Preprocessor::SimpleImputer)),
        );

        r.register(
            ESTIMATORS_MODULE,
            "KNeighborsClassifier",
            KNeighborsClassifier::PARAMS,
            Builder::Estimator(|p| KNeighborsClassifier::from_params(p).map(Estimator::KNeighborsClassifier)),
        );
        r.register(
            ESTIMATORS_MODULE,
            "KNeighborsRegressor",
            KNeighborsRegressor::PARAMS,
            Builder::Estimator(|p| KNeighborsRegressor::from_params(p).map(Estimator::KNeighborsRegressor)),
        );
        r.register(
            ESTIMATORS_MODULE,
            "LinearRegression",
            LinearRegression::PARAMS,
            Builder::Estimator(|p| LinearRegression::from_params(p).map(Estimator::LinearRegression)),
        );
        r.register(
            ESTIMATORS_MODULE,
            "Ridge",
            Ridge::PARAMS,
            Builder::Estimator(|p| Ridge::from_params(p).map(Estimator::Ridge)),
        );
        r.register(
            ESTIMATORS_MODULE,
            "ElasticNet",
            ElasticNet::PARAMS,
            Builder::Estimator(|p| ElasticNet::from_params(p).map(Estimator::ElasticNet)),
        );
        r.register(
            ESTIMATORS_MODULE,
            "LogisticRegression",
            LogisticRegression::PARAMS,
            Builder::Estimator(|p| LogisticRegression::from_params(p).map(Estimator::LogisticRegression)),
        );
        r.register(
            ESTIMATORS_MODULE,
            "DecisionTreeClassifier",
            DecisionTree::PARAMS,
            Builder::Estimator(|p| DecisionTree::from_params(p, true).map(Estimator::DecisionTreeClassifier)),
        );
        r.register(
            ESTIMATORS_MODULE,
            "DecisionTreeRegressor",
            DecisionTree::PARAMS,
            Builder::Estimator(|p| DecisionTree::from_params(p, false).map(Estimator::DecisionTreeRegressor)),
        );
        r.register(
            ESTIMATORS_MODULE,
            "SGDClassifier",
            SgdClassifier::PARAMS,
            Builder::Estimator(|p| SgdClassifier::from_params(p).map(Estimator::SgdClassifier)),
        );
        r.register(
            ESTIMATORS_MODULE,
            "SGDRegressor",
            SgdRegressor::PARAMS,
            Builder::Estimator(|p| SgdRegressor::from_params(p).map(Estimator::SgdRegressor)),
        );
        r.register(
            ESTIMATORS_MODULE,
            "DummyClassifier",
            DummyClassifier::PARAMS,
            Builder::Estimator(|p| DummyClassifier::from_params(p).map(Estimator::DummyClassifier)),
        );
        r.register(
            ESTIMATORS_MODULE,
            "DummyRegressor",
            DummyRegressor::PARAMS,
            Builder::Estimator(|p| DummyRegressor::from_params(p).map(Estimator::DummyRegressor)),
        );

        r.register(
            TIMESERIES_MODULE,
            "ExponentialSmoothing",
            ExponentialSmoothing::PARAMS,
            Builder::Estimator(|p| ExponentialSmoothing::from_params(p).map(Estimator::ExponentialSmoothing)),
        );

        r.register(ENSEMBLE_MODULE, "VotingEnsemble", &[], Builder::Ensemble(EnsembleKind::Voting));
        r.register(ENSEMBLE_MODULE, "StackEnsemble", &[], Builder::Ensemble(EnsembleKind::Stack));

        r.register(
            Y_TRANSFORMERS_MODULE,
            "Log1pTransformer",
            &[],
            Builder::YTransformer(YTransformer::log1p_from_params),
        );
        r.register(
            Y_TRANSFORMERS_MODULE,
            "TargetStandardizer",
            &[],
            Builder::YTransformer(YTransformer::standardize_from_params),
        );
        r
    }

    /// Add or replace an entry
    pub fn register(
        &mut self,
        module: &str,
        class_name: &str,
        declared: &'static [&'static str],
        builder: Builder,
    ) -> &mut Self {
        self.entries.retain(|e| !(e.module == module && e.class_name == class_name));
        self.entries.push(ComponentEntry {
            module: module.to_string(),
            class_name: class_name.to_string(),
            declared,
            builder,
        });
        self
    }

    pub fn resolve(&self, module: &str, class_name: &str) -> Result<&ComponentEntry> {
        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.module == module && e.class_name == class_name)
        {
            return Ok(entry);
        }
        let mut by_name = self.entries.iter().filter(|e| e.class_name == class_name);
        match (by_name.next(), by_name.next()) {
            (Some(entry), None) => Ok(entry),
            _ => Err(RunnerError::model_not_supported(class_name)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
