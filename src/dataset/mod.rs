//! Dataset container
//!
//! A [`Dataset`] holds the training corpus for one experiment: features,
//! targets, optional sample weights, the train/valid/test and CV split
//! definitions, and the transformers fitted upstream. Heavy fields can be
//! written to a [`CacheStore`] and evicted; every accessor falls back to the
//! cache when a field is not resident, and [`Dataset::open_dataset`] gives
//! scoped access with all cached fields loaded.
//!
//! Heavy fields are `Option<Arc<_>>` so subsamples share every unchanged
//! field with their parent and only own the rewritten index or payload.

pub mod binning;
mod builder;
mod caching;
pub mod sampling;
mod splits;
mod subsample;
mod transformers;

pub use binning::{make_bin_info, BinInfo};
pub use builder::DatasetBuilder;
pub use caching::OpenDataset;
pub use splits::CvSplitIter;
pub use transformers::{DatasetTransformers, Featurizer, LabelEncoder, TimeseriesTransformer};

use std::collections::HashMap;
use std::sync::Arc;

use ndarray::Array1;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tracing::warn;

use crate::cache::{CacheStore, CacheStoreHandle};
use crate::constants::{cache_keys, transformer_names};
use crate::data::{index_bytes, vector_bytes, TabularView};
use crate::error::{Result, RunnerError};
use crate::estimators::Preprocessor;
use crate::problem_info::{ProblemInfo, Task, TimeseriesParams};

/// Materialized `(X, y, sample_weight)` triple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitData {
    pub x: TabularView,
    pub y: Array1<f64>,
    pub sample_weight: Option<Array1<f64>>,
}

impl SplitData {
    pub fn new(x: impl Into<TabularView>, y: Array1<f64>) -> Self {
        Self {
            x: x.into(),
            y,
            sample_weight: None,
        }
    }

    pub fn with_sample_weight(mut self, w: Array1<f64>) -> Self {
        self.sample_weight = Some(w);
        self
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    /// Keep only the first `n` rows
    pub fn head(&self, n: usize) -> Result<Self> {
        let rows: Vec<usize> = (0..n.min(self.len())).collect();
        self.take_rows(&rows)
    }

    pub fn take_rows(&self, rows: &[usize]) -> Result<Self> {
        Ok(Self {
            x: self.x.take_rows(rows)?,
            y: crate::data::take_values(&self.y, rows)?,
            sample_weight: self
                .sample_weight
                .as_ref()
                .map(|w| crate::data::take_values(w, rows))
                .transpose()?,
        })
    }

    /// Stack two splits; weights survive only when both sides carry them
    pub fn vstack(&self, other: &SplitData) -> Result<Self> {
        let sample_weight = match (&self.sample_weight, &other.sample_weight) {
            (Some(a), Some(b)) => Some(crate::data::concat_values(a, b)),
            _ => None,
        };
        Ok(Self {
            x: self.x.vstack(&other.x)?,
            y: crate::data::concat_values(&self.y, &other.y),
            sample_weight,
        })
    }
}

/// Index-based CV fold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvSplit {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Materialized CV fold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fold {
    pub train: SplitData,
    pub test: SplitData,
}

/// How the dataset is meant to be trained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingType {
    TrainAndValidation,
    CrossValidation,
}

/// How the held-out data was defined; drives bin info
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum SplitKind {
    #[default]
    None,
    TrainValidate,
    KFold { n_folds: usize },
    MonteCarlo { valid_fraction: f64 },
    Custom,
}

/// Subsample caching policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SubsampleCacheStrategy {
    /// Sample once per percent and keep the result
    #[default]
    Classic,
    /// Sample on every call, never keep the result
    ClassicNoCache,
    /// Shuffle the train indices once and slice prefixes
    Preshuffle,
}

impl std::str::FromStr for SubsampleCacheStrategy {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "classic" => Ok(SubsampleCacheStrategy::Classic),
            "classicnocache" | "classic_no_cache" => Ok(SubsampleCacheStrategy::ClassicNoCache),
            "preshuffle" => Ok(SubsampleCacheStrategy::Preshuffle),
            other => Err(RunnerError::invalid_option(
                "subsample_cache_strategy",
                other,
                "expected classic, classic_no_cache or preshuffle",
            )),
        }
    }
}

/// Defines the heavy, cache-backed fields and their cache keys
macro_rules! heavy_fields {
    ($($field:ident : $ty:ty => $key:path),* $(,)?) => {
        #[derive(Debug, Clone, Default, Serialize, Deserialize)]
        pub(crate) struct DatasetFields {
            $(pub(crate) $field: Option<Arc<$ty>>,)*
        }

        impl DatasetFields {
            /// bincode image of a resident field
            pub(crate) fn encode(&self, key: &str) -> Result<Option<Vec<u8>>> {
                match key {
                    $($key => Ok(self
                        .$field
                        .as_ref()
                        .map(|v| bincode::serialize(v.as_ref()))
                        .transpose()?),)*
                    other => Err(unknown_key(other)),
                }
            }

            pub(crate) fn restore(&mut self, key: &str, bytes: &[u8]) -> Result<()> {
                match key {
                    $($key => {
                        self.$field = Some(Arc::new(decode::<$ty>(key, bytes)?));
                        Ok(())
                    })*
                    other => Err(unknown_key(other)),
                }
            }

            pub(crate) fn evict(&mut self, key: &str) {
                match key {
                    $($key => self.$field = None,)*
                    _ => {}
                }
            }

            pub(crate) fn is_resident(&self, key: &str) -> bool {
                match key {
                    $($key => self.$field.is_some(),)*
                    _ => false,
                }
            }
        }
    };
}

heavy_fields! {
    x: TabularView => cache_keys::X,
    y: Array1<f64> => cache_keys::Y,
    sample_weight: Array1<f64> => cache_keys::SAMPLE_WEIGHT,
    x_valid: TabularView => cache_keys::X_VALID,
    y_valid: Array1<f64> => cache_keys::Y_VALID,
    sample_weight_valid: Array1<f64> => cache_keys::SAMPLE_WEIGHT_VALID,
    x_test: TabularView => cache_keys::X_TEST,
    y_test: Array1<f64> => cache_keys::Y_TEST,
    sample_weight_test: Array1<f64> => cache_keys::SAMPLE_WEIGHT_TEST,
    x_raw: TabularView => cache_keys::X_RAW,
    y_raw: Array1<f64> => cache_keys::Y_RAW,
    class_labels: Vec<f64> => cache_keys::CLASS_LABELS,
    train_idx: Vec<usize> => cache_keys::TRAIN_INDICES,
    valid_idx: Vec<usize> => cache_keys::VALID_INDICES,
    test_idx: Vec<usize> => cache_keys::TEST_INDICES,
    featurized_train: SplitData => cache_keys::FEATURIZED_TRAIN,
    featurized_valid: SplitData => cache_keys::FEATURIZED_VALID,
    featurized_test: SplitData => cache_keys::FEATURIZED_TEST,
    cv_splits: Vec<CvSplit> => cache_keys::TRAIN_CV_SPLITS,
    featurized_cv_splits: Vec<Fold> => cache_keys::FEATURIZED_TRAIN_CV_SPLITS,
    transformers: DatasetTransformers => cache_keys::TRANSFORMERS,
    training_type: TrainingType => cache_keys::TRAINING_TYPE,
    is_timeseries: bool => cache_keys::TIMESERIES,
}

fn unknown_key(key: &str) -> RunnerError {
    RunnerError::DataError(format!("'{}' is not a dataset field", key))
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| {
        warn!(key, error = %e, "cached dataset field has an unexpected format");
        RunnerError::DataError(format!("cached field '{}' has the wrong format: {}", key, e))
    })
}

/// Light metadata, always resident
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub task: Task,
    pub num_samples: usize,
    pub num_features: usize,
    pub num_classes: Option<usize>,
    pub num_missing: usize,
    pub is_sparse: bool,
    pub num_categorical: usize,
    pub categorical: Option<Vec<bool>>,
    pub y_min: Option<f64>,
    pub y_max: Option<f64>,
    pub y_std: Option<f64>,
    pub raw_column_names: Option<Vec<String>>,
    pub raw_data_type: Option<String>,
    pub raw_data_snapshot: Option<String>,
    pub timeseries_param_dict: Option<TimeseriesParams>,
    pub bin_info: Option<BinInfo>,
    pub split_kind: SplitKind,
}

#[derive(Debug, Default)]
pub(crate) struct SubsampleState {
    pub(crate) cache: HashMap<u64, Arc<Dataset>>,
    pub(crate) preshuffled: HashMap<u64, Arc<Vec<usize>>>,
}

/// Training corpus with split definitions and a cache store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub(crate) fields: DatasetFields,
    pub(crate) meta: DatasetMeta,
    pub(crate) preprocessor_step: Option<Preprocessor>,
    pub(crate) subsample_strategy: SubsampleCacheStrategy,
    pub(crate) cache_store: CacheStoreHandle,
    #[serde(skip)]
    pub(crate) subsample_state: Arc<Mutex<SubsampleState>>,
}

impl Dataset {
    pub fn builder(x: impl Into<TabularView>, y: Array1<f64>, task: Task) -> DatasetBuilder {
        DatasetBuilder::new(x, y, task)
    }

    /// Dataset whose training split is the whole of `x`
    pub fn from_arrays(x: impl Into<TabularView>, y: Array1<f64>, task: Task) -> Result<Self> {
        DatasetBuilder::new(x, y, task).build()
    }

    /// Dataset with an explicit validation set
    ///
    /// Train indices cover all of `x`; class labels are the union of both
    /// sets; bin info comes from the validation targets.
    pub fn train_validate(
        x: impl Into<TabularView>,
        y: Array1<f64>,
        x_valid: impl Into<TabularView>,
        y_valid: Array1<f64>,
        task: Task,
    ) -> Result<Self> {
        DatasetBuilder::new(x, y, task)
            .with_validation_set(x_valid, y_valid, None)
            .build()
    }

    pub(crate) fn store(&self) -> &CacheStoreHandle {
        &self.cache_store
    }

    /// Read a field from the cache store without making it resident
    pub(crate) fn cached<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut found = self.cache_store.get(&[key.to_string()])?;
        match found.remove(key) {
            Some(bytes) => decode::<T>(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Resident value of a heavy field, or its cached copy
    pub(crate) fn resolve<T: DeserializeOwned>(&self, slot: &Option<Arc<T>>, key: &str) -> Result<Option<Arc<T>>> {
        if let Some(v) = slot {
            return Ok(Some(Arc::clone(v)));
        }
        Ok(self.cached::<T>(key)?.map(Arc::new))
    }

    pub fn task(&self) -> Task {
        self.meta.task
    }

    pub fn meta(&self) -> &DatasetMeta {
        &self.meta
    }

    pub fn num_samples(&self) -> usize {
        self.meta.num_samples
    }

    pub fn num_features(&self) -> usize {
        self.meta.num_features
    }

    pub fn is_sparse(&self) -> bool {
        self.meta.is_sparse
    }

    pub fn subsample_strategy(&self) -> SubsampleCacheStrategy {
        self.subsample_strategy
    }

    pub fn set_subsample_strategy(&mut self, strategy: SubsampleCacheStrategy) {
        self.subsample_strategy = strategy;
        let mut state = self.subsample_state.lock();
        state.cache.clear();
        state.preshuffled.clear();
    }

    /// Whether a heavy field is currently held in memory
    pub fn is_resident(&self, key: &str) -> bool {
        self.fields.is_resident(key)
    }

    /// Heavy fields currently held in memory
    pub fn resident_fields(&self) -> Vec<&'static str> {
        cache_keys::DATA_FIELDS
            .iter()
            .copied()
            .filter(|k| self.fields.is_resident(k))
            .collect()
    }

    pub fn train_indices(&self) -> Result<Option<Arc<Vec<usize>>>> {
        self.resolve(&self.fields.train_idx, cache_keys::TRAIN_INDICES)
    }

    pub fn valid_indices(&self) -> Result<Option<Arc<Vec<usize>>>> {
        self.resolve(&self.fields.valid_idx, cache_keys::VALID_INDICES)
    }

    pub fn test_indices(&self) -> Result<Option<Arc<Vec<usize>>>> {
        self.resolve(&self.fields.test_idx, cache_keys::TEST_INDICES)
    }

    pub fn cv_split_indices(&self) -> Result<Option<Arc<Vec<CvSplit>>>> {
        self.resolve(&self.fields.cv_splits, cache_keys::TRAIN_CV_SPLITS)
    }

    pub fn class_labels(&self) -> Result<Option<Arc<Vec<f64>>>> {
        self.resolve(&self.fields.class_labels, cache_keys::CLASS_LABELS)
    }

    pub fn transformers(&self) -> Result<Option<Arc<DatasetTransformers>>> {
        self.resolve(&self.fields.transformers, cache_keys::TRANSFORMERS)
    }

    pub fn get_num_classes(&self) -> Option<usize> {
        self.meta.num_classes
    }

    pub fn get_y_range(&self) -> (Option<f64>, Option<f64>) {
        (self.meta.y_min, self.meta.y_max)
    }

    pub fn get_y_std(&self) -> Option<f64> {
        self.meta.y_std
    }

    pub fn get_bin_info(&self) -> Option<&BinInfo> {
        self.meta.bin_info.as_ref()
    }

    /// Bin descriptor for `n_valid` held-out points of `y`
    pub fn make_bin_info(n_valid: usize, y: &Array1<f64>, percentile: f64) -> BinInfo {
        binning::make_bin_info(n_valid, y, percentile)
    }

    pub fn get_training_type(&self) -> Result<Option<TrainingType>> {
        Ok(self
            .resolve(&self.fields.training_type, cache_keys::TRAINING_TYPE)?
            .map(|t| *t))
    }

    pub fn is_timeseries(&self) -> Result<bool> {
        Ok(self
            .resolve(&self.fields.is_timeseries, cache_keys::TIMESERIES)?
            .map(|t| *t)
            .unwrap_or(false))
    }

    pub fn timeseries_params(&self) -> Option<&TimeseriesParams> {
        self.meta.timeseries_param_dict.as_ref()
    }

    pub fn has_training_set(&self) -> Result<bool> {
        Ok(self.x_valid_is_explicit()?
            || self.train_indices()?.is_some()
            || self.resolve(&self.fields.featurized_train, cache_keys::FEATURIZED_TRAIN)?.is_some())
    }

    pub fn has_valid_set(&self) -> Result<bool> {
        Ok(self.x_valid_is_explicit()?
            || self.valid_indices()?.is_some()
            || self.resolve(&self.fields.featurized_valid, cache_keys::FEATURIZED_VALID)?.is_some())
    }

    pub fn has_test_set(&self) -> Result<bool> {
        Ok(self.resolve(&self.fields.x_test, cache_keys::X_TEST)?.is_some()
            || self.test_indices()?.is_some()
            || self.resolve(&self.fields.featurized_test, cache_keys::FEATURIZED_TEST)?.is_some())
    }

    pub fn has_cv_splits(&self) -> Result<bool> {
        Ok(self.cv_split_indices()?.is_some()
            || self
                .resolve(&self.fields.featurized_cv_splits, cache_keys::FEATURIZED_TRAIN_CV_SPLITS)?
                .is_some())
    }

    pub(crate) fn x_valid_is_explicit(&self) -> Result<bool> {
        Ok(self.resolve(&self.fields.x_valid, cache_keys::X_VALID)?.is_some())
    }

    /// Feature names after featurization
    ///
    /// The timeseries transformer wins over the X transformer, which wins
    /// over the raw column names.
    pub fn get_engineered_feature_names(&self) -> Result<Option<Vec<String>>> {
        if let Some(transformers) = self.transformers()? {
            if let Some(ts) = &transformers.timeseries_transformer {
                return Ok(Some(ts.feature_names.clone()));
            }
            if let Some(featurizer) = &transformers.x_transformer {
                return Ok(Some(featurizer.feature_names.clone()));
            }
        }
        Ok(self.meta.raw_column_names.clone())
    }

    /// Step to prepend to every pipeline trained on this dataset
    pub fn get_preprocessor_pipeline_step(&self) -> Option<(String, Preprocessor)> {
        self.preprocessor_step
            .as_ref()
            .map(|p| (transformer_names::PREPROCESSOR_STEP.to_string(), p.clone()))
    }

    /// Problem description derived from the dataset's metadata
    pub fn get_problem_info(&self) -> ProblemInfo {
        let mut info = ProblemInfo::new(self.meta.task).with_shape(self.meta.num_samples, self.meta.num_features);
        info.num_classes = self.meta.num_classes;
        info.y_std = self.meta.y_std;
        info.is_sparse = self.meta.is_sparse;
        info.num_categorical = self.meta.num_categorical;
        info.dataset_categoricals = self.meta.categorical.clone();
        info.timeseries_param_dict = self.meta.timeseries_param_dict.clone();
        info
    }

    /// SHA-512 identifier of the data and its split indices
    ///
    /// Formatted as `hex-task-num_samples-num_features-y_min-y_max-is_sparse`.
    pub fn get_identifier(&self) -> Result<String> {
        let mut hasher = Sha512::new();
        if let Some(x) = self.resolve(&self.fields.x, cache_keys::X)? {
            hasher.update(x.hash_bytes()?);
        }
        if let Some(y) = self.resolve(&self.fields.y, cache_keys::Y)? {
            hasher.update(vector_bytes(&y));
        }
        for indices in [self.train_indices()?, self.test_indices()?, self.valid_indices()?]
            .into_iter()
            .flatten()
        {
            hasher.update(index_bytes(&indices));
        }
        if let Some(featurized) = self.resolve(&self.fields.featurized_train, cache_keys::FEATURIZED_TRAIN)? {
            hasher.update(featurized.x.hash_bytes()?);
            hasher.update(vector_bytes(&featurized.y));
        }
        if let Some(cv) = self.cv_split_indices()? {
            for split in cv.iter() {
                hasher.update(index_bytes(&split.train));
                hasher.update(index_bytes(&split.test));
            }
        }
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        let fmt = |v: Option<f64>| v.map_or_else(|| "None".to_string(), |v| v.to_string());
        Ok(format!(
            "{}-{}-{}-{}-{}-{}-{}",
            hex,
            self.meta.task,
            self.meta.num_samples,
            self.meta.num_features,
            fmt(self.meta.y_min),
            fmt(self.meta.y_max),
            self.meta.is_sparse
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn classification() -> Dataset {
        Dataset::builder(
            array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]],
            array![0.0, 1.0, 1.0, 0.0],
            Task::Classification,
        )
        .with_train_valid_indices(vec![0, 1], vec![2, 3])
        .build()
        .unwrap()
    }

    #[test]
    fn test_fields_encode_restore() {
        let ds = classification();
        let bytes = ds.fields.encode(cache_keys::TRAIN_INDICES).unwrap().unwrap();
        let mut fields = DatasetFields::default();
        fields.restore(cache_keys::TRAIN_INDICES, &bytes).unwrap();
        assert_eq!(fields.train_idx.as_deref(), Some(&vec![0, 1]));
        assert!(fields.restore("bogus", &bytes).is_err());
    }

    #[test]
    fn test_wrong_format_is_data_error() {
        let mut fields = DatasetFields::default();
        let err = fields.restore(cache_keys::FEATURIZED_TRAIN, &[1, 2]).unwrap_err();
        assert!(matches!(err, RunnerError::DataError(_)));
    }

    #[test]
    fn test_identifier_is_stable_and_sensitive() {
        let a = classification();
        let b = classification();
        assert_eq!(a.get_identifier().unwrap(), b.get_identifier().unwrap());
        let id = a.get_identifier().unwrap();
        assert!(id.ends_with("-classification-4-2-None-None-false"), "{}", id);

        let c = Dataset::builder(
            array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]],
            array![0.0, 1.0, 1.0, 0.0],
            Task::Classification,
        )
        .with_train_valid_indices(vec![1, 0], vec![2, 3])
        .build()
        .unwrap();
        assert_ne!(id, c.get_identifier().unwrap());
    }

    #[test]
    fn test_problem_info_from_metadata() {
        let ds = classification();
        let info = ds.get_problem_info();
        assert_eq!(info.num_samples, 4);
        assert_eq!(info.num_features, 2);
        assert_eq!(info.num_classes, Some(2));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "preshuffle".parse::<SubsampleCacheStrategy>().unwrap(),
            SubsampleCacheStrategy::Preshuffle
        );
        assert!("sometimes".parse::<SubsampleCacheStrategy>().is_err());
    }
}
