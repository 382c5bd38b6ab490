//! Dataset construction and validation

use std::sync::Arc;

use ndarray::Array1;
use parking_lot::Mutex;

use super::binning::make_bin_info;
use super::sampling;
use super::{
    CvSplit, Dataset, DatasetFields, DatasetMeta, DatasetTransformers, Fold, SplitData, SplitKind,
    SubsampleCacheStrategy, SubsampleState, TrainingType,
};
use crate::cache::CacheStoreHandle;
use crate::data::{take_values, TabularView};
use crate::error::{Result, RunnerError};
use crate::estimators::Preprocessor;
use crate::problem_info::{Task, TimeseriesParams};

/// Percentile beyond which targets land in the outer bins
const BIN_OUTLIER_PERCENTILE: f64 = 1.0;

type Labelled = (TabularView, Array1<f64>, Option<Array1<f64>>);

/// Builder for [`Dataset`]
///
/// With no split options the training split covers every row of `X`.
pub struct DatasetBuilder {
    task: Task,
    x: Option<TabularView>,
    y: Option<Array1<f64>>,
    sample_weight: Option<Array1<f64>>,
    valid: Option<Labelled>,
    test: Option<Labelled>,
    train_idx: Option<Vec<usize>>,
    valid_idx: Option<Vec<usize>>,
    test_idx: Option<Vec<usize>>,
    split_fractions: Option<(u64, f64, f64)>,
    k_fold: Option<(usize, u64)>,
    cv_indices: Option<Vec<CvSplit>>,
    featurized_train: Option<SplitData>,
    featurized_valid: Option<SplitData>,
    featurized_test: Option<SplitData>,
    featurized_cv: Option<Vec<Fold>>,
    categorical: Option<Vec<bool>>,
    raw: Option<(TabularView, Array1<f64>)>,
    raw_column_names: Option<Vec<String>>,
    raw_data_type: Option<String>,
    raw_data_snapshot: Option<String>,
    transformers: Option<DatasetTransformers>,
    timeseries: Option<TimeseriesParams>,
    preprocessor_step: Option<Preprocessor>,
    cache_store: CacheStoreHandle,
    subsample_strategy: SubsampleCacheStrategy,
}

impl DatasetBuilder {
    pub fn new(x: impl Into<TabularView>, y: Array1<f64>, task: Task) -> Self {
        let mut builder = Self::empty(task);
        builder.x = Some(x.into());
        builder.y = Some(y);
        builder
    }

    /// Dataset made only of pre-featurized payloads
    pub fn featurized(task: Task) -> Self {
        Self::empty(task)
    }

    fn empty(task: Task) -> Self {
        Self {
            task,
            x: None,
            y: None,
            sample_weight: None,
            valid: None,
            test: None,
            train_idx: None,
            valid_idx: None,
            test_idx: None,
            split_fractions: None,
            k_fold: None,
            cv_indices: None,
            featurized_train: None,
            featurized_valid: None,
            featurized_test: None,
            featurized_cv: None,
            categorical: None,
            raw: None,
            raw_column_names: None,
            raw_data_type: None,
            raw_data_snapshot: None,
            transformers: None,
            timeseries: None,
            preprocessor_step: None,
            cache_store: CacheStoreHandle::default(),
            subsample_strategy: SubsampleCacheStrategy::default(),
        }
    }

    pub fn with_sample_weight(mut self, w: Array1<f64>) -> Self {
        self.sample_weight = Some(w);
        self
    }

    /// Explicit validation arrays, kept apart from `X`
    pub fn with_validation_set(
        mut self,
        x_valid: impl Into<TabularView>,
        y_valid: Array1<f64>,
        sample_weight_valid: Option<Array1<f64>>,
    ) -> Self {
        self.valid = Some((x_valid.into(), y_valid, sample_weight_valid));
        self
    }

    pub fn with_test_set(
        mut self,
        x_test: impl Into<TabularView>,
        y_test: Array1<f64>,
        sample_weight_test: Option<Array1<f64>>,
    ) -> Self {
        self.test = Some((x_test.into(), y_test, sample_weight_test));
        self
    }

    /// Train / valid row ids into `X` (row labels when `X` is a frame)
    pub fn with_train_valid_indices(mut self, train: Vec<usize>, valid: Vec<usize>) -> Self {
        self.train_idx = Some(train);
        self.valid_idx = if valid.is_empty() { None } else { Some(valid) };
        self
    }

    pub fn with_test_indices(mut self, test: Vec<usize>) -> Self {
        self.test_idx = Some(test);
        self
    }

    /// Carve seeded test and validation splits out of `X`
    ///
    /// Both fractions lie in `[0, 1)`. Classification splits are stratified
    /// when every class has at least two members.
    pub fn with_split_percentages(mut self, seed: u64, test_fraction: f64, valid_fraction: f64) -> Self {
        self.split_fractions = Some((seed, test_fraction, valid_fraction));
        self
    }

    /// Shuffled k-fold over the non-test rows (stratified for classification)
    pub fn with_k_fold(mut self, n_folds: usize, seed: u64) -> Self {
        self.k_fold = Some((n_folds, seed));
        self
    }

    /// Custom CV folds as positional row indices
    pub fn with_cv_indices(mut self, splits: Vec<CvSplit>) -> Self {
        self.cv_indices = Some(splits);
        self
    }

    pub fn with_featurized_train(mut self, data: SplitData) -> Self {
        self.featurized_train = Some(data);
        self
    }

    pub fn with_featurized_valid(mut self, data: SplitData) -> Self {
        self.featurized_valid = Some(data);
        self
    }

    pub fn with_featurized_test(mut self, data: SplitData) -> Self {
        self.featurized_test = Some(data);
        self
    }

    pub fn with_featurized_cv(mut self, folds: Vec<Fold>) -> Self {
        self.featurized_cv = Some(folds);
        self
    }

    /// Boolean mask over the feature columns marking categoricals
    pub fn with_categorical(mut self, mask: Vec<bool>) -> Self {
        self.categorical = Some(mask);
        self
    }

    /// Data as it was before featurization
    pub fn with_raw(
        mut self,
        x_raw: impl Into<TabularView>,
        y_raw: Array1<f64>,
        data_type: Option<String>,
        snapshot: Option<String>,
    ) -> Self {
        self.raw = Some((x_raw.into(), y_raw));
        self.raw_data_type = data_type;
        self.raw_data_snapshot = snapshot;
        self
    }

    pub fn with_raw_column_names(mut self, names: Vec<String>) -> Self {
        self.raw_column_names = Some(names);
        self
    }

    pub fn with_transformers(mut self, transformers: DatasetTransformers) -> Self {
        self.transformers = Some(transformers);
        self
    }

    pub fn with_timeseries(mut self, params: TimeseriesParams) -> Self {
        self.timeseries = Some(params);
        self
    }

    pub fn with_preprocessor_step(mut self, step: Preprocessor) -> Self {
        self.preprocessor_step = Some(step);
        self
    }

    pub fn with_cache_store(mut self, store: CacheStoreHandle) -> Self {
        self.cache_store = store;
        self
    }

    pub fn with_subsample_strategy(mut self, strategy: SubsampleCacheStrategy) -> Self {
        self.subsample_strategy = strategy;
        self
    }

    pub fn build(mut self) -> Result<Dataset> {
        self.validate()?;

        let mut split_kind = SplitKind::None;
        let mut training_type = TrainingType::TrainAndValidation;

        if let Some((seed, test_fraction, valid_fraction)) = self.split_fractions {
            self.carve_splits(seed, test_fraction, valid_fraction)?;
            if valid_fraction > 0.0 {
                split_kind = SplitKind::MonteCarlo { valid_fraction };
            }
        }

        if let Some((n_folds, seed)) = self.k_fold {
            self.cv_indices = Some(self.make_folds(n_folds, seed)?);
            self.train_idx = None;
            self.valid_idx = None;
            split_kind = SplitKind::KFold { n_folds };
            training_type = TrainingType::CrossValidation;
        } else if self.cv_indices.is_some() || self.featurized_cv.is_some() {
            split_kind = SplitKind::Custom;
            training_type = TrainingType::CrossValidation;
        } else if self.valid.is_some() || self.valid_idx.is_some() || self.featurized_valid.is_some() {
            if split_kind == SplitKind::None {
                split_kind = SplitKind::TrainValidate;
            }
            if self.train_idx.is_none() && self.featurized_train.is_none() {
                if let Some(x) = &self.x {
                    self.train_idx = Some(row_ids(x, (0..x.nrows()).collect())?);
                }
            }
        } else if self.train_idx.is_none() && self.featurized_train.is_none() {
            if let Some(x) = &self.x {
                self.train_idx = Some(row_ids(x, (0..x.nrows()).collect())?);
            }
        }

        let meta = self.compute_meta(split_kind)?;
        let is_timeseries = self.timeseries.is_some() || self.task == Task::Forecasting;

        let (x_valid, y_valid, w_valid) = split_labelled(self.valid);
        let (x_test, y_test, w_test) = split_labelled(self.test);
        let (x_raw, y_raw) = match self.raw {
            Some((x, y)) => (Some(Arc::new(x)), Some(Arc::new(y))),
            None => (None, None),
        };
        let class_labels = meta_class_labels(&meta, &self.featurized_train, &self.y, &y_valid, &y_test);

        let fields = DatasetFields {
            x: self.x.map(Arc::new),
            y: self.y.map(Arc::new),
            sample_weight: self.sample_weight.map(Arc::new),
            x_valid,
            y_valid,
            sample_weight_valid: w_valid,
            x_test,
            y_test,
            sample_weight_test: w_test,
            x_raw,
            y_raw,
            class_labels: class_labels.map(Arc::new),
            train_idx: self.train_idx.map(Arc::new),
            valid_idx: self.valid_idx.map(Arc::new),
            test_idx: self.test_idx.map(Arc::new),
            featurized_train: self.featurized_train.map(Arc::new),
            featurized_valid: self.featurized_valid.map(Arc::new),
            featurized_test: self.featurized_test.map(Arc::new),
            cv_splits: self.cv_indices.map(Arc::new),
            featurized_cv_splits: self.featurized_cv.map(Arc::new),
            transformers: self.transformers.map(Arc::new),
            training_type: Some(Arc::new(training_type)),
            is_timeseries: Some(Arc::new(is_timeseries)),
        };

        Ok(Dataset {
            fields,
            meta,
            preprocessor_step: self.preprocessor_step,
            subsample_strategy: self.subsample_strategy,
            cache_store: self.cache_store,
            subsample_state: Arc::new(Mutex::new(SubsampleState::default())),
        })
    }

    fn validate(&self) -> Result<()> {
        match (&self.x, &self.y) {
            (Some(x), Some(y)) => {
                check_labelled("X", x, y, self.sample_weight.as_ref())?;
            }
            (None, None) => {
                if self.featurized_train.is_none() && self.featurized_cv.is_none() {
                    return Err(RunnerError::DataError(
                        "dataset needs X and y or a featurized training payload".to_string(),
                    ));
                }
            }
            _ => return Err(RunnerError::DataError("X and y must be given together".to_string())),
        }
        if let Some((x, y, w)) = &self.valid {
            check_labelled("X_valid", x, y, w.as_ref())?;
        }
        if let Some((x, y, w)) = &self.test {
            check_labelled("X_test", x, y, w.as_ref())?;
        }
        for (name, payload) in [
            ("featurized train", &self.featurized_train),
            ("featurized valid", &self.featurized_valid),
            ("featurized test", &self.featurized_test),
        ] {
            if let Some(p) = payload {
                check_labelled(name, &p.x, &p.y, p.sample_weight.as_ref())?;
            }
        }
        if let (Some(mask), Some(x)) = (&self.categorical, &self.x) {
            if mask.len() != x.ncols() {
                return Err(RunnerError::ShapeError {
                    expected: format!("categorical mask of {} columns", x.ncols()),
                    actual: format!("{} entries", mask.len()),
                });
            }
        }
        if let Some((_, test_fraction, valid_fraction)) = self.split_fractions {
            for (name, f) in [("test_fraction", test_fraction), ("valid_fraction", valid_fraction)] {
                if !(0.0..1.0).contains(&f) {
                    return Err(RunnerError::invalid_option(name, f, "must lie in [0, 1)"));
                }
            }
            if test_fraction + valid_fraction >= 1.0 {
                return Err(RunnerError::invalid_option(
                    "valid_fraction",
                    valid_fraction,
                    "test and validation fractions leave no training rows",
                ));
            }
        }
        Ok(())
    }

    /// Class labels for stratification of positions `0..n`
    fn strat_labels(&self) -> Option<Vec<f64>> {
        match (self.task, &self.y) {
            (Task::Classification, Some(y)) => Some(y.to_vec()),
            _ => None,
        }
    }

    fn carve_splits(&mut self, seed: u64, test_fraction: f64, valid_fraction: f64) -> Result<()> {
        let x = self
            .x
            .as_ref()
            .ok_or_else(|| RunnerError::DataError("split fractions need X".to_string()))?;
        let n = x.nrows();
        let labels = self.strat_labels();
        let order = sampling::stratified_permutation(labels.as_deref(), n, &mut sampling::rng_for(seed))
            .into_positions();

        let n_test = (n as f64 * test_fraction).round() as usize;
        let n_valid = (n as f64 * valid_fraction).round() as usize;
        if n_test + n_valid >= n {
            return Err(RunnerError::DataError(format!(
                "{} rows cannot hold {} test and {} validation rows",
                n, n_test, n_valid
            )));
        }
        let (test, rest) = order.split_at(n_test);
        let (valid, train) = rest.split_at(n_valid);

        if n_test > 0 {
            self.test_idx = Some(row_ids(x, test.to_vec())?);
        }
        self.valid_idx = if n_valid > 0 { Some(row_ids(x, valid.to_vec())?) } else { None };
        self.train_idx = Some(row_ids(x, train.to_vec())?);
        Ok(())
    }

    /// Folds over the rows not held out for testing, as positions
    fn make_folds(&self, n_folds: usize, seed: u64) -> Result<Vec<CvSplit>> {
        let x = self
            .x
            .as_ref()
            .ok_or_else(|| RunnerError::DataError("k-fold splits need X".to_string()))?;
        let test_positions = match &self.test_idx {
            Some(ids) => x.resolve_positions(ids, crate::data::RowSelection::Label)?,
            None => Vec::new(),
        };
        let ids: Vec<usize> = (0..x.nrows()).filter(|p| !test_positions.contains(p)).collect();
        match (self.task, &self.y) {
            (Task::Classification, Some(y)) => {
                let labels = take_values(y, &ids)?.to_vec();
                sampling::stratified_k_fold(&ids, &labels, n_folds, seed)
            }
            _ => sampling::k_fold(&ids, n_folds, seed),
        }
    }

    fn compute_meta(&self, split_kind: SplitKind) -> Result<DatasetMeta> {
        let (num_samples, num_features, num_missing, is_sparse, column_names) = match &self.x {
            Some(x) => (
                x.nrows(),
                x.ncols(),
                x.num_missing()?,
                x.is_sparse(),
                x.column_names().map(<[String]>::to_vec),
            ),
            None => {
                let first = self
                    .featurized_train
                    .as_ref()
                    .map(|p| &p.x)
                    .or_else(|| self.featurized_cv.as_ref().and_then(|f| f.first()).map(|f| &f.train.x));
                match first {
                    Some(x) => (x.nrows(), x.ncols(), x.num_missing()?, x.is_sparse(), None),
                    None => (0, 0, 0, false, None),
                }
            }
        };

        let mut meta = DatasetMeta {
            task: self.task,
            num_samples,
            num_features,
            num_missing,
            is_sparse,
            num_categorical: self.categorical.as_ref().map_or(0, |m| m.iter().filter(|&&c| c).count()),
            categorical: self.categorical.clone(),
            raw_column_names: self.raw_column_names.clone().or(column_names),
            raw_data_type: self.raw_data_type.clone(),
            raw_data_snapshot: self.raw_data_snapshot.clone(),
            timeseries_param_dict: self.timeseries.clone(),
            split_kind,
            ..DatasetMeta::default()
        };

        let targets = self.all_targets();
        if self.task == Task::Classification {
            meta.num_classes = Some(distinct(&targets).len());
        } else if !targets.is_empty() {
            let primary: Vec<f64> = match (&self.y, &self.featurized_train) {
                (Some(y), _) => y.to_vec(),
                (None, Some(p)) => p.y.to_vec(),
                _ => targets.clone(),
            };
            let n = primary.len() as f64;
            let mean = primary.iter().sum::<f64>() / n;
            let var = primary.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            meta.y_min = primary.iter().copied().reduce(f64::min);
            meta.y_max = primary.iter().copied().reduce(f64::max);
            meta.y_std = Some(var.sqrt());
            meta.bin_info = self.held_out_targets()?.map(|held| make_bin_info(held.len(), &held, BIN_OUTLIER_PERCENTILE));
        }
        Ok(meta)
    }

    /// Every target value the dataset knows about
    fn all_targets(&self) -> Vec<f64> {
        let mut out = Vec::new();
        for y in [
            self.y.as_ref(),
            self.valid.as_ref().map(|v| &v.1),
            self.test.as_ref().map(|t| &t.1),
            self.featurized_train.as_ref().map(|p| &p.y),
            self.featurized_valid.as_ref().map(|p| &p.y),
        ]
        .into_iter()
        .flatten()
        {
            out.extend(y.iter().copied());
        }
        if let Some(folds) = &self.featurized_cv {
            for f in folds {
                out.extend(f.train.y.iter().chain(f.test.y.iter()).copied());
            }
        }
        out
    }

    /// Targets of the held-out split that bin info describes
    ///
    /// A single validation split gives its own targets; CV gives the
    /// concatenated fold-test targets.
    fn held_out_targets(&self) -> Result<Option<Array1<f64>>> {
        if let Some((_, y_valid, _)) = &self.valid {
            return Ok(Some(y_valid.clone()));
        }
        if let (Some(ids), Some(x), Some(y)) = (&self.valid_idx, &self.x, &self.y) {
            let positions = x.resolve_positions(ids, crate::data::RowSelection::Label)?;
            return Ok(Some(take_values(y, &positions)?));
        }
        if let (Some(splits), Some(y)) = (&self.cv_indices, &self.y) {
            let positions: Vec<usize> = splits.iter().flat_map(|s| s.test.iter().copied()).collect();
            return Ok(Some(take_values(y, &positions)?));
        }
        if let Some(p) = &self.featurized_valid {
            return Ok(Some(p.y.clone()));
        }
        if let Some(folds) = &self.featurized_cv {
            return Ok(Some(folds.iter().flat_map(|f| f.test.y.iter().copied()).collect()));
        }
        Ok(None)
    }
}

fn check_labelled(name: &str, x: &TabularView, y: &Array1<f64>, w: Option<&Array1<f64>>) -> Result<()> {
    if x.nrows() != y.len() {
        return Err(RunnerError::DataError(format!(
            "{} has {} rows but its target has {} entries",
            name,
            x.nrows(),
            y.len()
        )));
    }
    if let Some(w) = w {
        if w.len() != y.len() {
            return Err(RunnerError::DataError(format!(
                "{} has {} sample weights for {} rows",
                name,
                w.len(),
                y.len()
            )));
        }
    }
    if y.iter().any(|v| v.is_nan()) {
        return Err(RunnerError::DataError(format!("target of {} has missing entries", name)));
    }
    Ok(())
}

/// Positions of `x` as the ids index arrays use (row labels for frames)
fn row_ids(x: &TabularView, positions: Vec<usize>) -> Result<Vec<usize>> {
    match x {
        TabularView::Frame(f) => f.labels_at(&positions),
        _ => Ok(positions),
    }
}

#[allow(clippy::type_complexity)]
fn split_labelled(
    labelled: Option<Labelled>,
) -> (Option<Arc<TabularView>>, Option<Arc<Array1<f64>>>, Option<Arc<Array1<f64>>>) {
    match labelled {
        Some((x, y, w)) => (Some(Arc::new(x)), Some(Arc::new(y)), w.map(Arc::new)),
        None => (None, None, None),
    }
}

fn distinct(values: &[f64]) -> Vec<f64> {
    let mut out = values.to_vec();
    out.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    out.dedup();
    out
}

/// Union of the class labels over every labelled split
fn meta_class_labels(
    meta: &DatasetMeta,
    featurized_train: &Option<SplitData>,
    y: &Option<Array1<f64>>,
    y_valid: &Option<Arc<Array1<f64>>>,
    y_test: &Option<Arc<Array1<f64>>>,
) -> Option<Vec<f64>> {
    if meta.task != Task::Classification {
        return None;
    }
    let mut all = Vec::new();
    for v in [y.as_ref(), y_valid.as_deref(), y_test.as_deref(), featurized_train.as_ref().map(|p| &p.y)]
        .into_iter()
        .flatten()
    {
        all.extend(v.iter().copied());
    }
    Some(distinct(&all))
}
