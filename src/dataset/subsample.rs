//! Subsampling of the training split

use std::sync::Arc;

use tracing::debug;

use super::sampling::{self, Sample};
use super::{CvSplit, Dataset, Fold, SubsampleCacheStrategy, SubsampleState};
use crate::cache::CacheStore;
use crate::constants::cache_keys;
use crate::data::{take_values, RowSelection};
use crate::error::{Result, RunnerError};
use crate::problem_info::Task;

impl Dataset {
    /// Dataset whose training split keeps `percent` of the rows
    ///
    /// `percent` must lie strictly between 0 and 100. Classification draws
    /// are stratified on `y` when feasible and random otherwise. The result
    /// shares every unchanged field with `self`.
    pub fn subsample(&self, percent: f64, seed: u64) -> Result<Arc<Dataset>> {
        if !(percent > 0.0 && percent < 100.0) {
            return Err(RunnerError::invalid_option(
                "subsample_percent",
                percent,
                "must be strictly between 0 and 100",
            ));
        }

        let strategy = match self.subsample_strategy {
            SubsampleCacheStrategy::Preshuffle if !self.is_index_backed()? => {
                debug!("preshuffle needs index-backed splits, using classic subsampling");
                SubsampleCacheStrategy::Classic
            }
            s => s,
        };

        match strategy {
            SubsampleCacheStrategy::Classic => {
                let key = percent.to_bits();
                if let Some(hit) = self.subsample_state.lock().cache.get(&key) {
                    return Ok(Arc::clone(hit));
                }
                let sub = Arc::new(self.classic_subsample(percent, seed)?);
                self.subsample_state.lock().cache.insert(key, Arc::clone(&sub));
                Ok(sub)
            }
            SubsampleCacheStrategy::ClassicNoCache => Ok(Arc::new(self.classic_subsample(percent, seed)?)),
            SubsampleCacheStrategy::Preshuffle => Ok(Arc::new(self.preshuffle_subsample(percent, seed)?)),
        }
    }

    fn is_index_backed(&self) -> Result<bool> {
        Ok(self.train_indices()?.is_some() && !self.x_valid_is_explicit()?)
    }

    /// Stratification labels for the rows named by `ids`
    fn labels_for(&self, ids: &[usize], mode: RowSelection) -> Result<Option<Vec<f64>>> {
        if self.meta.task != Task::Classification {
            return Ok(None);
        }
        let (x, y) = match (
            self.resolve(&self.fields.x, cache_keys::X)?,
            self.resolve(&self.fields.y, cache_keys::Y)?,
        ) {
            (Some(x), Some(y)) => (x, y),
            _ => return Ok(None),
        };
        let positions = x.resolve_positions(ids, mode)?;
        Ok(Some(take_values(&y, &positions)?.to_vec()))
    }

    /// Copy sharing all fields, with its own empty cache and subsample state
    ///
    /// Fields the parent only holds in its cache store are loaded into the
    /// copy, since the copy never sees that store.
    fn derived(&self) -> Result<Dataset> {
        let mut fields = self.fields.clone();
        let evicted: Vec<String> = self
            .cached_keys()?
            .unwrap_or_default()
            .into_iter()
            .filter(|k| !fields.is_resident(k))
            .collect();
        if !evicted.is_empty() {
            let found = self.cache_store.get(&evicted)?;
            for key in &evicted {
                if let Some(bytes) = found.get(key) {
                    fields.restore(key, bytes)?;
                }
            }
            debug!(fields = evicted.len(), "subsample loaded cached fields");
        }
        Ok(Dataset {
            fields,
            meta: self.meta.clone(),
            preprocessor_step: self.preprocessor_step.clone(),
            subsample_strategy: self.subsample_strategy,
            cache_store: self.cache_store.empty_like(),
            subsample_state: Arc::new(parking_lot::Mutex::new(SubsampleState::default())),
        })
    }

    fn classic_subsample(&self, percent: f64, seed: u64) -> Result<Dataset> {
        let mut rng = sampling::rng_for(seed);
        let mut sub = self.derived()?;

        if let Some(train_idx) = self.train_indices()? {
            let n = train_idx.len();
            let n_take = take_count(n, percent)?;
            let labels = self.labels_for(&train_idx, RowSelection::Label)?;
            let sample = sampling::draw(labels.as_deref(), n, n_take, &mut rng);
            log_branch(&sample, "train indices");
            let picked: Vec<usize> = sample.into_positions().into_iter().map(|p| train_idx[p]).collect();
            sub.fields.train_idx = Some(Arc::new(picked));
            return Ok(sub);
        }

        if let Some(payload) = self.resolve(&self.fields.featurized_train, cache_keys::FEATURIZED_TRAIN)? {
            let n = payload.len();
            let n_take = take_count(n, percent)?;
            let labels = (self.meta.task == Task::Classification).then(|| payload.y.to_vec());
            let sample = sampling::draw(labels.as_deref(), n, n_take, &mut rng);
            log_branch(&sample, "featurized train");
            sub.fields.featurized_train = Some(Arc::new(payload.take_rows(&sample.into_positions())?));
            return Ok(sub);
        }

        if let Some(splits) = self.cv_split_indices()? {
            let truncated: Vec<CvSplit> = splits
                .iter()
                .map(|s| CvSplit {
                    train: s.train[..floor_share(s.train.len(), percent)].to_vec(),
                    test: s.test.clone(),
                })
                .collect();
            sub.fields.cv_splits = Some(Arc::new(truncated));
            return Ok(sub);
        }

        if let Some(folds) =
            self.resolve(&self.fields.featurized_cv_splits, cache_keys::FEATURIZED_TRAIN_CV_SPLITS)?
        {
            let sliced = folds
                .iter()
                .map(|f| {
                    Ok(Fold {
                        train: f.train.head(floor_share(f.train.len(), percent))?,
                        test: f.test.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            sub.fields.featurized_cv_splits = Some(Arc::new(sliced));
            return Ok(sub);
        }

        // Explicit train/valid arrays: subsample X itself through a train index.
        if let Some(x) = self.resolve(&self.fields.x, cache_keys::X)? {
            let n = x.nrows();
            let n_take = take_count(n, percent)?;
            let all: Vec<usize> = (0..n).collect();
            let labels = self.labels_for(&all, RowSelection::Position)?;
            let sample = sampling::draw(labels.as_deref(), n, n_take, &mut rng);
            log_branch(&sample, "X");
            let positions = sample.into_positions();
            let ids = match x.as_ref() {
                crate::data::TabularView::Frame(f) => f.labels_at(&positions)?,
                _ => positions,
            };
            sub.fields.train_idx = Some(Arc::new(ids));
            return Ok(sub);
        }

        Err(RunnerError::DataError("dataset has nothing to subsample".to_string()))
    }

    fn preshuffle_subsample(&self, percent: f64, seed: u64) -> Result<Dataset> {
        let train_idx = self
            .train_indices()?
            .ok_or_else(|| RunnerError::DataError("preshuffle requires train indices".to_string()))?;

        let order = {
            let mut state = self.subsample_state.lock();
            match state.preshuffled.get(&seed) {
                Some(order) => Arc::clone(order),
                None => {
                    let labels = self.labels_for(&train_idx, RowSelection::Label)?;
                    let perm = sampling::stratified_permutation(
                        labels.as_deref(),
                        train_idx.len(),
                        &mut sampling::rng_for(seed),
                    );
                    log_branch(&perm, "preshuffle");
                    let order: Arc<Vec<usize>> =
                        Arc::new(perm.into_positions().into_iter().map(|p| train_idx[p]).collect());
                    state.preshuffled.insert(seed, Arc::clone(&order));
                    order
                }
            }
        };

        let n_take = (order.len() as f64 * percent / 100.0).ceil() as usize;
        let mut sub = self.derived()?;
        sub.fields.train_idx = Some(Arc::new(order[..n_take.min(order.len())].to_vec()));
        Ok(sub)
    }
}

/// `floor(n * percent / 100)`, exact whenever the true value is whole
fn floor_share(n: usize, percent: f64) -> usize {
    (n as f64 * percent / 100.0).floor() as usize
}

fn take_count(n: usize, percent: f64) -> Result<usize> {
    let n_take = floor_share(n, percent);
    if n_take == 0 {
        return Err(RunnerError::DataError(format!(
            "subsampling {} rows at {:.2}% leaves no training data",
            n, percent
        )));
    }
    Ok(n_take)
}

fn log_branch(sample: &Sample, what: &str) {
    if sample.is_stratified() {
        debug!(what, "stratified subsample");
    } else {
        debug!(what, "random subsample");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};

    fn indexed(n: usize, strategy: SubsampleCacheStrategy) -> Dataset {
        let x = Array2::from_shape_fn((n, 2), |(i, j)| (i * 2 + j) as f64);
        let y: Array1<f64> = (0..n).map(|i| (i % 3) as f64).collect();
        Dataset::builder(x, y, Task::Classification)
            .with_train_valid_indices((0..n).collect(), vec![])
            .with_subsample_strategy(strategy)
            .build()
            .unwrap()
    }

    #[test]
    fn test_percent_bounds() {
        let ds = indexed(30, SubsampleCacheStrategy::Classic);
        assert!(ds.subsample(0.0, 1).is_err());
        assert!(ds.subsample(100.0, 1).is_err());
        assert!(ds.subsample(f64::NAN, 1).is_err());
    }

    #[test]
    fn test_classic_returns_cached_object() {
        let ds = indexed(90, SubsampleCacheStrategy::Classic);
        let a = ds.subsample(50.0, 1).unwrap();
        let b = ds.subsample(50.0, 99).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.train_indices().unwrap().unwrap().len(), 45);
    }

    #[test]
    fn test_classic_floor_cardinality() {
        let ds = indexed(99, SubsampleCacheStrategy::ClassicNoCache);
        let sub = ds.subsample(33.0, 4).unwrap();
        assert_eq!(sub.train_indices().unwrap().unwrap().len(), 32);
    }

    #[test]
    fn test_classic_cardinality_on_awkward_percents() {
        let ds = indexed(100, SubsampleCacheStrategy::ClassicNoCache);
        for k in [29.0, 57.0, 58.0] {
            let sub = ds.subsample(k, 3).unwrap();
            assert_eq!(sub.train_indices().unwrap().unwrap().len(), k as usize, "k = {}", k);
        }
    }

    #[test]
    fn test_preshuffle_order_depends_on_seed() {
        let ds = indexed(60, SubsampleCacheStrategy::Preshuffle);
        let a = ds.subsample(50.0, 1).unwrap().train_indices().unwrap().unwrap();
        let b = ds.subsample(50.0, 2).unwrap().train_indices().unwrap().unwrap();
        let a_again = ds.subsample(50.0, 1).unwrap().train_indices().unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a_again);
        assert_eq!(ds.subsample_state.lock().preshuffled.len(), 2);
    }

    #[test]
    fn test_subsample_of_evicted_dataset_reads_data() {
        let mut ds = indexed(40, SubsampleCacheStrategy::ClassicNoCache);
        ds.cache_dataset(false).unwrap();
        assert!(!ds.is_resident(cache_keys::X));
        let sub = ds.subsample(50.0, 1).unwrap();
        assert!(sub.is_resident(cache_keys::X));
        assert_eq!(sub.get_train_set().unwrap().len(), 20);
        assert!(!ds.is_resident(cache_keys::X), "parent was reopened");
    }

    #[test]
    fn test_cv_truncation() {
        let x = Array2::from_shape_fn((10, 1), |(i, _)| i as f64);
        let y: Array1<f64> = (0..10).map(|i| i as f64).collect();
        let ds = Dataset::builder(x, y, Task::Regression)
            .with_cv_indices(vec![CvSplit { train: (0..8).collect(), test: vec![8, 9] }])
            .build()
            .unwrap();
        let sub = ds.subsample(50.0, 0).unwrap();
        let splits = sub.cv_split_indices().unwrap().unwrap();
        assert_eq!(splits[0].train, vec![0, 1, 2, 3]);
        assert_eq!(splits[0].test, vec![8, 9]);
    }

    #[test]
    fn test_subsample_shares_unchanged_fields() {
        let ds = indexed(30, SubsampleCacheStrategy::ClassicNoCache);
        let sub = ds.subsample(50.0, 2).unwrap();
        let (px, sx) = (ds.fields.x.as_ref().unwrap(), sub.fields.x.as_ref().unwrap());
        assert!(Arc::ptr_eq(px, sx));
    }
}
