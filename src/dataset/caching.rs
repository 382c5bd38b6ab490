//! Cache lifecycle: write heavy fields out, scoped reload, teardown

use std::ops::{Deref, DerefMut};

use tracing::{debug, warn};

use super::Dataset;
use crate::cache::CacheStore;
use crate::constants::cache_keys;
use crate::error::Result;

impl Dataset {
    /// Write every resident heavy field missing from the cache store
    ///
    /// The set of cached keys is recorded under `dataset_cached_keys` so that
    /// [`Dataset::open_dataset`] knows what to restore and evict. Unless
    /// `keep_in_memory` is set, the cached fields are evicted afterwards.
    pub fn cache_dataset(&mut self, keep_in_memory: bool) -> Result<()> {
        self.cache_store.load()?;
        let already: Vec<String> = self.cache_store.cache_items();

        let mut keys = Vec::new();
        let mut values = Vec::new();
        for key in cache_keys::DATA_FIELDS {
            if already.iter().any(|k| k == key) {
                continue;
            }
            if let Some(bytes) = self.fields.encode(key)? {
                keys.push(key.to_string());
                values.push(bytes);
            }
        }
        if !keys.is_empty() {
            self.cache_store.add(&keys, values)?;
        }

        let resident_in_store = self.cache_store.cache_items();
        let cached: Vec<String> = cache_keys::DATA_FIELDS
            .iter()
            .filter(|k| resident_in_store.iter().any(|r| r == *k))
            .map(|k| k.to_string())
            .collect();
        self.cache_store.add(
            &[cache_keys::DATASET_CACHED_KEYS.to_string()],
            vec![bincode::serialize(&cached)?],
        )?;
        debug!(fields = cached.len(), keep_in_memory, "dataset cached");

        if !keep_in_memory {
            self.evict(&cached);
        }
        Ok(())
    }

    /// Keys recorded by the last [`Dataset::cache_dataset`], if any
    pub fn cached_keys(&self) -> Result<Option<Vec<String>>> {
        self.cached::<Vec<String>>(cache_keys::DATASET_CACHED_KEYS)
    }

    pub(crate) fn evict(&mut self, keys: &[String]) {
        for key in keys {
            self.fields.evict(key);
        }
    }

    fn restore(&mut self, keys: &[String]) -> Result<()> {
        let found = self.cache_store.get(keys)?;
        for key in keys {
            if let Some(bytes) = found.get(key) {
                self.fields.restore(key, bytes)?;
            }
        }
        Ok(())
    }

    /// Scoped access with every cached field loaded
    ///
    /// On a dataset that was never cached both entry and exit are no-ops.
    /// Otherwise the guard evicts exactly the cached fields when dropped;
    /// data that was only ever held in memory is never evicted.
    pub fn open_dataset(&mut self) -> Result<OpenDataset<'_>> {
        let keys = self.cached_keys()?.unwrap_or_default();
        if !keys.is_empty() {
            self.restore(&keys)?;
        }
        Ok(OpenDataset { dataset: self, keys })
    }

    /// Evict cached fields and drop the cache store's contents
    ///
    /// Best effort: failures are logged and reported as `false`. Subsamples
    /// already handed out keep their shared fields alive; the parent's
    /// subsample cache is emptied.
    pub fn clear_cache(&mut self) -> bool {
        let keys = match self.cached_keys() {
            Ok(keys) => keys.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "could not read cached keys while clearing dataset cache");
                Vec::new()
            }
        };
        self.evict(&keys);
        {
            let mut state = self.subsample_state.lock();
            state.cache.clear();
            state.preshuffled.clear();
        }
        match self.cache_store.unload() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to unload dataset cache store");
                false
            }
        }
    }
}

/// Guard returned by [`Dataset::open_dataset`]
pub struct OpenDataset<'a> {
    dataset: &'a mut Dataset,
    keys: Vec<String>,
}

impl OpenDataset<'_> {
    /// Fields that will be evicted when the guard drops
    pub fn cached_keys(&self) -> &[String] {
        &self.keys
    }
}

impl Deref for OpenDataset<'_> {
    type Target = Dataset;

    fn deref(&self) -> &Dataset {
        self.dataset
    }
}

impl DerefMut for OpenDataset<'_> {
    fn deref_mut(&mut self) -> &mut Dataset {
        self.dataset
    }
}

impl Drop for OpenDataset<'_> {
    fn drop(&mut self) {
        if !self.keys.is_empty() {
            let keys = std::mem::take(&mut self.keys);
            self.dataset.evict(&keys);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStoreHandle, FileCacheStore};
    use crate::dataset::SubsampleCacheStrategy;
    use crate::problem_info::Task;
    use ndarray::{array, Array1, Array2};
    use std::sync::Arc;

    fn dataset() -> Dataset {
        Dataset::builder(
            array![[0.0, 1.0], [1.0, 0.0], [2.0, 2.0], [3.0, 1.0]],
            array![1.0, 2.0, 3.0, 4.0],
            Task::Regression,
        )
        .with_train_valid_indices(vec![0, 1, 2], vec![3])
        .build()
        .unwrap()
    }

    #[test]
    fn test_open_on_uncached_dataset_is_noop() {
        let mut ds = dataset();
        let before = ds.resident_fields();
        {
            let open = ds.open_dataset().unwrap();
            assert!(open.cached_keys().is_empty());
            assert_eq!(open.resident_fields(), before);
        }
        assert_eq!(ds.resident_fields(), before);
    }

    #[test]
    fn test_cache_then_open_restores_and_reevicts() {
        let mut ds = dataset();
        let before = ds.resident_fields();
        ds.cache_dataset(false).unwrap();
        assert!(ds.resident_fields().is_empty());
        // accessors still work through the cache
        assert_eq!(ds.get_valid_set().unwrap().y, array![4.0]);

        {
            let open = ds.open_dataset().unwrap();
            assert_eq!(open.resident_fields(), before);
        }
        assert!(ds.resident_fields().is_empty());
    }

    #[test]
    fn test_keep_in_memory() {
        let mut ds = dataset();
        ds.cache_dataset(true).unwrap();
        assert!(ds.is_resident(cache_keys::X));
        assert!(ds.cached_keys().unwrap().unwrap().contains(&cache_keys::X.to_string()));
    }

    #[test]
    fn test_clear_cache_with_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = Dataset::builder(array![[1.0], [2.0]], array![1.0, 2.0], Task::Regression)
            .with_cache_store(CacheStoreHandle::File(FileCacheStore::new(dir.path().join("ds"))))
            .build()
            .unwrap();
        ds.cache_dataset(false).unwrap();
        assert!(dir.path().join("ds").exists());
        assert!(ds.clear_cache());
        assert!(!dir.path().join("ds").exists());
        assert!(ds.cached_keys().unwrap().is_none());
    }

    #[test]
    fn test_clear_cache_keeps_handed_out_subsamples() {
        let mut ds = Dataset::builder(
            Array2::from_shape_fn((20, 1), |(i, _)| i as f64),
            Array1::from_shape_fn(20, |i| i as f64),
            Task::Regression,
        )
        .with_subsample_strategy(SubsampleCacheStrategy::Classic)
        .build()
        .unwrap();
        let before = ds.subsample(50.0, 3).unwrap();
        assert!(Arc::ptr_eq(&before, &ds.subsample(50.0, 3).unwrap()));
        assert!(ds.clear_cache());

        assert_eq!(before.get_train_set().unwrap().len(), 10);
        let after = ds.subsample(50.0, 3).unwrap();
        assert!(!Arc::ptr_eq(&before, &after), "subsample cache survived clear_cache");
    }
}
