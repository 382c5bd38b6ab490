//! Byte-oriented cache stores backing a dataset's heavy fields
//!
//! A store maps string keys to opaque byte blobs. The dataset decides what
//! the bytes mean; stores only keep them resident or on disk.

mod file;
mod memory;

pub use file::FileCacheStore;
pub use memory::MemoryCacheStore;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnerError};

/// Storage capability used by [`crate::dataset::Dataset`]
pub trait CacheStore {
    /// Prepare the store for reads (create directories, rescan contents)
    fn load(&mut self) -> Result<()>;

    /// Insert or replace one blob per key
    fn add(&mut self, keys: &[String], values: Vec<Vec<u8>>) -> Result<()>;

    /// Fetch the blobs for the given keys; absent keys are omitted
    fn get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>>;

    /// Drop every entry and release backing storage
    fn unload(&mut self) -> Result<()>;

    /// Keys currently held by the store
    fn cache_items(&self) -> Vec<String>;
}

fn check_lengths(keys: &[String], values: &[Vec<u8>]) -> Result<()> {
    if keys.len() != values.len() {
        return Err(RunnerError::ShapeError {
            expected: format!("{} values", keys.len()),
            actual: format!("{} values", values.len()),
        });
    }
    Ok(())
}

/// Serializable handle over the available store backends
///
/// Datasets carry the handle so they can be shipped to a child process with
/// their cache intact (memory) or pointing at the same directory (file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheStoreHandle {
    Memory(MemoryCacheStore),
    File(FileCacheStore),
}

impl Default for CacheStoreHandle {
    fn default() -> Self {
        CacheStoreHandle::Memory(MemoryCacheStore::default())
    }
}

impl CacheStoreHandle {
    /// Fresh handle of the same backend kind with no entries
    ///
    /// File stores get a sibling directory so the two handles never share
    /// files.
    pub fn empty_like(&self) -> Self {
        match self {
            CacheStoreHandle::Memory(_) => CacheStoreHandle::Memory(MemoryCacheStore::default()),
            CacheStoreHandle::File(store) => CacheStoreHandle::File(store.sibling()),
        }
    }

    fn inner(&self) -> &dyn CacheStore {
        match self {
            CacheStoreHandle::Memory(s) => s,
            CacheStoreHandle::File(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn CacheStore {
        match self {
            CacheStoreHandle::Memory(s) => s,
            CacheStoreHandle::File(s) => s,
        }
    }
}

impl CacheStore for CacheStoreHandle {
    fn load(&mut self) -> Result<()> {
        self.inner_mut().load()
    }

    fn add(&mut self, keys: &[String], values: Vec<Vec<u8>>) -> Result<()> {
        self.inner_mut().add(keys, values)
    }

    fn get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        self.inner().get(keys)
    }

    fn unload(&mut self) -> Result<()> {
        self.inner_mut().unload()
    }

    fn cache_items(&self) -> Vec<String> {
        self.inner().cache_items()
    }
}
