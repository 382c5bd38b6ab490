//! In-memory cache store

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::{check_lengths, CacheStore};
use crate::error::Result;

/// Default store: blobs live in the owning dataset's memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryCacheStore {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes held
    pub fn size_bytes(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

impl CacheStore for MemoryCacheStore {
    fn load(&mut self) -> Result<()> {
        Ok(())
    }

    fn add(&mut self, keys: &[String], values: Vec<Vec<u8>>) -> Result<()> {
        check_lengths(keys, &values)?;
        for (key, value) in keys.iter().zip(values) {
            self.entries.insert(key.clone(), value);
        }
        Ok(())
    }

    fn get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        Ok(keys
            .iter()
            .filter_map(|k| self.entries.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    fn unload(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }

    fn cache_items(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}
