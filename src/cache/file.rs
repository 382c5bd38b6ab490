//! Directory-backed cache store
//!
//! One file per key. File names are the hex encoding of the key so keys with
//! spaces or separators map to portable names.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{check_lengths, CacheStore};
use crate::error::{Result, RunnerError};

const FILE_SUFFIX: &str = ".blob";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCacheStore {
    dir: PathBuf,
    keys: BTreeSet<String>,
}

impl FileCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            keys: BTreeSet::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Empty store in a uniquely named sibling directory
    pub fn sibling(&self) -> Self {
        let name = format!("cache-{}", uuid::Uuid::new_v4().simple());
        let dir = match self.dir.parent() {
            Some(parent) => parent.join(name),
            None => std::env::temp_dir().join(name),
        };
        Self::new(dir)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", encode_key(key), FILE_SUFFIX))
    }
}

fn encode_key(key: &str) -> String {
    key.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn decode_key(name: &str) -> Option<String> {
    let hex = name.strip_suffix(FILE_SUFFIX)?;
    if hex.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

impl CacheStore for FileCacheStore {
    fn load(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        self.keys.clear();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            match name.to_str().and_then(decode_key) {
                Some(key) => {
                    self.keys.insert(key);
                }
                None => debug!(file = ?name, "ignoring foreign file in cache directory"),
            }
        }
        Ok(())
    }

    fn add(&mut self, keys: &[String], values: Vec<Vec<u8>>) -> Result<()> {
        check_lengths(keys, &values)?;
        fs::create_dir_all(&self.dir)?;
        for (key, value) in keys.iter().zip(values) {
            let path = self.path_for(key);
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, &value)?;
            fs::rename(&tmp, &path)?;
            self.keys.insert(key.clone());
        }
        Ok(())
    }

    fn get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if !self.keys.contains(key) {
                continue;
            }
            let bytes = fs::read(self.path_for(key)).map_err(|e| {
                RunnerError::IoError(format!("reading cache entry '{}': {}", key, e))
            })?;
            out.insert(key.clone(), bytes);
        }
        Ok(out)
    }

    fn unload(&mut self) -> Result<()> {
        for key in std::mem::take(&mut self.keys) {
            let path = self.path_for(&key);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove cache entry");
                }
            }
        }
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    fn cache_items(&self) -> Vec<String> {
        self.keys.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_encoding_roundtrip() {
        let key = "featurized train CV splits";
        let name = format!("{}{}", encode_key(key), FILE_SUFFIX);
        assert_eq!(decode_key(&name).as_deref(), Some(key));
        assert_eq!(decode_key("not-hex.blob"), None);
    }

    #[test]
    fn test_load_rescans_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCacheStore::new(dir.path().join("c"));
        store.add(&["y".to_string()], vec![vec![9]]).unwrap();

        let mut reopened = FileCacheStore::new(dir.path().join("c"));
        reopened.load().unwrap();
        assert_eq!(reopened.cache_items(), vec!["y".to_string()]);
        assert_eq!(reopened.get(&["y".to_string()]).unwrap()["y"], vec![9]);
    }

    #[test]
    fn test_unload_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c");
        let mut store = FileCacheStore::new(&path);
        store.add(&["X".to_string()], vec![vec![1]]).unwrap();
        store.unload().unwrap();
        assert!(!path.exists());
    }
}
