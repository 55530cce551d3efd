//! In-memory backend.
//!
//! Clones share the underlying map, so a test can drop a kernel and build a
//! new one over the same handle to model stopping and re-opening a database
//! file.

use crate::api::{BatchOp, StorageBackend};
use crate::error::StoreError;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

#[derive(Clone, Default)]
pub struct InMemoryBackend {
    map: Arc<RwLock<BTreeMap<String, String>>>,
}

impl InMemoryBackend {
    pub fn new() -> InMemoryBackend {
        InMemoryBackend::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("entries", &self.len())
            .finish()
    }
}

impl StorageBackend for InMemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let map = self
            .map
            .read()
            .map_err(|_| StoreError::Backend("in-memory map poisoned".to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn write_batch(&self, batch: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut map = self
            .map
            .write()
            .map_err(|_| StoreError::Backend("in-memory map poisoned".to_string()))?;
        for op in batch {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let map = self
            .map
            .read()
            .map_err(|_| StoreError::Backend("in-memory map poisoned".to_string()))?;
        let range = map.range::<String, _>((Bound::Included(prefix.to_string()), Bound::Unbounded));
        let mut out = Vec::new();
        for (key, value) in range {
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.clone(), value.clone()));
        }
        Ok(out)
    }
}
