//! RocksDB backend, enabled with the `rocksdb` feature.

use crate::api::{BatchOp, StorageBackend};
use crate::error::StoreError;
use rocksdb::{DB, IteratorMode, Options, WriteBatch};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub struct RocksDbBackend {
    db: Arc<DB>,
}

impl RocksDbBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<RocksDbBackend, StoreError> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, path).map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(RocksDbBackend { db: Arc::new(db) })
    }
}

impl fmt::Debug for RocksDbBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocksDbBackend").finish_non_exhaustive()
    }
}

impl StorageBackend for RocksDbBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let found = self
            .db
            .get(key.as_bytes())
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        match found {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes)
                    .map_err(|_| StoreError::Corrupt(format!("non-utf8 value at `{key}`")))?,
            )),
            None => Ok(None),
        }
    }

    fn write_batch(&self, batch: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut write = WriteBatch::default();
        for op in batch {
            match op {
                BatchOp::Put { key, value } => write.put(key.as_bytes(), value.as_bytes()),
                BatchOp::Delete { key } => write.delete(key.as_bytes()),
            }
        }
        self.db
            .write(write)
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mode = IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward);
        let mut out = Vec::new();
        for entry in self.db.iterator(mode) {
            let (key, value) = entry.map_err(|err| StoreError::Backend(err.to_string()))?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::Corrupt("non-utf8 key".to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            let value = String::from_utf8(value.to_vec())
                .map_err(|_| StoreError::Corrupt(format!("non-utf8 value at `{key}`")))?;
            out.push((key, value));
        }
        Ok(out)
    }
}
