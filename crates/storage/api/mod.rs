//! The backend seam: everything the kernel store needs from a database.
//!
//! Backends are deliberately dumb. They provide point reads, ordered prefix
//! scans, and atomic multi-key batches; transactions and savepoints are
//! layered above in [`crate::store`], so any engine with an atomic batch
//! write can host a kernel.

pub mod tables;

use crate::error::StoreError;
use std::fmt::Debug;

/// One operation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: String, value: String },
    Delete { key: String },
}

pub trait StorageBackend: Send + Sync + Debug {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Apply every operation or none of them.
    fn write_batch(&self, batch: Vec<BatchOp>) -> Result<(), StoreError>;

    /// All `(key, value)` pairs whose key starts with `prefix`, in ascending
    /// key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
}
