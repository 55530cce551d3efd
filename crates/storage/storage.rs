//! Durable kernel state.
//!
//! [`KernelStore`] is a typed overlay on a pluggable key-value backend. All
//! kernel state — reference tables, c-lists, the promise table, queues, ref
//! counts, subcluster records, pending GC actions — lives here, so a kernel
//! restarted over the same backend resumes exactly where it quiesced.

pub mod api;
pub mod backend;
pub mod error;
pub mod store;

pub use api::{BatchOp, StorageBackend};
pub use backend::in_memory::InMemoryBackend;
#[cfg(feature = "rocksdb")]
pub use backend::rocksdb::RocksDbBackend;
pub use error::StoreError;
pub use store::{GcAction, KernelStore, PromiseSnapshot, PromiseStateTag, RefCounts};

/// Version prefix applied to every key, so a future layout change can
/// coexist with old data during migration.
pub const KEY_VERSION_PREFIX: &str = "kv.v1.";

pub(crate) fn apply_prefix(key: &str) -> String {
    format!("{KEY_VERSION_PREFIX}{key}")
}
