#![allow(dead_code)]

use kestrel_common::{CapData, KRef, SubclusterConfig, VatId};
use kestrel_kernel::{Kernel, builtin};
use kestrel_storage::InMemoryBackend;
use serde_json::json;
use std::sync::Arc;

/// Kernel over a shared backend handle, with the built-in bundles
/// registered. Reusing the same handle models reopening the database.
pub fn new_kernel(backend: &InMemoryBackend) -> Kernel {
    let mut kernel = Kernel::new(Arc::new(backend.clone()));
    builtin::register_builtin_bundles(&mut kernel);
    kernel
}

pub fn counter_config() -> SubclusterConfig {
    serde_json::from_value(json!({
        "bootstrap": "main",
        "vats": [{ "name": "main", "bundle": "counter" }]
    }))
    .expect("valid config")
}

pub fn empty_args() -> CapData {
    CapData::from_value(&json!([])).expect("marshal")
}

/// Root object of the only vat in a single-vat subcluster.
pub fn sole_vat_root(kernel: &Kernel, vat: VatId) -> KRef {
    kernel.store().vat_record(vat).expect("vat record").root
}
