//! Typed overlay on the KV backend.
//!
//! # Transactions
//!
//! Every crank runs inside exactly one outermost transaction plus nested
//! named savepoints. The store keeps an overlay stack above the backend:
//! [`KernelStore::begin_crank`] opens the base layer, [`KernelStore::savepoint`]
//! pushes a named layer, and [`KernelStore::commit_crank`] folds the stack
//! into a single atomic backend batch. Mutations outside a transaction are
//! written through immediately (host-side setup such as enqueueing a message
//! before the kernel starts turning cranks).
//!
//! # Reference counts
//!
//! Objects carry `(reachable, recognizable)` counts covering non-owner
//! c-list entries; `reachable <= recognizable` always. Decrements that hit
//! zero record the corresponding GC action and put the kref on the
//! `maybeFree` candidate list, which [`KernelStore::collect_candidates`]
//! retires once nothing pins the entry any more.

use crate::api::tables::*;
use crate::api::{BatchOp, StorageBackend};
use crate::apply_prefix;
use crate::error::StoreError;
use kestrel_common::{
    CapData, EndpointId, GcActionKind, KRef, RunQueueItem, SubclusterId, SubclusterRecord, VRef,
    VatId, VatRecord,
};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;
use tracing::trace;

/// The two distributed ref counts maintained per object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefCounts {
    pub reachable: u64,
    pub recognizable: u64,
}

impl RefCounts {
    fn encode(&self) -> String {
        format!("{},{}", self.reachable, self.recognizable)
    }

    fn decode(text: &str) -> Result<RefCounts, StoreError> {
        let (reach, recog) = text
            .split_once(',')
            .ok_or_else(|| StoreError::Corrupt(format!("bad refCount `{text}`")))?;
        Ok(RefCounts {
            reachable: reach
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("bad refCount `{text}`")))?,
            recognizable: recog
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("bad refCount `{text}`")))?,
        })
    }
}

/// Where a promise is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseStateTag {
    Unresolved,
    Fulfilled,
    Rejected,
    Forwarded,
}

impl PromiseStateTag {
    fn encode(&self) -> &'static str {
        match self {
            PromiseStateTag::Unresolved => "unresolved",
            PromiseStateTag::Fulfilled => "fulfilled",
            PromiseStateTag::Rejected => "rejected",
            PromiseStateTag::Forwarded => "forwarded",
        }
    }

    fn decode(text: &str) -> Result<PromiseStateTag, StoreError> {
        match text {
            "unresolved" => Ok(PromiseStateTag::Unresolved),
            "fulfilled" => Ok(PromiseStateTag::Fulfilled),
            "rejected" => Ok(PromiseStateTag::Rejected),
            "forwarded" => Ok(PromiseStateTag::Forwarded),
            other => Err(StoreError::Corrupt(format!("bad promise state `{other}`"))),
        }
    }
}

/// Everything a notify delivery needs to describe a promise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromiseSnapshot {
    pub state: PromiseStateTag,
    pub value: Option<CapData>,
    pub forward: Option<KRef>,
}

/// One pending GC delivery, persisted in the sorted `gcActions` set as
/// `"<vat> <kind> <kref>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GcAction {
    pub kind: GcActionKind,
    pub vat: VatId,
    pub kref: KRef,
}

impl GcAction {
    fn encode(&self) -> String {
        format!("{} {} {}", self.vat, self.kind, self.kref)
    }

    fn decode(text: &str) -> Result<GcAction, StoreError> {
        let mut parts = text.split(' ');
        let (Some(vat), Some(kind), Some(kref), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(StoreError::Corrupt(format!("bad gc action `{text}`")));
        };
        let kind = match kind {
            "dropExports" => GcActionKind::DropExports,
            "retireExports" => GcActionKind::RetireExports,
            "dropImports" => GcActionKind::DropImports,
            "retireImports" => GcActionKind::RetireImports,
            "abandonExports" => GcActionKind::AbandonExports,
            other => return Err(StoreError::Corrupt(format!("bad gc action kind `{other}`"))),
        };
        Ok(GcAction {
            kind,
            vat: vat.parse()?,
            kref: kref.parse()?,
        })
    }
}

/// One overlay layer. `None` values are deletion tombstones.
#[derive(Debug, Default)]
struct Layer {
    name: Option<String>,
    writes: BTreeMap<String, Option<String>>,
}

/// Typed store over a pluggable backend. Not `Clone`: exactly one kernel
/// owns a store, matching the one-kernel-per-database rule.
#[derive(Debug)]
pub struct KernelStore {
    backend: Arc<dyn StorageBackend>,
    layers: Vec<Layer>,
}

fn valid_savepoint_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl KernelStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> KernelStore {
        KernelStore {
            backend,
            layers: Vec::new(),
        }
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.backend.clone()
    }

    // ---- raw access with overlay + version prefix ----

    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let full = apply_prefix(key);
        for layer in self.layers.iter().rev() {
            if let Some(entry) = layer.writes.get(&full) {
                return Ok(entry.clone());
            }
        }
        self.backend.get(&full)
    }

    fn write(&mut self, key: &str, value: String) -> Result<(), StoreError> {
        let full = apply_prefix(key);
        match self.layers.last_mut() {
            Some(layer) => {
                layer.writes.insert(full, Some(value));
                Ok(())
            }
            None => self.backend.write_batch(vec![BatchOp::Put { key: full, value }]),
        }
    }

    fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        let full = apply_prefix(key);
        match self.layers.last_mut() {
            Some(layer) => {
                layer.writes.insert(full, None);
                Ok(())
            }
            None => self.backend.write_batch(vec![BatchOp::Delete { key: full }]),
        }
    }

    /// Prefix scan merged across the overlay stack. Returned keys have the
    /// version prefix stripped.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let full_prefix = apply_prefix(prefix);
        let mut merged: BTreeMap<String, Option<String>> = self
            .backend
            .scan_prefix(&full_prefix)?
            .into_iter()
            .map(|(key, value)| (key, Some(value)))
            .collect();
        for layer in &self.layers {
            for (key, value) in &layer.writes {
                if key.starts_with(&full_prefix) {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(merged
            .into_iter()
            .filter_map(|(key, value)| {
                let value = value?;
                let stripped = key.strip_prefix(crate::KEY_VERSION_PREFIX)?.to_string();
                Some((stripped, value))
            })
            .collect())
    }

    // ---- transactions & savepoints ----

    pub fn in_transaction(&self) -> bool {
        !self.layers.is_empty()
    }

    pub fn begin_crank(&mut self) -> Result<(), StoreError> {
        if self.in_transaction() {
            return Err(StoreError::NestedTransaction);
        }
        self.layers.push(Layer::default());
        Ok(())
    }

    /// Mark a named rollback point. Identifiers are restricted to
    /// alphanumerics and underscore so they can pass verbatim into any
    /// underlying driver.
    pub fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        if !self.in_transaction() {
            return Err(StoreError::NoTransaction);
        }
        if !valid_savepoint_name(name) {
            return Err(StoreError::InvalidSavepoint(name.to_string()));
        }
        self.layers.push(Layer {
            name: Some(name.to_string()),
            writes: BTreeMap::new(),
        });
        Ok(())
    }

    /// Discard every write made since the named savepoint was opened. The
    /// savepoint itself stays usable.
    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let index = self
            .layer_index(name)
            .ok_or_else(|| StoreError::UnknownSavepoint(name.to_string()))?;
        self.layers.truncate(index + 1);
        if let Some(layer) = self.layers.last_mut() {
            layer.writes.clear();
        }
        Ok(())
    }

    /// Fold the named savepoint's writes into the layer below.
    pub fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let index = self
            .layer_index(name)
            .ok_or_else(|| StoreError::UnknownSavepoint(name.to_string()))?;
        while self.layers.len() > index {
            let layer = match self.layers.pop() {
                Some(layer) => layer,
                None => break,
            };
            if let Some(below) = self.layers.last_mut() {
                below.writes.extend(layer.writes);
            } else {
                // released the base layer: flush directly
                self.flush_layer(layer)?;
            }
        }
        Ok(())
    }

    fn layer_index(&self, name: &str) -> Option<usize> {
        self.layers
            .iter()
            .rposition(|layer| layer.name.as_deref() == Some(name))
    }

    pub fn commit_crank(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction() {
            return Err(StoreError::NoTransaction);
        }
        let mut merged = Layer::default();
        for layer in self.layers.drain(..) {
            merged.writes.extend(layer.writes);
        }
        self.flush_layer(merged)
    }

    pub fn abort_crank(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction() {
            return Err(StoreError::NoTransaction);
        }
        self.layers.clear();
        Ok(())
    }

    fn flush_layer(&mut self, layer: Layer) -> Result<(), StoreError> {
        let batch: Vec<BatchOp> = layer
            .writes
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => BatchOp::Put { key, value },
                None => BatchOp::Delete { key },
            })
            .collect();
        if batch.is_empty() {
            return Ok(());
        }
        self.backend.write_batch(batch)
    }

    // ---- counters ----

    fn bump_counter(&mut self, key: &str) -> Result<u64, StoreError> {
        let next = match self.read(key)? {
            Some(text) => text
                .parse::<u64>()
                .map_err(|_| StoreError::Corrupt(format!("bad counter `{key}`")))?,
            None => 1,
        };
        self.write(key, (next + 1).to_string())?;
        Ok(next)
    }

    pub fn crank_number(&self) -> Result<u64, StoreError> {
        Ok(self
            .read(CRANK_NUMBER_KEY)?
            .and_then(|text| text.parse().ok())
            .unwrap_or(0))
    }

    pub fn increment_crank_number(&mut self) -> Result<u64, StoreError> {
        let next = self.crank_number()? + 1;
        self.write(CRANK_NUMBER_KEY, next.to_string())?;
        Ok(next)
    }

    // ---- object table ----

    pub fn allocate_object(&mut self, owner: &EndpointId) -> Result<KRef, StoreError> {
        let index = self.bump_counter(NEXT_OBJECT_ID_KEY)?;
        let kref = KRef::Object(index);
        self.write(&format!("{kref}{OBJECT_OWNER_SUFFIX}"), owner.to_string())?;
        self.write(
            &format!("{kref}{OBJECT_REFCOUNT_SUFFIX}"),
            RefCounts::default().encode(),
        )?;
        trace!(%kref, %owner, "allocated kernel object");
        Ok(kref)
    }

    pub fn object_exists(&self, kref: KRef) -> Result<bool, StoreError> {
        Ok(self
            .read(&format!("{kref}{OBJECT_REFCOUNT_SUFFIX}"))?
            .is_some())
    }

    /// `Ok(None)` means the object exists but was abandoned by a terminated
    /// owner.
    pub fn object_owner(&self, kref: KRef) -> Result<Option<EndpointId>, StoreError> {
        if !self.object_exists(kref)? {
            return Err(StoreError::UnknownObject(kref));
        }
        match self.read(&format!("{kref}{OBJECT_OWNER_SUFFIX}"))? {
            Some(text) => Ok(Some(EndpointId::from_str(&text)?)),
            None => Ok(None),
        }
    }

    pub fn clear_object_owner(&mut self, kref: KRef) -> Result<(), StoreError> {
        self.delete(&format!("{kref}{OBJECT_OWNER_SUFFIX}"))
    }

    pub fn is_revoked(&self, kref: KRef) -> Result<bool, StoreError> {
        Ok(self
            .read(&format!("{kref}{OBJECT_REVOKED_SUFFIX}"))?
            .as_deref()
            == Some("true"))
    }

    pub fn set_revoked(&mut self, kref: KRef, revoked: bool) -> Result<(), StoreError> {
        if !self.object_exists(kref)? {
            return Err(StoreError::UnknownObject(kref));
        }
        let key = format!("{kref}{OBJECT_REVOKED_SUFFIX}");
        if revoked {
            self.write(&key, "true".to_string())
        } else {
            self.delete(&key)
        }
    }

    pub fn ref_counts(&self, kref: KRef) -> Result<RefCounts, StoreError> {
        let text = self
            .read(&format!("{kref}{OBJECT_REFCOUNT_SUFFIX}"))?
            .ok_or(StoreError::UnknownObject(kref))?;
        RefCounts::decode(&text)
    }

    fn set_ref_counts(&mut self, kref: KRef, counts: RefCounts) -> Result<(), StoreError> {
        if counts.reachable > counts.recognizable {
            return Err(StoreError::InvariantViolation(format!(
                "{kref}: reachable {} > recognizable {}",
                counts.reachable, counts.recognizable
            )));
        }
        self.write(&format!("{kref}{OBJECT_REFCOUNT_SUFFIX}"), counts.encode())
    }

    /// Bump counts for a new non-owner c-list entry. Returns the new counts.
    pub fn increment_ref_counts(
        &mut self,
        kref: KRef,
        reachable: bool,
    ) -> Result<RefCounts, StoreError> {
        let mut counts = self.ref_counts(kref)?;
        counts.recognizable += 1;
        if reachable {
            counts.reachable += 1;
        }
        self.set_ref_counts(kref, counts)?;
        Ok(counts)
    }

    /// Drop counts and record the GC transitions the new counts imply:
    /// reachable hitting zero queues `dropExports` to the owner, recognizable
    /// hitting zero queues `retireExports` and puts the kref up for
    /// retirement.
    pub fn decrement_ref_counts(
        &mut self,
        kref: KRef,
        was_reachable: bool,
        drop_recognizable: bool,
    ) -> Result<RefCounts, StoreError> {
        let mut counts = self.ref_counts(kref)?;
        if was_reachable {
            counts.reachable = counts.reachable.checked_sub(1).ok_or_else(|| {
                StoreError::InvariantViolation(format!("{kref}: reachable underflow"))
            })?;
        }
        if drop_recognizable {
            counts.recognizable = counts.recognizable.checked_sub(1).ok_or_else(|| {
                StoreError::InvariantViolation(format!("{kref}: recognizable underflow"))
            })?;
        }
        self.set_ref_counts(kref, counts)?;

        let owner = self.object_owner(kref)?;
        if was_reachable && counts.reachable == 0 && counts.recognizable > 0 {
            if let Some(EndpointId::Vat(owner_vat)) = owner {
                self.add_gc_action(GcAction {
                    kind: GcActionKind::DropExports,
                    vat: owner_vat,
                    kref,
                })?;
            }
        }
        if drop_recognizable && counts.recognizable == 0 {
            // the exporter learns of full retirement only once it has
            // dropped its own entry too
            if let Some(EndpointId::Vat(owner_vat)) = owner {
                if self.clist_entry(owner_vat, kref)?.is_none() {
                    self.add_gc_action(GcAction {
                        kind: GcActionKind::RetireExports,
                        vat: owner_vat,
                        kref,
                    })?;
                }
            }
            self.add_maybe_free(kref)?;
        }
        Ok(counts)
    }

    pub fn delete_object(&mut self, kref: KRef) -> Result<(), StoreError> {
        self.delete(&format!("{kref}{OBJECT_OWNER_SUFFIX}"))?;
        self.delete(&format!("{kref}{OBJECT_REFCOUNT_SUFFIX}"))?;
        self.delete(&format!("{kref}{OBJECT_REVOKED_SUFFIX}"))?;
        trace!(%kref, "retired kernel object");
        Ok(())
    }

    // ---- promise table ----

    pub fn allocate_promise(&mut self, decider: Option<VatId>) -> Result<KRef, StoreError> {
        let index = self.bump_counter(NEXT_PROMISE_ID_KEY)?;
        let kref = KRef::Promise(index);
        self.write(
            &format!("{kref}{PROMISE_STATE_SUFFIX}"),
            PromiseStateTag::Unresolved.encode().to_string(),
        )?;
        if let Some(vat) = decider {
            self.write(&format!("{kref}{PROMISE_DECIDER_SUFFIX}"), vat.to_string())?;
        }
        self.write(
            &format!("{kref}{PROMISE_SUBSCRIBERS_SUFFIX}"),
            "[]".to_string(),
        )?;
        self.write(&format!("{kref}{PROMISE_REFCOUNT_SUFFIX}"), "0".to_string())?;
        trace!(%kref, ?decider, "allocated kernel promise");
        Ok(kref)
    }

    pub fn promise_exists(&self, kref: KRef) -> Result<bool, StoreError> {
        Ok(self.read(&format!("{kref}{PROMISE_STATE_SUFFIX}"))?.is_some())
    }

    pub fn promise_state(&self, kref: KRef) -> Result<PromiseStateTag, StoreError> {
        let text = self
            .read(&format!("{kref}{PROMISE_STATE_SUFFIX}"))?
            .ok_or(StoreError::UnknownPromise(kref))?;
        PromiseStateTag::decode(&text)
    }

    pub fn promise_decider(&self, kref: KRef) -> Result<Option<VatId>, StoreError> {
        match self.read(&format!("{kref}{PROMISE_DECIDER_SUFFIX}"))? {
            Some(text) => Ok(Some(text.parse()?)),
            None => Ok(None),
        }
    }

    pub fn set_promise_decider(
        &mut self,
        kref: KRef,
        decider: Option<VatId>,
    ) -> Result<(), StoreError> {
        let key = format!("{kref}{PROMISE_DECIDER_SUFFIX}");
        match decider {
            Some(vat) => self.write(&key, vat.to_string()),
            None => self.delete(&key),
        }
    }

    pub fn promise_subscribers(&self, kref: KRef) -> Result<Vec<VatId>, StoreError> {
        match self.read(&format!("{kref}{PROMISE_SUBSCRIBERS_SUFFIX}"))? {
            Some(text) => serde_json::from_str(&text)
                .map_err(|_| StoreError::Corrupt(format!("bad subscribers for {kref}"))),
            None => Ok(Vec::new()),
        }
    }

    /// Idempotent; keeps the set sorted for deterministic notify order.
    pub fn add_promise_subscriber(&mut self, kref: KRef, vat: VatId) -> Result<(), StoreError> {
        let mut subscribers = self.promise_subscribers(kref)?;
        if !subscribers.contains(&vat) {
            subscribers.push(vat);
            subscribers.sort();
            let text = serde_json::to_string(&subscribers)
                .map_err(|err| StoreError::Corrupt(err.to_string()))?;
            self.write(&format!("{kref}{PROMISE_SUBSCRIBERS_SUFFIX}"), text)?;
        }
        Ok(())
    }

    pub fn promise_value(&self, kref: KRef) -> Result<Option<CapData>, StoreError> {
        match self.read(&format!("{kref}{PROMISE_VALUE_SUFFIX}"))? {
            Some(text) => Ok(Some(serde_json::from_str(&text).map_err(|_| {
                StoreError::Corrupt(format!("bad promise value for {kref}"))
            })?)),
            None => Ok(None),
        }
    }

    pub fn promise_forward(&self, kref: KRef) -> Result<Option<KRef>, StoreError> {
        match self.read(&format!("{kref}{PROMISE_FORWARD_SUFFIX}"))? {
            Some(text) => Ok(Some(text.parse()?)),
            None => Ok(None),
        }
    }

    pub fn promise_snapshot(&self, kref: KRef) -> Result<PromiseSnapshot, StoreError> {
        Ok(PromiseSnapshot {
            state: self.promise_state(kref)?,
            value: self.promise_value(kref)?,
            forward: self.promise_forward(kref)?,
        })
    }

    /// Move an unresolved promise to a terminal state. Decider and
    /// subscriber records are cleared, and the value's slots are pinned so
    /// they outlive the resolution; the caller is responsible for draining
    /// the promise queue and scheduling notifies first.
    pub fn resolve_promise(
        &mut self,
        kref: KRef,
        rejected: bool,
        value: &CapData,
    ) -> Result<(), StoreError> {
        if self.promise_state(kref)? != PromiseStateTag::Unresolved {
            return Err(StoreError::InvariantViolation(format!(
                "{kref} resolved twice"
            )));
        }
        let tag = if rejected {
            PromiseStateTag::Rejected
        } else {
            PromiseStateTag::Fulfilled
        };
        self.write(
            &format!("{kref}{PROMISE_STATE_SUFFIX}"),
            tag.encode().to_string(),
        )?;
        let text =
            serde_json::to_string(value).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        self.write(&format!("{kref}{PROMISE_VALUE_SUFFIX}"), text)?;
        self.delete(&format!("{kref}{PROMISE_DECIDER_SUFFIX}"))?;
        self.delete(&format!("{kref}{PROMISE_SUBSCRIBERS_SUFFIX}"))?;
        for slot in &value.slots {
            self.pin_kref(*slot)?;
        }
        Ok(())
    }

    pub fn forward_promise(&mut self, kref: KRef, target: KRef) -> Result<(), StoreError> {
        if self.promise_state(kref)? != PromiseStateTag::Unresolved {
            return Err(StoreError::InvariantViolation(format!(
                "{kref} resolved twice"
            )));
        }
        self.write(
            &format!("{kref}{PROMISE_STATE_SUFFIX}"),
            PromiseStateTag::Forwarded.encode().to_string(),
        )?;
        self.write(&format!("{kref}{PROMISE_FORWARD_SUFFIX}"), target.to_string())?;
        self.delete(&format!("{kref}{PROMISE_DECIDER_SUFFIX}"))?;
        self.delete(&format!("{kref}{PROMISE_SUBSCRIBERS_SUFFIX}"))?;
        Ok(())
    }

    pub fn promise_ref_count(&self, kref: KRef) -> Result<u64, StoreError> {
        let text = self
            .read(&format!("{kref}{PROMISE_REFCOUNT_SUFFIX}"))?
            .ok_or(StoreError::UnknownPromise(kref))?;
        text.parse()
            .map_err(|_| StoreError::Corrupt(format!("bad promise refCount for {kref}")))
    }

    pub fn increment_promise_ref_count(&mut self, kref: KRef) -> Result<u64, StoreError> {
        let count = self.promise_ref_count(kref)? + 1;
        self.write(&format!("{kref}{PROMISE_REFCOUNT_SUFFIX}"), count.to_string())?;
        Ok(count)
    }

    pub fn decrement_promise_ref_count(&mut self, kref: KRef) -> Result<u64, StoreError> {
        let count = self
            .promise_ref_count(kref)?
            .checked_sub(1)
            .ok_or_else(|| {
                StoreError::InvariantViolation(format!("{kref}: refCount underflow"))
            })?;
        self.write(&format!("{kref}{PROMISE_REFCOUNT_SUFFIX}"), count.to_string())?;
        if count == 0 {
            self.add_maybe_free(kref)?;
        }
        Ok(count)
    }

    pub fn delete_promise(&mut self, kref: KRef) -> Result<(), StoreError> {
        if let Some(value) = self.promise_value(kref)? {
            for slot in &value.slots {
                self.unpin_kref(*slot)?;
            }
        }
        for suffix in [
            PROMISE_STATE_SUFFIX,
            PROMISE_DECIDER_SUFFIX,
            PROMISE_SUBSCRIBERS_SUFFIX,
            PROMISE_REFCOUNT_SUFFIX,
            PROMISE_VALUE_SUFFIX,
            PROMISE_FORWARD_SUFFIX,
        ] {
            self.delete(&format!("{kref}{suffix}"))?;
        }
        trace!(%kref, "retired kernel promise");
        Ok(())
    }

    // ---- c-lists ----

    fn k2e_key(vat: VatId, kref: KRef) -> String {
        format!("{CLIST_PREFIX}{vat}{CLIST_K2E_SEGMENT}{kref}")
    }

    fn e2k_key(vat: VatId, vref: VRef) -> String {
        format!("{CLIST_PREFIX}{vat}{CLIST_E2K_SEGMENT}{vref}")
    }

    pub fn clist_kref(&self, vat: VatId, vref: VRef) -> Result<Option<KRef>, StoreError> {
        match self.read(&Self::e2k_key(vat, vref))? {
            Some(text) => Ok(Some(text.parse()?)),
            None => Ok(None),
        }
    }

    /// Returns the vat-space name and whether the entry is reachable.
    pub fn clist_entry(&self, vat: VatId, kref: KRef) -> Result<Option<(VRef, bool)>, StoreError> {
        match self.read(&Self::k2e_key(vat, kref))? {
            Some(text) => {
                let (flag, vref) = text
                    .split_once(' ')
                    .ok_or_else(|| StoreError::Corrupt(format!("bad c-list entry `{text}`")))?;
                Ok(Some((vref.parse()?, flag == "R")))
            }
            None => Ok(None),
        }
    }

    /// Insert both directions of a c-list entry and maintain ref counts.
    /// Entries for the owning vat do not contribute to the counts.
    pub fn add_clist_entry(
        &mut self,
        vat: VatId,
        kref: KRef,
        vref: VRef,
        reachable: bool,
    ) -> Result<(), StoreError> {
        let flag = if reachable { "R" } else { "_" };
        self.write(&Self::k2e_key(vat, kref), format!("{flag} {vref}"))?;
        self.write(&Self::e2k_key(vat, vref), kref.to_string())?;
        match kref {
            KRef::Object(_) => {
                if self.object_owner(kref)? != Some(EndpointId::Vat(vat)) {
                    self.increment_ref_counts(kref, reachable)?;
                }
            }
            KRef::Promise(_) => {
                self.increment_promise_ref_count(kref)?;
            }
        }
        Ok(())
    }

    /// Flip the reachable flag, adjusting the reachable count on real
    /// transitions. Flipping to unreachable is how a vat keeps only weak
    /// recognition of an import.
    pub fn set_clist_reachable(
        &mut self,
        vat: VatId,
        kref: KRef,
        reachable: bool,
    ) -> Result<(), StoreError> {
        let (vref, was_reachable) = self
            .clist_entry(vat, kref)?
            .ok_or(StoreError::UnknownClistEntry { vat, kref })?;
        if was_reachable == reachable {
            return Ok(());
        }
        let flag = if reachable { "R" } else { "_" };
        self.write(&Self::k2e_key(vat, kref), format!("{flag} {vref}"))?;
        if kref.is_object() && self.object_owner(kref)? != Some(EndpointId::Vat(vat)) {
            if reachable {
                self.increment_ref_counts_reachable_only(kref)?;
            } else {
                self.decrement_ref_counts(kref, true, false)?;
            }
        }
        Ok(())
    }

    fn increment_ref_counts_reachable_only(&mut self, kref: KRef) -> Result<RefCounts, StoreError> {
        let mut counts = self.ref_counts(kref)?;
        counts.reachable += 1;
        self.set_ref_counts(kref, counts)?;
        Ok(counts)
    }

    /// Remove the entry in both directions, decrementing whatever counts it
    /// held.
    pub fn delete_clist_entry(&mut self, vat: VatId, kref: KRef) -> Result<(), StoreError> {
        let (vref, was_reachable) = self
            .clist_entry(vat, kref)?
            .ok_or(StoreError::UnknownClistEntry { vat, kref })?;
        self.delete(&Self::k2e_key(vat, kref))?;
        self.delete(&Self::e2k_key(vat, vref))?;
        match kref {
            KRef::Object(_) => {
                if self.object_owner(kref)? != Some(EndpointId::Vat(vat)) {
                    self.decrement_ref_counts(kref, was_reachable, true)?;
                }
            }
            KRef::Promise(_) => {
                self.decrement_promise_ref_count(kref)?;
            }
        }
        Ok(())
    }

    pub fn next_import_index(&mut self, vat: VatId, promise: bool) -> Result<u64, StoreError> {
        let segment = if promise {
            CLIST_NEXT_PROMISE_IMPORT_SEGMENT
        } else {
            CLIST_NEXT_OBJECT_IMPORT_SEGMENT
        };
        self.bump_counter(&format!("{CLIST_PREFIX}{vat}{segment}"))
    }

    /// Every `(kref, vref, reachable)` entry in the vat's c-list.
    pub fn vat_clist(&self, vat: VatId) -> Result<Vec<(KRef, VRef, bool)>, StoreError> {
        let prefix = format!("{CLIST_PREFIX}{vat}{CLIST_K2E_SEGMENT}");
        let mut out = Vec::new();
        for (key, value) in self.scan(&prefix)? {
            let kref: KRef = key
                .strip_prefix(&prefix)
                .ok_or_else(|| StoreError::Corrupt(format!("bad c-list key `{key}`")))?
                .parse()?;
            let (flag, vref) = value
                .split_once(' ')
                .ok_or_else(|| StoreError::Corrupt(format!("bad c-list entry `{value}`")))?;
            out.push((kref, vref.parse()?, flag == "R"));
        }
        Ok(out)
    }

    /// Vats other than the owner holding a c-list entry for the kref.
    pub fn vats_recognizing(&self, kref: KRef) -> Result<Vec<VatId>, StoreError> {
        let owner = self.object_owner(kref).ok().flatten();
        let mut out = Vec::new();
        for (vat, _) in self.list_vats()? {
            if owner == Some(EndpointId::Vat(vat)) {
                continue;
            }
            if self.clist_entry(vat, kref)?.is_some() {
                out.push(vat);
            }
        }
        Ok(out)
    }

    /// Every vat holding a c-list entry for the kref, owner included.
    pub fn vats_with_entry(&self, kref: KRef) -> Result<Vec<VatId>, StoreError> {
        let mut out = Vec::new();
        for (vat, _) in self.list_vats()? {
            if self.clist_entry(vat, kref)?.is_some() {
                out.push(vat);
            }
        }
        Ok(out)
    }

    // ---- run queue & promise queues ----

    fn queue_pointer(&self, queue: &str, end: &str) -> Result<u64, StoreError> {
        Ok(self
            .read(&format!("{queue}.{end}"))?
            .and_then(|text| text.parse().ok())
            .unwrap_or(1))
    }

    fn enqueue(&mut self, queue: &str, item: &RunQueueItem) -> Result<(), StoreError> {
        let tail = self.queue_pointer(queue, "tail")?;
        let text =
            serde_json::to_string(item).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        self.write(&format!("{queue}.{tail}"), text)?;
        self.write(&format!("{queue}.tail"), (tail + 1).to_string())?;
        for kref in item.mentioned_krefs() {
            self.pin_kref(kref)?;
        }
        Ok(())
    }

    fn dequeue(&mut self, queue: &str) -> Result<Option<RunQueueItem>, StoreError> {
        let head = self.queue_pointer(queue, "head")?;
        let tail = self.queue_pointer(queue, "tail")?;
        if head >= tail {
            return Ok(None);
        }
        let key = format!("{queue}.{head}");
        let text = self
            .read(&key)?
            .ok_or_else(|| StoreError::Corrupt(format!("missing queue record `{key}`")))?;
        let item: RunQueueItem = serde_json::from_str(&text)
            .map_err(|_| StoreError::Corrupt(format!("bad queue record `{key}`")))?;
        self.delete(&key)?;
        self.write(&format!("{queue}.head"), (head + 1).to_string())?;
        for kref in item.mentioned_krefs() {
            self.unpin_kref(kref)?;
        }
        Ok(Some(item))
    }

    fn queue_length(&self, queue: &str) -> Result<u64, StoreError> {
        let head = self.queue_pointer(queue, "head")?;
        let tail = self.queue_pointer(queue, "tail")?;
        Ok(tail.saturating_sub(head))
    }

    pub fn enqueue_run(&mut self, item: &RunQueueItem) -> Result<(), StoreError> {
        self.enqueue(RUN_QUEUE_PREFIX, item)
    }

    pub fn dequeue_run(&mut self) -> Result<Option<RunQueueItem>, StoreError> {
        self.dequeue(RUN_QUEUE_PREFIX)
    }

    pub fn run_queue_length(&self) -> Result<u64, StoreError> {
        self.queue_length(RUN_QUEUE_PREFIX)
    }

    pub fn enqueue_promise_message(
        &mut self,
        kp: KRef,
        item: &RunQueueItem,
    ) -> Result<(), StoreError> {
        self.enqueue(&format!("{QUEUE_PREFIX}{kp}"), item)
    }

    /// Empty the promise's queue in FIFO order, for re-targeting after
    /// resolution.
    pub fn drain_promise_queue(&mut self, kp: KRef) -> Result<Vec<RunQueueItem>, StoreError> {
        let queue = format!("{QUEUE_PREFIX}{kp}");
        let mut items = Vec::new();
        while let Some(item) = self.dequeue(&queue)? {
            items.push(item);
        }
        self.delete(&format!("{queue}.head"))?;
        self.delete(&format!("{queue}.tail"))?;
        Ok(items)
    }

    pub fn promise_queue_length(&self, kp: KRef) -> Result<u64, StoreError> {
        self.queue_length(&format!("{QUEUE_PREFIX}{kp}"))
    }

    // ---- pins & retirement candidates ----

    pub fn pin_kref(&mut self, kref: KRef) -> Result<(), StoreError> {
        let key = format!("{PIN_PREFIX}{kref}");
        let count: u64 = self
            .read(&key)?
            .and_then(|text| text.parse().ok())
            .unwrap_or(0);
        self.write(&key, (count + 1).to_string())
    }

    pub fn unpin_kref(&mut self, kref: KRef) -> Result<(), StoreError> {
        let key = format!("{PIN_PREFIX}{kref}");
        let count: u64 = self
            .read(&key)?
            .and_then(|text| text.parse().ok())
            .unwrap_or(0);
        match count {
            0 | 1 => self.delete(&key),
            n => self.write(&key, (n - 1).to_string()),
        }
    }

    pub fn pin_count(&self, kref: KRef) -> Result<u64, StoreError> {
        Ok(self
            .read(&format!("{PIN_PREFIX}{kref}"))?
            .and_then(|text| text.parse().ok())
            .unwrap_or(0))
    }

    fn read_kref_set(&self, key: &str) -> Result<Vec<KRef>, StoreError> {
        match self.read(key)? {
            Some(text) => {
                let names: Vec<String> = serde_json::from_str(&text)
                    .map_err(|_| StoreError::Corrupt(format!("bad kref set `{key}`")))?;
                names.iter().map(|name| Ok(name.parse()?)).collect()
            }
            None => Ok(Vec::new()),
        }
    }

    fn write_kref_set(&mut self, key: &str, krefs: &[KRef]) -> Result<(), StoreError> {
        if krefs.is_empty() {
            return self.delete(key);
        }
        let names: Vec<String> = krefs.iter().map(KRef::to_string).collect();
        let text =
            serde_json::to_string(&names).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        self.write(key, text)
    }

    pub fn add_maybe_free(&mut self, kref: KRef) -> Result<(), StoreError> {
        let mut set = self.read_kref_set(MAYBE_FREE_KEY)?;
        if !set.contains(&kref) {
            set.push(kref);
            set.sort();
            self.write_kref_set(MAYBE_FREE_KEY, &set)?;
        }
        Ok(())
    }

    /// Retire every candidate that nothing references any more: counts at
    /// zero, no queue pins, no c-list entries, no queued promise messages.
    /// Returns the krefs actually retired.
    pub fn collect_candidates(&mut self) -> Result<Vec<KRef>, StoreError> {
        let candidates = self.read_kref_set(MAYBE_FREE_KEY)?;
        let mut retired = Vec::new();
        let mut remaining = Vec::new();
        for kref in candidates {
            if self.pin_count(kref)? > 0 {
                remaining.push(kref);
                continue;
            }
            match kref {
                KRef::Object(_) => {
                    if !self.object_exists(kref)? {
                        continue;
                    }
                    let counts = self.ref_counts(kref)?;
                    if counts.recognizable == 0 && self.vats_with_entry(kref)?.is_empty() {
                        self.delete_object(kref)?;
                        retired.push(kref);
                    } else {
                        remaining.push(kref);
                    }
                }
                KRef::Promise(_) => {
                    if !self.promise_exists(kref)? {
                        continue;
                    }
                    let settled = self.promise_state(kref)? != PromiseStateTag::Unresolved;
                    if settled
                        && self.promise_ref_count(kref)? == 0
                        && self.promise_queue_length(kref)? == 0
                    {
                        self.delete_promise(kref)?;
                        retired.push(kref);
                    } else {
                        remaining.push(kref);
                    }
                }
            }
        }
        self.write_kref_set(MAYBE_FREE_KEY, &remaining)?;
        Ok(retired)
    }

    // ---- GC actions ----

    pub fn gc_actions(&self) -> Result<Vec<GcAction>, StoreError> {
        match self.read(GC_ACTIONS_KEY)? {
            Some(text) => {
                let names: Vec<String> = serde_json::from_str(&text)
                    .map_err(|_| StoreError::Corrupt("bad gcActions".to_string()))?;
                names.iter().map(|name| GcAction::decode(name)).collect()
            }
            None => Ok(Vec::new()),
        }
    }

    fn write_gc_actions(&mut self, actions: &[GcAction]) -> Result<(), StoreError> {
        if actions.is_empty() {
            return self.delete(GC_ACTIONS_KEY);
        }
        let names: Vec<String> = actions.iter().map(GcAction::encode).collect();
        let text =
            serde_json::to_string(&names).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        self.write(GC_ACTIONS_KEY, text)
    }

    pub fn add_gc_action(&mut self, action: GcAction) -> Result<(), StoreError> {
        let mut actions = self.gc_actions()?;
        if !actions.contains(&action) {
            actions.push(action);
            actions.sort();
            self.write_gc_actions(&actions)?;
        }
        Ok(())
    }

    pub fn has_gc_actions(&self) -> Result<bool, StoreError> {
        Ok(!self.gc_actions()?.is_empty())
    }

    /// Pop the highest-priority `(vat, kind)` group off the pending set.
    pub fn take_gc_action_group(
        &mut self,
    ) -> Result<Option<(VatId, GcActionKind, Vec<KRef>)>, StoreError> {
        let actions = self.gc_actions()?;
        let Some(first) = actions.first().copied() else {
            return Ok(None);
        };
        let (group, rest): (Vec<GcAction>, Vec<GcAction>) = actions
            .into_iter()
            .partition(|action| action.kind == first.kind && action.vat == first.vat);
        self.write_gc_actions(&rest)?;
        let krefs = group.into_iter().map(|action| action.kref).collect();
        Ok(Some((first.vat, first.kind, krefs)))
    }

    // ---- vatstore ----

    fn vatstore_key(vat: VatId, key: &str) -> String {
        format!("{VATSTORE_PREFIX}{vat}.{key}")
    }

    pub fn vatstore_get(&self, vat: VatId, key: &str) -> Result<Option<String>, StoreError> {
        self.read(&Self::vatstore_key(vat, key))
    }

    pub fn vatstore_set(&mut self, vat: VatId, key: &str, value: &str) -> Result<(), StoreError> {
        self.write(&Self::vatstore_key(vat, key), value.to_string())
    }

    pub fn vatstore_delete(&mut self, vat: VatId, key: &str) -> Result<(), StoreError> {
        self.delete(&Self::vatstore_key(vat, key))
    }

    /// First user key strictly greater than `after` (empty string starts the
    /// scan), for the `vatstoreGetNextKey` syscall.
    pub fn vatstore_next_key(
        &self,
        vat: VatId,
        after: &str,
    ) -> Result<Option<String>, StoreError> {
        let prefix = format!("{VATSTORE_PREFIX}{vat}.");
        for (key, _) in self.scan(&prefix)? {
            if let Some(user_key) = key.strip_prefix(&prefix) {
                if user_key > after {
                    return Ok(Some(user_key.to_string()));
                }
            }
        }
        Ok(None)
    }

    pub fn clear_vatstore(&mut self, vat: VatId) -> Result<(), StoreError> {
        let prefix = format!("{VATSTORE_PREFIX}{vat}.");
        for (key, _) in self.scan(&prefix)? {
            self.delete(&key)?;
        }
        Ok(())
    }

    // ---- vat & subcluster tables ----

    pub fn allocate_vat_id(&mut self) -> Result<VatId, StoreError> {
        Ok(VatId(self.bump_counter(NEXT_VAT_ID_KEY)?))
    }

    pub fn set_vat_record(&mut self, vat: VatId, record: &VatRecord) -> Result<(), StoreError> {
        let text =
            serde_json::to_string(record).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        self.write(&format!("{VAT_PREFIX}{vat}"), text)
    }

    pub fn vat_record(&self, vat: VatId) -> Result<VatRecord, StoreError> {
        let text = self
            .read(&format!("{VAT_PREFIX}{vat}"))?
            .ok_or(StoreError::UnknownVat(vat))?;
        serde_json::from_str(&text)
            .map_err(|_| StoreError::Corrupt(format!("bad vat record for {vat}")))
    }

    pub fn vat_exists(&self, vat: VatId) -> Result<bool, StoreError> {
        Ok(self.read(&format!("{VAT_PREFIX}{vat}"))?.is_some())
    }

    pub fn delete_vat_record(&mut self, vat: VatId) -> Result<(), StoreError> {
        self.delete(&format!("{VAT_PREFIX}{vat}"))
    }

    pub fn list_vats(&self) -> Result<Vec<(VatId, VatRecord)>, StoreError> {
        let mut out = Vec::new();
        for (key, value) in self.scan(VAT_PREFIX)? {
            let Some(id_text) = key.strip_prefix(VAT_PREFIX) else {
                continue;
            };
            let vat: VatId = id_text.parse()?;
            let record = serde_json::from_str(&value)
                .map_err(|_| StoreError::Corrupt(format!("bad vat record for {vat}")))?;
            out.push((vat, record));
        }
        Ok(out)
    }

    pub fn allocate_subcluster_id(&mut self) -> Result<SubclusterId, StoreError> {
        Ok(SubclusterId(self.bump_counter(NEXT_SUBCLUSTER_ID_KEY)?))
    }

    pub fn set_subcluster(&mut self, record: &SubclusterRecord) -> Result<(), StoreError> {
        let text =
            serde_json::to_string(record).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        self.write(&format!("{SUBCLUSTER_PREFIX}{}", record.id), text)
    }

    pub fn subcluster(&self, sid: SubclusterId) -> Result<Option<SubclusterRecord>, StoreError> {
        match self.read(&format!("{SUBCLUSTER_PREFIX}{sid}"))? {
            Some(text) => Ok(Some(serde_json::from_str(&text).map_err(|_| {
                StoreError::Corrupt(format!("bad subcluster record for {sid}"))
            })?)),
            None => Ok(None),
        }
    }

    pub fn delete_subcluster(&mut self, sid: SubclusterId) -> Result<(), StoreError> {
        self.delete(&format!("{SUBCLUSTER_PREFIX}{sid}"))
    }

    pub fn list_subclusters(&self) -> Result<Vec<SubclusterRecord>, StoreError> {
        let mut out = Vec::new();
        for (_, value) in self.scan(SUBCLUSTER_PREFIX)? {
            out.push(
                serde_json::from_str(&value)
                    .map_err(|_| StoreError::Corrupt("bad subcluster record".to_string()))?,
            );
        }
        Ok(out)
    }

    // ---- OCAP URL tokens ----

    pub fn set_ocap_token(&mut self, token: &str, kref: KRef) -> Result<(), StoreError> {
        self.write(&format!("{OCAP_TOKEN_PREFIX}{token}"), kref.to_string())
    }

    pub fn ocap_token(&self, token: &str) -> Result<Option<KRef>, StoreError> {
        match self.read(&format!("{OCAP_TOKEN_PREFIX}{token}"))? {
            Some(text) => Ok(Some(text.parse()?)),
            None => Ok(None),
        }
    }

    pub fn delete_ocap_token(&mut self, token: &str) -> Result<(), StoreError> {
        self.delete(&format!("{OCAP_TOKEN_PREFIX}{token}"))
    }

    /// First token already bound to the kref, to keep reissue idempotent.
    pub fn ocap_token_for(&self, kref: KRef) -> Result<Option<String>, StoreError> {
        for (key, value) in self.scan(OCAP_TOKEN_PREFIX)? {
            if value == kref.to_string() {
                if let Some(token) = key.strip_prefix(OCAP_TOKEN_PREFIX) {
                    return Ok(Some(token.to_string()));
                }
            }
        }
        Ok(None)
    }

    // ---- kernel services & remote proxies ----

    pub fn set_service_kref(&mut self, name: &str, kref: KRef) -> Result<(), StoreError> {
        self.write(&format!("{SERVICE_PREFIX}{name}"), kref.to_string())
    }

    pub fn service_kref(&self, name: &str) -> Result<Option<KRef>, StoreError> {
        match self.read(&format!("{SERVICE_PREFIX}{name}"))? {
            Some(text) => Ok(Some(text.parse()?)),
            None => Ok(None),
        }
    }

    /// Name of the service a kernel-owned object dispatches to.
    pub fn service_name_for(&self, kref: KRef) -> Result<Option<String>, StoreError> {
        for (key, value) in self.scan(SERVICE_PREFIX)? {
            if value == kref.to_string() {
                return Ok(key.strip_prefix(SERVICE_PREFIX).map(str::to_string));
            }
        }
        Ok(None)
    }

    /// Bind a synthetic kref to `(peer, token)` in both directions.
    pub fn set_remote_object(
        &mut self,
        kref: KRef,
        peer: &str,
        token: &str,
    ) -> Result<(), StoreError> {
        self.write(&format!("{REMOTE_OBJECT_PREFIX}{kref}"), format!("{peer} {token}"))?;
        self.write(&format!("{REMOTE_TOKEN_PREFIX}{peer}.{token}"), kref.to_string())
    }

    pub fn remote_object(&self, kref: KRef) -> Result<Option<(String, String)>, StoreError> {
        match self.read(&format!("{REMOTE_OBJECT_PREFIX}{kref}"))? {
            Some(text) => {
                let (peer, token) = text
                    .split_once(' ')
                    .ok_or_else(|| StoreError::Corrupt(format!("bad remote binding `{text}`")))?;
                Ok(Some((peer.to_string(), token.to_string())))
            }
            None => Ok(None),
        }
    }

    pub fn remote_kref_for(&self, peer: &str, token: &str) -> Result<Option<KRef>, StoreError> {
        match self.read(&format!("{REMOTE_TOKEN_PREFIX}{peer}.{token}"))? {
            Some(text) => Ok(Some(text.parse()?)),
            None => Ok(None),
        }
    }

    /// Unresolved promises a vat may still decide, for termination cleanup.
    pub fn promises_decided_by(&self, vat: VatId) -> Result<Vec<KRef>, StoreError> {
        let mut out = Vec::new();
        for (key, value) in self.scan("kp")? {
            if let Some(kref_text) = key.strip_suffix(PROMISE_DECIDER_SUFFIX) {
                if value == vat.to_string() {
                    out.push(kref_text.parse()?);
                }
            }
        }
        Ok(out)
    }

    // ---- invariants ----

    /// Property checks run by tests between cranks: `reachable <=
    /// recognizable` and `reachable == Σ` non-owner reachable c-list entries
    /// for every live object.
    pub fn check_ref_count_invariants(&self) -> Result<(), StoreError> {
        let vats = self.list_vats()?;
        for (key, value) in self.scan("ko")? {
            let Some(kref_text) = key.strip_suffix(OBJECT_REFCOUNT_SUFFIX) else {
                continue;
            };
            let kref: KRef = kref_text.parse()?;
            let counts = RefCounts::decode(&value)?;
            if counts.reachable > counts.recognizable {
                return Err(StoreError::InvariantViolation(format!(
                    "{kref}: reachable {} > recognizable {}",
                    counts.reachable, counts.recognizable
                )));
            }
            let owner = self.object_owner(kref)?;
            let mut observed = 0;
            for (vat, _) in &vats {
                if owner == Some(EndpointId::Vat(*vat)) {
                    continue;
                }
                if let Some((_, true)) = self.clist_entry(*vat, kref)? {
                    observed += 1;
                }
            }
            if observed != counts.reachable {
                return Err(StoreError::InvariantViolation(format!(
                    "{kref}: reachable {} but {} c-list entries",
                    counts.reachable, observed
                )));
            }
        }
        Ok(())
    }

    /// Live object and promise counts, for status reporting.
    pub fn table_sizes(&self) -> Result<(u64, u64), StoreError> {
        let objects = self
            .scan("ko")?
            .iter()
            .filter(|(key, _)| key.ends_with(OBJECT_REFCOUNT_SUFFIX))
            .count() as u64;
        let promises = self
            .scan("kp")?
            .iter()
            .filter(|(key, _)| key.ends_with(PROMISE_STATE_SUFFIX))
            .count() as u64;
        Ok((objects, promises))
    }

    /// Debug rendering of a section, used by tests and the CLI status
    /// output.
    pub fn dump_prefix(&self, prefix: &str) -> Result<String, StoreError> {
        let mut out = String::new();
        for (key, value) in self.scan(prefix)? {
            let _ = writeln!(out, "{key} = {value}");
        }
        Ok(out)
    }
}
