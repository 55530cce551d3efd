//! Distributed garbage collection.
//!
//! The c-list maintains the counts; this module turns pending GC actions
//! into vat deliveries, reaps vats, and tears down terminated vats. Cross-
//! vat cycles have no local observer, so the reap schedule is the liveness
//! mechanism: collection is eventual, not immediate.

use crate::error::KernelError;
use crate::promise::{self, VAT_TERMINATED_ERROR};
use crate::vat::VatDelivery;
use kestrel_common::{CapData, EndpointId, GcActionKind, KRef, RunQueueItem, VRef, VatId};
use kestrel_storage::{GcAction, KernelStore, PromiseStateTag};
use tracing::{debug, trace};

/// Schedule a `bringOutYourDead` delivery for every live vat.
pub fn schedule_reap_all(store: &mut KernelStore) -> Result<(), KernelError> {
    for (vat, _) in store.list_vats()? {
        store.enqueue_run(&RunQueueItem::BringOutYourDead { vat })?;
    }
    Ok(())
}

/// Convert one pending `(vat, kind)` action group into a delivery for that
/// vat, dropping krefs whose state has moved on since the action was
/// queued. `None` means the whole group was stale or fully handled
/// kernel-side.
pub fn action_group_to_delivery(
    store: &mut KernelStore,
    vat: VatId,
    kind: GcActionKind,
    krefs: Vec<KRef>,
) -> Result<Option<VatDelivery>, KernelError> {
    let mut vrefs: Vec<VRef> = Vec::new();
    for kref in krefs {
        if !store.object_exists(kref)? {
            continue;
        }
        match kind {
            // to the exporter: only while the object is still dropped
            GcActionKind::DropExports => {
                if store.ref_counts(kref)?.reachable > 0 {
                    continue;
                }
            }
            // to the exporter: only once nobody recognizes it any more
            GcActionKind::RetireExports => {
                if store.ref_counts(kref)?.recognizable > 0 {
                    continue;
                }
            }
            // to importers: only while they still hold an entry
            GcActionKind::DropImports | GcActionKind::RetireImports => {}
            // handled kernel-side in terminate_vat_state
            GcActionKind::AbandonExports => {
                abandon_export(store, kref)?;
                continue;
            }
        }
        let Some((vref, _)) = store.clist_entry(vat, kref)? else {
            continue;
        };
        if kind == GcActionKind::RetireExports || kind == GcActionKind::RetireImports {
            store.delete_clist_entry(vat, kref)?;
            store.add_maybe_free(kref)?;
        }
        vrefs.push(vref);
    }
    if vrefs.is_empty() {
        trace!(%vat, %kind, "gc action group was stale");
        return Ok(None);
    }
    debug!(%vat, %kind, count = vrefs.len(), "delivering gc action");
    Ok(Some(match kind {
        GcActionKind::DropExports => VatDelivery::DropExports { vrefs },
        GcActionKind::RetireExports => VatDelivery::RetireExports { vrefs },
        GcActionKind::DropImports | GcActionKind::RetireImports => {
            VatDelivery::RetireImports { vrefs }
        }
        GcActionKind::AbandonExports => return Ok(None),
    }))
}

/// Owner walked away: clear ownership and tell every recognizer to retire
/// its import at the next cycle.
pub(crate) fn abandon_export(store: &mut KernelStore, kref: KRef) -> Result<(), KernelError> {
    for vat in store.vats_recognizing(kref)? {
        store.add_gc_action(GcAction {
            kind: GcActionKind::RetireImports,
            vat,
            kref,
        })?;
    }
    store.clear_object_owner(kref)?;
    store.add_maybe_free(kref)?;
    Ok(())
}

/// Tear down all kernel state for a vat: abandon its exports, reject the
/// promises it was deciding, drop its c-list, vatstore, and record.
pub fn terminate_vat_state(store: &mut KernelStore, vat: VatId) -> Result<(), KernelError> {
    debug!(%vat, "terminating vat state");

    for kp in store.promises_decided_by(vat)? {
        if store.promise_state(kp)? == PromiseStateTag::Unresolved {
            promise::reject_with(store, kp, CapData::error(VAT_TERMINATED_ERROR))?;
        }
    }

    for (kref, _, _) in store.vat_clist(vat)? {
        match kref {
            KRef::Object(_) => {
                let owned = store.object_owner(kref)? == Some(EndpointId::Vat(vat));
                if owned {
                    // entry first so the importers' counts stay coherent
                    store.delete_clist_entry(vat, kref)?;
                    abandon_export(store, kref)?;
                } else {
                    store.delete_clist_entry(vat, kref)?;
                }
            }
            KRef::Promise(_) => {
                store.delete_clist_entry(vat, kref)?;
            }
        }
    }

    store.clear_vatstore(vat)?;
    store.delete_vat_record(vat)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::{SubclusterId, VatRecord};
    use kestrel_storage::InMemoryBackend;
    use serde_json::Value;
    use std::sync::Arc;

    fn store_with_vats(ids: &[u64]) -> KernelStore {
        let mut store = KernelStore::new(Arc::new(InMemoryBackend::new()));
        for id in ids {
            let record = VatRecord {
                name: format!("vat{id}"),
                bundle: "test".to_string(),
                parameters: Value::Null,
                subcluster: SubclusterId(1),
                root: KRef::Object(0),
            };
            store.set_vat_record(VatId(*id), &record).expect("record");
        }
        store
    }

    #[test]
    fn stale_drop_actions_are_skipped() {
        let mut store = store_with_vats(&[1, 2]);
        let exporter = VatId(1);
        let importer = VatId(2);
        let kref = store
            .allocate_object(&EndpointId::Vat(exporter))
            .expect("allocate");
        store
            .add_clist_entry(exporter, kref, VRef::export_object(0), true)
            .expect("clist");
        store
            .add_clist_entry(importer, kref, VRef::import_object(1), true)
            .expect("clist");

        // queue a drop, then re-import before it is processed
        store
            .set_clist_reachable(importer, kref, false)
            .expect("weaken");
        store
            .set_clist_reachable(importer, kref, true)
            .expect("restrengthen");

        let Some((vat, kind, krefs)) = store.take_gc_action_group().expect("take") else {
            panic!("expected queued action");
        };
        let delivery =
            action_group_to_delivery(&mut store, vat, kind, krefs).expect("convert");
        assert_eq!(delivery, None);
    }

    #[test]
    fn termination_abandons_exports_and_rejects_decided_promises() {
        let mut store = store_with_vats(&[1, 2]);
        let dying = VatId(1);
        let survivor = VatId(2);

        let exported = store
            .allocate_object(&EndpointId::Vat(dying))
            .expect("allocate");
        store
            .add_clist_entry(dying, exported, VRef::export_object(0), true)
            .expect("clist");
        store
            .add_clist_entry(survivor, exported, VRef::import_object(1), true)
            .expect("clist");

        let kp = store.allocate_promise(Some(dying)).expect("promise");
        store.add_promise_subscriber(kp, survivor).expect("subscribe");

        terminate_vat_state(&mut store, dying).expect("terminate");

        assert_eq!(store.object_owner(exported).expect("owner"), None);
        assert_eq!(
            store.promise_state(kp).expect("state"),
            PromiseStateTag::Rejected
        );
        let value = store.promise_value(kp).expect("value").expect("capdata");
        assert!(value.body.contains(VAT_TERMINATED_ERROR));
        assert!(!store.vat_exists(dying).expect("exists"));
        assert!(store.vat_clist(dying).expect("clist").is_empty());
        // survivor is told to retire its import at the next cycle
        let kinds: Vec<GcActionKind> = store
            .gc_actions()
            .expect("actions")
            .into_iter()
            .map(|action| action.kind)
            .collect();
        assert!(kinds.contains(&GcActionKind::RetireImports));
    }
}
