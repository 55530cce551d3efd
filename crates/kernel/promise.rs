//! Promise lifecycle: subscription, resolution, forwarding, pipelining.
//!
//! Resolution chains collapse eagerly. A promise resolved to another promise
//! becomes a `Forwarded` record pointing at the chain's terminal; chasing is
//! iterative with a visited set so a cycle turns into a rejection rather
//! than a hang. Messages sent to an unresolved promise queue on that promise
//! and are re-targeted when it settles.

use crate::error::KernelError;
use kestrel_common::{CapData, KRef, RunQueueItem, VatId};
use kestrel_storage::{KernelStore, PromiseStateTag};
use std::collections::BTreeSet;
use tracing::{debug, trace};

pub const CYCLE_ERROR: &str = "promise resolution cycle detected";
pub const UNRESOLVABLE_TARGET_ERROR: &str = "cannot deliver to a non-capability resolution";
pub const VAT_TERMINATED_ERROR: &str = "vat terminated";

/// Follow forward pointers to the end of a chain. Returns the terminal kp.
pub fn chase_forwards(store: &KernelStore, kp: KRef) -> Result<KRef, KernelError> {
    let mut visited = BTreeSet::new();
    let mut current = kp;
    loop {
        if !visited.insert(current) {
            return Err(KernelError::Internal(format!(
                "forward cycle through {current}"
            )));
        }
        match store.promise_state(current)? {
            PromiseStateTag::Forwarded => {
                current = store
                    .promise_forward(current)?
                    .ok_or_else(|| KernelError::Internal(format!("{current} lost its forward")))?;
            }
            _ => return Ok(current),
        }
    }
}

/// Add a subscriber; an already-settled promise schedules an immediate
/// notify instead. The decider never subscribes to its own promise.
pub fn subscribe(store: &mut KernelStore, vat: VatId, kp: KRef) -> Result<(), KernelError> {
    let terminal = chase_forwards(store, kp)?;
    match store.promise_state(terminal)? {
        PromiseStateTag::Unresolved => {
            if store.promise_decider(terminal)? == Some(vat) {
                return Ok(());
            }
            store.add_promise_subscriber(terminal, vat)?;
        }
        _ => {
            store.enqueue_run(&RunQueueItem::Notify { vat, kp: terminal })?;
        }
    }
    trace!(%vat, %kp, "subscribed");
    Ok(())
}

/// Resolve a batch of promises. `resolver` is the syscalling vat, or `None`
/// for kernel-held promises (remote results, service replies, host sends).
pub fn resolve_batch(
    store: &mut KernelStore,
    resolver: Option<VatId>,
    batch: Vec<(KRef, bool, CapData)>,
) -> Result<(), KernelError> {
    for (kp, rejected, value) in batch {
        resolve_one(store, resolver, kp, rejected, value)?;
    }
    Ok(())
}

fn resolve_one(
    store: &mut KernelStore,
    resolver: Option<VatId>,
    kp: KRef,
    rejected: bool,
    value: CapData,
) -> Result<(), KernelError> {
    if store.promise_state(kp)? != PromiseStateTag::Unresolved {
        return Err(KernelError::Internal(format!("{kp} is already resolved")));
    }
    let decider = store.promise_decider(kp)?;
    if decider != resolver {
        return Err(KernelError::Internal(format!(
            "{kp} may only be resolved by its decider"
        )));
    }

    // A fulfillment whose value is exactly one promise is a forward, not
    // data.
    if !rejected {
        if let Some(target) = value.sole_slot().filter(KRef::is_promise) {
            return forward_to(store, kp, target);
        }
    }

    apply_terminal(store, kp, rejected, value)
}

fn forward_to(store: &mut KernelStore, kp: KRef, target: KRef) -> Result<(), KernelError> {
    let terminal = chase_forwards(store, target)?;
    if terminal == kp {
        // resolving a promise to itself (possibly through a chain)
        debug!(%kp, "rejecting self-referential resolution");
        return apply_terminal(store, kp, true, CapData::error(CYCLE_ERROR));
    }
    match store.promise_state(terminal)? {
        PromiseStateTag::Unresolved => {
            let subscribers = store.promise_subscribers(kp)?;
            let queued = store.drain_promise_queue(kp)?;
            store.forward_promise(kp, terminal)?;
            // chain state moves to the terminal: waiters follow, queued
            // sends aim at the new leaf
            for vat in subscribers {
                subscribe(store, vat, terminal)?;
            }
            for item in queued {
                if let RunQueueItem::Send { message, .. } = item {
                    store.enqueue_promise_message(
                        terminal,
                        &RunQueueItem::Send {
                            target: terminal,
                            message,
                        },
                    )?;
                }
            }
            trace!(%kp, %terminal, "collapsed promise forward");
            Ok(())
        }
        // short-circuit through an already-settled promise
        PromiseStateTag::Fulfilled => {
            let value = store
                .promise_value(terminal)?
                .ok_or_else(|| KernelError::Internal(format!("{terminal} lost its value")))?;
            apply_terminal(store, kp, false, value)
        }
        PromiseStateTag::Rejected => {
            let value = store
                .promise_value(terminal)?
                .ok_or_else(|| KernelError::Internal(format!("{terminal} lost its value")))?;
            apply_terminal(store, kp, true, value)
        }
        PromiseStateTag::Forwarded => Err(KernelError::Internal(format!(
            "{terminal} is not a chain terminal"
        ))),
    }
}

/// Commit a terminal resolution: store it, re-target the queue, schedule
/// notifies.
fn apply_terminal(
    store: &mut KernelStore,
    kp: KRef,
    rejected: bool,
    value: CapData,
) -> Result<(), KernelError> {
    let subscribers = store.promise_subscribers(kp)?;
    let queued = store.drain_promise_queue(kp)?;
    store.resolve_promise(kp, rejected, &value)?;

    let retarget = if rejected {
        None
    } else {
        value.sole_slot().filter(KRef::is_object)
    };
    for item in queued {
        let RunQueueItem::Send { message, .. } = item else {
            continue;
        };
        match retarget {
            Some(target) => store.enqueue_run(&RunQueueItem::Send { target, message })?,
            None => {
                // the resolution is not something a message can go to
                if let Some(result) = message.result {
                    reject_orphaned_result(store, result)?;
                }
            }
        }
    }
    for vat in subscribers {
        store.enqueue_run(&RunQueueItem::Notify { vat, kp })?;
    }
    debug!(%kp, rejected, "promise resolved");
    Ok(())
}

/// Reject the result of a send that can never be delivered. Only promises
/// with no decider (never delivered anywhere) take this path.
pub fn reject_orphaned_result(store: &mut KernelStore, kp: KRef) -> Result<(), KernelError> {
    if store.promise_state(kp)? == PromiseStateTag::Unresolved {
        resolve_one(
            store,
            store.promise_decider(kp)?,
            kp,
            true,
            CapData::error(UNRESOLVABLE_TARGET_ERROR),
        )?;
    }
    Ok(())
}

/// Reject with an explicit error payload, bypassing the decider check; used
/// by the crank for delivery errors and vat termination.
pub fn reject_with(store: &mut KernelStore, kp: KRef, error: CapData) -> Result<(), KernelError> {
    if store.promise_state(kp)? != PromiseStateTag::Unresolved {
        return Ok(());
    }
    let decider = store.promise_decider(kp)?;
    resolve_one(store, decider, kp, true, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::Message;
    use kestrel_common::capdata::kref_marker;
    use kestrel_storage::InMemoryBackend;
    use std::sync::Arc;

    fn fresh_store() -> KernelStore {
        KernelStore::new(Arc::new(InMemoryBackend::new()))
    }

    #[test]
    fn resolving_to_a_promise_forwards_and_moves_waiters() {
        let mut store = fresh_store();
        let first = store.allocate_promise(None).expect("allocate");
        let second = store.allocate_promise(None).expect("allocate");
        store
            .add_promise_subscriber(first, VatId(3))
            .expect("subscribe");

        let value = CapData::single_slot(second);
        resolve_batch(&mut store, None, vec![(first, false, value)]).expect("resolve");

        assert_eq!(
            store.promise_state(first).expect("state"),
            PromiseStateTag::Forwarded
        );
        assert_eq!(chase_forwards(&store, first).expect("chase"), second);
        assert_eq!(
            store.promise_subscribers(second).expect("subs"),
            vec![VatId(3)]
        );
    }

    #[test]
    fn self_resolution_rejects_with_cycle_error() {
        let mut store = fresh_store();
        let kp = store.allocate_promise(None).expect("allocate");
        let value = CapData::single_slot(kp);
        resolve_batch(&mut store, None, vec![(kp, false, value)]).expect("resolve");
        assert_eq!(
            store.promise_state(kp).expect("state"),
            PromiseStateTag::Rejected
        );
        let stored = store.promise_value(kp).expect("value").expect("capdata");
        assert!(stored.is_error());
        assert!(stored.body.contains(CYCLE_ERROR));
    }

    #[test]
    fn cycle_through_a_chain_rejects() {
        let mut store = fresh_store();
        let a = store.allocate_promise(None).expect("allocate");
        let b = store.allocate_promise(None).expect("allocate");
        resolve_batch(&mut store, None, vec![(a, false, CapData::single_slot(b))])
            .expect("forward a to b");
        // now resolve b to a, which chases back to b itself
        resolve_batch(&mut store, None, vec![(b, false, CapData::single_slot(a))])
            .expect("resolve");
        assert_eq!(
            store.promise_state(b).expect("state"),
            PromiseStateTag::Rejected
        );
    }

    #[test]
    fn resolving_to_resolved_promise_short_circuits() {
        let mut store = fresh_store();
        let settled = store.allocate_promise(None).expect("allocate");
        resolve_batch(
            &mut store,
            None,
            vec![(settled, false, CapData::string("payload"))],
        )
        .expect("resolve");

        let chained = store.allocate_promise(None).expect("allocate");
        resolve_batch(
            &mut store,
            None,
            vec![(chained, false, CapData::single_slot(settled))],
        )
        .expect("resolve");
        assert_eq!(
            store.promise_state(chained).expect("state"),
            PromiseStateTag::Fulfilled
        );
        assert_eq!(
            store
                .promise_value(chained)
                .expect("value")
                .expect("capdata")
                .as_string()
                .as_deref(),
            Some("payload")
        );
    }

    #[test]
    fn queued_sends_retarget_to_object_resolution() {
        let mut store = fresh_store();
        let kp = store.allocate_promise(None).expect("allocate");
        let target = store
            .allocate_object(&kestrel_common::EndpointId::Kernel)
            .expect("allocate");
        store
            .enqueue_promise_message(
                kp,
                &RunQueueItem::Send {
                    target: kp,
                    message: Message::new("poke", CapData::null(), None),
                },
            )
            .expect("enqueue");

        let value = CapData::from_value(&kref_marker(target)).expect("marshal");
        resolve_batch(&mut store, None, vec![(kp, false, value)]).expect("resolve");

        assert_eq!(store.promise_queue_length(kp).expect("len"), 0);
        assert_eq!(store.run_queue_length().expect("len"), 1);
        match store.dequeue_run().expect("dequeue").expect("item") {
            RunQueueItem::Send { target: t, .. } => assert_eq!(t, target),
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn queued_sends_to_data_resolution_reject_their_results() {
        let mut store = fresh_store();
        let kp = store.allocate_promise(None).expect("allocate");
        let orphan_result = store.allocate_promise(None).expect("allocate");
        store
            .enqueue_promise_message(
                kp,
                &RunQueueItem::Send {
                    target: kp,
                    message: Message::new("poke", CapData::null(), Some(orphan_result)),
                },
            )
            .expect("enqueue");

        resolve_batch(&mut store, None, vec![(kp, false, CapData::string("just data"))])
            .expect("resolve");
        assert_eq!(
            store.promise_state(orphan_result).expect("state"),
            PromiseStateTag::Rejected
        );
    }

    #[test]
    fn decider_mismatch_is_refused() {
        let mut store = fresh_store();
        let kp = store.allocate_promise(Some(VatId(1))).expect("allocate");
        let result = resolve_batch(
            &mut store,
            Some(VatId(2)),
            vec![(kp, false, CapData::null())],
        );
        assert!(matches!(result, Err(KernelError::Internal(_))));
    }
}
