//! The crank: one delivery per turn of the kernel's cooperative loop.
//!
//! Each crank opens the store's outermost transaction, pops exactly one
//! unit of work (a pending GC action group takes priority over the run
//! queue), and only then opens the named savepoint around the delivery
//! itself. The ordering matters: a failing worker rolls back to the
//! savepoint, which must discard the delivery's effects but never un-pop
//! the work item — a failed delivery is consumed, its result promise
//! rejects, and the crank commits that recovery.

use crate::error::KernelError;
use crate::gc;
use crate::promise;
use crate::services::{ServiceContext, ServiceReply};
use crate::translator;
use crate::vat::{
    MAX_CONSECUTIVE_CRASHES, SyscallResult, SyscallSink, VatCapData, VatDelivery, VatSyscall,
};
use crate::Kernel;
use kestrel_common::{
    CapData, EndpointId, GcActionKind, KRef, Message, RunQueueItem, VRef, VatId,
};
use kestrel_storage::{GcAction, KernelStore, PromiseStateTag};
use tracing::{debug, trace, warn};

pub(crate) const NO_ENDPOINT_ERROR: &str = "no endpoint";
pub(crate) const REVOKED_ERROR: &str = "revoked object";

/// What became of one delivery attempt.
enum DeliveryOutcome {
    Completed { exit: Option<(bool, CapData)> },
    Failed(String),
    VatGone,
}

/// One popped unit of crank work.
enum CrankWork {
    Gc {
        vat: VatId,
        kind: GcActionKind,
        krefs: Vec<KRef>,
    },
    Item(RunQueueItem),
}

impl Kernel {
    /// Run one crank. Returns false when there was nothing to do.
    pub(crate) async fn crank(&mut self) -> Result<bool, KernelError> {
        if !self.store.has_gc_actions()? && self.store.run_queue_length()? == 0 {
            return Ok(false);
        }
        self.store.begin_crank()?;
        let seq = self.store.increment_crank_number()?;
        // pop before the savepoint so a delivery rollback cannot un-pop
        // the work item
        let work = match self.store.take_gc_action_group()? {
            Some((vat, kind, krefs)) => Some(CrankWork::Gc { vat, kind, krefs }),
            None => self.store.dequeue_run()?.map(CrankWork::Item),
        };
        let Some(work) = work else {
            self.store.commit_crank()?;
            return Ok(false);
        };
        let savepoint = format!("crank_{seq}");
        self.store.savepoint(&savepoint)?;
        trace!(crank = seq, "crank start");

        match self.crank_body(&savepoint, work).await {
            Ok(()) => {
                self.store.collect_candidates()?;
                self.store.release_savepoint(&savepoint)?;
                self.store.commit_crank()?;
            }
            Err(err) => {
                // internal errors abort without committing
                self.store.abort_crank()?;
                return Err(err);
            }
        }
        self.flush_remote().await?;
        Ok(true)
    }

    async fn crank_body(&mut self, savepoint: &str, work: CrankWork) -> Result<(), KernelError> {
        match work {
            CrankWork::Gc { vat, kind, krefs } => {
                self.dispatch_gc_group(savepoint, vat, kind, krefs).await
            }
            CrankWork::Item(RunQueueItem::Send { target, message }) => {
                self.deliver_send(savepoint, target, message).await
            }
            CrankWork::Item(RunQueueItem::Notify { vat, kp }) => {
                self.deliver_notify(savepoint, vat, kp).await
            }
            CrankWork::Item(RunQueueItem::GcAction { vat, kind, krefs }) => {
                self.dispatch_gc_group(savepoint, vat, kind, krefs).await
            }
            CrankWork::Item(RunQueueItem::BringOutYourDead { vat }) => self
                .deliver_to_vat(savepoint, vat, VatDelivery::BringOutYourDead, None)
                .await
                .map(|_| ()),
        }
    }

    async fn dispatch_gc_group(
        &mut self,
        savepoint: &str,
        vat: VatId,
        kind: GcActionKind,
        krefs: Vec<KRef>,
    ) -> Result<(), KernelError> {
        match gc::action_group_to_delivery(&mut self.store, vat, kind, krefs)? {
            Some(delivery) => self
                .deliver_to_vat(savepoint, vat, delivery, None)
                .await
                .map(|_| ()),
            None => Ok(()),
        }
    }

    /// Route a send by its target's kind and owner.
    async fn deliver_send(
        &mut self,
        savepoint: &str,
        target: KRef,
        message: Message,
    ) -> Result<(), KernelError> {
        if target.is_promise() {
            return self.deliver_send_to_promise(target, message);
        }

        if !self.store.object_exists(target)? {
            return self.reject_result(
                &message,
                CapData::error(&format!("{NO_ENDPOINT_ERROR} for {target}")),
            );
        }
        if self.store.is_revoked(target)? {
            debug!(%target, "send to revoked object");
            return self.reject_result(
                &message,
                CapData::error(&format!("{REVOKED_ERROR} {target}")),
            );
        }
        match self.store.object_owner(target)? {
            None => self.reject_result(
                &message,
                CapData::error(&format!("{NO_ENDPOINT_ERROR} for {target}")),
            ),
            Some(EndpointId::Kernel) => self.dispatch_service_send(target, message).await,
            Some(EndpointId::Remote(peer)) => self.dispatch_remote_send(&peer, target, message),
            Some(EndpointId::Vat(vat)) => {
                if !self.vats.contains_key(&vat) {
                    return self.reject_result(
                        &message,
                        CapData::error(&format!("{NO_ENDPOINT_ERROR} for {target}")),
                    );
                }
                if let Some(result) = message.result {
                    // the target vat decides the result from here on
                    self.store.set_promise_decider(result, Some(vat))?;
                }
                let vat_target = translator::kref_to_vref(&mut self.store, vat, target)?;
                let vat_message =
                    translator::kernel_message_to_vat(&mut self.store, vat, &message)?;
                self.deliver_to_vat(
                    savepoint,
                    vat,
                    VatDelivery::Message {
                        target: vat_target,
                        message: vat_message,
                    },
                    message.result,
                )
                .await
                .map(|_| ())
            }
        }
    }

    /// A send aimed at a promise: queue on unresolved, chase resolved.
    fn deliver_send_to_promise(&mut self, target: KRef, message: Message) -> Result<(), KernelError> {
        let terminal = promise::chase_forwards(&self.store, target)?;
        match self.store.promise_state(terminal)? {
            PromiseStateTag::Unresolved => {
                self.store.enqueue_promise_message(
                    terminal,
                    &RunQueueItem::Send {
                        target: terminal,
                        message,
                    },
                )?;
                Ok(())
            }
            PromiseStateTag::Fulfilled => {
                let value = self
                    .store
                    .promise_value(terminal)?
                    .ok_or_else(|| KernelError::Internal(format!("{terminal} lost its value")))?;
                match value.sole_slot().filter(KRef::is_object) {
                    Some(object) => {
                        // re-queue at the resolution target
                        self.store.enqueue_run(&RunQueueItem::Send {
                            target: object,
                            message,
                        })?;
                        Ok(())
                    }
                    None => self.reject_result(
                        &message,
                        CapData::error(promise::UNRESOLVABLE_TARGET_ERROR),
                    ),
                }
            }
            PromiseStateTag::Rejected => {
                let value = self
                    .store
                    .promise_value(terminal)?
                    .unwrap_or_else(|| CapData::error(promise::UNRESOLVABLE_TARGET_ERROR));
                self.reject_result(&message, value)
            }
            PromiseStateTag::Forwarded => Err(KernelError::Internal(format!(
                "{terminal} is not a chain terminal"
            ))),
        }
    }

    /// Send aimed at a kernel service object.
    async fn dispatch_service_send(
        &mut self,
        target: KRef,
        message: Message,
    ) -> Result<(), KernelError> {
        let Some(name) = self.store.service_name_for(target)? else {
            return self.reject_result(
                &message,
                CapData::error(&format!("{NO_ENDPOINT_ERROR} for {target}")),
            );
        };
        let Some(service) = self.services.get(&name) else {
            return self.reject_result(
                &message,
                CapData::error(&format!("no registered kernel service '{name}'")),
            );
        };
        debug!(service = %name, method = %message.method, "kernel service call");

        let mut scratch_outbox = Vec::new();
        let mut scratch_redemptions = std::collections::HashMap::new();
        let reply = {
            let (peer_id, outbox, pending) = match self.remote.as_mut() {
                Some(remote) => (
                    Some(remote.comms.peer_id().clone()),
                    &mut remote.outbox,
                    &mut remote.pending_redemptions,
                ),
                None => (None, &mut scratch_outbox, &mut scratch_redemptions),
            };
            let mut ctx = ServiceContext {
                store: &mut self.store,
                peer_id,
                outbox,
                pending_redemptions: pending,
            };
            service
                .handle(&mut ctx, &message.method, message.args.clone())
                .await
        };
        match reply {
            Ok(ServiceReply::Data(value)) => {
                if let Some(result) = message.result {
                    let rejected = value.is_error();
                    promise::resolve_batch(
                        &mut self.store,
                        None,
                        vec![(result, rejected, value)],
                    )?;
                }
                Ok(())
            }
            Ok(ServiceReply::Promise(kp)) => {
                if let Some(result) = message.result {
                    promise::resolve_batch(
                        &mut self.store,
                        None,
                        vec![(result, false, CapData::single_slot(kp))],
                    )?;
                }
                Ok(())
            }
            Err(err) => self.reject_result(&message, CapData::error(&err.to_string())),
        }
    }

    /// Deliver a resolution description to a subscriber.
    async fn deliver_notify(
        &mut self,
        savepoint: &str,
        vat: VatId,
        kp: KRef,
    ) -> Result<(), KernelError> {
        if !self.vats.contains_key(&vat) {
            return Ok(());
        }
        let terminal = promise::chase_forwards(&self.store, kp)?;
        let snapshot = self.store.promise_snapshot(terminal)?;
        let (rejected, value) = match (&snapshot.state, snapshot.value) {
            (PromiseStateTag::Fulfilled, Some(value)) => (false, value),
            (PromiseStateTag::Rejected, Some(value)) => (true, value),
            _ => {
                // raced with a rollback; nothing to tell the vat
                return Ok(());
            }
        };
        let vref = translator::kref_to_vref(&mut self.store, vat, terminal)?;
        let vat_value = translator::kernel_capdata_to_vat(&mut self.store, vat, &value)?;
        let delivered = self
            .deliver_to_vat(
                savepoint,
                vat,
                VatDelivery::Notify {
                    resolutions: vec![(vref, rejected, vat_value)],
                },
                None,
            )
            .await?;
        if !delivered {
            // rolled back: the vat never saw the resolution, keep its entry
            return Ok(());
        }
        // the vat has seen the resolution; its c-list entry retires
        if self.store.clist_entry(vat, terminal)?.is_some() {
            self.store.delete_clist_entry(vat, terminal)?;
        }
        if kp != terminal && self.store.clist_entry(vat, kp)?.is_some() {
            self.store.delete_clist_entry(vat, kp)?;
        }
        Ok(())
    }

    /// Hand a delivery to a vat worker, with the crash/restart/replay
    /// policy: one replay after a restart, termination after
    /// [`MAX_CONSECUTIVE_CRASHES`] crashes in a row. Returns whether the
    /// worker actually completed the delivery; `false` means the crank's
    /// savepoint was rolled back (failure, crash-out, or vat gone) and any
    /// result promise has been rejected.
    async fn deliver_to_vat(
        &mut self,
        savepoint: &str,
        vat: VatId,
        delivery: VatDelivery,
        result: Option<KRef>,
    ) -> Result<bool, KernelError> {
        let mut replayed = false;
        let outcome = loop {
            let Kernel { store, vats, .. } = self;
            let Some(supervisor) = vats.get_mut(&vat) else {
                break DeliveryOutcome::VatGone;
            };
            let mut sink = KernelSink {
                store,
                vat,
                exit: None,
            };
            match supervisor.deliver(delivery.clone(), &mut sink).await {
                Ok(()) => {
                    break DeliveryOutcome::Completed { exit: sink.exit };
                }
                Err(crate::vat::VatWorkerError::DeliveryFailed(detail)) => {
                    warn!(%vat, %detail, "delivery failed");
                    self.store.rollback_to_savepoint(savepoint)?;
                    break DeliveryOutcome::Failed(detail);
                }
                Err(crate::vat::VatWorkerError::Crashed(detail)) => {
                    warn!(%vat, %detail, "vat worker crashed");
                    self.store.rollback_to_savepoint(savepoint)?;
                    let crashes = match self.vats.get_mut(&vat) {
                        Some(supervisor) => supervisor.restart()?,
                        None => break DeliveryOutcome::VatGone,
                    };
                    if crashes >= MAX_CONSECUTIVE_CRASHES || replayed {
                        self.vats.remove(&vat);
                        gc::terminate_vat_state(&mut self.store, vat)?;
                        break DeliveryOutcome::VatGone;
                    }
                    // replay the delivery once against the fresh worker
                    replayed = true;
                }
            }
        };

        match outcome {
            DeliveryOutcome::Completed { exit } => {
                if let Some((failure, info)) = exit {
                    debug!(%vat, failure, "vat requested exit");
                    self.vats.remove(&vat);
                    gc::terminate_vat_state(&mut self.store, vat)?;
                    if let Some(kp) = result {
                        if failure {
                            promise::reject_with(&mut self.store, kp, info)?;
                        }
                    }
                }
                Ok(true)
            }
            DeliveryOutcome::Failed(detail) => {
                if let Some(kp) = result {
                    promise::reject_with(
                        &mut self.store,
                        kp,
                        CapData::error(&format!("delivery failed: {detail}")),
                    )?;
                }
                Ok(false)
            }
            DeliveryOutcome::VatGone => {
                if let Some(kp) = result {
                    promise::reject_with(
                        &mut self.store,
                        kp,
                        CapData::error(promise::VAT_TERMINATED_ERROR),
                    )?;
                }
                Ok(false)
            }
        }
    }

    fn reject_result(&mut self, message: &Message, error: CapData) -> Result<(), KernelError> {
        if let Some(kp) = message.result {
            promise::reject_with(&mut self.store, kp, error)?;
        }
        Ok(())
    }
}

/// Applies a worker's syscalls against the store under the active
/// savepoint.
struct KernelSink<'a> {
    store: &'a mut KernelStore,
    vat: VatId,
    exit: Option<(bool, CapData)>,
}

impl KernelSink<'_> {
    fn send(&mut self, target: VRef, message: crate::vat::VatMessage) -> Result<(), KernelError> {
        let target_kref = translator::vref_to_kref(self.store, self.vat, target)?;
        let kernel_message =
            translator::vat_message_to_kernel(self.store, self.vat, &message)?;
        self.store.enqueue_run(&RunQueueItem::Send {
            target: target_kref,
            message: kernel_message,
        })?;
        Ok(())
    }

    fn resolve(
        &mut self,
        resolutions: Vec<(VRef, bool, VatCapData)>,
    ) -> Result<(), KernelError> {
        let mut batch = Vec::with_capacity(resolutions.len());
        for (vref, rejected, value) in resolutions {
            let kp = translator::vref_to_kref(self.store, self.vat, vref)?;
            let capdata = translator::vat_capdata_to_kernel(self.store, self.vat, &value)?;
            batch.push((kp, rejected, capdata));
        }
        let resolved: Vec<KRef> = batch.iter().map(|(kp, _, _)| *kp).collect();
        promise::resolve_batch(self.store, Some(self.vat), batch)?;
        // the resolver is done with these promises; retire its entries
        for kp in resolved {
            if self.store.clist_entry(self.vat, kp)?.is_some() {
                self.store.delete_clist_entry(self.vat, kp)?;
            }
        }
        Ok(())
    }

    fn drop_imports(&mut self, vrefs: Vec<VRef>) -> Result<(), KernelError> {
        for vref in vrefs {
            if let Some(kref) = self.store.clist_kref(self.vat, vref)? {
                self.store.set_clist_reachable(self.vat, kref, false)?;
            }
        }
        Ok(())
    }

    fn retire_imports(&mut self, vrefs: Vec<VRef>) -> Result<(), KernelError> {
        for vref in vrefs {
            if let Some(kref) = self.store.clist_kref(self.vat, vref)? {
                self.store.delete_clist_entry(self.vat, kref)?;
            }
        }
        Ok(())
    }

    /// The vat no longer references its own export. Remaining recognizers
    /// retire at the next GC cycle; the object itself dies once they do.
    fn retire_exports(&mut self, vrefs: Vec<VRef>) -> Result<(), KernelError> {
        for vref in vrefs {
            if let Some(kref) = self.store.clist_kref(self.vat, vref)? {
                for recognizer in self.store.vats_recognizing(kref)? {
                    self.store.add_gc_action(GcAction {
                        kind: GcActionKind::RetireImports,
                        vat: recognizer,
                        kref,
                    })?;
                }
                self.store.delete_clist_entry(self.vat, kref)?;
                self.store.add_maybe_free(kref)?;
            }
        }
        Ok(())
    }

    fn abandon_exports(&mut self, vrefs: Vec<VRef>) -> Result<(), KernelError> {
        for vref in vrefs {
            if let Some(kref) = self.store.clist_kref(self.vat, vref)? {
                self.store.delete_clist_entry(self.vat, kref)?;
                gc::abandon_export(self.store, kref)?;
            }
        }
        Ok(())
    }
}

impl SyscallSink for KernelSink<'_> {
    fn syscall(&mut self, syscall: VatSyscall) -> Result<SyscallResult, KernelError> {
        trace!(vat = %self.vat, ?syscall, "syscall");
        match syscall {
            VatSyscall::Send { target, message } => {
                self.send(target, message)?;
                Ok(SyscallResult::Ok)
            }
            VatSyscall::Subscribe { vref } => {
                let kp = translator::vref_to_kref(self.store, self.vat, vref)?;
                promise::subscribe(self.store, self.vat, kp)?;
                Ok(SyscallResult::Ok)
            }
            VatSyscall::Resolve { resolutions } => {
                self.resolve(resolutions)?;
                Ok(SyscallResult::Ok)
            }
            VatSyscall::Exit { failure, info } => {
                let capdata =
                    translator::vat_capdata_to_kernel(self.store, self.vat, &info)?;
                self.exit = Some((failure, capdata));
                Ok(SyscallResult::Ok)
            }
            VatSyscall::VatstoreGet { key } => Ok(SyscallResult::Value(
                self.store.vatstore_get(self.vat, &key)?,
            )),
            VatSyscall::VatstoreSet { key, value } => {
                self.store.vatstore_set(self.vat, &key, &value)?;
                Ok(SyscallResult::Ok)
            }
            VatSyscall::VatstoreDelete { key } => {
                self.store.vatstore_delete(self.vat, &key)?;
                Ok(SyscallResult::Ok)
            }
            VatSyscall::VatstoreGetNextKey { after } => Ok(SyscallResult::Value(
                self.store.vatstore_next_key(self.vat, &after)?,
            )),
            VatSyscall::DropImports { vrefs } => {
                self.drop_imports(vrefs)?;
                Ok(SyscallResult::Ok)
            }
            VatSyscall::RetireImports { vrefs } => {
                self.retire_imports(vrefs)?;
                Ok(SyscallResult::Ok)
            }
            VatSyscall::RetireExports { vrefs } => {
                self.retire_exports(vrefs)?;
                Ok(SyscallResult::Ok)
            }
            VatSyscall::AbandonExports { vrefs } => {
                self.abandon_exports(vrefs)?;
                Ok(SyscallResult::Ok)
            }
            VatSyscall::CallKernelService { service, message } => {
                self.send(service, message)?;
                Ok(SyscallResult::Ok)
            }
        }
    }
}
