//! The ocap kernel: a persistent, message-passing runtime hosting isolated
//! vats, with promise pipelining, distributed GC, and remote comms.
//!
//! A [`Kernel`] owns a store handle, the live vat supervisors, the kernel
//! service registry, and (once initialized) the remote-comms router. It is
//! an explicit value: hosts construct it, register worker bundles, and
//! drive it by awaiting [`Kernel::run_until_quiescent`] between calls.

pub mod builtin;
pub mod error;
pub mod gc;
pub mod promise;
pub mod services;
pub mod subcluster;
pub mod translator;
pub mod vat;

mod crank;
mod remote;

pub use error::KernelError;
pub use subcluster::SubclusterLaunch;
pub use vat::{
    SyscallResult, SyscallSink, VatCapData, VatDelivery, VatMessage, VatSupervisor, VatSyscall,
    VatWorker, VatWorkerError, VatWorkerFactory,
};

use kestrel_comms::{CommsOptions, OcapUrl, RemoteComms, generate_token};
use kestrel_common::{CapData, EndpointId, KRef, Message, RunQueueItem, SubclusterId, VatId};
use kestrel_storage::{KernelStore, PromiseSnapshot, PromiseStateTag, StorageBackend};
use remote::RemoteState;
use serde::Serialize;
use services::ServiceRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// How long a host call waits for a result that depends on network traffic.
pub const REMOTE_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub struct Kernel {
    store: KernelStore,
    vats: HashMap<VatId, VatSupervisor>,
    factories: HashMap<String, Arc<dyn VatWorkerFactory>>,
    services: ServiceRegistry,
    remote: Option<RemoteState>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("vats", &self.vats.len())
            .field("bundles", &self.factories.len())
            .field("remote", &self.remote.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VatStatus {
    pub id: String,
    pub name: String,
    pub bundle: String,
    pub subcluster: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubclusterStatus {
    pub id: String,
    pub vats: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteCommsStatus {
    pub peer_id: String,
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct KernelStatus {
    pub vats: Vec<VatStatus>,
    pub subclusters: Vec<SubclusterStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_comms: Option<RemoteCommsStatus>,
    pub run_queue_length: u64,
    pub object_count: u64,
    pub promise_count: u64,
    pub crank_number: u64,
}

impl Kernel {
    /// Open a kernel over a backend. Bundles must be registered (and
    /// [`Kernel::resume`] called, when reopening an existing database)
    /// before messages are queued.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Kernel {
        Kernel {
            store: KernelStore::new(backend),
            vats: HashMap::new(),
            factories: HashMap::new(),
            services: ServiceRegistry::with_builtins(),
            remote: None,
        }
    }

    /// Make a worker bundle launchable under `name`.
    pub fn register_bundle(&mut self, name: &str, factory: Arc<dyn VatWorkerFactory>) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Register an additional kernel service.
    pub fn register_service(&mut self, name: &str, service: Arc<dyn services::KernelService>) {
        self.services.register(name, service);
    }

    /// Relaunch workers for every vat recorded in the store. Durable vat
    /// state lives in the vatstore, so no replay is needed.
    pub fn resume(&mut self) -> Result<(), KernelError> {
        for (vat, record) in self.store.list_vats()? {
            if self.vats.contains_key(&vat) {
                continue;
            }
            let factory = self
                .factories
                .get(&record.bundle)
                .cloned()
                .ok_or_else(|| KernelError::UnknownBundle(record.bundle.clone()))?;
            let supervisor =
                VatSupervisor::launch(vat, &record.bundle, record.parameters.clone(), factory)?;
            self.vats.insert(vat, supervisor);
        }
        debug!(vats = self.vats.len(), "kernel resumed");
        Ok(())
    }

    pub fn store(&self) -> &KernelStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut KernelStore {
        &mut self.store
    }

    // ---- host API ----

    /// Queue a method call onto a kernel object and run until its result
    /// settles. The returned CapData is the resolution either way — a
    /// rejection comes back as an `#error` body, not an `Err`.
    pub async fn queue_message(
        &mut self,
        target: KRef,
        method: &str,
        args: CapData,
    ) -> Result<CapData, KernelError> {
        if !self.store.object_exists(target)? && !self.store.promise_exists(target)? {
            return Err(kestrel_storage::StoreError::UnknownObject(target).into());
        }
        let kp = self.store.allocate_promise(None)?;
        // the host itself holds the result until it has read it
        self.store.pin_kref(kp)?;
        self.store.enqueue_run(&RunQueueItem::Send {
            target,
            message: Message::new(method, args, Some(kp)),
        })?;
        let settled = self.run_until_settled(kp, REMOTE_SETTLE_TIMEOUT).await;
        self.store.unpin_kref(kp)?;
        self.store.add_maybe_free(kp)?;
        let snapshot = settled?;
        snapshot
            .value
            .ok_or_else(|| KernelError::Internal(format!("{kp} settled without a value")))
    }

    /// Same entry point for kernel-originated traffic; kept separate so
    /// hosts can distinguish the two in their own plumbing.
    pub async fn queue_message_from_kernel(
        &mut self,
        target: KRef,
        method: &str,
        args: CapData,
    ) -> Result<CapData, KernelError> {
        self.queue_message(target, method, args).await
    }

    pub fn get_status(&self) -> Result<KernelStatus, KernelError> {
        let mut vats = Vec::new();
        for (vat, record) in self.store.list_vats()? {
            vats.push(VatStatus {
                id: vat.to_string(),
                name: record.name,
                bundle: record.bundle,
                subcluster: record.subcluster.to_string(),
            });
        }
        let subclusters = self
            .store
            .list_subclusters()?
            .into_iter()
            .map(|record| SubclusterStatus {
                id: record.id.to_string(),
                vats: record.vats.iter().map(|(_, id)| id.to_string()).collect(),
            })
            .collect();
        let (object_count, promise_count) = self.store.table_sizes()?;
        Ok(KernelStatus {
            vats,
            subclusters,
            remote_comms: self.remote.as_ref().map(|remote| RemoteCommsStatus {
                peer_id: remote.comms.peer_id().to_string(),
                listen_addr: remote.comms.local_addr().to_string(),
            }),
            run_queue_length: self.store.run_queue_length()?,
            object_count,
            promise_count,
            crank_number: self.store.crank_number()?,
        })
    }

    /// Schedule a `bringOutYourDead` sweep over every live vat.
    pub fn reap_all_vats(&mut self) -> Result<(), KernelError> {
        gc::schedule_reap_all(&mut self.store)
    }

    /// Drain pending GC actions and retire anything fully unreferenced.
    pub async fn collect_garbage(&mut self) -> Result<(), KernelError> {
        while self.store.has_gc_actions()? {
            self.crank().await?;
        }
        self.store.collect_candidates()?;
        Ok(())
    }

    /// Discard a vat's worker and relaunch it from its recorded bundle.
    pub fn restart_vat(&mut self, vat: VatId) -> Result<(), KernelError> {
        self.vats
            .get_mut(&vat)
            .ok_or(KernelError::UnknownVat(vat))?
            .restart_clean()
    }

    /// Irrevocably stop a vat; its exports are abandoned and promises it
    /// was deciding reject with `vat terminated`.
    pub fn terminate_vat(&mut self, vat: VatId) -> Result<(), KernelError> {
        if self.vats.remove(&vat).is_none() && !self.store.vat_exists(vat)? {
            return Err(KernelError::UnknownVat(vat));
        }
        gc::terminate_vat_state(&mut self.store, vat)?;
        info!(%vat, "vat terminated");
        Ok(())
    }

    pub fn is_revoked(&self, kref: KRef) -> Result<bool, KernelError> {
        Ok(self.store.is_revoked(kref)?)
    }

    // ---- remote comms ----

    pub async fn init_remote_comms(&mut self, options: CommsOptions) -> Result<(), KernelError> {
        if self.remote.is_some() {
            return Err(KernelError::CommsAlreadyInitialized);
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let comms = RemoteComms::initialize(options, events_tx).await?;
        info!(peer = %comms.peer_id(), addr = %comms.local_addr(), "remote comms initialized");
        self.remote = Some(RemoteState::new(comms, events_rx));
        Ok(())
    }

    pub fn remote_comms(&self) -> Option<&RemoteComms> {
        self.remote.as_ref().map(|remote| &remote.comms)
    }

    /// Issue an opaque URL capability for a local object. Idempotent per
    /// kref.
    pub fn issue_ocap_url(&mut self, kref: KRef) -> Result<String, KernelError> {
        let remote = self.remote.as_ref().ok_or(KernelError::CommsNotInitialized)?;
        if !self.store.object_exists(kref)? {
            return Err(kestrel_storage::StoreError::UnknownObject(kref).into());
        }
        let token = match self.store.ocap_token_for(kref)? {
            Some(token) => token,
            None => {
                let token = generate_token();
                self.store.set_ocap_token(&token, kref)?;
                token
            }
        };
        Ok(OcapUrl::new(remote.comms.peer_id().clone(), token).to_string())
    }

    /// Redeem an OCAP URL. A URL issued by this kernel answers locally; a
    /// foreign one performs the redeem round-trip and mints a remote proxy
    /// kref.
    pub async fn redeem_ocap_url(&mut self, url: &str) -> Result<KRef, KernelError> {
        let parsed: OcapUrl = url.parse()?;
        let remote = self.remote.as_ref().ok_or(KernelError::CommsNotInitialized)?;
        if remote.comms.peer_id() == &parsed.peer {
            return self
                .store
                .ocap_token(&parsed.token)?
                .ok_or_else(|| kestrel_comms::CommsError::UnknownToken(parsed.token).into());
        }
        let redemption_id = generate_token();
        let kp = self.store.allocate_promise(None)?;
        self.store.pin_kref(kp)?;
        let remote = self
            .remote
            .as_mut()
            .ok_or(KernelError::CommsNotInitialized)?;
        remote.pending_redemptions.insert(redemption_id.clone(), kp);
        remote.outbox.push((
            parsed.peer,
            kestrel_comms::Frame::Redeem {
                token: parsed.token,
                result: redemption_id,
            },
        ));
        self.flush_remote().await?;
        let settled = self.run_until_settled(kp, REMOTE_SETTLE_TIMEOUT).await;
        self.store.unpin_kref(kp)?;
        self.store.add_maybe_free(kp)?;
        let snapshot = settled?;
        match snapshot.state {
            PromiseStateTag::Fulfilled => snapshot
                .value
                .and_then(|value| value.sole_slot())
                .ok_or_else(|| KernelError::Internal("redemption yielded no capability".into())),
            _ => {
                let detail = snapshot
                    .value
                    .and_then(|value| value.error_message())
                    .unwrap_or_else(|| "redemption rejected".to_string());
                Err(KernelError::Internal(detail))
            }
        }
    }

    // ---- scheduler entry points ----

    /// Process inbound comms traffic, then run at most one crank. Returns
    /// whether any work was done.
    pub async fn step(&mut self) -> Result<bool, KernelError> {
        let drained = self.drain_comms_events()?;
        let cranked = self.crank().await?;
        if drained && !cranked {
            // inbound handling may have queued reply frames with no crank
            // to flush them
            self.flush_remote().await?;
        }
        Ok(drained || cranked)
    }

    /// Run cranks until the run queue is empty and no GC action is
    /// pending. Network traffic that has not arrived yet does not count as
    /// work; callers waiting on a remote reply poll via
    /// [`Kernel::run_until_settled`].
    pub async fn run_until_quiescent(&mut self) -> Result<(), KernelError> {
        while self.step().await? {}
        Ok(())
    }

    /// Drive the kernel until a promise settles, or time out. Without
    /// remote comms there is nothing to wait for beyond quiescence.
    pub async fn run_until_settled(
        &mut self,
        kp: KRef,
        timeout: Duration,
    ) -> Result<PromiseSnapshot, KernelError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.run_until_quiescent().await?;
            let terminal = promise::chase_forwards(&self.store, kp)?;
            let snapshot = self.store.promise_snapshot(terminal)?;
            if snapshot.state != PromiseStateTag::Unresolved {
                return Ok(snapshot);
            }
            if self.remote.is_none() || tokio::time::Instant::now() >= deadline {
                return Err(KernelError::Timeout(kp));
            }
            tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
        }
    }

    pub(crate) fn subcluster_ids(&self) -> Result<Vec<SubclusterId>, KernelError> {
        Ok(self
            .store
            .list_subclusters()?
            .into_iter()
            .map(|record| record.id)
            .collect())
    }

    pub(crate) fn service_registry(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Kernel object standing for a named service, minted on first use.
    pub(crate) fn ensure_service_kref(&mut self, name: &str) -> Result<KRef, KernelError> {
        if !self.services.contains(name) {
            return Err(KernelError::UnknownService(name.to_string()));
        }
        if let Some(kref) = self.store.service_kref(name)? {
            return Ok(kref);
        }
        let kref = self.store.allocate_object(&EndpointId::Kernel)?;
        self.store.set_service_kref(name, kref)?;
        Ok(kref)
    }
}
