//! Subcluster lifecycle: launch, reload, terminate.
//!
//! A subcluster is a configured group of vats launched together. The
//! designated bootstrap vat receives a synthetic `bootstrap` delivery whose
//! first argument records every co-launched root object by name and whose
//! second records the granted kernel services.

use crate::error::KernelError;
use crate::vat::VatSupervisor;
use crate::{Kernel, gc};
use kestrel_common::capdata::kref_marker;
use kestrel_common::{
    CapData, Message, RunQueueItem, SubclusterConfig, SubclusterId, SubclusterRecord, VRef, VatId,
    VatRecord,
};
use kestrel_common::EndpointId;
use kestrel_storage::PromiseStateTag;
use serde_json::{Value, json};
use tracing::{debug, info};

/// Outcome of a subcluster launch.
#[derive(Debug, Clone)]
pub struct SubclusterLaunch {
    pub subcluster_id: SubclusterId,
    pub bootstrap_result: CapData,
}

impl Kernel {
    /// Launch a configured group of vats and run their bootstrap to
    /// completion.
    pub async fn launch_subcluster(
        &mut self,
        config: SubclusterConfig,
    ) -> Result<SubclusterLaunch, KernelError> {
        // fail fast before any state is allocated
        for name in &config.services {
            if !self.service_registry().contains(name) {
                return Err(KernelError::UnknownService(name.clone()));
            }
        }
        if config.vat_named(&config.bootstrap).is_none() {
            return Err(KernelError::SubclusterInit(format!(
                "no vat named `{}` to bootstrap",
                config.bootstrap
            )));
        }
        for vat_config in &config.vats {
            if !self.factories.contains_key(&vat_config.bundle) {
                return Err(KernelError::UnknownBundle(vat_config.bundle.clone()));
            }
        }

        if config.force_reset {
            self.discard_matching_subclusters(&config).await?;
        }

        let sid = self.store.allocate_subcluster_id()?;
        let record = self.launch_vats(sid, &config)?;
        self.store.set_subcluster(&record)?;
        info!(subcluster = %sid, vats = record.vats.len(), "subcluster launched");

        let bootstrap_result = self.run_bootstrap(&record).await?;
        Ok(SubclusterLaunch {
            subcluster_id: sid,
            bootstrap_result,
        })
    }

    /// Allocate vat ids, mint roots, and start workers for every vat in
    /// the config.
    fn launch_vats(
        &mut self,
        sid: SubclusterId,
        config: &SubclusterConfig,
    ) -> Result<SubclusterRecord, KernelError> {
        let mut vats = Vec::with_capacity(config.vats.len());
        for vat_config in &config.vats {
            let vat = self.store.allocate_vat_id()?;
            let root = self.store.allocate_object(&EndpointId::Vat(vat))?;
            self.store
                .add_clist_entry(vat, root, VRef::ROOT_OBJECT, true)?;
            let record = VatRecord {
                name: vat_config.name.clone(),
                bundle: vat_config.bundle.clone(),
                parameters: vat_config.parameters.clone(),
                subcluster: sid,
                root,
            };
            self.store.set_vat_record(vat, &record)?;
            let factory = self
                .factories
                .get(&vat_config.bundle)
                .cloned()
                .ok_or_else(|| KernelError::UnknownBundle(vat_config.bundle.clone()))?;
            let supervisor = VatSupervisor::launch(
                vat,
                &vat_config.bundle,
                vat_config.parameters.clone(),
                factory,
            )?;
            self.vats.insert(vat, supervisor);
            debug!(%vat, name = %vat_config.name, bundle = %vat_config.bundle, "vat launched");
            vats.push((vat_config.name.clone(), vat));
        }
        let bootstrap_vat = vats
            .iter()
            .find(|(name, _)| *name == config.bootstrap)
            .map(|(_, vat)| *vat)
            .ok_or_else(|| {
                KernelError::SubclusterInit(format!("no vat named `{}`", config.bootstrap))
            })?;
        Ok(SubclusterRecord {
            id: sid,
            bootstrap_vat,
            vats,
            services: config.services.clone(),
            config: config.clone(),
        })
    }

    /// Deliver `bootstrap(roots, services)` to the bootstrap vat and wait
    /// for its result. An uncaught failure during bootstrap is fatal to the
    /// launch.
    async fn run_bootstrap(
        &mut self,
        record: &SubclusterRecord,
    ) -> Result<CapData, KernelError> {
        let mut roots = serde_json::Map::new();
        for (name, vat) in &record.vats {
            let vat_record = self.store.vat_record(*vat)?;
            roots.insert(name.clone(), kref_marker(vat_record.root));
        }
        let mut services = serde_json::Map::new();
        for name in &record.services {
            let kref = self.ensure_service_kref(name)?;
            services.insert(name.clone(), kref_marker(kref));
        }
        let args = CapData::from_value(&json!([Value::Object(roots), Value::Object(services)]))?;

        let bootstrap_root = self.store.vat_record(record.bootstrap_vat)?.root;
        let kp = self.store.allocate_promise(None)?;
        self.store.pin_kref(kp)?;
        self.store.enqueue_run(&RunQueueItem::Send {
            target: bootstrap_root,
            message: Message::new("bootstrap", args, Some(kp)),
        })?;
        let run = self.run_until_quiescent().await;
        let terminal = crate::promise::chase_forwards(&self.store, kp)?;
        let snapshot = self.store.promise_snapshot(terminal)?;
        self.store.unpin_kref(kp)?;
        self.store.add_maybe_free(kp)?;
        run?;
        match snapshot.state {
            PromiseStateTag::Fulfilled => snapshot
                .value
                .ok_or_else(|| KernelError::SubclusterInit("bootstrap lost its result".into())),
            PromiseStateTag::Rejected => {
                let cause = snapshot
                    .value
                    .and_then(|value| value.error_message())
                    .unwrap_or_else(|| "bootstrap rejected".to_string());
                Err(KernelError::SubclusterInit(cause))
            }
            _ => Err(KernelError::SubclusterInit(
                "bootstrap did not complete".into(),
            )),
        }
    }

    pub fn get_subclusters(&self) -> Result<Vec<SubclusterRecord>, KernelError> {
        Ok(self.store.list_subclusters()?)
    }

    pub fn get_subcluster_vats(&self, sid: SubclusterId) -> Result<Vec<VatId>, KernelError> {
        let record = self
            .store
            .subcluster(sid)?
            .ok_or(KernelError::UnknownSubcluster(sid))?;
        Ok(record.vat_ids())
    }

    pub fn is_vat_in_subcluster(
        &self,
        vat: VatId,
        sid: SubclusterId,
    ) -> Result<bool, KernelError> {
        Ok(self
            .store
            .subcluster(sid)?
            .map(|record| record.contains_vat(vat))
            .unwrap_or(false))
    }

    /// Terminate every vat in the subcluster and relaunch from the stored
    /// config under fresh vat ids.
    pub async fn reload_subcluster(
        &mut self,
        sid: SubclusterId,
    ) -> Result<SubclusterLaunch, KernelError> {
        let record = self
            .store
            .subcluster(sid)?
            .ok_or(KernelError::UnknownSubcluster(sid))?;
        for vat in record.vat_ids() {
            self.vats.remove(&vat);
            gc::terminate_vat_state(&mut self.store, vat)?;
        }
        self.run_until_quiescent().await?;

        let new_record = self.launch_vats(sid, &record.config)?;
        self.store.set_subcluster(&new_record)?;
        info!(subcluster = %sid, "subcluster reloaded");
        let bootstrap_result = self.run_bootstrap(&new_record).await?;
        Ok(SubclusterLaunch {
            subcluster_id: sid,
            bootstrap_result,
        })
    }

    /// Terminate the subcluster's vats and drop its record; owned krefs
    /// follow the abandon path.
    pub async fn terminate_subcluster(&mut self, sid: SubclusterId) -> Result<(), KernelError> {
        let record = self
            .store
            .subcluster(sid)?
            .ok_or(KernelError::UnknownSubcluster(sid))?;
        for vat in record.vat_ids() {
            self.vats.remove(&vat);
            gc::terminate_vat_state(&mut self.store, vat)?;
        }
        self.store.delete_subcluster(sid)?;
        self.run_until_quiescent().await?;
        info!(subcluster = %sid, "subcluster terminated");
        Ok(())
    }

    /// Reload every subcluster.
    pub async fn reload(&mut self) -> Result<(), KernelError> {
        for sid in self.subcluster_ids()? {
            self.reload_subcluster(sid).await?;
        }
        Ok(())
    }

    /// `forceReset`: discard persisted state for earlier launches of the
    /// same logical deployment (same bootstrap vat name and vat name set).
    async fn discard_matching_subclusters(
        &mut self,
        config: &SubclusterConfig,
    ) -> Result<(), KernelError> {
        let mut names: Vec<&str> = config.vats.iter().map(|vat| vat.name.as_str()).collect();
        names.sort_unstable();
        for record in self.store.list_subclusters()? {
            let mut existing: Vec<&str> =
                record.vats.iter().map(|(name, _)| name.as_str()).collect();
            existing.sort_unstable();
            if record.config.bootstrap == config.bootstrap && existing == names {
                debug!(subcluster = %record.id, "force reset discards prior subcluster");
                self.terminate_subcluster(record.id).await?;
            }
        }
        Ok(())
    }
}
