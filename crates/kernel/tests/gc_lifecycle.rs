//! Drop/retire lifecycle across an exporter/importer pair, driven by reap
//! sweeps: weaken to (0,1), retire the import to (0,0), then retire the
//! export and watch the object disappear.

mod common;

use async_trait::async_trait;
use common::{empty_args, new_kernel, sole_vat_root};
use kestrel_common::{CapData, VRef, VatId};
use kestrel_kernel::{
    Kernel, KernelError, SyscallSink, VatCapData, VatDelivery, VatSyscall, VatWorker,
    VatWorkerError, VatWorkerFactory,
};
use kestrel_storage::{InMemoryBackend, RefCounts};
use serde_json::{Value, json};
use std::sync::Arc;

fn fail(err: KernelError) -> VatWorkerError {
    VatWorkerError::DeliveryFailed(err.to_string())
}

fn resolve_ok(sink: &mut dyn SyscallSink, result: Option<VRef>) -> Result<(), VatWorkerError> {
    if let Some(result) = result {
        sink.syscall(VatSyscall::Resolve {
            resolutions: vec![(result, false, VatCapData::string("ok"))],
        })
        .map_err(fail)?;
    }
    Ok(())
}

/// Exports one object on request; `forget` retires the export at the next
/// reap.
struct ExporterWorker {
    export: VRef,
    exported: bool,
    forget: bool,
}

struct ExporterFactory;

impl VatWorkerFactory for ExporterFactory {
    fn create(&self, _vat: VatId, _parameters: &Value) -> Result<Box<dyn VatWorker>, KernelError> {
        Ok(Box::new(ExporterWorker {
            export: VRef::export_object(1),
            exported: false,
            forget: false,
        }))
    }
}

#[async_trait(?Send)]
impl VatWorker for ExporterWorker {
    async fn deliver(
        &mut self,
        delivery: VatDelivery,
        sink: &mut dyn SyscallSink,
    ) -> Result<(), VatWorkerError> {
        match delivery {
            VatDelivery::Message { message, .. } => match message.method.as_str() {
                "bootstrap" => resolve_ok(sink, message.result),
                "export" => {
                    self.exported = true;
                    if let Some(result) = message.result {
                        sink.syscall(VatSyscall::Resolve {
                            resolutions: vec![(
                                result,
                                false,
                                VatCapData::single_slot(self.export),
                            )],
                        })
                        .map_err(fail)?;
                    }
                    Ok(())
                }
                "forget" => {
                    self.forget = true;
                    resolve_ok(sink, message.result)
                }
                _ => resolve_ok(sink, message.result),
            },
            VatDelivery::BringOutYourDead => {
                if self.forget && self.exported {
                    self.exported = false;
                    sink.syscall(VatSyscall::RetireExports {
                        vrefs: vec![self.export],
                    })
                    .map_err(fail)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Stores one import; `makeWeak` downgrades it to recognizable-only and
/// `forgetImport` retires it, both taking effect at the next reap.
struct ImporterWorker {
    stored: Option<VRef>,
    weaken: bool,
    forget: bool,
}

struct ImporterFactory;

impl VatWorkerFactory for ImporterFactory {
    fn create(&self, _vat: VatId, _parameters: &Value) -> Result<Box<dyn VatWorker>, KernelError> {
        Ok(Box::new(ImporterWorker {
            stored: None,
            weaken: false,
            forget: false,
        }))
    }
}

#[async_trait(?Send)]
impl VatWorker for ImporterWorker {
    async fn deliver(
        &mut self,
        delivery: VatDelivery,
        sink: &mut dyn SyscallSink,
    ) -> Result<(), VatWorkerError> {
        match delivery {
            VatDelivery::Message { message, .. } => match message.method.as_str() {
                "bootstrap" => resolve_ok(sink, message.result),
                "store" => {
                    self.stored = message.args.slots.first().copied();
                    resolve_ok(sink, message.result)
                }
                "makeWeak" => {
                    self.weaken = true;
                    resolve_ok(sink, message.result)
                }
                "forgetImport" => {
                    self.forget = true;
                    resolve_ok(sink, message.result)
                }
                _ => resolve_ok(sink, message.result),
            },
            VatDelivery::BringOutYourDead => {
                if let Some(stored) = self.stored {
                    if self.forget {
                        self.stored = None;
                        sink.syscall(VatSyscall::RetireImports {
                            vrefs: vec![stored],
                        })
                        .map_err(fail)?;
                    } else if self.weaken {
                        self.weaken = false;
                        sink.syscall(VatSyscall::DropImports {
                            vrefs: vec![stored],
                        })
                        .map_err(fail)?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

async fn reap(kernel: &mut Kernel) {
    kernel.reap_all_vats().expect("schedule reap");
    kernel.run_until_quiescent().await.expect("quiesce");
    kernel.collect_garbage().await.expect("collect");
}

#[tokio::test]
async fn drop_retire_lifecycle() {
    let backend = InMemoryBackend::new();
    let mut kernel = new_kernel(&backend);
    kernel.register_bundle("exporter", Arc::new(ExporterFactory));
    kernel.register_bundle("importer", Arc::new(ImporterFactory));

    let config = serde_json::from_value(json!({
        "bootstrap": "exporter",
        "vats": [
            { "name": "exporter", "bundle": "exporter" },
            { "name": "importer", "bundle": "importer" }
        ]
    }))
    .expect("valid config");
    let launch = kernel.launch_subcluster(config).await.expect("launch");
    let vats = kernel
        .get_subcluster_vats(launch.subcluster_id)
        .expect("vats");
    let exporter_root = sole_vat_root(&kernel, vats[0]);
    let importer_root = sole_vat_root(&kernel, vats[1]);

    // exporter mints the object and hands it to the host
    let reply = kernel
        .queue_message(exporter_root, "export", empty_args())
        .await
        .expect("export");
    let object = reply.sole_slot().expect("exported kref");

    // importer stores it: reachable in one non-owner c-list
    kernel
        .queue_message(importer_root, "store", CapData::single_slot(object))
        .await
        .expect("store");
    kernel.collect_garbage().await.expect("collect");
    assert_eq!(
        kernel.store().ref_counts(object).expect("counts"),
        RefCounts {
            reachable: 1,
            recognizable: 1
        }
    );

    // weak reference: reachable drops, recognizable stays
    kernel
        .queue_message(importer_root, "makeWeak", empty_args())
        .await
        .expect("makeWeak");
    reap(&mut kernel).await;
    assert_eq!(
        kernel.store().ref_counts(object).expect("counts"),
        RefCounts {
            reachable: 0,
            recognizable: 1
        }
    );

    // retire the import entirely
    kernel
        .queue_message(importer_root, "forgetImport", empty_args())
        .await
        .expect("forgetImport");
    reap(&mut kernel).await;
    assert_eq!(
        kernel.store().ref_counts(object).expect("counts"),
        RefCounts {
            reachable: 0,
            recognizable: 0
        }
    );
    assert!(
        kernel.store().object_exists(object).expect("exists"),
        "object lives while the exporter still holds it"
    );

    // exporter lets go: the object is removed from the table
    kernel
        .queue_message(exporter_root, "forget", empty_args())
        .await
        .expect("forget");
    reap(&mut kernel).await;
    reap(&mut kernel).await;
    assert!(!kernel.store().object_exists(object).expect("exists"));

    kernel
        .store()
        .check_ref_count_invariants()
        .expect("invariants hold");
}
