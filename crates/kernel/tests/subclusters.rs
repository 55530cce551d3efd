//! Subcluster lifecycle, kernel services, and the vat failure policy.

mod common;

use async_trait::async_trait;
use common::{counter_config, empty_args, new_kernel, sole_vat_root};
use kestrel_common::{VRef, VatId};
use kestrel_kernel::{
    KernelError, SyscallSink, VatCapData, VatDelivery, VatMessage, VatSyscall, VatWorker,
    VatWorkerError, VatWorkerFactory,
};
use kestrel_storage::InMemoryBackend;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[tokio::test]
async fn unknown_service_name_fails_fast() {
    let backend = InMemoryBackend::new();
    let mut kernel = new_kernel(&backend);
    let config = serde_json::from_value(json!({
        "bootstrap": "main",
        "vats": [{ "name": "main", "bundle": "counter" }],
        "services": ["definitelyNotAService"]
    }))
    .expect("valid config");
    let error = kernel
        .launch_subcluster(config)
        .await
        .expect_err("must fail");
    assert_eq!(
        error.to_string(),
        "no registered kernel service 'definitelyNotAService'"
    );
    // nothing was launched
    assert!(kernel.get_subclusters().expect("list").is_empty());
}

#[tokio::test]
async fn unknown_bundle_fails_fast() {
    let backend = InMemoryBackend::new();
    let mut kernel = new_kernel(&backend);
    let config = serde_json::from_value(json!({
        "bootstrap": "main",
        "vats": [{ "name": "main", "bundle": "no-such-bundle" }]
    }))
    .expect("valid config");
    let error = kernel
        .launch_subcluster(config)
        .await
        .expect_err("must fail");
    assert!(matches!(error, KernelError::UnknownBundle(_)));
}

#[tokio::test]
async fn reload_restarts_with_fresh_vat_ids() {
    let backend = InMemoryBackend::new();
    let mut kernel = new_kernel(&backend);
    let launch = kernel
        .launch_subcluster(counter_config())
        .await
        .expect("launch");
    let old_vats = kernel
        .get_subcluster_vats(launch.subcluster_id)
        .expect("vats");
    let old_root = sole_vat_root(&kernel, old_vats[0]);
    kernel
        .queue_message(old_root, "resume", empty_args())
        .await
        .expect("resume");

    let relaunch = kernel
        .reload_subcluster(launch.subcluster_id)
        .await
        .expect("reload");
    assert_eq!(relaunch.subcluster_id, launch.subcluster_id);
    assert_eq!(
        relaunch.bootstrap_result.as_string().as_deref(),
        Some("Counter initialized with count: 1")
    );
    let new_vats = kernel
        .get_subcluster_vats(launch.subcluster_id)
        .expect("vats");
    assert_ne!(old_vats, new_vats);
    assert!(
        kernel
            .is_vat_in_subcluster(new_vats[0], launch.subcluster_id)
            .expect("membership")
    );
    assert!(
        !kernel
            .is_vat_in_subcluster(old_vats[0], launch.subcluster_id)
            .expect("membership")
    );
}

#[tokio::test]
async fn terminated_subcluster_objects_lose_their_endpoint() {
    let backend = InMemoryBackend::new();
    let mut kernel = new_kernel(&backend);
    let launch = kernel
        .launch_subcluster(counter_config())
        .await
        .expect("launch");
    let vats = kernel
        .get_subcluster_vats(launch.subcluster_id)
        .expect("vats");
    let root = sole_vat_root(&kernel, vats[0]);

    kernel
        .terminate_subcluster(launch.subcluster_id)
        .await
        .expect("terminate");
    assert!(kernel.get_subclusters().expect("list").is_empty());

    let reply = kernel
        .queue_message(root, "resume", empty_args())
        .await
        .expect("queue");
    assert!(reply.is_error());
    assert!(
        reply.body.contains("no endpoint"),
        "unexpected body {}",
        reply.body
    );
}

/// Calls the `logger` kernel service during bootstrap and resolves once the
/// service answers.
struct ServiceUserWorker {
    bootstrap_result: Option<VRef>,
}

struct ServiceUserFactory;

impl VatWorkerFactory for ServiceUserFactory {
    fn create(&self, _vat: VatId, _parameters: &Value) -> Result<Box<dyn VatWorker>, KernelError> {
        Ok(Box::new(ServiceUserWorker {
            bootstrap_result: None,
        }))
    }
}

#[async_trait(?Send)]
impl VatWorker for ServiceUserWorker {
    async fn deliver(
        &mut self,
        delivery: VatDelivery,
        sink: &mut dyn SyscallSink,
    ) -> Result<(), VatWorkerError> {
        match delivery {
            VatDelivery::Message { message, .. } if message.method == "bootstrap" => {
                let args = message
                    .args
                    .to_value()
                    .map_err(|err| VatWorkerError::DeliveryFailed(err.to_string()))?;
                let logger = args
                    .as_array()
                    .and_then(|items| items.get(1))
                    .and_then(|services| services.get("logger"))
                    .and_then(|marker| marker.get("$vref"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        VatWorkerError::DeliveryFailed("no logger service granted".to_string())
                    })?;
                let logger: VRef = logger
                    .parse()
                    .map_err(|_| VatWorkerError::DeliveryFailed("bad service vref".to_string()))?;
                let reply = VRef::export_promise(1);
                sink.syscall(VatSyscall::CallKernelService {
                    service: logger,
                    message: VatMessage {
                        method: "info".to_string(),
                        args: VatCapData::string("vat says hi"),
                        result: Some(reply),
                    },
                })
                .map_err(|err| VatWorkerError::DeliveryFailed(err.to_string()))?;
                sink.syscall(VatSyscall::Subscribe { vref: reply })
                    .map_err(|err| VatWorkerError::DeliveryFailed(err.to_string()))?;
                self.bootstrap_result = message.result;
                Ok(())
            }
            VatDelivery::Notify { .. } => {
                if let Some(result) = self.bootstrap_result.take() {
                    sink.syscall(VatSyscall::Resolve {
                        resolutions: vec![(result, false, VatCapData::string("logged"))],
                    })
                    .map_err(|err| VatWorkerError::DeliveryFailed(err.to_string()))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[tokio::test]
async fn granted_service_answers_vat_calls() {
    let backend = InMemoryBackend::new();
    let mut kernel = new_kernel(&backend);
    kernel.register_bundle("service-user", Arc::new(ServiceUserFactory));
    let config = serde_json::from_value(json!({
        "bootstrap": "main",
        "vats": [{ "name": "main", "bundle": "service-user" }],
        "services": ["logger"]
    }))
    .expect("valid config");
    let launch = kernel.launch_subcluster(config).await.expect("launch");
    assert_eq!(
        launch.bootstrap_result.as_string().as_deref(),
        Some("logged")
    );
}

/// Crashes a configurable number of times before answering `poke`.
struct CrashyWorker {
    crashes: Arc<AtomicU32>,
    crash_limit: u32,
}

struct CrashyFactory {
    crashes: Arc<AtomicU32>,
    crash_limit: u32,
}

impl VatWorkerFactory for CrashyFactory {
    fn create(&self, _vat: VatId, _parameters: &Value) -> Result<Box<dyn VatWorker>, KernelError> {
        Ok(Box::new(CrashyWorker {
            crashes: self.crashes.clone(),
            crash_limit: self.crash_limit,
        }))
    }
}

#[async_trait(?Send)]
impl VatWorker for CrashyWorker {
    async fn deliver(
        &mut self,
        delivery: VatDelivery,
        sink: &mut dyn SyscallSink,
    ) -> Result<(), VatWorkerError> {
        let VatDelivery::Message { message, .. } = delivery else {
            return Ok(());
        };
        match message.method.as_str() {
            "bootstrap" => {
                if let Some(result) = message.result {
                    sink.syscall(VatSyscall::Resolve {
                        resolutions: vec![(result, false, VatCapData::string("ready"))],
                    })
                    .map_err(|err| VatWorkerError::DeliveryFailed(err.to_string()))?;
                }
                Ok(())
            }
            "poke" => {
                if self.crashes.fetch_add(1, Ordering::SeqCst) < self.crash_limit {
                    return Err(VatWorkerError::Crashed("simulated worker death".into()));
                }
                if let Some(result) = message.result {
                    sink.syscall(VatSyscall::Resolve {
                        resolutions: vec![(result, false, VatCapData::string("survived"))],
                    })
                    .map_err(|err| VatWorkerError::DeliveryFailed(err.to_string()))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[tokio::test]
async fn crashed_delivery_is_replayed_once_after_restart() {
    let backend = InMemoryBackend::new();
    let mut kernel = new_kernel(&backend);
    kernel.register_bundle(
        "crashy",
        Arc::new(CrashyFactory {
            crashes: Arc::new(AtomicU32::new(0)),
            crash_limit: 1,
        }),
    );
    let config = serde_json::from_value(json!({
        "bootstrap": "main",
        "vats": [{ "name": "main", "bundle": "crashy" }]
    }))
    .expect("valid config");
    let launch = kernel.launch_subcluster(config).await.expect("launch");
    let vats = kernel
        .get_subcluster_vats(launch.subcluster_id)
        .expect("vats");
    let root = sole_vat_root(&kernel, vats[0]);

    let reply = kernel
        .queue_message(root, "poke", empty_args())
        .await
        .expect("poke");
    assert_eq!(reply.as_string().as_deref(), Some("survived"));
}

#[tokio::test]
async fn persistent_crasher_is_terminated() {
    let backend = InMemoryBackend::new();
    let mut kernel = new_kernel(&backend);
    kernel.register_bundle(
        "crashy",
        Arc::new(CrashyFactory {
            crashes: Arc::new(AtomicU32::new(0)),
            crash_limit: u32::MAX,
        }),
    );
    let config = serde_json::from_value(json!({
        "bootstrap": "main",
        "vats": [{ "name": "main", "bundle": "crashy" }]
    }))
    .expect("valid config");
    let launch = kernel.launch_subcluster(config).await.expect("launch");
    let vats = kernel
        .get_subcluster_vats(launch.subcluster_id)
        .expect("vats");
    let root = sole_vat_root(&kernel, vats[0]);

    let reply = kernel
        .queue_message(root, "poke", empty_args())
        .await
        .expect("poke");
    assert!(reply.is_error());
    assert!(
        reply.body.contains("vat terminated"),
        "unexpected body {}",
        reply.body
    );
    assert!(!kernel.store().vat_exists(vats[0]).expect("exists"));
}

/// Answers `bootstrap`, then fails every other delivery the way user code
/// throwing does.
struct FailingWorker;

struct FailingFactory;

impl VatWorkerFactory for FailingFactory {
    fn create(&self, _vat: VatId, _parameters: &Value) -> Result<Box<dyn VatWorker>, KernelError> {
        Ok(Box::new(FailingWorker))
    }
}

#[async_trait(?Send)]
impl VatWorker for FailingWorker {
    async fn deliver(
        &mut self,
        delivery: VatDelivery,
        sink: &mut dyn SyscallSink,
    ) -> Result<(), VatWorkerError> {
        let VatDelivery::Message { message, .. } = delivery else {
            return Ok(());
        };
        match message.method.as_str() {
            "bootstrap" => {
                if let Some(result) = message.result {
                    sink.syscall(VatSyscall::Resolve {
                        resolutions: vec![(result, false, VatCapData::string("ready"))],
                    })
                    .map_err(|err| VatWorkerError::DeliveryFailed(err.to_string()))?;
                }
                Ok(())
            }
            _ => Err(VatWorkerError::DeliveryFailed("user code threw".into())),
        }
    }
}

#[tokio::test]
async fn failed_delivery_consumes_the_message_and_vat_survives() {
    let backend = InMemoryBackend::new();
    let mut kernel = new_kernel(&backend);
    kernel.register_bundle("failing", Arc::new(FailingFactory));
    let config = serde_json::from_value(json!({
        "bootstrap": "main",
        "vats": [{ "name": "main", "bundle": "failing" }]
    }))
    .expect("valid config");
    let launch = kernel.launch_subcluster(config).await.expect("launch");
    let vats = kernel
        .get_subcluster_vats(launch.subcluster_id)
        .expect("vats");
    let root = sole_vat_root(&kernel, vats[0]);

    // the result rejects exactly once; the message is not redelivered
    let reply = kernel
        .queue_message(root, "poke", empty_args())
        .await
        .expect("poke");
    assert!(reply.is_error());
    assert!(
        reply.body.contains("delivery failed"),
        "unexpected body {}",
        reply.body
    );
    assert_eq!(kernel.store().run_queue_length().expect("len"), 0);

    // the vat continues: it was neither restarted nor terminated
    assert!(kernel.store().vat_exists(vats[0]).expect("exists"));
    let reply = kernel
        .queue_message(root, "bootstrap", empty_args())
        .await
        .expect("bootstrap");
    assert_eq!(reply.as_string().as_deref(), Some("ready"));
}
