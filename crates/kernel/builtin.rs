//! Built-in vat bundles used by the CLI demo config and the integration
//! suites: a persistent counter, a greeter for remote hello flows, and the
//! pipeliner pair exercising promise pipelining.

use crate::error::KernelError;
use crate::vat::{
    SyscallResult, SyscallSink, VatCapData, VatDelivery, VatMessage, VatSyscall, VatWorker,
    VatWorkerError, VatWorkerFactory,
};
use crate::Kernel;
use async_trait::async_trait;
use kestrel_common::{VRef, VatId};
use serde_json::Value;
use std::sync::Arc;

/// Register every built-in bundle on a kernel.
pub fn register_builtin_bundles(kernel: &mut Kernel) {
    kernel.register_bundle("counter", Arc::new(CounterFactory));
    kernel.register_bundle("greeter", Arc::new(GreeterFactory));
    kernel.register_bundle("pipeline-alice", Arc::new(PipelineAliceFactory));
    kernel.register_bundle("pipeline-bob", Arc::new(PipelineBobFactory));
}

fn fail(err: KernelError) -> VatWorkerError {
    VatWorkerError::DeliveryFailed(err.to_string())
}

fn resolve_string(
    sink: &mut dyn SyscallSink,
    result: Option<VRef>,
    text: &str,
) -> Result<(), VatWorkerError> {
    if let Some(result) = result {
        sink.syscall(VatSyscall::Resolve {
            resolutions: vec![(result, false, VatCapData::string(text))],
        })
        .map_err(fail)?;
    }
    Ok(())
}

fn reject(
    sink: &mut dyn SyscallSink,
    result: Option<VRef>,
    message: &str,
) -> Result<(), VatWorkerError> {
    if let Some(result) = result {
        sink.syscall(VatSyscall::Resolve {
            resolutions: vec![(result, true, VatCapData::error(message))],
        })
        .map_err(fail)?;
    }
    Ok(())
}

// ---- counter ----

/// Counts across restarts. All state lives in the vatstore, so stopping the
/// kernel and reopening the database picks up where the count left off.
pub struct CounterWorker;

pub struct CounterFactory;

impl VatWorkerFactory for CounterFactory {
    fn create(&self, _vat: VatId, _parameters: &Value) -> Result<Box<dyn VatWorker>, KernelError> {
        Ok(Box::new(CounterWorker))
    }
}

impl CounterWorker {
    fn read_count(&self, sink: &mut dyn SyscallSink) -> Result<u64, VatWorkerError> {
        match sink
            .syscall(VatSyscall::VatstoreGet {
                key: "count".to_string(),
            })
            .map_err(fail)?
        {
            SyscallResult::Value(Some(text)) => text
                .parse()
                .map_err(|_| VatWorkerError::DeliveryFailed("corrupt count".to_string())),
            _ => Ok(0),
        }
    }

    fn write_count(&self, sink: &mut dyn SyscallSink, count: u64) -> Result<(), VatWorkerError> {
        sink.syscall(VatSyscall::VatstoreSet {
            key: "count".to_string(),
            value: count.to_string(),
        })
        .map_err(fail)?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl VatWorker for CounterWorker {
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
                self.write_count(sink, 1)?;
                resolve_string(sink, message.result, "Counter initialized with count: 1")
            }
            "resume" => {
                let count = self.read_count(sink)? + 1;
                self.write_count(sink, count)?;
                resolve_string(
                    sink,
                    message.result,
                    &format!("Counter incremented to: {count}"),
                )
            }
            other => reject(sink, message.result, &format!("unknown method `{other}`")),
        }
    }
}

// ---- greeter ----

/// Answers `hello(name)` with a greeting that names both parties.
pub struct GreeterWorker {
    name: String,
}

pub struct GreeterFactory;

impl VatWorkerFactory for GreeterFactory {
    fn create(&self, vat: VatId, parameters: &Value) -> Result<Box<dyn VatWorker>, KernelError> {
        let name = match parameters.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => vat.to_string(),
        };
        Ok(Box::new(GreeterWorker { name }))
    }
}

#[async_trait(?Send)]
impl VatWorker for GreeterWorker {
    async fn deliver(
        &mut self,
        delivery: VatDelivery,
        sink: &mut dyn SyscallSink,
    ) -> Result<(), VatWorkerError> {
        let VatDelivery::Message { message, .. } = delivery else {
            return Ok(());
        };
        match message.method.as_str() {
            "bootstrap" => resolve_string(sink, message.result, "greeter ready"),
            "hello" => {
                let caller = message
                    .args
                    .to_value()
                    .ok()
                    .and_then(|value| {
                        value
                            .as_array()
                            .and_then(|items| items.first())
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| "stranger".to_string());
                resolve_string(
                    sink,
                    message.result,
                    &format!("{} says hello back to {caller}", self.name),
                )
            }
            other => reject(sink, message.result, &format!("unknown method `{other}`")),
        }
    }
}

// ---- pipeliner pair ----

/// Bootstrap vat of the pipelining pair: calls `bob.first()` and
/// immediately pipelines the unresolved result into `bob.second(p1)`.
pub struct PipelineAliceWorker {
    bootstrap_result: Option<VRef>,
    second_result: Option<VRef>,
}

pub struct PipelineAliceFactory;

impl VatWorkerFactory for PipelineAliceFactory {
    fn create(&self, _vat: VatId, _parameters: &Value) -> Result<Box<dyn VatWorker>, KernelError> {
        Ok(Box::new(PipelineAliceWorker {
            bootstrap_result: None,
            second_result: None,
        }))
    }
}

#[async_trait(?Send)]
impl VatWorker for PipelineAliceWorker {
    async fn deliver(
        &mut self,
        delivery: VatDelivery,
        sink: &mut dyn SyscallSink,
    ) -> Result<(), VatWorkerError> {
        match delivery {
            VatDelivery::Message { message, .. } if message.method == "bootstrap" => {
                let roots = message
                    .args
                    .to_value()
                    .map_err(|err| VatWorkerError::DeliveryFailed(err.to_string()))?;
                let bob_marker = roots
                    .as_array()
                    .and_then(|items| items.first())
                    .and_then(|record| record.get("bob"))
                    .and_then(|marker| marker.get("$vref"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        VatWorkerError::DeliveryFailed("bootstrap args lack bob".to_string())
                    })?;
                let bob: VRef = bob_marker
                    .parse()
                    .map_err(|_| VatWorkerError::DeliveryFailed("bad bob vref".to_string()))?;

                let p1 = VRef::export_promise(1);
                let p2 = VRef::export_promise(2);
                sink.syscall(VatSyscall::Send {
                    target: bob,
                    message: VatMessage {
                        method: "first".to_string(),
                        args: VatCapData::null(),
                        result: Some(p1),
                    },
                })
                .map_err(fail)?;
                // pipeline: p1 is still unresolved when it rides along here
                sink.syscall(VatSyscall::Send {
                    target: bob,
                    message: VatMessage {
                        method: "second".to_string(),
                        args: VatCapData::single_slot(p1),
                        result: Some(p2),
                    },
                })
                .map_err(fail)?;
                sink.syscall(VatSyscall::Subscribe { vref: p2 }).map_err(fail)?;
                self.bootstrap_result = message.result;
                self.second_result = Some(p2);
                Ok(())
            }
            VatDelivery::Message { message, .. } => {
                reject(sink, message.result, "unknown method")
            }
            VatDelivery::Notify { resolutions } => {
                for (vref, rejected, value) in resolutions {
                    if Some(vref) == self.second_result {
                        let result = self.bootstrap_result.take();
                        if rejected {
                            reject(sink, result, "second failed")?;
                        } else {
                            let text = value.as_string().unwrap_or_default();
                            resolve_string(sink, result, &text)?;
                        }
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Target vat of the pipelining pair.
pub struct PipelineBobWorker {
    /// Result promise of a `second` call waiting on its parameter.
    pending_second: Option<VRef>,
}

pub struct PipelineBobFactory;

impl VatWorkerFactory for PipelineBobFactory {
    fn create(&self, _vat: VatId, _parameters: &Value) -> Result<Box<dyn VatWorker>, KernelError> {
        Ok(Box::new(PipelineBobWorker {
            pending_second: None,
        }))
    }
}

#[async_trait(?Send)]
impl VatWorker for PipelineBobWorker {
    async fn deliver(
        &mut self,
        delivery: VatDelivery,
        sink: &mut dyn SyscallSink,
    ) -> Result<(), VatWorkerError> {
        match delivery {
            VatDelivery::Message { message, .. } => match message.method.as_str() {
                "first" => resolve_string(sink, message.result, "Bob's first answer"),
                "second" => {
                    // answer only after the pipelined parameter settles
                    let Some(param) = message.args.slots.first().copied() else {
                        return reject(sink, message.result, "second takes a promise");
                    };
                    sink.syscall(VatSyscall::Subscribe { vref: param })
                        .map_err(fail)?;
                    self.pending_second = message.result;
                    Ok(())
                }
                other => reject(sink, message.result, &format!("unknown method `{other}`")),
            },
            VatDelivery::Notify { .. } => {
                let result = self.pending_second.take();
                resolve_string(sink, result, "Bob's second answer")
            }
            _ => Ok(()),
        }
    }
}
