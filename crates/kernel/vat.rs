//! The vat seam: worker trait, deliveries, syscalls, and the supervisor.
//!
//! A vat worker is a black box that receives deliveries and emits syscalls
//! through the sink it is handed. Everything the worker sees is in vat space
//! (vrefs); the kernel translates at the boundary. Workers hold no durable
//! state of their own: anything that must survive a restart goes through the
//! vatstore syscalls.

use crate::error::KernelError;
use async_trait::async_trait;
use kestrel_common::capdata::{
    self, BODY_PREFIX, ERROR_PREFIX, VREF_KEY, decode_body, lift_marked_refs, restore_marked_refs,
};
use kestrel_common::{MarshalError, VRef, VatId};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// How many times in a row a worker may crash before the vat is terminated.
pub const MAX_CONSECUTIVE_CRASHES: u32 = 3;

/// CapData in vat space: same body encoding as kernel CapData, slots are
/// vrefs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VatCapData {
    pub body: String,
    pub slots: Vec<VRef>,
}

impl VatCapData {
    /// Marshal a JSON value carrying `{"$vref": "o+1"}` capability markers.
    pub fn from_value(value: &Value) -> Result<VatCapData, MarshalError> {
        let mut names = Vec::new();
        let lifted = lift_marked_refs(value, VREF_KEY, &mut names)?;
        let slots = names
            .iter()
            .map(|name| {
                name.parse()
                    .map_err(|_| MarshalError::Unserializable(name.clone()))
            })
            .collect::<Result<Vec<VRef>, _>>()?;
        let body = serde_json::to_string(&lifted)
            .map_err(|err| MarshalError::Unserializable(err.to_string()))?;
        Ok(VatCapData {
            body: format!("{BODY_PREFIX}{body}"),
            slots,
        })
    }

    pub fn to_value(&self) -> Result<Value, MarshalError> {
        let raw = decode_body(&self.body)?;
        let names: Vec<String> = self.slots.iter().map(VRef::to_string).collect();
        restore_marked_refs(&raw, VREF_KEY, &names)
    }

    pub fn string(text: &str) -> VatCapData {
        VatCapData {
            body: format!("{BODY_PREFIX}{}", Value::String(text.to_string())),
            slots: Vec::new(),
        }
    }

    pub fn null() -> VatCapData {
        VatCapData {
            body: format!("{BODY_PREFIX}null"),
            slots: Vec::new(),
        }
    }

    pub fn error(message: &str) -> VatCapData {
        let inner = capdata::CapData::error(message);
        VatCapData {
            body: inner.body,
            slots: Vec::new(),
        }
    }

    pub fn single_slot(vref: VRef) -> VatCapData {
        VatCapData {
            body: format!("{BODY_PREFIX}{{\"$slot\":0}}"),
            slots: vec![vref],
        }
    }

    pub fn is_error(&self) -> bool {
        self.body.starts_with(ERROR_PREFIX)
    }

    pub fn as_string(&self) -> Option<String> {
        match self.to_value() {
            Ok(Value::String(text)) => Some(text),
            _ => None,
        }
    }
}

/// A method call as a vat sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VatMessage {
    pub method: String,
    pub args: VatCapData,
    pub result: Option<VRef>,
}

/// What the kernel hands a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VatDelivery {
    Message {
        target: VRef,
        message: VatMessage,
    },
    /// `(promise, rejected, value)` for each promise the vat subscribed to.
    Notify {
        resolutions: Vec<(VRef, bool, VatCapData)>,
    },
    DropExports { vrefs: Vec<VRef> },
    RetireExports { vrefs: Vec<VRef> },
    RetireImports { vrefs: Vec<VRef> },
    BringOutYourDead,
}

/// Syscalls a worker may emit during a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VatSyscall {
    Send {
        target: VRef,
        message: VatMessage,
    },
    Subscribe {
        vref: VRef,
    },
    Resolve {
        resolutions: Vec<(VRef, bool, VatCapData)>,
    },
    Exit {
        failure: bool,
        info: VatCapData,
    },
    VatstoreGet {
        key: String,
    },
    VatstoreSet {
        key: String,
        value: String,
    },
    VatstoreDelete {
        key: String,
    },
    VatstoreGetNextKey {
        after: String,
    },
    DropImports {
        vrefs: Vec<VRef>,
    },
    RetireImports {
        vrefs: Vec<VRef>,
    },
    RetireExports {
        vrefs: Vec<VRef>,
    },
    AbandonExports {
        vrefs: Vec<VRef>,
    },
    /// Sugar for a send to a kernel service object handed out at bootstrap.
    CallKernelService {
        service: VRef,
        message: VatMessage,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallResult {
    Ok,
    /// Answer to the vatstore read syscalls.
    Value(Option<String>),
}

/// How a delivery went wrong, from the supervisor's point of view.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VatWorkerError {
    /// User code threw: reject the result, roll back the crank, vat lives on.
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
    /// The worker itself died: roll back, restart, replay once.
    #[error("worker crashed: {0}")]
    Crashed(String),
}

/// Sink handed to a worker for the duration of one delivery. Syscalls apply
/// under the crank's active savepoint.
pub trait SyscallSink {
    fn syscall(&mut self, syscall: VatSyscall) -> Result<SyscallResult, KernelError>;
}

/// The in-vat execution sandbox, from the kernel's side.
#[async_trait(?Send)]
pub trait VatWorker: Send {
    async fn deliver(
        &mut self,
        delivery: VatDelivery,
        syscalls: &mut dyn SyscallSink,
    ) -> Result<(), VatWorkerError>;
}

/// Builds workers for one bundle name.
pub trait VatWorkerFactory: Send + Sync {
    fn create(&self, vat: VatId, parameters: &Value) -> Result<Box<dyn VatWorker>, KernelError>;
}

/// Per-vat controller: owns the worker, restarts it, and tracks consecutive
/// crashes so a persistently failing vat gets terminated instead of spinning.
pub struct VatSupervisor {
    vat: VatId,
    bundle: String,
    parameters: Value,
    factory: Arc<dyn VatWorkerFactory>,
    worker: Box<dyn VatWorker>,
    consecutive_crashes: u32,
}

impl std::fmt::Debug for VatSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VatSupervisor")
            .field("vat", &self.vat)
            .field("bundle", &self.bundle)
            .field("consecutive_crashes", &self.consecutive_crashes)
            .finish_non_exhaustive()
    }
}

impl VatSupervisor {
    pub fn launch(
        vat: VatId,
        bundle: &str,
        parameters: Value,
        factory: Arc<dyn VatWorkerFactory>,
    ) -> Result<VatSupervisor, KernelError> {
        let worker = factory.create(vat, &parameters)?;
        debug!(%vat, bundle, "launched vat worker");
        Ok(VatSupervisor {
            vat,
            bundle: bundle.to_string(),
            parameters,
            factory,
            worker,
            consecutive_crashes: 0,
        })
    }

    pub fn vat(&self) -> VatId {
        self.vat
    }

    pub fn bundle(&self) -> &str {
        &self.bundle
    }

    pub async fn deliver(
        &mut self,
        delivery: VatDelivery,
        syscalls: &mut dyn SyscallSink,
    ) -> Result<(), VatWorkerError> {
        let outcome = self.worker.deliver(delivery, syscalls).await;
        if outcome.is_ok() {
            self.consecutive_crashes = 0;
        }
        outcome
    }

    /// Discard worker state and relaunch. Durable state lives in the
    /// vatstore and kernel store, so no replay is needed. Returns the number
    /// of crashes seen in a row, so the caller can give up at
    /// [`MAX_CONSECUTIVE_CRASHES`].
    pub fn restart(&mut self) -> Result<u32, KernelError> {
        self.consecutive_crashes += 1;
        warn!(vat = %self.vat, crashes = self.consecutive_crashes, "restarting vat worker");
        self.worker = self.factory.create(self.vat, &self.parameters)?;
        Ok(self.consecutive_crashes)
    }

    /// Host-requested restart: fresh worker, clean slate.
    pub fn restart_clean(&mut self) -> Result<(), KernelError> {
        self.worker = self.factory.create(self.vat, &self.parameters)?;
        self.consecutive_crashes = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn vat_capdata_round_trips_vrefs() {
        let value = json!({
            "param": { "$vref": "p+1" },
            "root": { "$vref": "o-3" },
        });
        let capdata = VatCapData::from_value(&value).expect("marshal");
        assert_eq!(
            capdata.slots,
            vec![VRef::export_promise(1), VRef::import_object(3)]
        );
        assert_eq!(capdata.to_value().expect("unmarshal"), value);
    }

    #[test]
    fn error_capdata_is_detectable() {
        let capdata = VatCapData::error("boom");
        assert!(capdata.is_error());
        assert!(capdata.body.contains("boom"));
    }
}
