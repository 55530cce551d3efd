//! Kref/vref translation at the vat boundary.
//!
//! Outbound (vat syscall → kernel): a vref the vat allocated (`o+`/`p+`) and
//! the kernel has never seen mints a fresh kref owned/decided by that vat;
//! everything else must already be in the c-list. Inbound (kernel → vat): an
//! unknown kref allocates the vat's next import index. Both directions are
//! idempotent — a second mention reuses the existing c-list entry.

use crate::error::KernelError;
use crate::vat::{VatCapData, VatMessage};
use kestrel_common::{CapData, EndpointId, KRef, Message, VRef, VatId};
use kestrel_storage::KernelStore;

/// Vat mentions a vref on the way out; produce the kref it stands for.
pub fn vref_to_kref(store: &mut KernelStore, vat: VatId, vref: VRef) -> Result<KRef, KernelError> {
    if let Some(kref) = store.clist_kref(vat, vref)? {
        return Ok(kref);
    }
    if !vref.allocated_by_vat() {
        // an import the kernel never gave out
        return Err(KernelError::Internal(format!(
            "{vat} mentioned unknown import {vref}"
        )));
    }
    let kref = match vref {
        VRef::Object { .. } => store.allocate_object(&EndpointId::Vat(vat))?,
        VRef::Promise { .. } => store.allocate_promise(Some(vat))?,
    };
    store.add_clist_entry(vat, kref, vref, true)?;
    Ok(kref)
}

/// Kernel mentions a kref on the way in; produce the vat's name for it,
/// allocating an import if needed. Delivering a kref re-strengthens a
/// recognizable-only entry.
pub fn kref_to_vref(store: &mut KernelStore, vat: VatId, kref: KRef) -> Result<VRef, KernelError> {
    if let Some((vref, reachable)) = store.clist_entry(vat, kref)? {
        if !reachable {
            store.set_clist_reachable(vat, kref, true)?;
        }
        return Ok(vref);
    }
    let vref = match kref {
        KRef::Object(_) => VRef::import_object(store.next_import_index(vat, false)?),
        KRef::Promise(_) => VRef::import_promise(store.next_import_index(vat, true)?),
    };
    store.add_clist_entry(vat, kref, vref, true)?;
    Ok(vref)
}

pub fn vat_capdata_to_kernel(
    store: &mut KernelStore,
    vat: VatId,
    capdata: &VatCapData,
) -> Result<CapData, KernelError> {
    let slots = capdata
        .slots
        .iter()
        .map(|vref| vref_to_kref(store, vat, *vref))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CapData {
        body: capdata.body.clone(),
        slots,
    })
}

pub fn kernel_capdata_to_vat(
    store: &mut KernelStore,
    vat: VatId,
    capdata: &CapData,
) -> Result<VatCapData, KernelError> {
    let slots = capdata
        .slots
        .iter()
        .map(|kref| kref_to_vref(store, vat, *kref))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(VatCapData {
        body: capdata.body.clone(),
        slots,
    })
}

/// Translate an outbound send. The result vref, when present, must be a
/// promise; a fresh `p+` mints a kernel promise whose decider is assigned
/// when the send is delivered.
pub fn vat_message_to_kernel(
    store: &mut KernelStore,
    vat: VatId,
    message: &VatMessage,
) -> Result<Message, KernelError> {
    let args = vat_capdata_to_kernel(store, vat, &message.args)?;
    let result = match message.result {
        Some(vref) if vref.is_promise() => {
            let kp = vref_to_kref(store, vat, vref)?;
            // the sender does not decide its own result promise
            if store.promise_decider(kp)? == Some(vat) {
                store.set_promise_decider(kp, None)?;
            }
            Some(kp)
        }
        Some(vref) => {
            return Err(KernelError::Internal(format!(
                "result reference {vref} is not a promise"
            )));
        }
        None => None,
    };
    Ok(Message {
        method: message.method.clone(),
        args,
        result,
    })
}

/// Translate an inbound delivery for the target vat.
pub fn kernel_message_to_vat(
    store: &mut KernelStore,
    vat: VatId,
    message: &Message,
) -> Result<VatMessage, KernelError> {
    let args = kernel_capdata_to_vat(store, vat, &message.args)?;
    let result = match message.result {
        Some(kp) => Some(kref_to_vref(store, vat, kp)?),
        None => None,
    };
    Ok(VatMessage {
        method: message.method.clone(),
        args,
        result,
    })
}
