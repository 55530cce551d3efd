//! Routing between the kernel and remote comms.
//!
//! Krefs are meaningless outside their kernel, so every capability crossing
//! the wire travels as a token. Outbound slots get tokens issued on the
//! fly; inbound tokens resolve to the kref they were issued for, or mint a
//! remote proxy owned by `remote:<peer>`. Result promises cross as random
//! result ids: a `deliver` registers where its `notify` must go, and a
//! dropped connection rejects everything still pending against that peer.

use crate::error::KernelError;
use crate::promise;
use kestrel_comms::{CommsEvent, Frame, PeerId, RemoteComms, WireCapData, generate_token};
use kestrel_common::capdata::kref_marker;
use kestrel_common::{CapData, EndpointId, KRef, Message, RunQueueItem};
use kestrel_storage::{KernelStore, PromiseStateTag};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub(crate) const DISCONNECTED_ERROR: &str = "remote peer disconnected";

pub(crate) struct RemoteState {
    pub(crate) comms: RemoteComms,
    pub(crate) events: mpsc::UnboundedReceiver<CommsEvent>,
    /// result id → local promise awaiting a `notify` from the peer.
    pub(crate) pending_results: HashMap<String, (PeerId, KRef)>,
    /// redemption id → local promise awaiting a `resolve` from the issuer.
    pub(crate) pending_redemptions: HashMap<String, KRef>,
    /// local promise → where to send the `notify` once it settles.
    pub(crate) exported_results: HashMap<KRef, (PeerId, String)>,
    /// frames accumulated during a crank, transmitted after commit.
    pub(crate) outbox: Vec<(PeerId, Frame)>,
}

impl RemoteState {
    pub(crate) fn new(comms: RemoteComms, events: mpsc::UnboundedReceiver<CommsEvent>) -> Self {
        RemoteState {
            comms,
            events,
            pending_results: HashMap::new(),
            pending_redemptions: HashMap::new(),
            exported_results: HashMap::new(),
            outbox: Vec::new(),
        }
    }
}

/// Translate outbound CapData: each slot kref becomes a token this kernel
/// will answer for (or the peer's own token for a proxy pointing back at
/// it).
fn capdata_to_wire(
    store: &mut KernelStore,
    peer: &PeerId,
    capdata: &CapData,
) -> Result<WireCapData, KernelError> {
    let mut slots = Vec::with_capacity(capdata.slots.len());
    for kref in &capdata.slots {
        if let Some((owner_peer, token)) = store.remote_object(*kref)? {
            if owner_peer == peer.as_str() {
                // handing the peer back its own object
                slots.push(token);
                continue;
            }
        }
        let token = match store.ocap_token_for(*kref)? {
            Some(token) => token,
            None => {
                let token = generate_token();
                store.set_ocap_token(&token, *kref)?;
                token
            }
        };
        slots.push(token);
    }
    Ok(WireCapData {
        body: capdata.body.clone(),
        slots,
    })
}

/// Translate inbound CapData: tokens we issued map back to our krefs,
/// anything else becomes (or reuses) a remote proxy for the sending peer.
fn capdata_from_wire(
    store: &mut KernelStore,
    peer: &PeerId,
    capdata: &WireCapData,
) -> Result<CapData, KernelError> {
    let mut slots = Vec::with_capacity(capdata.slots.len());
    for token in &capdata.slots {
        let kref = resolve_inbound_token(store, peer, token)?;
        slots.push(kref);
    }
    Ok(CapData {
        body: capdata.body.clone(),
        slots,
    })
}

fn resolve_inbound_token(
    store: &mut KernelStore,
    peer: &PeerId,
    token: &str,
) -> Result<KRef, KernelError> {
    if let Some(kref) = store.ocap_token(token)? {
        return Ok(kref);
    }
    if let Some(kref) = store.remote_kref_for(peer.as_str(), token)? {
        return Ok(kref);
    }
    let kref = store.allocate_object(&EndpointId::Remote(peer.to_string()))?;
    store.set_remote_object(kref, peer.as_str(), token)?;
    trace!(%kref, %peer, "minted remote proxy");
    Ok(kref)
}

impl crate::Kernel {
    /// Queue an outbound frame for a send whose target lives at a peer.
    /// Called from the crank, so the frame waits in the outbox until the
    /// crank commits.
    pub(crate) fn dispatch_remote_send(
        &mut self,
        peer: &str,
        target: KRef,
        message: Message,
    ) -> Result<(), KernelError> {
        let Some(remote) = self.remote.as_mut() else {
            if let Some(kp) = message.result {
                promise::reject_with(
                    &mut self.store,
                    kp,
                    CapData::error("remote comms not initialized"),
                )?;
            }
            return Ok(());
        };
        let peer = match PeerId::from_hex(peer) {
            Ok(peer) => peer,
            Err(_) => {
                return Err(KernelError::Internal(format!("bad peer id `{peer}`")));
            }
        };
        let Some((_, token)) = self.store.remote_object(target)? else {
            return Err(KernelError::Internal(format!(
                "{target} has no remote binding"
            )));
        };
        let args = capdata_to_wire(&mut self.store, &peer, &message.args)?;
        let result = match message.result {
            Some(kp) => {
                let result_id = generate_token();
                remote
                    .pending_results
                    .insert(result_id.clone(), (peer.clone(), kp));
                Some(result_id)
            }
            None => None,
        };
        remote.outbox.push((
            peer,
            Frame::Deliver {
                token,
                method: message.method,
                args,
                result,
            },
        ));
        Ok(())
    }

    /// Pull everything the transport has delivered and fold it into kernel
    /// state. Returns whether anything arrived.
    pub(crate) fn drain_comms_events(&mut self) -> Result<bool, KernelError> {
        let mut drained = false;
        loop {
            let event = match self.remote.as_mut() {
                Some(remote) => match remote.events.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
                None => break,
            };
            drained = true;
            match event {
                CommsEvent::Frame { peer, frame } => self.handle_frame(peer, frame)?,
                CommsEvent::Disconnected { peer } => self.handle_disconnect(&peer)?,
            }
        }
        Ok(drained)
    }

    fn handle_frame(&mut self, peer: PeerId, frame: Frame) -> Result<(), KernelError> {
        match frame {
            Frame::Hello { .. } => Ok(()),
            Frame::Deliver {
                token,
                method,
                args,
                result,
            } => {
                let Some(target) = self.store.ocap_token(&token)? else {
                    warn!(%peer, "dropping deliver for unknown token");
                    return Ok(());
                };
                let args = capdata_from_wire(&mut self.store, &peer, &args)?;
                let result_kp = match result {
                    Some(result_id) => {
                        let kp = self.store.allocate_promise(None)?;
                        // held on behalf of the wire until the notify goes out
                        self.store.pin_kref(kp)?;
                        if let Some(remote) = self.remote.as_mut() {
                            remote.exported_results.insert(kp, (peer.clone(), result_id));
                        }
                        Some(kp)
                    }
                    None => None,
                };
                debug!(%peer, %target, %method, "inbound remote send");
                self.store.enqueue_run(&RunQueueItem::Send {
                    target,
                    message: Message {
                        method,
                        args,
                        result: result_kp,
                    },
                })?;
                Ok(())
            }
            Frame::Notify {
                result,
                rejected,
                args,
            } => {
                let Some(remote) = self.remote.as_mut() else {
                    return Ok(());
                };
                let Some((_, kp)) = remote.pending_results.remove(&result) else {
                    warn!(%peer, "dropping notify for unknown result id");
                    return Ok(());
                };
                let value = capdata_from_wire(&mut self.store, &peer, &args)?;
                promise::resolve_batch(&mut self.store, None, vec![(kp, rejected, value)])?;
                Ok(())
            }
            Frame::Redeem { token, result } => {
                let reply = match self.store.ocap_token(&token)? {
                    Some(_) => Frame::Resolve {
                        result,
                        rejected: false,
                        args: WireCapData {
                            body: CapData::string(&token).body,
                            slots: vec![],
                        },
                    },
                    None => {
                        warn!(%peer, "redeem for unknown token");
                        Frame::Resolve {
                            result,
                            rejected: true,
                            args: WireCapData {
                                body: CapData::error(&format!("unknown token `{token}`")).body,
                                slots: vec![],
                            },
                        }
                    }
                };
                if let Some(remote) = self.remote.as_mut() {
                    remote.outbox.push((peer, reply));
                }
                Ok(())
            }
            Frame::Resolve {
                result,
                rejected,
                args,
            } => {
                let Some(remote) = self.remote.as_mut() else {
                    return Ok(());
                };
                let Some(kp) = remote.pending_redemptions.remove(&result) else {
                    warn!(%peer, "dropping resolve for unknown redemption id");
                    return Ok(());
                };
                let payload = CapData {
                    body: args.body,
                    slots: vec![],
                };
                if rejected {
                    promise::resolve_batch(&mut self.store, None, vec![(kp, true, payload)])?;
                    return Ok(());
                }
                // the issuer confirmed the token: mint the proxy
                let token = payload
                    .as_string()
                    .ok_or_else(|| KernelError::Internal("malformed redemption reply".into()))?;
                let kref = resolve_inbound_token(&mut self.store, &peer, &token)?;
                let value = CapData::from_value(&kref_marker(kref))?;
                promise::resolve_batch(&mut self.store, None, vec![(kp, false, value)])?;
                Ok(())
            }
        }
    }

    /// Connection loss rejects every promise still waiting on that peer.
    fn handle_disconnect(&mut self, peer: &PeerId) -> Result<(), KernelError> {
        let Some(remote) = self.remote.as_mut() else {
            return Ok(());
        };
        debug!(%peer, "peer disconnected");
        let orphaned: Vec<KRef> = remote
            .pending_results
            .values()
            .filter(|(result_peer, _)| result_peer == peer)
            .map(|(_, kp)| *kp)
            .collect();
        remote.pending_results.retain(|_, entry| entry.0 != *peer);
        let abandoned: Vec<KRef> = remote
            .exported_results
            .iter()
            .filter(|(_, (export_peer, _))| export_peer == peer)
            .map(|(kp, _)| *kp)
            .collect();
        remote.exported_results.retain(|_, entry| entry.0 != *peer);
        for kp in orphaned {
            promise::reject_with(&mut self.store, kp, CapData::error(DISCONNECTED_ERROR))?;
        }
        for kp in abandoned {
            // nobody is listening for this result any more
            self.store.unpin_kref(kp)?;
            self.store.add_maybe_free(kp)?;
        }
        Ok(())
    }

    /// After a crank commits: send queued frames and answer any settled
    /// result promises the wire is waiting on.
    pub(crate) async fn flush_remote(&mut self) -> Result<(), KernelError> {
        if self.remote.is_none() {
            return Ok(());
        }

        // settled exported results become notify frames
        let settled: Vec<(KRef, PeerId, String)> = {
            let remote = match self.remote.as_ref() {
                Some(remote) => remote,
                None => return Ok(()),
            };
            let mut settled = Vec::new();
            for (kp, (peer, result_id)) in &remote.exported_results {
                let terminal = promise::chase_forwards(&self.store, *kp)?;
                if self.store.promise_state(terminal)? != PromiseStateTag::Unresolved {
                    settled.push((*kp, peer.clone(), result_id.clone()));
                }
            }
            settled
        };
        for (kp, peer, result_id) in settled {
            let terminal = promise::chase_forwards(&self.store, kp)?;
            let rejected = self.store.promise_state(terminal)? == PromiseStateTag::Rejected;
            let value = self
                .store
                .promise_value(terminal)?
                .unwrap_or_else(CapData::null);
            let args = capdata_to_wire(&mut self.store, &peer, &value)?;
            if let Some(remote) = self.remote.as_mut() {
                remote.exported_results.remove(&kp);
                remote.outbox.push((
                    peer,
                    Frame::Notify {
                        result: result_id,
                        rejected,
                        args,
                    },
                ));
            }
            self.store.unpin_kref(kp)?;
            self.store.add_maybe_free(kp)?;
        }

        let outbox: Vec<(PeerId, Frame)> = match self.remote.as_mut() {
            Some(remote) => remote.outbox.drain(..).collect(),
            None => Vec::new(),
        };
        for (peer, frame) in outbox {
            let send_result = {
                let remote = match self.remote.as_ref() {
                    Some(remote) => remote,
                    None => return Ok(()),
                };
                remote.comms.send_remote_message(&peer, frame).await
            };
            if let Err(error) = send_result {
                warn!(%peer, %error, "remote send failed");
                self.handle_disconnect(&peer)?;
            }
        }
        Ok(())
    }
}
