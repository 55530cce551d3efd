//! Kernel services: host-provided objects addressable by name from
//! subcluster configs.
//!
//! Each service is a kernel-owned object; a send targeting it dispatches to
//! the registered handler instead of a vat. Handlers run inside the crank,
//! under the same savepoint as any delivery, and answer with either
//! immediate data or a promise the kernel resolves later (the redemption
//! service uses the latter while a redeem round-trip is in flight).

use crate::error::KernelError;
use async_trait::async_trait;
use kestrel_comms::{Frame, OcapUrl, PeerId, generate_token};
use kestrel_common::{CapData, KRef};
use kestrel_storage::KernelStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// What a service hands back for the caller's result promise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceReply {
    Data(CapData),
    Promise(KRef),
}

/// Kernel state a handler may touch.
pub struct ServiceContext<'a> {
    pub store: &'a mut KernelStore,
    /// Local peer id once remote comms is initialized.
    pub peer_id: Option<PeerId>,
    /// Frames to transmit after the crank commits.
    pub outbox: &'a mut Vec<(PeerId, Frame)>,
    /// Redemption id → promise awaiting the issuer's answer.
    pub pending_redemptions: &'a mut HashMap<String, KRef>,
}

#[async_trait]
pub trait KernelService: Send + Sync {
    async fn handle(
        &self,
        ctx: &mut ServiceContext<'_>,
        method: &str,
        args: CapData,
    ) -> Result<ServiceReply, KernelError>;
}

#[derive(Default)]
pub struct ServiceRegistry {
    entries: HashMap<String, Arc<dyn KernelService>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ServiceRegistry {
    /// Registry preloaded with the built-in services.
    pub fn with_builtins() -> ServiceRegistry {
        let mut registry = ServiceRegistry::default();
        registry.register("logger", Arc::new(LoggerService));
        registry.register("urlIssuer", Arc::new(UrlIssuerService));
        registry.register("urlRedemption", Arc::new(UrlRedemptionService));
        registry
    }

    pub fn register(&mut self, name: &str, service: Arc<dyn KernelService>) {
        self.entries.insert(name.to_string(), service);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn KernelService>> {
        self.entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Writes through to the host's structured log; the method names the level.
pub struct LoggerService;

#[async_trait]
impl KernelService for LoggerService {
    async fn handle(
        &self,
        _ctx: &mut ServiceContext<'_>,
        method: &str,
        args: CapData,
    ) -> Result<ServiceReply, KernelError> {
        let text = args
            .as_string()
            .or_else(|| args.to_value().ok().map(|value| value.to_string()))
            .unwrap_or_else(|| args.body.clone());
        match method {
            "error" => error!(target: "vat", "{text}"),
            "warn" => warn!(target: "vat", "{text}"),
            "debug" => debug!(target: "vat", "{text}"),
            "trace" => trace!(target: "vat", "{text}"),
            _ => info!(target: "vat", "{text}"),
        }
        Ok(ServiceReply::Data(CapData::null()))
    }
}

/// Issues `ocap:` URLs for local objects. The same object always gets the
/// same token.
pub struct UrlIssuerService;

#[async_trait]
impl KernelService for UrlIssuerService {
    async fn handle(
        &self,
        ctx: &mut ServiceContext<'_>,
        method: &str,
        args: CapData,
    ) -> Result<ServiceReply, KernelError> {
        if method != "issue" {
            return Err(KernelError::Internal(format!(
                "urlIssuer has no method `{method}`"
            )));
        }
        let peer = ctx
            .peer_id
            .clone()
            .ok_or(KernelError::CommsNotInitialized)?;
        let target = args
            .sole_slot()
            .ok_or_else(|| KernelError::Internal("issue takes exactly one capability".into()))?;
        let token = match ctx.store.ocap_token_for(target)? {
            Some(token) => token,
            None => {
                let token = generate_token();
                ctx.store.set_ocap_token(&token, target)?;
                token
            }
        };
        let url = OcapUrl::new(peer, token);
        Ok(ServiceReply::Data(CapData::string(&url.to_string())))
    }
}

/// Redeems an `ocap:` URL. Local URLs answer immediately; remote ones send
/// a redeem frame and hand back a promise the comms layer resolves.
pub struct UrlRedemptionService;

#[async_trait]
impl KernelService for UrlRedemptionService {
    async fn handle(
        &self,
        ctx: &mut ServiceContext<'_>,
        method: &str,
        args: CapData,
    ) -> Result<ServiceReply, KernelError> {
        if method != "redeem" {
            return Err(KernelError::Internal(format!(
                "urlRedemption has no method `{method}`"
            )));
        }
        let text = args
            .as_string()
            .ok_or_else(|| KernelError::Internal("redeem takes a URL string".into()))?;
        let url: OcapUrl = text.parse()?;
        if ctx.peer_id.as_ref() == Some(&url.peer) {
            let kref = ctx
                .store
                .ocap_token(&url.token)?
                .ok_or_else(|| KernelError::Comms(
                    kestrel_comms::CommsError::UnknownToken(url.token.clone()),
                ))?;
            return Ok(ServiceReply::Data(CapData::single_slot(kref)));
        }
        let redemption_id = generate_token();
        let kp = ctx.store.allocate_promise(None)?;
        ctx.pending_redemptions.insert(redemption_id.clone(), kp);
        ctx.outbox.push((
            url.peer,
            Frame::Redeem {
                token: url.token,
                result: redemption_id,
            },
        ));
        Ok(ServiceReply::Promise(kp))
    }
}
