use kestrel_comms::CommsError;
use kestrel_common::{KRef, MarshalError, RefError, SubclusterId, VatId};
use kestrel_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Reference(#[from] RefError),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    #[error(transparent)]
    Comms(#[from] CommsError),
    #[error("unknown vat {0}")]
    UnknownVat(VatId),
    #[error("unknown subcluster {0}")]
    UnknownSubcluster(SubclusterId),
    #[error("no vat bundle registered as `{0}`")]
    UnknownBundle(String),
    #[error("no registered kernel service '{0}'")]
    UnknownService(String),
    #[error("revoked object {0}")]
    Revoked(KRef),
    #[error("no endpoint for {0}")]
    NoEndpoint(KRef),
    #[error("Subcluster initialization failed: {0}")]
    SubclusterInit(String),
    #[error("remote comms already initialized")]
    CommsAlreadyInitialized,
    #[error("remote comms not initialized")]
    CommsNotInitialized,
    #[error("timed out waiting for {0} to settle")]
    Timeout(KRef),
    #[error("internal kernel error: {0}")]
    Internal(String),
}
