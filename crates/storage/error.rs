use kestrel_common::{KRef, RefError, VatId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Reference(#[from] RefError),
    #[error("unknown object {0}")]
    UnknownObject(KRef),
    #[error("unknown promise {0}")]
    UnknownPromise(KRef),
    #[error("unknown vat {0}")]
    UnknownVat(VatId),
    #[error("no c-list entry for {kref} in {vat}")]
    UnknownClistEntry { vat: VatId, kref: KRef },
    #[error("invalid savepoint identifier `{0}`")]
    InvalidSavepoint(String),
    #[error("unknown savepoint `{0}`")]
    UnknownSavepoint(String),
    #[error("no transaction is open")]
    NoTransaction,
    #[error("a transaction is already open")]
    NestedTransaction,
    #[error("corrupt store entry: {0}")]
    Corrupt(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("backend failure: {0}")]
    Backend(String),
}
