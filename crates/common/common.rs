//! Shared data model for the kestrel kernel: reference types, the CapData
//! marshalling format, queue records, and subcluster configuration.

pub mod capdata;
pub mod cluster;
pub mod message;
pub mod refs;

pub use capdata::{CapData, MarshalError};
pub use cluster::{SubclusterConfig, SubclusterId, SubclusterRecord, VatConfig, VatRecord};
pub use message::{GcActionKind, Message, RunQueueItem};
pub use refs::{EndpointId, KRef, RefError, VRef, VatId};
