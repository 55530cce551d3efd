//! Key layout used by the kernel store.
//!
//! Every key below is additionally wrapped in the `kv.v1.` version prefix
//! before it reaches the backend.

/// Object table: `ko<N>.owner` => endpoint id string
/// - `"v3"`, `"kernel"`, or `"remote:<peerId>"`
pub const OBJECT_OWNER_SUFFIX: &str = ".owner";

/// Object table: `ko<N>.refCount` => `"<reachable>,<recognizable>"`
pub const OBJECT_REFCOUNT_SUFFIX: &str = ".refCount";

/// Object table: `ko<N>.revoked` => `"true"` (absent when not revoked)
pub const OBJECT_REVOKED_SUFFIX: &str = ".revoked";

/// Promise table: `kp<N>.state` => `"unresolved" | "fulfilled" | "rejected" | "forwarded"`
pub const PROMISE_STATE_SUFFIX: &str = ".state";

/// Promise table: `kp<N>.decider` => vat id string (absent when kernel-held)
pub const PROMISE_DECIDER_SUFFIX: &str = ".decider";

/// Promise table: `kp<N>.subscribers` => JSON array of vat id strings
pub const PROMISE_SUBSCRIBERS_SUFFIX: &str = ".subscribers";

/// Promise table: `kp<N>.refCount` => decimal count
pub const PROMISE_REFCOUNT_SUFFIX: &str = ".refCount";

/// Promise table: `kp<N>.value` => CapData JSON (fulfilled/rejected only)
pub const PROMISE_VALUE_SUFFIX: &str = ".value";

/// Promise table: `kp<N>.forward` => kref string (forwarded only)
pub const PROMISE_FORWARD_SUFFIX: &str = ".forward";

/// C-list, kernel to vat space: `cl.<vatId>.k2e.<kref>` => `"R <vref>"` or `"_ <vref>"`
/// - `R` marks the entry reachable, `_` recognizable-only
pub const CLIST_PREFIX: &str = "cl.";

/// C-list, vat to kernel space: `cl.<vatId>.e2k.<vref>` => kref string
pub const CLIST_E2K_SEGMENT: &str = ".e2k.";
pub const CLIST_K2E_SEGMENT: &str = ".k2e.";

/// Per-vat import allocation counters:
/// `cl.<vatId>.nextObjectImport` / `cl.<vatId>.nextPromiseImport` => decimal
pub const CLIST_NEXT_OBJECT_IMPORT_SEGMENT: &str = ".nextObjectImport";
pub const CLIST_NEXT_PROMISE_IMPORT_SEGMENT: &str = ".nextPromiseImport";

/// Run queue: `queue.run.head` / `queue.run.tail` => decimal index,
/// `queue.run.<N>` => run-queue item JSON. Empty iff head == tail.
pub const RUN_QUEUE_PREFIX: &str = "queue.run";

/// Per-promise queues, same shape: `queue.<kpref>.head/tail/<N>`
pub const QUEUE_PREFIX: &str = "queue.";

/// Vatstore: `vatstore.<vatId>.<userKey>` => opaque string
pub const VATSTORE_PREFIX: &str = "vatstore.";

/// Vat table: `vat.<vatId>` => vat record JSON
pub const VAT_PREFIX: &str = "vat.";

/// Subcluster table: `subcluster.<sid>` => subcluster record JSON
pub const SUBCLUSTER_PREFIX: &str = "subcluster.";

/// Pending GC actions: `gcActions` => JSON sorted array of
/// `"<vatId> <kind> <kref>"` strings
pub const GC_ACTIONS_KEY: &str = "gcActions";

/// Retirement candidates: `maybeFree` => JSON sorted array of kref strings
pub const MAYBE_FREE_KEY: &str = "maybeFree";

/// Queue pins: `pin.<kref>` => decimal count of queue items naming the kref
pub const PIN_PREFIX: &str = "pin.";

/// OCAP URL tokens: `ocap.<token>` => kref string
pub const OCAP_TOKEN_PREFIX: &str = "ocap.";

/// Kernel service objects: `service.<name>` => kref string
pub const SERVICE_PREFIX: &str = "service.";

/// Remote proxy objects: `remote.<kref>` => `"<peerId> <token>"`
pub const REMOTE_OBJECT_PREFIX: &str = "remote.";

/// Reverse remote lookup: `remoteToken.<peerId>.<token>` => kref string
pub const REMOTE_TOKEN_PREFIX: &str = "remoteToken.";

/// Id counters => decimal next index
pub const NEXT_OBJECT_ID_KEY: &str = "nextObjectId";
pub const NEXT_PROMISE_ID_KEY: &str = "nextPromiseId";
pub const NEXT_VAT_ID_KEY: &str = "nextVatId";
pub const NEXT_SUBCLUSTER_ID_KEY: &str = "nextSubclusterId";

/// Crank counter: `crankNumber` => decimal, incremented at each commit
pub const CRANK_NUMBER_KEY: &str = "crankNumber";
