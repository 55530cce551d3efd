//! Remote comms: framed transport between kernels.
//!
//! Each kernel derives a stable peer identifier from a secp256k1 key pair,
//! listens for framed connections, and keeps one serialized outbound session
//! per peer so remote sends stay FIFO per (source, target) pair. OCAP URLs
//! (`ocap:<peerId>/<token>`) carry a random token the issuing kernel binds to
//! a kref; redemption and remote deliveries travel as length-prefixed JSON
//! frames.

pub mod error;
pub mod frame;
pub mod peer;
pub mod session;
pub mod url;

pub use error::CommsError;
pub use frame::{Frame, FrameCodec, WireCapData};
pub use peer::{PeerId, PeerIdentity};
pub use session::{CommsEvent, CommsOptions, RemoteComms};
pub use url::{OcapUrl, generate_token};
