#[derive(Debug, thiserror::Error)]
pub enum CommsError {
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),
    #[error("malformed ocap url `{0}`")]
    InvalidUrl(String),
    #[error("unknown token `{0}`")]
    UnknownToken(String),
    #[error("no known address for peer {0}")]
    UnknownPeer(String),
    #[error("remote peer disconnected")]
    PeerDisconnected,
    #[error("remote comms already initialized")]
    AlreadyInitialized,
    #[error("remote comms not initialized")]
    NotInitialized,
    #[error("bad key seed: {0}")]
    BadKeySeed(String),
}
