//! Listener and per-peer outbound sessions.
//!
//! One TCP connection carries frames in both directions. The connecting
//! side opens with a `hello` frame naming its peer id; after that, either
//! side sends protocol frames at will. Outbound frames for a peer funnel
//! through one writer task, which keeps remote sends FIFO per peer.

use crate::error::CommsError;
use crate::frame::{Frame, FrameCodec};
use crate::peer::{PeerId, PeerIdentity};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

/// What the kernel receives from the transport.
#[derive(Debug)]
pub enum CommsEvent {
    Frame { peer: PeerId, frame: Frame },
    Disconnected { peer: PeerId },
}

#[derive(Debug, Clone)]
pub struct CommsOptions {
    /// Address to listen on; port 0 picks a free port.
    pub listen_addr: SocketAddr,
    /// Deterministic identity seed; `None` generates a fresh key pair.
    pub key_seed: Option<Vec<u8>>,
    /// Peers whose addresses are known up front.
    pub known_peers: Vec<(PeerId, SocketAddr)>,
}

impl Default for CommsOptions {
    fn default() -> CommsOptions {
        CommsOptions {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            key_seed: None,
            known_peers: Vec::new(),
        }
    }
}

struct Shared {
    local_peer: PeerId,
    sessions: Mutex<HashMap<PeerId, mpsc::UnboundedSender<Frame>>>,
    addresses: Mutex<HashMap<PeerId, SocketAddr>>,
    events: mpsc::UnboundedSender<CommsEvent>,
}

pub struct RemoteComms {
    identity: PeerIdentity,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl Drop for RemoteComms {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl std::fmt::Debug for RemoteComms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteComms")
            .field("peer_id", self.identity.peer_id())
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl RemoteComms {
    /// Open the listening endpoint and start accepting sessions. Inbound
    /// frames and disconnects arrive on `events`.
    pub async fn initialize(
        options: CommsOptions,
        events: mpsc::UnboundedSender<CommsEvent>,
    ) -> Result<RemoteComms, CommsError> {
        let identity = match &options.key_seed {
            Some(seed) => PeerIdentity::from_seed(seed)?,
            None => PeerIdentity::random(),
        };
        let listener = TcpListener::bind(options.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            local_peer: identity.peer_id().clone(),
            sessions: Mutex::new(HashMap::new()),
            addresses: Mutex::new(options.known_peers.into_iter().collect()),
            events,
        });
        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote_addr)) => {
                        trace!(%remote_addr, "inbound comms connection");
                        tokio::spawn(accept_session(stream, accept_shared.clone()));
                    }
                    Err(error) => {
                        warn!(%error, "comms accept failed");
                        break;
                    }
                }
            }
        });
        debug!(peer = %identity.peer_id(), %local_addr, "remote comms listening");
        Ok(RemoteComms {
            identity,
            local_addr,
            shared,
            accept_task,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Record where a peer can be dialed.
    pub async fn add_peer_address(&self, peer: PeerId, addr: SocketAddr) {
        self.shared.addresses.lock().await.insert(peer, addr);
    }

    /// Transmit one frame, dialing the peer first if no session is open.
    pub async fn send_remote_message(&self, peer: &PeerId, frame: Frame) -> Result<(), CommsError> {
        if let Some(sender) = self.shared.sessions.lock().await.get(peer) {
            if sender.send(frame.clone()).is_ok() {
                return Ok(());
            }
        }
        // no live session: dial and retry once
        self.shared.sessions.lock().await.remove(peer);
        self.connect(peer).await?;
        let sessions = self.shared.sessions.lock().await;
        let sender = sessions
            .get(peer)
            .ok_or(CommsError::PeerDisconnected)?;
        sender
            .send(frame)
            .map_err(|_| CommsError::PeerDisconnected)
    }

    async fn connect(&self, peer: &PeerId) -> Result<(), CommsError> {
        let addr = self
            .shared
            .addresses
            .lock()
            .await
            .get(peer)
            .copied()
            .ok_or_else(|| CommsError::UnknownPeer(peer.to_string()))?;
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, FrameCodec);
        framed
            .send(Frame::Hello {
                peer: self.shared.local_peer.to_string(),
            })
            .await?;
        let (sink, stream) = framed.split();
        register_session(peer.clone(), sink, stream, self.shared.clone()).await;
        debug!(%peer, %addr, "opened outbound comms session");
        Ok(())
    }
}

async fn accept_session(stream: TcpStream, shared: Arc<Shared>) {
    let mut framed = Framed::new(stream, FrameCodec);
    let peer = match framed.next().await {
        Some(Ok(Frame::Hello { peer })) => match PeerId::from_hex(&peer) {
            Ok(peer) => peer,
            Err(_) => {
                warn!(%peer, "dropping session with malformed hello peer id");
                return;
            }
        },
        other => {
            warn!(?other, "dropping session that did not open with hello");
            return;
        }
    };
    debug!(%peer, "accepted inbound comms session");
    let (sink, stream) = framed.split();
    register_session(peer, sink, stream, shared).await;
}

async fn register_session(
    peer: PeerId,
    mut sink: SplitSink<Framed<TcpStream, FrameCodec>, Frame>,
    mut stream: SplitStream<Framed<TcpStream, FrameCodec>>,
    shared: Arc<Shared>,
) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    shared
        .sessions
        .lock()
        .await
        .insert(peer.clone(), out_tx);

    let writer_peer = peer.clone();
    let writer_shared = shared.clone();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(error) = sink.send(frame).await {
                warn!(peer = %writer_peer, %error, "comms write failed");
                break;
            }
        }
        writer_shared
            .sessions
            .lock()
            .await
            .remove(&writer_peer);
    });

    tokio::spawn(async move {
        loop {
            match stream.next().await {
                Some(Ok(Frame::Hello { .. })) => {
                    trace!(%peer, "ignoring duplicate hello");
                }
                Some(Ok(frame)) => {
                    if shared
                        .events
                        .send(CommsEvent::Frame {
                            peer: peer.clone(),
                            frame,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Err(CommsError::MalformedFrame(detail))) => {
                    // recoverable: the payload was consumed, keep reading
                    warn!(%peer, %detail, "dropped malformed inbound frame");
                }
                Some(Err(error)) => {
                    warn!(%peer, %error, "comms read failed");
                    break;
                }
                None => break,
            }
        }
        shared.sessions.lock().await.remove(&peer);
        let _ = shared.events.send(CommsEvent::Disconnected { peer });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::WireCapData;

    fn options_with_seed(seed: &[u8]) -> CommsOptions {
        CommsOptions {
            key_seed: Some(seed.to_vec()),
            ..CommsOptions::default()
        }
    }

    #[tokio::test]
    async fn frames_travel_between_two_endpoints() {
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = RemoteComms::initialize(options_with_seed(b"alpha"), a_tx)
            .await
            .expect("initialize a");
        let b = RemoteComms::initialize(options_with_seed(b"beta"), b_tx)
            .await
            .expect("initialize b");
        a.add_peer_address(b.peer_id().clone(), b.local_addr()).await;

        let frame = Frame::Redeem {
            token: "deadbeef".to_string(),
            result: "r1".to_string(),
        };
        a.send_remote_message(b.peer_id(), frame.clone())
            .await
            .expect("send");

        match b_rx.recv().await.expect("event") {
            CommsEvent::Frame { peer, frame: got } => {
                assert_eq!(&peer, a.peer_id());
                assert_eq!(got, frame);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn replies_reuse_the_inbound_session() {
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = RemoteComms::initialize(options_with_seed(b"alpha"), a_tx)
            .await
            .expect("initialize a");
        let b = RemoteComms::initialize(options_with_seed(b"beta"), b_tx)
            .await
            .expect("initialize b");
        a.add_peer_address(b.peer_id().clone(), b.local_addr()).await;

        a.send_remote_message(
            b.peer_id(),
            Frame::Redeem {
                token: "00ff".to_string(),
                result: "r2".to_string(),
            },
        )
        .await
        .expect("send");
        let CommsEvent::Frame { peer, .. } = b_rx.recv().await.expect("event") else {
            panic!("expected frame");
        };

        // b never learned a's address, yet can answer over the open session
        b.send_remote_message(
            &peer,
            Frame::Resolve {
                result: "r2".to_string(),
                rejected: false,
                args: WireCapData {
                    body: "#null".to_string(),
                    slots: vec![],
                },
            },
        )
        .await
        .expect("reply");
        match a_rx.recv().await.expect("event") {
            CommsEvent::Frame { frame, .. } => {
                assert!(matches!(frame, Frame::Resolve { .. }));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn dialing_an_unknown_peer_fails_fast() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let comms = RemoteComms::initialize(options_with_seed(b"gamma"), tx)
            .await
            .expect("initialize");
        let stranger = PeerIdentity::from_seed(b"stranger").expect("identity");
        let result = comms
            .send_remote_message(
                stranger.peer_id(),
                Frame::Redeem {
                    token: "aa".to_string(),
                    result: "r".to_string(),
                },
            )
            .await;
        assert!(matches!(result, Err(CommsError::UnknownPeer(_))));
    }
}
