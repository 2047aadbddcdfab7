use crate::error::{Error, Result};
use crate::peer::PeerId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Object-safe duplex byte channel.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

impl std::fmt::Debug for dyn Duplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Duplex")
    }
}

/// A raw connection as produced by a transport: one duplex byte channel
/// to a remote peer, with no stream multiplexing of its own.
pub type RawConn = Box<dyn Duplex>;

/// A logical stream obtained from a connection's multiplexer.
pub type MuxedStream = Box<dyn Duplex>;

/// A way of reaching remote peers.
///
/// Implementations wrap a concrete medium (TCP, WebSocket, in-process
/// pipes); the switch only sees duplex byte channels coming out.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether this transport knows how to reach the given peer.
    async fn can_reach(&self, peer: &PeerId) -> bool;

    /// Establish an outbound connection to the peer.
    async fn connect(&self, peer: &PeerId) -> Result<RawConn>;

    /// Wait for the next inbound connection.
    async fn accept(&self) -> Result<(PeerId, RawConn)>;
}

/// Factory turning raw connections into multiplexed ones.
pub trait Muxer: Send + Sync {
    /// Wrap a raw connection. `initiator` distinguishes the dialing side so
    /// implementations can keep stream-id spaces disjoint.
    fn wrap(&self, conn: RawConn, initiator: bool) -> Box<dyn MuxedConn>;
}

/// One multiplexed connection: a factory and acceptor of logical streams.
///
/// The muxed connection is the only permitted creator of [`MuxedStream`]s
/// from its underlying socket.
#[async_trait]
pub trait MuxedConn: Send + Sync {
    /// Open a new outbound logical stream.
    async fn open_stream(&self) -> Result<MuxedStream>;

    /// Wait for the next inbound logical stream opened by the remote.
    async fn accept_stream(&self) -> Result<MuxedStream>;

    /// Whether the connection has died, closed locally or by the peer.
    fn is_closed(&self) -> bool;

    /// Close the connection and all of its streams.
    async fn close(&self) -> Result<()>;
}

/// Buffer capacity of each in-memory pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// An in-process network connecting [`MemoryTransport`] endpoints.
///
/// Exists so tests and demos can run two switches against each other
/// without touching a real socket; not a production transport.
pub struct MemoryNetwork {
    peers: Mutex<HashMap<PeerId, mpsc::Sender<(PeerId, RawConn)>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Register an endpoint for `local` and return its transport.
    ///
    /// Registering the same peer id twice replaces the previous endpoint;
    /// the old one stops receiving inbound connections.
    pub async fn endpoint(self: &Arc<Self>, local: PeerId) -> MemoryTransport {
        let (tx, rx) = mpsc::channel(16);
        self.peers.lock().await.insert(local.clone(), tx);
        MemoryTransport {
            local,
            network: self.clone(),
            inbound: Mutex::new(rx),
        }
    }
}

/// In-process transport endpoint attached to a [`MemoryNetwork`].
pub struct MemoryTransport {
    local: PeerId,
    network: Arc<MemoryNetwork>,
    inbound: Mutex<mpsc::Receiver<(PeerId, RawConn)>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn can_reach(&self, peer: &PeerId) -> bool {
        self.network.peers.lock().await.contains_key(peer)
    }

    async fn connect(&self, peer: &PeerId) -> Result<RawConn> {
        let tx = {
            let peers = self.network.peers.lock().await;
            peers.get(peer).cloned()
        };
        let tx = tx.ok_or_else(|| Error::Dial(format!("unknown peer {}", peer)))?;

        let (local_end, remote_end) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send((self.local.clone(), Box::new(remote_end)))
            .await
            .map_err(|_| Error::Dial(format!("peer {} is no longer accepting", peer)))?;

        debug!("Memory transport: {} connected to {}", self.local, peer);
        Ok(Box::new(local_end))
    }

    async fn accept(&self) -> Result<(PeerId, RawConn)> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)
    }
}
