use crate::config::Config;
use crate::error::{Error, Result};
use crate::matcher::MatchKind;
use crate::negotiator;
use crate::peer::PeerId;
use crate::registry::{ProtocolHandler, Registry};
use crate::transport::{MuxedConn, MuxedStream, Muxer, Transport};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A multiplexed connection to one remote peer, owned by the switch that
/// created or accepted it.
struct Connection {
    peer: PeerId,
    muxed: Arc<dyn MuxedConn>,

    /// Child of the switch token: switch close cancels every connection.
    cancel: CancellationToken,
}

impl Connection {
    /// Live means neither shut down by this switch nor dead at the
    /// transport: a peer hanging up cancels the muxer's loops, and that
    /// must stop the cache from handing the connection out again.
    fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled() && !self.muxed.is_closed()
    }

    async fn close(&self) {
        self.cancel.cancel();
        let _ = self.muxed.close().await;
        debug!("Closed connection to peer {}", self.peer);
    }
}

/// An outbound muxed stream bound to its negotiated protocol.
#[derive(Debug)]
pub struct NegotiatedStream {
    stream: MuxedStream,
    protocol: String,
    peer: PeerId,
}

impl NegotiatedStream {
    /// The protocol id this stream is bound to.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The remote peer on the other end.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Unwrap into the raw stream.
    pub fn into_inner(self) -> MuxedStream {
        self.stream
    }
}

impl AsyncRead for NegotiatedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for NegotiatedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Top-level coordinator: owns the local identity, the set of active
/// connections, and the protocol registry; runs negotiation on every new
/// logical stream and dispatches inbound streams to registered handlers.
pub struct Switch {
    local: PeerId,
    transports: Vec<Arc<dyn Transport>>,
    muxer: Arc<dyn Muxer>,
    registry: Arc<Registry>,
    connections: Arc<RwLock<HashMap<PeerId, Arc<Connection>>>>,
    config: Config,
    cancel: CancellationToken,
}

impl Switch {
    /// Create a switch for the given local identity.
    ///
    /// Fails with [`Error::Construction`] when no identity is supplied —
    /// before any registry or network state exists, so nothing downstream
    /// ever sees an unidentified local peer.
    pub fn new(
        local: Option<PeerId>,
        transports: Vec<Arc<dyn Transport>>,
        muxer: Arc<dyn Muxer>,
        config: Config,
    ) -> Result<Self> {
        let local = local.ok_or(Error::Construction)?;

        Ok(Self {
            local,
            transports,
            muxer,
            registry: Arc::new(Registry::new()),
            connections: Arc::new(RwLock::new(HashMap::new())),
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// The local peer identity.
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    /// Register a handler for a protocol pattern.
    ///
    /// Re-registering an existing pattern replaces its handler.
    pub async fn handle(
        &self,
        pattern: impl Into<String>,
        kind: MatchKind,
        handler: Arc<dyn ProtocolHandler>,
    ) {
        self.registry.register(pattern, kind, handler).await;
    }

    /// Open a stream to `peer` negotiated to the first mutually supported
    /// protocol in `protocols` (caller priority order).
    pub async fn dial(&self, peer: &PeerId, protocols: &[String]) -> Result<NegotiatedStream> {
        self.dial_inner(peer, protocols, false).await
    }

    /// Like [`Switch::dial`], but asks the remote for its protocol list
    /// first and proposes only the best advertised candidate.
    pub async fn dial_with_ls(
        &self,
        peer: &PeerId,
        protocols: &[String],
    ) -> Result<NegotiatedStream> {
        self.dial_inner(peer, protocols, true).await
    }

    async fn dial_inner(
        &self,
        peer: &PeerId,
        protocols: &[String],
        use_ls: bool,
    ) -> Result<NegotiatedStream> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let conn = self.connection_to(peer).await?;
        // The connection can still die between the liveness check and the
        // stream open; surface that as a dial failure.
        let mut stream = match conn.muxed.open_stream().await {
            Ok(stream) => stream,
            Err(Error::ConnectionClosed) => {
                return Err(Error::Dial(format!("connection to peer {} died", peer)))
            }
            Err(e) => return Err(e),
        };

        let negotiated = tokio::select! {
            result = async {
                if use_ls {
                    negotiator::dial_negotiate_ls(&mut stream, protocols, &self.config).await
                } else {
                    negotiator::dial_negotiate(&mut stream, protocols, &self.config).await
                }
            } => result,
            _ = conn.cancel.cancelled() => Err(Error::Cancelled),
        };

        match negotiated {
            Ok(protocol) => Ok(NegotiatedStream {
                stream,
                protocol,
                peer: peer.clone(),
            }),
            Err(e) => {
                // Only this stream dies; the connection stays up.
                let _ = stream.shutdown().await;
                Err(e)
            }
        }
    }

    /// Get a live connection to the peer, reusing a cached one when
    /// possible, otherwise dialing over the first transport that can
    /// reach the peer.
    async fn connection_to(&self, peer: &PeerId) -> Result<Arc<Connection>> {
        {
            let mut connections = self.connections.write().await;
            if let Some(conn) = connections.get(peer) {
                if conn.is_alive() {
                    debug!("Reusing existing connection to peer {}", peer);
                    return Ok(conn.clone());
                }
                debug!("Evicting dead connection to peer {}", peer);
                connections.remove(peer);
            }
        }

        let mut transport = None;
        for candidate in &self.transports {
            if candidate.can_reach(peer).await {
                transport = Some(candidate.clone());
                break;
            }
        }
        let transport =
            transport.ok_or_else(|| Error::Dial(format!("no transport can reach peer {}", peer)))?;

        let raw = timeout(self.config.dial_timeout, transport.connect(peer))
            .await
            .map_err(|_| Error::Dial(format!("connect to peer {} timed out", peer)))??;

        let conn = self.register_connection(peer.clone(), raw, true).await;
        debug!("Created new connection to peer {}", peer);
        Ok(conn)
    }

    /// Wrap a raw connection in the muxer, cache it, and start serving its
    /// inbound streams.
    async fn register_connection(
        &self,
        peer: PeerId,
        raw: crate::transport::RawConn,
        initiator: bool,
    ) -> Arc<Connection> {
        let muxed: Arc<dyn MuxedConn> = Arc::from(self.muxer.wrap(raw, initiator));
        let conn = Arc::new(Connection {
            peer: peer.clone(),
            muxed,
            cancel: self.cancel.child_token(),
        });

        self.connections
            .write()
            .await
            .insert(peer, conn.clone());

        // Inbound streams arrive on dialed connections too.
        tokio::spawn(stream_loop(
            conn.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.connections.clone(),
        ));

        conn
    }

    /// Start accepting inbound connections on a transport.
    ///
    /// Every accepted connection gets its own stream-accept loop; every
    /// inbound stream negotiates independently and is dispatched to the
    /// matching registered handler.
    pub fn listen(&self, transport: Arc<dyn Transport>) {
        let switch = SwitchRef {
            muxer: self.muxer.clone(),
            registry: self.registry.clone(),
            connections: self.connections.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        };

        tokio::spawn(async move {
            accept_loop(transport, switch).await;
        });
    }

    /// Close all connections and abort in-flight negotiations. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();

        let connections = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, conn)| conn).collect::<Vec<_>>()
        };
        for conn in connections {
            conn.close().await;
        }

        debug!("Switch closed");
    }

    /// Number of live cached connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Drop for Switch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The shared parts of a switch that background loops need.
#[derive(Clone)]
struct SwitchRef {
    muxer: Arc<dyn Muxer>,
    registry: Arc<Registry>,
    connections: Arc<RwLock<HashMap<PeerId, Arc<Connection>>>>,
    config: Config,
    cancel: CancellationToken,
}

/// Accepts inbound connections on one transport.
async fn accept_loop(transport: Arc<dyn Transport>, switch: SwitchRef) {
    loop {
        tokio::select! {
            result = transport.accept() => {
                match result {
                    Ok((peer, raw)) => {
                        debug!("Accepted connection from peer {}", peer);
                        let muxed: Arc<dyn MuxedConn> = Arc::from(switch.muxer.wrap(raw, false));
                        let conn = Arc::new(Connection {
                            peer: peer.clone(),
                            muxed,
                            cancel: switch.cancel.child_token(),
                        });
                        switch.connections.write().await.insert(peer, conn.clone());
                        tokio::spawn(stream_loop(
                            conn,
                            switch.registry.clone(),
                            switch.config.clone(),
                            switch.connections.clone(),
                        ));
                    }
                    Err(e) => {
                        debug!("Accept loop ending: {}", e);
                        return;
                    }
                }
            }
            _ = switch.cancel.cancelled() => {
                debug!("Accept loop cancelled");
                return;
            }
        }
    }
}

/// Accepts inbound muxed streams on one connection and negotiates each in
/// its own task. When the connection dies, its cache entry goes with it.
async fn stream_loop(
    conn: Arc<Connection>,
    registry: Arc<Registry>,
    config: Config,
    connections: Arc<RwLock<HashMap<PeerId, Arc<Connection>>>>,
) {
    loop {
        tokio::select! {
            result = conn.muxed.accept_stream() => {
                match result {
                    Ok(stream) => {
                        let peer = conn.peer.clone();
                        let registry = registry.clone();
                        let config = config.clone();
                        let cancel = conn.cancel.clone();
                        tokio::spawn(async move {
                            negotiate_inbound(stream, peer, registry, config, cancel).await;
                        });
                    }
                    Err(e) => {
                        debug!("Stream loop for peer {} ending: {}", conn.peer, e);
                        break;
                    }
                }
            }
            _ = conn.cancel.cancelled() => {
                debug!("Stream loop for peer {} cancelled", conn.peer);
                break;
            }
        }
    }

    // Forget this connection unless a replacement already took the slot.
    let mut map = connections.write().await;
    if let Some(current) = map.get(&conn.peer) {
        if Arc::ptr_eq(current, &conn) {
            map.remove(&conn.peer);
        }
    }
}

/// Negotiate one inbound stream and hand it to its handler.
///
/// Failure closes this stream only; sibling streams and the connection
/// are untouched.
async fn negotiate_inbound(
    mut stream: MuxedStream,
    peer: PeerId,
    registry: Arc<Registry>,
    config: Config,
    cancel: CancellationToken,
) {
    let negotiated = tokio::select! {
        result = negotiator::listen_negotiate(&mut stream, &registry, &config) => result,
        _ = cancel.cancelled() => Err(Error::Cancelled),
    };

    match negotiated {
        Ok((protocol, handler)) => {
            debug!("Negotiated {} with peer {}", protocol, peer);
            if let Err(e) = handler.handle(stream, peer.clone(), protocol.clone()).await {
                warn!("Handler for {} failed on peer {}: {}", protocol, peer, e);
            }
        }
        Err(e) => {
            warn!("Inbound negotiation with peer {} failed: {}", peer, e);
            let _ = stream.shutdown().await;
        }
    }
}
