//! Minimal length-prefixed stream multiplexer.
//!
//! Turns one reliable duplex connection into many independent logical
//! streams, enough for tests and demos to exercise the switch end to end.
//! There is deliberately no flow control or retransmission: the underlying
//! connection is assumed reliable and ordered, and backpressure comes from
//! the channel between each stream and the shared writer task.
//!
//! Wire format per packet:
//! ```text
//! [stream_id: u32][flags: u8][length: u16][data: bytes]
//! ```

use crate::error::{Error, Result};
use crate::transport::{MuxedConn, MuxedStream, Muxer, RawConn};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace, warn};

/// Open a new stream.
const FLAG_SYN: u8 = 0x01;
/// Sender is done writing on this stream.
const FLAG_FIN: u8 = 0x02;

/// Packet header size (stream_id + flags + length).
const HEADER_SIZE: usize = 7;

/// Maximum data payload per packet.
const MAX_DATA_SIZE: usize = u16::MAX as usize;

/// One multiplexer packet.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Packet {
    stream_id: u32,
    flags: u8,
    data: Vec<u8>,
}

impl Packet {
    fn syn(stream_id: u32) -> Self {
        Self {
            stream_id,
            flags: FLAG_SYN,
            data: Vec::new(),
        }
    }

    fn fin(stream_id: u32) -> Self {
        Self {
            stream_id,
            flags: FLAG_FIN,
            data: Vec::new(),
        }
    }

    fn data(stream_id: u32, data: Vec<u8>) -> Self {
        Self {
            stream_id,
            flags: 0,
            data,
        }
    }

    fn is_syn(&self) -> bool {
        self.flags & FLAG_SYN != 0
    }

    fn is_fin(&self) -> bool {
        self.flags & FLAG_FIN != 0
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.data.len());
        buf.put_u32(self.stream_id);
        buf.put_u8(self.flags);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
        buf
    }
}

/// [`Muxer`] implementation wrapping connections in a [`PacketConn`].
pub struct PacketMuxer;

impl Muxer for PacketMuxer {
    fn wrap(&self, conn: RawConn, initiator: bool) -> Box<dyn MuxedConn> {
        Box::new(PacketConn::new(conn, initiator))
    }
}

/// One multiplexed connection: routes packets between the shared socket
/// and per-stream channels.
struct PacketConn {
    /// Packets from all streams, drained by the writer task.
    outgoing: mpsc::Sender<Packet>,

    /// Streams opened by the remote, surfaced via `accept_stream`.
    incoming: Mutex<mpsc::Receiver<MuxStream>>,

    /// Inbound data routing (stream id -> sender feeding that stream).
    streams: Arc<Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>>,

    /// Local-drop notices from streams, drained by the read loop.
    dropped: mpsc::UnboundedSender<(u32, bool)>,

    /// Next outbound stream id (odd for initiator, even for acceptor).
    next_stream_id: AtomicU32,

    cancel: CancellationToken,
}

impl PacketConn {
    fn new(conn: RawConn, initiator: bool) -> Self {
        let (read_half, write_half) = tokio::io::split(conn);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(64);
        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        let (dropped_tx, dropped_rx) = mpsc::unbounded_channel();
        let streams = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(write_loop(write_half, outgoing_rx, cancel.clone()));
        tokio::spawn(read_loop(
            read_half,
            streams.clone(),
            incoming_tx,
            outgoing_tx.clone(),
            dropped_tx.clone(),
            dropped_rx,
            cancel.clone(),
        ));

        Self {
            outgoing: outgoing_tx,
            incoming: Mutex::new(incoming_rx),
            streams,
            dropped: dropped_tx,
            next_stream_id: AtomicU32::new(if initiator { 1 } else { 2 }),
            cancel,
        }
    }
}

#[async_trait]
impl MuxedConn for PacketConn {
    async fn open_stream(&self) -> Result<MuxedStream> {
        if self.cancel.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        let id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (data_tx, data_rx) = mpsc::channel(32);
        self.streams.lock().await.insert(id, data_tx);

        self.outgoing
            .send(Packet::syn(id))
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        trace!("Opened stream {}", id);
        Ok(Box::new(MuxStream::new(
            id,
            data_rx,
            self.outgoing.clone(),
            self.dropped.clone(),
        )))
    }

    async fn accept_stream(&self) -> Result<MuxedStream> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            stream = incoming.recv() => stream
                .map(|s| Box::new(s) as MuxedStream)
                .ok_or(Error::ConnectionClosed),
            _ = self.cancel.cancelled() => Err(Error::ConnectionClosed),
        }
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        debug!("Muxed connection closed");
        Ok(())
    }
}

impl Drop for PacketConn {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reads packets off the socket and routes them to streams; also retires
/// map entries for streams dropped on this side.
async fn read_loop(
    mut reader: ReadHalf<RawConn>,
    streams: Arc<Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>>,
    incoming: mpsc::Sender<MuxStream>,
    outgoing: mpsc::Sender<Packet>,
    dropped_tx: mpsc::UnboundedSender<(u32, bool)>,
    mut dropped_rx: mpsc::UnboundedReceiver<(u32, bool)>,
    cancel: CancellationToken,
) {
    let mut header = [0u8; HEADER_SIZE];

    loop {
        tokio::select! {
            result = reader.read_exact(&mut header) => {
                if result.is_err() {
                    // Peer closed the connection
                    cancel.cancel();
                    return;
                }

                let mut cursor = &header[..];
                let stream_id = cursor.get_u32();
                let flags = cursor.get_u8();
                let length = cursor.get_u16() as usize;

                let mut data = vec![0u8; length];
                if reader.read_exact(&mut data).await.is_err() {
                    cancel.cancel();
                    return;
                }

                let packet = Packet { stream_id, flags, data };
                route_packet(packet, &streams, &incoming, &outgoing, &dropped_tx).await;
            }
            notice = dropped_rx.recv() => {
                // This task holds a sender, so recv never yields None.
                if let Some((id, fin_needed)) = notice {
                    streams.lock().await.remove(&id);
                    if fin_needed {
                        let _ = outgoing.send(Packet::fin(id)).await;
                    }
                    trace!("Stream {} dropped locally", id);
                }
            }
            _ = cancel.cancelled() => {
                trace!("Read loop cancelled");
                return;
            }
        }
    }
}

async fn route_packet(
    packet: Packet,
    streams: &Arc<Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>>,
    incoming: &mpsc::Sender<MuxStream>,
    outgoing: &mpsc::Sender<Packet>,
    dropped: &mpsc::UnboundedSender<(u32, bool)>,
) {
    let id = packet.stream_id;

    if packet.is_syn() {
        let (data_tx, data_rx) = mpsc::channel(32);
        {
            let mut streams = streams.lock().await;
            if streams.contains_key(&id) {
                debug!("Duplicate SYN for stream {}, ignoring", id);
                return;
            }
            streams.insert(id, data_tx);
        }

        let stream = MuxStream::new(id, data_rx, outgoing.clone(), dropped.clone());
        if incoming.send(stream).await.is_err() {
            warn!("Nobody accepting streams, dropping stream {}", id);
            streams.lock().await.remove(&id);
        } else {
            trace!("Accepted stream {}", id);
        }
        return;
    }

    if packet.is_fin() {
        // Dropping the sender ends the stream's inbound side after any
        // already-buffered data is drained.
        streams.lock().await.remove(&id);
        trace!("Stream {} finished by peer", id);
        return;
    }

    if packet.data.is_empty() {
        return;
    }

    let tx = {
        let streams = streams.lock().await;
        streams.get(&id).cloned()
    };
    match tx {
        Some(tx) => {
            // Applies backpressure to the whole connection when one stream
            // stops reading; acceptable for a test multiplexer.
            let _ = tx.send(packet.data).await;
        }
        None => warn!("Data for unknown stream {}, dropping", id),
    }
}

/// Drains packets from all streams and writes them to the socket.
async fn write_loop(
    mut writer: WriteHalf<RawConn>,
    mut outgoing: mpsc::Receiver<Packet>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            packet = outgoing.recv() => {
                let Some(packet) = packet else {
                    return;
                };
                let buf = packet.encode();
                if writer.write_all(&buf).await.is_err() || writer.flush().await.is_err() {
                    cancel.cancel();
                    return;
                }
                trace!(
                    "Wrote packet stream={} flags={:02x} len={}",
                    packet.stream_id, packet.flags, packet.data.len()
                );
            }
            _ = cancel.cancelled() => {
                trace!("Write loop cancelled");
                return;
            }
        }
    }
}

/// One logical stream over a [`PacketConn`].
struct MuxStream {
    id: u32,
    /// Inbound data chunks from the read loop.
    rx: mpsc::Receiver<Vec<u8>>,
    /// Leftover bytes from a partially consumed chunk.
    buffered: Vec<u8>,
    out: PollSender<Packet>,
    /// Tells the read loop to retire this stream's routing entry.
    dropped: mpsc::UnboundedSender<(u32, bool)>,
    write_closed: bool,
}

impl MuxStream {
    fn new(
        id: u32,
        rx: mpsc::Receiver<Vec<u8>>,
        outgoing: mpsc::Sender<Packet>,
        dropped: mpsc::UnboundedSender<(u32, bool)>,
    ) -> Self {
        Self {
            id,
            rx,
            buffered: Vec::new(),
            out: PollSender::new(outgoing),
            dropped,
            write_closed: false,
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        // FIN the peer too if shutdown never did.
        let _ = self.dropped.send((self.id, !self.write_closed));
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.buffered.is_empty() {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.buffered = chunk,
                // Sender dropped: peer sent FIN or the connection died — EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = buf.remaining().min(this.buffered.len());
        buf.put_slice(&this.buffered[..n]);
        this.buffered.drain(..n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.write_closed {
            return Poll::Ready(Err(broken_pipe()));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        match this.out.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = data.len().min(MAX_DATA_SIZE);
                let packet = Packet::data(this.id, data[..n].to_vec());
                if this.out.send_item(packet).is_err() {
                    return Poll::Ready(Err(broken_pipe()));
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(broken_pipe())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Packets are handed to the writer task as they are produced.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.write_closed {
            return Poll::Ready(Ok(()));
        }

        match this.out.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let _ = this.out.send_item(Packet::fin(this.id));
                this.write_closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                // Writer task is gone; nothing left to notify.
                this.write_closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_encode_layout() {
        let packet = Packet::data(42, b"hello".to_vec());
        let buf = packet.encode();

        assert_eq!(buf.len(), HEADER_SIZE + 5);
        let mut cursor = &buf[..];
        assert_eq!(cursor.get_u32(), 42);
        assert_eq!(cursor.get_u8(), 0);
        assert_eq!(cursor.get_u16(), 5);
        assert_eq!(cursor, b"hello");
    }

    #[test]
    fn test_packet_flags() {
        assert!(Packet::syn(1).is_syn());
        assert!(!Packet::syn(1).is_fin());
        assert!(Packet::fin(1).is_fin());
        assert!(!Packet::data(1, vec![1]).is_syn());
    }

    fn connected_pair() -> (Box<dyn MuxedConn>, Box<dyn MuxedConn>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let muxer = PacketMuxer;
        (
            muxer.wrap(Box::new(a), true),
            muxer.wrap(Box::new(b), false),
        )
    }

    #[tokio::test]
    async fn test_open_accept_and_transfer() {
        let (initiator, acceptor) = connected_pair();

        let mut out_stream = initiator.open_stream().await.unwrap();
        let mut in_stream = acceptor.accept_stream().await.unwrap();

        out_stream.write_all(b"over the mux").await.unwrap();
        out_stream.flush().await.unwrap();

        let mut buf = vec![0u8; 12];
        in_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over the mux");

        // Reply on the same stream
        in_stream.write_all(b"ack").await.unwrap();
        let mut buf = vec![0u8; 3];
        out_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ack");
    }

    #[tokio::test]
    async fn test_shutdown_yields_eof() {
        let (initiator, acceptor) = connected_pair();

        let mut out_stream = initiator.open_stream().await.unwrap();
        let mut in_stream = acceptor.accept_stream().await.unwrap();

        out_stream.write_all(b"bye").await.unwrap();
        out_stream.shutdown().await.unwrap();

        // Buffered data still arrives before EOF
        let mut buf = Vec::new();
        in_stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bye");
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let (initiator, acceptor) = connected_pair();

        let mut out1 = initiator.open_stream().await.unwrap();
        let mut out2 = initiator.open_stream().await.unwrap();
        let mut in1 = acceptor.accept_stream().await.unwrap();
        let mut in2 = acceptor.accept_stream().await.unwrap();

        out1.write_all(b"first").await.unwrap();
        out2.write_all(b"second").await.unwrap();

        let mut buf = vec![0u8; 5];
        in1.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first");

        let mut buf = vec![0u8; 6];
        in2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"second");

        // Closing one stream leaves the other usable
        out1.shutdown().await.unwrap();
        out2.write_all(b"still here").await.unwrap();
        let mut buf = vec![0u8; 10];
        in2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
    }

    #[tokio::test]
    async fn test_open_after_close_fails() {
        let (initiator, _acceptor) = connected_pair();

        initiator.close().await.unwrap();
        assert!(initiator.is_closed());
        assert!(matches!(
            initiator.open_stream().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_remote_death_marks_connection_closed() {
        let (initiator, acceptor) = connected_pair();
        assert!(!initiator.is_closed());

        // The remote side going away surfaces on the next accept and flips
        // the liveness flag.
        drop(acceptor);
        let err = initiator.accept_stream().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(initiator.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_stream_retires_routing_entry() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let conn_a = PacketConn::new(Box::new(a), true);
        let conn_b = PacketConn::new(Box::new(b), false);

        let out_stream = conn_a.open_stream().await.unwrap();
        let mut in_stream = conn_b.accept_stream().await.unwrap();
        assert_eq!(conn_a.streams.lock().await.len(), 1);

        // Dropping without shutdown still FINs the peer and cleans up.
        drop(out_stream);
        let mut buf = Vec::new();
        in_stream.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        assert!(conn_a.streams.lock().await.is_empty());
    }
}
