//! Echo demo: two switches on an in-memory network.
//!
//! The server registers an echo protocol, the client dials it and sends a
//! message over the negotiated stream.

use async_trait::async_trait;
use std::sync::Arc;
use stream_switch::{
    Config, MatchKind, MemoryNetwork, MuxedStream, PacketMuxer, PeerId, ProtocolHandler, Switch,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

/// Default protocol served by the echo side
const ECHO_PROTO: &str = "/echo/1.0.0";

struct EchoHandler;

#[async_trait]
impl ProtocolHandler for EchoHandler {
    async fn handle(
        &self,
        mut stream: MuxedStream,
        peer: PeerId,
        protocol: String,
    ) -> stream_switch::Result<()> {
        info!("Serving {} for peer {}", protocol, peer);

        let mut buf = vec![0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                info!("Stream closed by peer {}", peer);
                break;
            }
            stream.write_all(&buf[..n]).await?;
            stream.flush().await?;
            info!("Echoed {} bytes to peer {}", n, peer);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("info,stream_switch=debug")
        .init();

    let network = MemoryNetwork::new();

    // Server switch
    let server_transport = Arc::new(network.endpoint(PeerId::from("server")).await);
    let server = Switch::new(
        Some(PeerId::from("server")),
        vec![server_transport.clone()],
        Arc::new(PacketMuxer),
        Config::default(),
    )?;
    server
        .handle(ECHO_PROTO, MatchKind::Exact, Arc::new(EchoHandler))
        .await;
    server.listen(server_transport);
    info!("Server listening for {}", ECHO_PROTO);

    // Client switch
    let client_transport = Arc::new(network.endpoint(PeerId::from("client")).await);
    let client = Switch::new(
        Some(PeerId::from("client")),
        vec![client_transport.clone()],
        Arc::new(PacketMuxer),
        Config::default(),
    )?;

    let mut stream = client
        .dial(&PeerId::from("server"), &[ECHO_PROTO.to_string()])
        .await?;
    info!("Negotiated {}", stream.protocol());

    stream.write_all(b"Hello, switch!").await?;
    stream.flush().await?;

    let mut buf = vec![0u8; 64];
    let n = stream.read(&mut buf).await?;
    info!("Got back: {}", String::from_utf8_lossy(&buf[..n]));

    client.close().await;
    server.close().await;
    Ok(())
}
