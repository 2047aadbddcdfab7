//! Candidate-fallback demo.
//!
//! The client prefers `/chat/2.0.0` but the server only registers
//! `/chat/1.0.0`; negotiation settles on the second candidate after one
//! rejection.

use async_trait::async_trait;
use std::sync::Arc;
use stream_switch::{
    Config, MatchKind, MemoryNetwork, MuxedStream, PacketMuxer, PeerId, ProtocolHandler, Switch,
};
use tracing::info;

struct ChatHandler;

#[async_trait]
impl ProtocolHandler for ChatHandler {
    async fn handle(
        &self,
        _stream: MuxedStream,
        peer: PeerId,
        protocol: String,
    ) -> stream_switch::Result<()> {
        info!("Chat session on {} with peer {}", protocol, peer);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("info,stream_switch=debug")
        .init();

    let network = MemoryNetwork::new();

    let server_transport = Arc::new(network.endpoint(PeerId::from("server")).await);
    let server = Switch::new(
        Some(PeerId::from("server")),
        vec![server_transport.clone()],
        Arc::new(PacketMuxer),
        Config::default(),
    )?;
    server
        .handle("/chat/1.0.0", MatchKind::Exact, Arc::new(ChatHandler))
        .await;
    server.listen(server_transport);

    let client_transport = Arc::new(network.endpoint(PeerId::from("client")).await);
    let client = Switch::new(
        Some(PeerId::from("client")),
        vec![client_transport.clone()],
        Arc::new(PacketMuxer),
        Config::default(),
    )?;

    let candidates = vec!["/chat/2.0.0".to_string(), "/chat/1.0.0".to_string()];
    let stream = client.dial(&PeerId::from("server"), &candidates).await?;
    info!(
        "Preferred {} — negotiation settled on {}",
        candidates[0],
        stream.protocol()
    );

    client.close().await;
    server.close().await;
    Ok(())
}
