//! Connection switch with multistream-select protocol negotiation.
//!
//! This crate turns a raw duplex connection between two peers into a set of
//! independently addressable, protocol-tagged logical streams. Per stream,
//! per connection, a line-based handshake decides which application
//! protocol governs it:
//!
//! - Open multiple concurrent streams per peer connection
//! - Register protocol handlers matched exactly or by semver range
//! - Use standard Rust async I/O traits (AsyncRead, AsyncWrite)
//!
//! # Architecture
//!
//! ```text
//! Application protocols (register handlers, dial peers)
//!     ↓
//! Switch (connections, negotiation, dispatch)
//!     ↓
//! Muxer (one connection → many streams)
//!     ↓
//! Transport (duplex byte connections)
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stream_switch::{Config, MatchKind, MemoryNetwork, PacketMuxer, PeerId, Switch};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::new();
//!     let transport = Arc::new(network.endpoint(PeerId::from("alice")).await);
//!
//!     let switch = Switch::new(
//!         Some(PeerId::from("alice")),
//!         vec![transport.clone()],
//!         Arc::new(PacketMuxer),
//!         Config::default(),
//!     )?;
//!
//!     // Serve a protocol
//!     switch.handle("/echo/1.0.0", MatchKind::Exact, Arc::new(EchoHandler)).await;
//!     switch.listen(transport);
//!
//!     // Dial one
//!     let stream = switch
//!         .dial(&PeerId::from("bob"), &["/echo/1.0.0".to_string()])
//!         .await?;
//!     assert_eq!(stream.protocol(), "/echo/1.0.0");
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod frame;
pub mod matcher;
pub mod mux;
pub mod negotiator;
pub mod peer;
pub mod registry;
pub mod switch;
pub mod transport;

// Re-export main types
pub use config::Config;
pub use error::{Error, Result};
pub use matcher::{matches, MatchKind};
pub use mux::PacketMuxer;
pub use negotiator::{Role, LS, MULTISTREAM_PROTO, NA};
pub use peer::PeerId;
pub use registry::{ProtocolHandler, Registry};
pub use switch::{NegotiatedStream, Switch};
pub use transport::{
    MemoryNetwork, MemoryTransport, MuxedConn, MuxedStream, Muxer, RawConn, Transport,
};
