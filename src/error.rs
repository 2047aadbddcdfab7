use thiserror::Error;

/// Errors that can occur in switch and negotiation operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Switch built without a local peer identity
    #[error("Switch requires a local peer identity")]
    Construction,

    /// Malformed length prefix, truncated payload, or oversize frame
    #[error("Framing error: {0}")]
    Framing(String),

    /// No mutually acceptable protocol after exhausting candidates or attempts
    #[error("No mutually supported protocol")]
    NegotiationFailed,

    /// Bootstrap multistream id not acknowledged by the remote
    #[error("Multistream handshake rejected by peer")]
    HandshakeFailed,

    /// Transport-level failure to establish a connection
    #[error("Dial error: {0}")]
    Dial(String),

    /// Deadline expiry or explicit shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
