use std::fmt;

/// Stable, comparable identifier for a network peer.
///
/// The switch never inspects how an identity was generated (public key
/// hash, random token, ...) — it only requires that identities are stable
/// and comparable, because the identity is the connection-reuse key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    /// Create an identity from any stable byte key.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self(key.into())
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(key: &str) -> Self {
        Self(key.as_bytes().to_vec())
    }
}

impl From<&[u8]> for PeerId {
    fn from(key: &[u8]) -> Self {
        Self(key.to_vec())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Printable keys render as-is, binary keys as a short hex prefix.
        match std::str::from_utf8(&self.0) {
            Ok(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_graphic()) => f.write_str(s),
            _ => {
                for byte in self.0.iter().take(8) {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}
