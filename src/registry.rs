use crate::matcher::{self, MatchKind};
use crate::peer::PeerId;
use crate::transport::MuxedStream;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Capability invoked with every inbound stream negotiated to its protocol.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Handle one negotiated stream. `protocol` is the id that won
    /// negotiation (useful when the registration pattern is a range).
    async fn handle(&self, stream: MuxedStream, peer: PeerId, protocol: String)
        -> crate::error::Result<()>;
}

impl std::fmt::Debug for dyn ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ProtocolHandler")
    }
}

/// One registered protocol: pattern, discipline, handler.
struct Registration {
    pattern: String,
    kind: MatchKind,
    handler: Arc<dyn ProtocolHandler>,
}

/// Ordered protocol registry.
///
/// Registrations are scanned in insertion order; the first pattern that
/// matches an offered id wins. Re-registering an existing pattern replaces
/// its handler in place, keeping its position in the order.
pub struct Registry {
    entries: RwLock<Vec<Registration>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Add or replace a registration.
    pub async fn register(
        &self,
        pattern: impl Into<String>,
        kind: MatchKind,
        handler: Arc<dyn ProtocolHandler>,
    ) {
        let pattern = pattern.into();
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.iter_mut().find(|r| r.pattern == pattern) {
            debug!("Replacing handler for pattern {}", pattern);
            existing.kind = kind;
            existing.handler = handler;
            return;
        }

        debug!("Registered pattern {}", pattern);
        entries.push(Registration {
            pattern,
            kind,
            handler,
        });
    }

    /// Find the first registration matching the offered id.
    pub async fn lookup(&self, candidate: &str) -> Option<Arc<dyn ProtocolHandler>> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .find(|r| matcher::matches(candidate, &r.pattern, r.kind))
            .map(|r| r.handler.clone())
    }

    /// Snapshot of all registered patterns, in insertion order.
    pub async fn patterns(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        entries.iter().map(|r| r.pattern.clone()).collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use tokio::sync::Mutex;

    /// Records which handler ran, so tests can observe match order.
    struct TagHandler {
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ProtocolHandler for TagHandler {
        async fn handle(
            &self,
            _stream: MuxedStream,
            _peer: PeerId,
            _protocol: String,
        ) -> Result<()> {
            self.log.lock().await.push(self.tag);
            Ok(())
        }
    }

    fn handler(tag: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<TagHandler> {
        Arc::new(TagHandler {
            tag,
            log: log.clone(),
        })
    }

    fn dummy_stream() -> MuxedStream {
        let (a, _b) = tokio::io::duplex(16);
        Box::new(a)
    }

    async fn run_lookup(registry: &Registry, candidate: &str) {
        let handler = registry.lookup(candidate).await.unwrap();
        handler
            .handle(dummy_stream(), PeerId::from("peer"), candidate.to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::new();
        registry
            .register("/chat/^1.0.0", MatchKind::SemverRange, handler("range", &log))
            .await;
        registry
            .register("/chat/1.2.0", MatchKind::Exact, handler("exact", &log))
            .await;

        // Both registrations match the offered id; insertion order decides.
        run_lookup(&registry, "/chat/1.2.0").await;
        assert_eq!(*log.lock().await, vec!["range"]);
    }

    #[tokio::test]
    async fn test_lookup_by_discipline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::new();
        registry
            .register("/echo/1.0.0", MatchKind::Exact, handler("echo", &log))
            .await;
        registry
            .register("/file/^2.0.0", MatchKind::SemverRange, handler("file", &log))
            .await;

        assert!(registry.lookup("/echo/1.0.0").await.is_some());
        assert!(registry.lookup("/echo/1.0.1").await.is_none());
        assert!(registry.lookup("/file/2.3.1").await.is_some());
        assert!(registry.lookup("/file/3.0.0").await.is_none());
    }

    #[tokio::test]
    async fn test_reregistration_replaces_in_place() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::new();
        registry
            .register("/a/1.0.0", MatchKind::Exact, handler("first", &log))
            .await;
        registry
            .register("/b/1.0.0", MatchKind::Exact, handler("second", &log))
            .await;
        registry
            .register("/a/1.0.0", MatchKind::Exact, handler("replaced", &log))
            .await;

        // Still two entries, original order preserved, new handler active.
        assert_eq!(registry.patterns().await, vec!["/a/1.0.0", "/b/1.0.0"]);
        run_lookup(&registry, "/a/1.0.0").await;
        assert_eq!(*log.lock().await, vec!["replaced"]);
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let registry = Registry::new();
        assert!(registry.lookup("/any/1.0.0").await.is_none());
        assert!(registry.patterns().await.is_empty());
    }
}
