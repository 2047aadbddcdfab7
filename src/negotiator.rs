//! Multistream-select handshake, both halves.
//!
//! The listener and dialer are two variants of the same session driving one
//! frame codec, not two separate protocol implementations. Either side may
//! run on any duplex stream; the switch runs the listener on every inbound
//! muxed stream and the dialer on every outbound one.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame;
use crate::matcher::{self, MatchKind};
use crate::registry::{ProtocolHandler, Registry};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Bootstrap protocol id exchanged before any application proposal.
pub const MULTISTREAM_PROTO: &str = "/multistream/1.0.0";

/// Reserved command: list all registered patterns.
pub const LS: &str = "ls";

/// Reserved response: proposed protocol not available.
pub const NA: &str = "na";

/// Upper bound on patterns accepted in one `ls` listing.
const MAX_LS_ENTRIES: usize = 1024;

/// Which half of the handshake this session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Dialer,
}

/// Ephemeral per-stream handshake state.
///
/// Lives exactly as long as one negotiation; dropped on success or failure.
struct Session<'a, S> {
    role: Role,
    stream: &'a mut S,
    max_frame_len: usize,
    attempts: u32,
}

impl<'a, S> Session<'a, S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    fn new(role: Role, stream: &'a mut S, config: &Config) -> Self {
        Self {
            role,
            stream,
            max_frame_len: config.max_frame_len,
            attempts: 0,
        }
    }

    async fn read(&mut self) -> Result<String> {
        let id = frame::read_frame(self.stream, self.max_frame_len).await?;
        trace!("{:?} received {:?}", self.role, id);
        Ok(id)
    }

    async fn write(&mut self, id: &str) -> Result<()> {
        frame::write_frame(self.stream, id).await?;
        trace!("{:?} sent {:?}", self.role, id);
        Ok(())
    }

    /// Write each pattern as its own frame, then an empty-id terminator.
    async fn write_list(&mut self, patterns: &[String]) -> Result<()> {
        for pattern in patterns {
            self.write(pattern).await?;
        }
        self.write("").await
    }

    /// Read frames until the empty-id terminator.
    async fn read_list(&mut self) -> Result<Vec<String>> {
        let mut patterns = Vec::new();
        loop {
            let id = self.read().await?;
            if id.is_empty() {
                return Ok(patterns);
            }
            if patterns.len() >= MAX_LS_ENTRIES {
                return Err(Error::Framing("protocol listing too long".to_string()));
            }
            patterns.push(id);
        }
    }
}

/// Run the listener half on an inbound stream.
///
/// Answers the dialer's multistream header, then accepts proposals until
/// one matches the registry, the attempt budget is exhausted, or the
/// deadline expires. On success the stream is bound: the winning id and
/// its handler are returned and no further negotiation may occur.
pub async fn listen_negotiate<S>(
    stream: &mut S,
    registry: &Registry,
    config: &Config,
) -> Result<(String, Arc<dyn ProtocolHandler>)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    timeout(
        config.negotiation_timeout,
        listen_inner(stream, registry, config),
    )
    .await
    .map_err(|_| Error::Cancelled)?
}

async fn listen_inner<S>(
    stream: &mut S,
    registry: &Registry,
    config: &Config,
) -> Result<(String, Arc<dyn ProtocolHandler>)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut session = Session::new(Role::Listener, stream, config);

    // The dialer speaks first; echo its header iff we speak its protocol.
    let header = session.read().await?;
    if !matcher::matches(&header, MULTISTREAM_PROTO, MatchKind::SemverRange) {
        session.write(NA).await?;
        return Err(Error::HandshakeFailed);
    }
    session.write(&header).await?;

    loop {
        let proposal = session.read().await?;

        if proposal == LS {
            // Listing does not consume an attempt.
            session.write_list(&registry.patterns().await).await?;
            continue;
        }

        if let Some(handler) = registry.lookup(&proposal).await {
            session.write(&proposal).await?;
            debug!("Listener bound stream to {}", proposal);
            return Ok((proposal, handler));
        }

        session.write(NA).await?;
        session.attempts += 1;
        if session.attempts >= config.max_attempts {
            debug!(
                "Listener giving up after {} rejected proposals",
                session.attempts
            );
            return Err(Error::NegotiationFailed);
        }
    }
}

/// Run the dialer half on an outbound stream, proposing each candidate in
/// priority order until one is accepted.
///
/// Returns the id the stream is now bound to.
pub async fn dial_negotiate<S>(stream: &mut S, protocols: &[String], config: &Config) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    timeout(config.negotiation_timeout, dial_inner(stream, protocols, config))
        .await
        .map_err(|_| Error::Cancelled)?
}

async fn dial_inner<S>(stream: &mut S, protocols: &[String], config: &Config) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut session = Session::new(Role::Dialer, stream, config);
    handshake(&mut session).await?;

    for protocol in protocols {
        session.write(protocol).await?;
        let response = session.read().await?;

        if response == *protocol {
            debug!("Dialer bound stream to {}", protocol);
            return Ok(protocol.clone());
        }
        if response != NA {
            return Err(Error::Framing(format!(
                "unexpected response to proposal: {:?}",
                response
            )));
        }
        trace!("Proposal {} rejected, trying next candidate", protocol);
    }

    Err(Error::NegotiationFailed)
}

/// Dialer variant that lists the remote's patterns first and proposes only
/// the best local candidate the remote advertises.
///
/// Saves round trips over blind sequential proposal when the candidate
/// list is long. The advertised patterns are matched client-side with the
/// exact discipline; range registrations on the listener still apply to
/// the final proposal itself.
pub async fn dial_negotiate_ls<S>(
    stream: &mut S,
    protocols: &[String],
    config: &Config,
) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    timeout(
        config.negotiation_timeout,
        dial_ls_inner(stream, protocols, config),
    )
    .await
    .map_err(|_| Error::Cancelled)?
}

async fn dial_ls_inner<S>(stream: &mut S, protocols: &[String], config: &Config) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut session = Session::new(Role::Dialer, stream, config);
    handshake(&mut session).await?;

    session.write(LS).await?;
    let advertised = session.read_list().await?;
    trace!("Remote advertises {} protocols", advertised.len());

    let candidate = protocols
        .iter()
        .find(|p| advertised.iter().any(|a| a == *p))
        .ok_or(Error::NegotiationFailed)?;

    session.write(candidate).await?;
    let response = session.read().await?;
    if response == *candidate {
        debug!("Dialer bound stream to {}", candidate);
        return Ok(candidate.clone());
    }
    Err(Error::NegotiationFailed)
}

/// Dialer side of the bootstrap header exchange.
async fn handshake<S>(session: &mut Session<'_, S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    session.write(MULTISTREAM_PROTO).await?;
    let echo = session.read().await?;
    if !matcher::matches(&echo, MULTISTREAM_PROTO, MatchKind::SemverRange) {
        return Err(Error::HandshakeFailed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;
    use crate::transport::MuxedStream;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoopHandler;

    #[async_trait]
    impl ProtocolHandler for NoopHandler {
        async fn handle(
            &self,
            _stream: MuxedStream,
            _peer: PeerId,
            _protocol: String,
        ) -> Result<()> {
            Ok(())
        }
    }

    async fn registry_with(patterns: &[(&str, MatchKind)]) -> Registry {
        let registry = Registry::new();
        for (pattern, kind) in patterns {
            registry
                .register(pattern.to_string(), *kind, Arc::new(NoopHandler))
                .await;
        }
        registry
    }

    #[tokio::test]
    async fn test_negotiate_exact_protocol() {
        let (mut dialer, mut listener) = tokio::io::duplex(4096);
        let registry = registry_with(&[("/echo/1.0.0", MatchKind::Exact)]).await;
        let config = Config::default();

        let listen = tokio::spawn(async move {
            listen_negotiate(&mut listener, &registry, &config).await
        });

        let config = Config::default();
        let protocols = vec!["/echo/1.0.0".to_string()];
        let bound = dial_negotiate(&mut dialer, &protocols, &config)
            .await
            .unwrap();
        assert_eq!(bound, "/echo/1.0.0");

        let (protocol, _handler) = listen.await.unwrap().unwrap();
        assert_eq!(protocol, "/echo/1.0.0");
    }

    #[tokio::test]
    async fn test_negotiate_second_candidate_after_na() {
        let (mut dialer, mut listener) = tokio::io::duplex(4096);
        let registry = registry_with(&[("/chat/1.0.0", MatchKind::Exact)]).await;
        let config = Config::default();

        let listen = tokio::spawn(async move {
            listen_negotiate(&mut listener, &registry, &config).await
        });

        let config = Config::default();
        let protocols = vec!["/chat/2.0.0".to_string(), "/chat/1.0.0".to_string()];
        let bound = dial_negotiate(&mut dialer, &protocols, &config)
            .await
            .unwrap();
        assert_eq!(bound, "/chat/1.0.0");

        let (protocol, _handler) = listen.await.unwrap().unwrap();
        assert_eq!(protocol, "/chat/1.0.0");
    }

    #[tokio::test]
    async fn test_negotiate_semver_registration() {
        let (mut dialer, mut listener) = tokio::io::duplex(4096);
        let registry = registry_with(&[("/file/^1.0.0", MatchKind::SemverRange)]).await;
        let config = Config::default();

        let listen = tokio::spawn(async move {
            listen_negotiate(&mut listener, &registry, &config).await
        });

        let config = Config::default();
        let protocols = vec!["/file/1.3.0".to_string()];
        let bound = dial_negotiate(&mut dialer, &protocols, &config)
            .await
            .unwrap();
        assert_eq!(bound, "/file/1.3.0");

        // The listener reports the offered id, not the range pattern.
        let (protocol, _handler) = listen.await.unwrap().unwrap();
        assert_eq!(protocol, "/file/1.3.0");
    }

    #[tokio::test]
    async fn test_negotiation_failed_after_attempt_limit() {
        let (mut dialer, mut listener) = tokio::io::duplex(4096);
        let registry = registry_with(&[]).await;
        let config = Config {
            max_attempts: 1,
            ..Config::default()
        };

        let listen = tokio::spawn(async move {
            listen_negotiate(&mut listener, &registry, &config).await
        });

        let config = Config::default();
        let protocols = vec!["/unknown/1.0.0".to_string()];
        let err = dial_negotiate(&mut dialer, &protocols, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NegotiationFailed));

        let err = listen.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::NegotiationFailed));
    }

    #[tokio::test]
    async fn test_handshake_failed_on_wrong_header() {
        let (mut dialer, mut listener) = tokio::io::duplex(4096);
        let registry = registry_with(&[("/echo/1.0.0", MatchKind::Exact)]).await;
        let config = Config::default();

        let listen = tokio::spawn(async move {
            listen_negotiate(&mut listener, &registry, &config).await
        });

        // A peer speaking an incompatible multistream major version.
        let config = Config::default();
        frame::write_frame(&mut dialer, "/multistream/2.0.0")
            .await
            .unwrap();
        let response = frame::read_frame(&mut dialer, config.max_frame_len)
            .await
            .unwrap();
        assert_eq!(response, NA);

        let err = listen.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed));
    }

    #[tokio::test]
    async fn test_dialer_rejects_na_header() {
        let (mut dialer, mut listener) = tokio::io::duplex(4096);

        let fake_listener = tokio::spawn(async move {
            // Read the header, refuse it.
            let config = Config::default();
            let _ = frame::read_frame(&mut listener, config.max_frame_len).await;
            frame::write_frame(&mut listener, NA).await
        });

        let config = Config::default();
        let protocols = vec!["/echo/1.0.0".to_string()];
        let err = dial_negotiate(&mut dialer, &protocols, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed));

        fake_listener.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ls_then_select() {
        let (mut dialer, mut listener) = tokio::io::duplex(4096);
        let registry = registry_with(&[
            ("/mail/1.0.0", MatchKind::Exact),
            ("/chat/1.0.0", MatchKind::Exact),
        ])
        .await;
        let config = Config::default();

        let listen = tokio::spawn(async move {
            listen_negotiate(&mut listener, &registry, &config).await
        });

        let config = Config::default();
        let protocols = vec!["/chat/2.0.0".to_string(), "/chat/1.0.0".to_string()];
        let bound = dial_negotiate_ls(&mut dialer, &protocols, &config)
            .await
            .unwrap();
        assert_eq!(bound, "/chat/1.0.0");

        let (protocol, _handler) = listen.await.unwrap().unwrap();
        assert_eq!(protocol, "/chat/1.0.0");
    }

    #[tokio::test]
    async fn test_ls_with_no_overlap() {
        let (mut dialer, mut listener) = tokio::io::duplex(4096);
        let registry = registry_with(&[("/mail/1.0.0", MatchKind::Exact)]).await;
        let config = Config::default();

        let listen = tokio::spawn(async move {
            listen_negotiate(&mut listener, &registry, &config).await
        });

        let config = Config::default();
        let protocols = vec!["/chat/1.0.0".to_string()];
        let err = dial_negotiate_ls(&mut dialer, &protocols, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NegotiationFailed));

        // The listener is still waiting for a proposal; drop the dialer end
        // so its read fails and the task finishes.
        drop(dialer);
        let _ = listen.await.unwrap();
    }

    #[tokio::test]
    async fn test_deadline_expiry_is_cancelled() {
        let (mut dialer, _listener) = tokio::io::duplex(4096);
        let config = Config {
            negotiation_timeout: Duration::from_millis(50),
            ..Config::default()
        };

        // Nobody answers: the header write succeeds, the echo never comes.
        let protocols = vec!["/echo/1.0.0".to_string()];
        let err = dial_negotiate(&mut dialer, &protocols, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
