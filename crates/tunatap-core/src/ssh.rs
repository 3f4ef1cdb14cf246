//! The `russh`-backed SSH client: dials a bastion host (optionally through
//! a SOCKS5 proxy), authenticates with a [`ResolvedCredential`], verifies
//! the host key through a [`HostKeyStore`], and opens `direct-tcpip`
//! channels for the forwarding engine. This is the only module that knows
//! about the wire protocol; everything above it (`pool`, `forwarding`,
//! `supervisor`) depends only on [`PoolClient`] and [`SshClient::dial_channel`].

use crate::auth::ResolvedCredential;
use crate::forwarding::DialChannel;
use crate::hostkeys::HostKeyStore;
use crate::pool::PoolClient;
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh_keys::{PrivateKeyWithHashAlg, PublicKey};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// A boxed, type-erased duplex byte stream: what a `direct-tcpip` channel
/// (or any fake standing in for one in tests) looks like to the forwarding
/// engine's copy tasks.
pub type ChannelStream = Pin<Box<dyn AsyncReadWrite>>;

/// Blanket trait tying `AsyncRead`+`AsyncWrite` together behind one trait
/// object, since Rust can't express `dyn AsyncRead + AsyncWrite` directly.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send {}
impl<T: AsyncRead + AsyncWrite + Send> AsyncReadWrite for T {}

#[derive(Debug, thiserror::Error)]
pub enum SshDialError {
    #[error("failed to resolve or connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("SOCKS5 proxy dial to {proxy} for target {addr} failed: {source}")]
    Socks5 {
        proxy: String,
        addr: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("SSH handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: russh::Error,
    },
    #[error("host key verification failed: {0}")]
    HostKey(#[from] crate::hostkeys::HostKeyError),
    #[error("SSH authentication to {addr} as {user} was rejected")]
    AuthRejected { addr: String, user: String },
    #[error("SSH authentication error: {0}")]
    AuthTransport(#[source] russh::Error),
    #[error("agent-backed authentication is not supported on this platform")]
    AgentUnsupported,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelDialError {
    #[error("direct-tcpip channel open to {host}:{port} failed: {source}")]
    Open {
        host: String,
        port: u16,
        #[source]
        source: russh::Error,
    },
}

/// Optional upstream SOCKS5 proxy the bastion dial is tunneled through.
/// When set, the rest of the pipeline (handshake, auth, channel dial) is
/// identical; only the initial TCP connect changes.
#[derive(Debug, Clone)]
pub struct Socks5ProxyConfig {
    pub proxy_addr: String,
}

/// What `SessionManager::current_signer_blob` + a target bastion host
/// resolve to: everything `SshClient::connect` needs.
pub struct DialSpec {
    pub bastion_host: String,
    pub user: String,
    pub credential: Arc<ResolvedCredential>,
    pub socks_proxy: Option<Socks5ProxyConfig>,
    pub keepalive_interval: Duration,
}

struct ClientHandler {
    host: String,
    host_keys: Arc<HostKeyStore>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match self.host_keys.verify_or_pin(&self.host, server_public_key) {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(host = %self.host, error = %err, "host key verification failed");
                Ok(false)
            }
        }
    }
}

/// A connected, authenticated SSH client. Implements [`PoolClient`] so it
/// can be held inside a [`crate::pool::TrackedConnection`].
pub struct SshClient {
    handle: Handle<ClientHandler>,
}

impl SshClient {
    /// Connects to `spec.bastion_host`, optionally through a SOCKS5 proxy,
    /// verifies the host key via `host_keys` (trust-on-first-use), and
    /// authenticates using `spec.credential`.
    pub async fn connect(spec: DialSpec, host_keys: Arc<HostKeyStore>) -> Result<Self, SshDialError> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(spec.keepalive_interval),
            ..Default::default()
        });
        let handler = ClientHandler {
            host: spec.bastion_host.clone(),
            host_keys,
        };

        let mut handle = match &spec.socks_proxy {
            None => {
                let addr = spec.bastion_host.clone();
                client::connect(config, parse_host_port(&addr), handler)
                    .await
                    .map_err(|source| SshDialError::Handshake { addr, source })?
            }
            Some(proxy) => {
                let stream = dial_via_socks5(proxy, &spec.bastion_host)
                    .await
                    .map_err(|source| SshDialError::Socks5 {
                        proxy: proxy.proxy_addr.clone(),
                        addr: spec.bastion_host.clone(),
                        source,
                    })?;
                client::connect_stream(config, stream, handler)
                    .await
                    .map_err(|source| SshDialError::Handshake {
                        addr: spec.bastion_host.clone(),
                        source,
                    })?
            }
        };

        authenticate(&mut handle, &spec).await?;

        Ok(Self { handle })
    }

    /// Opens a `direct-tcpip` channel to `(host, port)` and returns it as a
    /// plain `AsyncRead + AsyncWrite` stream the forwarding engine copies
    /// bytes through.
    pub async fn dial_channel(&self, host: &str, port: u16) -> Result<ChannelStream, ChannelDialError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|source| ChannelDialError::Open {
                host: host.to_string(),
                port,
                source,
            })?;
        Ok(Box::pin(channel.into_stream()))
    }
}

#[async_trait]
impl DialChannel for SshClient {
    type Stream = ChannelStream;

    async fn dial_channel(&self, host: &str, port: u16) -> Result<Self::Stream, anyhow::Error> {
        // Inherent methods are always preferred over trait methods in
        // method-call syntax, so this calls the concrete impl above, not
        // recursing into this trait method.
        self.dial_channel(host, port).await.map_err(anyhow::Error::from)
    }
}

#[async_trait]
impl PoolClient for SshClient {
    /// Opens and immediately closes a session channel as a liveness probe,
    /// standing in for an SSH keepalive global-request; `russh` exposes
    /// this most directly as a cheap channel round-trip.
    async fn probe(&self) -> bool {
        match self.handle.channel_open_session().await {
            Ok(channel) => {
                let _ = channel.close().await;
                true
            }
            Err(err) => {
                debug!(error = %err, "ssh keepalive probe failed");
                false
            }
        }
    }

    async fn close(&self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "closing", "en")
            .await;
    }
}

async fn authenticate(handle: &mut Handle<ClientHandler>, spec: &DialSpec) -> Result<(), SshDialError> {
    let result = match spec.credential.as_ref() {
        ResolvedCredential::Local(key) => {
            let key_with_alg = PrivateKeyWithHashAlg::new(key.clone(), None);
            handle
                .authenticate_publickey(&spec.user, key_with_alg)
                .await
                .map_err(SshDialError::AuthTransport)?
        }
        ResolvedCredential::Agent { .. } => return Err(SshDialError::AgentUnsupported),
    };

    if !result.success() {
        return Err(SshDialError::AuthRejected {
            addr: spec.bastion_host.clone(),
            user: spec.user.clone(),
        });
    }
    Ok(())
}

async fn dial_via_socks5(
    proxy: &Socks5ProxyConfig,
    target: &str,
) -> Result<impl AsyncRead + AsyncWrite + Send + Unpin + 'static, anyhow::Error> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("target {target:?} is not host:port"))?;
    let port: u16 = port.parse()?;

    let stream = fast_socks5::client::Socks5Stream::connect(
        proxy.proxy_addr.clone(),
        host.to_string(),
        port,
        fast_socks5::client::Config::default(),
    )
    .await?;
    Ok(stream)
}

fn parse_host_port(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(22)),
        None => (addr.to_string(), 22),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_defaults_to_22_without_explicit_port() {
        assert_eq!(parse_host_port("host.bastion.example.com"), ("host.bastion.example.com".to_string(), 22));
    }

    #[test]
    fn parse_host_port_with_explicit_port() {
        assert_eq!(parse_host_port("host.bastion.example.com:2222"), ("host.bastion.example.com".to_string(), 2222));
    }
}
