//! `ForwardingEngine` (C8) — binds a local TCP listener and bidirectionally
//! pipes every accepted connection through a leased pool channel.
//!
//! Shape: one dispatcher task drains a bounded accept queue and spawns one
//! forward task per connection; each forward task spawns two copy tasks
//! (local->remote, remote->local). All of it is cancellable by a single
//! [`CancellationToken`].

use crate::backoff::BackoffPolicy;
use crate::endpoint::Endpoint;
use crate::pool::{ConnectionPool, PoolClient};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Internal accept-queue capacity. Overflow sheds the new
/// connection immediately rather than blocking the accept loop.
const ACCEPT_QUEUE_CAPACITY: usize = 100;
/// Consecutive accept failures tolerated before the engine gives up and
/// reports `ListenerFailed`.
const MAX_CONSECUTIVE_ACCEPT_FAILURES: u32 = 10;
/// Per-direction copy buffer size.
const COPY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ForwardingError {
    #[error("failed to bind local listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("listener failed after {consecutive_failures} consecutive accept errors: {last_error}")]
    ListenerFailed {
        consecutive_failures: u32,
        last_error: String,
    },
}

/// Point-in-time counters for one engine's lifetime. Cheap to snapshot;
/// read by tests and (eventually) the health/metrics surface.
#[derive(Default)]
pub struct ForwardingStats {
    pub accepted: AtomicU64,
    pub shed_overload: AtomicU64,
    pub dial_failures: AtomicU64,
    pub pool_exhausted: AtomicU64,
    pub completed: AtomicU64,
}

impl ForwardingStats {
    pub fn snapshot(&self) -> ForwardingStatsSnapshot {
        ForwardingStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            shed_overload: self.shed_overload.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardingStatsSnapshot {
    pub accepted: u64,
    pub shed_overload: u64,
    pub dial_failures: u64,
    pub pool_exhausted: u64,
    pub completed: u64,
}

/// A bound local listener, ready to serve once `serve` is called.
pub struct ForwardingEngine {
    listener: TcpListener,
    actual_port: u16,
    stats: Arc<ForwardingStats>,
}

impl ForwardingEngine {
    /// Binds `local_host:local_port`. Port `0` captures whatever ephemeral
    /// port the OS assigns; read it back via [`actual_port`](Self::actual_port).
    pub async fn bind(local_host: &str, local_port: u16) -> Result<Self, ForwardingError> {
        let addr = format!("{local_host}:{local_port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ForwardingError::Bind { addr, source })?;
        let actual_port = listener.local_addr().map(|a| a.port()).unwrap_or(local_port);
        Ok(Self {
            listener,
            actual_port,
            stats: Arc::new(ForwardingStats::default()),
        })
    }

    pub fn actual_port(&self) -> u16 {
        self.actual_port
    }

    pub fn stats(&self) -> Arc<ForwardingStats> {
        self.stats.clone()
    }

    /// Runs the accept loop until `cancel` fires or the listener fails.
    /// Sends on `ready` once (after bind, which already happened in
    /// [`bind`](Self::bind)) and before any accepted connection is
    /// dispatched, satisfying the ordering the supervisor depends on to
    /// mark the tunnel healthy.
    pub async fn serve<C: PoolClient + 'static>(
        self,
        pool: Arc<ConnectionPool<C>>,
        remote: Endpoint,
        ready: oneshot::Sender<u16>,
        cancel: CancellationToken,
    ) -> Result<(), ForwardingError>
    where
        C: DialChannel,
    {
        let (tx, mut rx) = mpsc::channel::<(TcpStream, SocketAddr)>(ACCEPT_QUEUE_CAPACITY);
        let _ = ready.send(self.actual_port);

        let dispatcher_cancel = cancel.clone();
        let dispatcher_pool = pool.clone();
        let dispatcher_remote = remote.clone();
        let dispatcher_stats = self.stats.clone();
        let dispatcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatcher_cancel.cancelled() => break,
                    accepted = rx.recv() => {
                        match accepted {
                            Some((stream, peer)) => {
                                let pool = dispatcher_pool.clone();
                                let remote = dispatcher_remote.clone();
                                let cancel = dispatcher_cancel.clone();
                                let stats = dispatcher_stats.clone();
                                tokio::spawn(async move {
                                    forward_connection(stream, peer, pool, remote, cancel, stats).await;
                                });
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        let accept_backoff = BackoffPolicy::accept_retry();
        let mut consecutive_failures = 0u32;
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        consecutive_failures = 0;
                        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                        match tx.try_send((stream, peer)) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full((stream, peer))) => {
                                self.stats.shed_overload.fetch_add(1, Ordering::Relaxed);
                                debug!(%peer, "accept queue full, shedding connection");
                                drop(stream);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break Ok(()),
                        }
                    }
                    Err(err) => {
                        if cancel.is_cancelled() {
                            break Ok(());
                        }
                        consecutive_failures += 1;
                        warn!(error = %err, consecutive_failures, "accept failed");
                        if consecutive_failures >= MAX_CONSECUTIVE_ACCEPT_FAILURES {
                            break Err(ForwardingError::ListenerFailed {
                                consecutive_failures,
                                last_error: err.to_string(),
                            });
                        }
                        let (delay, _) = accept_backoff.next(consecutive_failures - 1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        };

        drop(tx);
        cancel.cancel();
        let _ = dispatcher.await;
        result
    }
}

/// Seam `forward_connection` needs from a pooled client: open a
/// `direct-tcpip`-shaped channel to `(host, port)`. Implemented by
/// [`SshClient`]; tests implement it on fakes.
#[async_trait::async_trait]
pub trait DialChannel: Send + Sync {
    type Stream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static;
    async fn dial_channel(&self, host: &str, port: u16) -> Result<Self::Stream, anyhow::Error>;
}

async fn forward_connection<C: PoolClient + DialChannel + 'static>(
    mut local: TcpStream,
    peer: SocketAddr,
    pool: Arc<ConnectionPool<C>>,
    remote: Endpoint,
    cancel: CancellationToken,
    stats: Arc<ForwardingStats>,
) {
    let lease = match pool.lease().await {
        Ok(lease) => lease,
        Err(err) => {
            stats.pool_exhausted.fetch_add(1, Ordering::Relaxed);
            warn!(%peer, error = %err, "pool lease failed, dropping connection");
            let _ = local.shutdown().await;
            return;
        }
    };

    let client = lease.client();
    let channel_stream = match client.dial_channel(remote.host(), remote.port()).await {
        Ok(stream) => stream,
        Err(err) => {
            stats.dial_failures.fetch_add(1, Ordering::Relaxed);
            warn!(%peer, error = %err, "direct-tcpip dial failed, invalidating connection");
            lease.invalidate();
            lease.release();
            let _ = local.shutdown().await;
            return;
        }
    };

    let (local_read, local_write) = local.into_split();
    let (remote_read, remote_write) = tokio::io::split(channel_stream);

    let copy_cancel = cancel.clone();
    let to_remote = tokio::spawn(copy_with_cancellation(local_read, remote_write, copy_cancel.clone()));
    let to_local = tokio::spawn(copy_with_cancellation(remote_read, local_write, copy_cancel));

    let _ = tokio::join!(to_remote, to_local);
    lease.release();
    stats.completed.fetch_add(1, Ordering::Relaxed);
    debug!(%peer, "forwarded connection closed");
}

async fn copy_with_cancellation<R, W>(mut reader: R, mut writer: W, cancel: CancellationToken)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if writer.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConnectionPool;
    use std::sync::atomic::AtomicBool;
    use tokio::io::{duplex, DuplexStream};

    struct EchoClient;

    #[async_trait::async_trait]
    impl PoolClient for EchoClient {
        async fn probe(&self) -> bool {
            true
        }
        async fn close(&self) {}
    }

    #[async_trait::async_trait]
    impl DialChannel for EchoClient {
        type Stream = DuplexStream;
        async fn dial_channel(&self, _host: &str, _port: u16) -> Result<Self::Stream, anyhow::Error> {
            let (client_side, server_side) = duplex(4096);
            tokio::spawn(echo_loop(server_side));
            Ok(client_side)
        }
    }

    async fn echo_loop(mut stream: DuplexStream) {
        let mut buf = vec![0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    struct FailingDialClient {
        fail_probe: AtomicBool,
    }

    #[async_trait::async_trait]
    impl PoolClient for FailingDialClient {
        async fn probe(&self) -> bool {
            !self.fail_probe.load(Ordering::Relaxed)
        }
        async fn close(&self) {}
    }

    #[async_trait::async_trait]
    impl DialChannel for FailingDialClient {
        type Stream = DuplexStream;
        async fn dial_channel(&self, _host: &str, _port: u16) -> Result<Self::Stream, anyhow::Error> {
            Err(anyhow::anyhow!("dial refused"))
        }
    }

    #[tokio::test]
    async fn bind_with_ephemeral_port_reports_actual_port() {
        let engine = ForwardingEngine::bind("127.0.0.1", 0).await.unwrap();
        assert!(engine.actual_port() > 0);
    }

    #[tokio::test]
    async fn echoes_bytes_end_to_end() {
        let engine = ForwardingEngine::bind("127.0.0.1", 0).await.unwrap();
        let port = engine.actual_port();

        let factory: crate::pool::Factory<EchoClient> = Box::new(|| Box::pin(async { Ok(EchoClient) }));
        let pool = Arc::new(ConnectionPool::new(factory, 5, 10, 1).await.unwrap());

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let serve_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            engine
                .serve(pool, Endpoint::new("10.0.0.5", 6443), ready_tx, serve_cancel)
                .await
        });
        ready_rx.await.unwrap();

        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(b"hello\n").await.unwrap();
        let mut buf = [0u8; 6];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");

        cancel.cancel();
        let _ = handle.await.unwrap();
    }

    #[tokio::test]
    async fn dial_failure_invalidates_connection_and_closes_local() {
        let engine = ForwardingEngine::bind("127.0.0.1", 0).await.unwrap();
        let port = engine.actual_port();

        let factory: crate::pool::Factory<FailingDialClient> =
            Box::new(|| Box::pin(async { Ok(FailingDialClient { fail_probe: AtomicBool::new(false) }) }));
        let pool = Arc::new(ConnectionPool::new(factory, 5, 10, 1).await.unwrap());
        let stats_handle;
        {
            stats_handle = engine.stats();
        }

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let serve_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            engine
                .serve(pool, Endpoint::new("10.0.0.5", 6443), ready_tx, serve_cancel)
                .await
        });
        ready_rx.await.unwrap();

        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 1];
        let _ = conn.read(&mut buf).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(stats_handle.snapshot().dial_failures, 1);

        cancel.cancel();
        let _ = handle.await.unwrap();
    }
}
