//! `TrackedConnection` (C6) and `ConnectionPool` (C7) — a fixed-capacity
//! pool of leasable SSH clients with first-fit scheduling, a sweep pass for
//! dead connections, and a periodic health check.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// What the pool requires of a leased SSH client: a way to probe liveness
/// and a way to tear it down. Implemented by the real `russh` client
/// wrapper and by fakes in tests.
#[async_trait::async_trait]
pub trait PoolClient: Send + Sync {
    /// Typically an SSH keepalive global-request; false means the
    /// connection is dead and should be invalidated.
    async fn probe(&self) -> bool;
    /// Idempotent close of the underlying transport.
    async fn close(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool exhausted: all {size} connections are at capacity and max-size is reached")]
    Exhausted { size: usize },
    #[error("pool is closed")]
    Closed,
    #[error("warmup failed: all {attempted} initial connections failed to establish")]
    WarmupFailed { attempted: usize },
    #[error("connection factory failed: {0}")]
    Factory(#[source] anyhow::Error),
}

/// `(ssh-client, use-count, max-concurrent, invalid)`. `use-count` is
/// never negative; `invalid` is monotonic — once true, never leased again.
pub struct TrackedConnection<C: PoolClient> {
    client: Arc<C>,
    use_count: AtomicUsize,
    max_concurrent: usize,
    invalid: AtomicBool,
}

impl<C: PoolClient> TrackedConnection<C> {
    fn new(client: C, max_concurrent: usize) -> Self {
        Self {
            client: Arc::new(client),
            use_count: AtomicUsize::new(0),
            max_concurrent,
            invalid: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> Arc<C> {
        self.client.clone()
    }

    pub fn can_lease(&self) -> bool {
        !self.invalid.load(Ordering::Acquire) && self.use_count.load(Ordering::Acquire) < self.max_concurrent
    }

    /// CAS-increments `use-count` iff [`can_lease`](Self::can_lease) still
    /// holds at the moment of the attempt.
    fn try_lease(&self) -> bool {
        loop {
            let current = self.use_count.load(Ordering::Acquire);
            if self.invalid.load(Ordering::Acquire) || current >= self.max_concurrent {
                return false;
            }
            if self
                .use_count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release(&self) {
        let _ = self
            .use_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 {
                    None
                } else {
                    Some(count - 1)
                }
            });
    }

    pub fn invalidate(&self) {
        self.invalid.store(true, Ordering::Release);
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.use_count.load(Ordering::Acquire) == 0
    }

    pub async fn close(&self) {
        self.client.close().await;
    }
}

/// A leased handle to a pooled connection. Releasing the lease on drop
/// would require async drop, which Rust doesn't have; callers must call
/// [`release`](Self::release) explicitly when done (the forwarding engine
/// does this once both copy tasks terminate).
pub struct Lease<C: PoolClient> {
    connection: Arc<TrackedConnection<C>>,
}

impl<C: PoolClient> Lease<C> {
    pub fn client(&self) -> Arc<C> {
        self.connection.client()
    }

    pub fn invalidate(&self) {
        self.connection.invalidate();
    }

    pub fn release(self) {
        self.connection.release();
    }
}

pub type Factory<C> = Box<dyn Fn() -> BoxFuture<'static, Result<C, anyhow::Error>> + Send + Sync>;

pub struct PoolStats {
    pub size: usize,
    pub active_uses: usize,
    pub available: usize,
}

struct Inner<C: PoolClient> {
    connections: Vec<Arc<TrackedConnection<C>>>,
    closed: bool,
}

/// Fixed-capacity pool of leasable connections. Construction eagerly
/// creates `warmup_count` connections via `factory`; if zero succeed and
/// `warmup_count > 0`, construction fails.
pub struct ConnectionPool<C: PoolClient> {
    factory: Factory<C>,
    max_size: usize,
    max_concurrent_per_conn: usize,
    inner: Mutex<Inner<C>>,
}

impl<C: PoolClient + 'static> ConnectionPool<C> {
    pub async fn new(
        factory: Factory<C>,
        max_size: usize,
        max_concurrent_per_conn: usize,
        warmup_count: usize,
    ) -> Result<Self, PoolError> {
        let mut connections = Vec::with_capacity(max_size);
        let mut attempted = 0;
        for _ in 0..warmup_count.min(max_size) {
            attempted += 1;
            match factory().await {
                Ok(client) => connections.push(Arc::new(TrackedConnection::new(
                    client,
                    max_concurrent_per_conn,
                ))),
                Err(err) => warn!(error = %err, "warmup connection attempt failed"),
            }
        }

        if warmup_count > 0 && connections.is_empty() {
            return Err(PoolError::WarmupFailed { attempted });
        }

        Ok(Self {
            factory,
            max_size,
            max_concurrent_per_conn,
            inner: Mutex::new(Inner {
                connections,
                closed: false,
            }),
        })
    }

    /// First-fit lease in insertion order: deterministic and
    /// test-reproducible. Sweeps dead-idle connections before growing the
    /// pool. No blocking wait; callers decide whether to retry.
    pub async fn lease(&self) -> Result<Lease<C>, PoolError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(PoolError::Closed);
        }

        for connection in inner.connections.iter() {
            if connection.try_lease() {
                return Ok(Lease {
                    connection: connection.clone(),
                });
            }
        }

        inner.connections.retain(|c| !(c.is_invalid() && c.is_idle()));

        if inner.connections.len() >= self.max_size {
            return Err(PoolError::Exhausted {
                size: inner.connections.len(),
            });
        }

        let client = (self.factory)().await.map_err(PoolError::Factory)?;
        let connection = Arc::new(TrackedConnection::new(client, self.max_concurrent_per_conn));
        let leased = connection.try_lease();
        debug_assert!(leased, "freshly created connection must be leasable");
        inner.connections.push(connection.clone());
        Ok(Lease { connection })
    }

    /// Probes every non-invalid connection, marking failures invalid, then
    /// drops invalid-and-idle connections. Intended to run every 10s.
    pub async fn health_check(&self) {
        let mut inner = self.inner.lock().await;
        for connection in inner.connections.iter() {
            if connection.is_invalid() {
                continue;
            }
            if !connection.client.probe().await {
                debug!("connection failed health probe, marking invalid");
                connection.invalidate();
            }
        }
        inner.connections.retain(|c| !(c.is_invalid() && c.is_idle()));
    }

    /// Marks the pool closed, invalidates all connections, closes idle
    /// ones immediately; in-flight leases close on release.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        for connection in inner.connections.iter() {
            connection.invalidate();
            if connection.is_idle() {
                connection.close().await;
            }
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        let mut active_uses = 0;
        let mut available = 0;
        for connection in inner.connections.iter() {
            if connection.is_invalid() {
                continue;
            }
            let uses = connection.use_count.load(Ordering::Acquire);
            active_uses += uses;
            available += self.max_concurrent_per_conn.saturating_sub(uses);
        }
        PoolStats {
            size: inner.connections.len(),
            active_uses,
            available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FakeClient {
        id: u32,
        probe_result: AtomicBool,
        closed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl PoolClient for FakeClient {
        async fn probe(&self) -> bool {
            self.probe_result.load(Ordering::Acquire)
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    fn counting_factory() -> (Factory<FakeClient>, Arc<AtomicU32>) {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let factory: Factory<FakeClient> = Box::new(move || {
            let id = counter_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Ok(FakeClient {
                    id,
                    probe_result: AtomicBool::new(true),
                    closed: AtomicBool::new(false),
                })
            })
        });
        (factory, counter)
    }

    #[tokio::test]
    async fn warmup_creates_requested_connections() {
        let (factory, _) = counting_factory();
        let pool = ConnectionPool::new(factory, 5, 2, 3).await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.size, 3);
    }

    #[tokio::test]
    async fn warmup_failure_with_all_factories_failing_errors() {
        let factory: Factory<FakeClient> =
            Box::new(|| Box::pin(async { Err(anyhow::anyhow!("dial failed")) }));
        let err = ConnectionPool::new(factory, 5, 2, 2).await.unwrap_err();
        assert!(matches!(err, PoolError::WarmupFailed { .. }));
    }

    #[tokio::test]
    async fn lease_reuses_first_fit_connection() {
        let (factory, counter) = counting_factory();
        let pool = ConnectionPool::new(factory, 5, 2, 1).await.unwrap();
        let lease1 = pool.lease().await.unwrap();
        lease1.release();
        let _lease2 = pool.lease().await.unwrap();
        // Only the warmup connection should ever have been created.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lease_grows_pool_when_all_at_capacity() {
        let (factory, counter) = counting_factory();
        let pool = ConnectionPool::new(factory, 5, 1, 1).await.unwrap();
        let _lease1 = pool.lease().await.unwrap();
        let _lease2 = pool.lease().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lease_exhausted_at_max_size() {
        let (factory, _) = counting_factory();
        let pool = ConnectionPool::new(factory, 1, 1, 1).await.unwrap();
        let _lease1 = pool.lease().await.unwrap();
        let err = pool.lease().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn health_check_invalidates_failed_probe_and_sweeps_idle() {
        let (factory, _) = counting_factory();
        let pool = ConnectionPool::new(factory, 5, 2, 1).await.unwrap();
        {
            let inner = pool.inner.lock().await;
            inner.connections[0]
                .client
                .probe_result
                .store(false, Ordering::Release);
        }
        pool.health_check().await;
        assert_eq!(pool.stats().await.size, 0);
    }

    #[tokio::test]
    async fn close_invalidates_and_closes_idle_connections() {
        let (factory, _) = counting_factory();
        let pool = ConnectionPool::new(factory, 5, 2, 1).await.unwrap();
        pool.close().await;
        let inner = pool.inner.lock().await;
        assert!(inner.connections[0].is_invalid());
        assert!(inner.connections[0].client.closed.load(Ordering::Acquire));
    }

    #[test]
    fn tracked_connection_use_count_never_goes_negative() {
        let conn = TrackedConnection::new(
            FakeClient {
                id: 0,
                probe_result: AtomicBool::new(true),
                closed: AtomicBool::new(false),
            },
            1,
        );
        conn.release();
        conn.release();
        assert_eq!(conn.use_count.load(Ordering::Acquire), 0);
    }

    #[test]
    fn tracked_connection_invalid_is_monotonic() {
        let conn = TrackedConnection::new(
            FakeClient {
                id: 0,
                probe_result: AtomicBool::new(true),
                closed: AtomicBool::new(false),
            },
            1,
        );
        conn.invalidate();
        assert!(conn.is_invalid());
        assert!(!conn.can_lease());
    }
}
