//! `Supervisor` (C9) — the top-level driver for one tunnel. Composes
//! `SessionManager`, `ConnectionPool`, `ForwardingEngine`, `HealthRegistry`,
//! and `AuditSink` behind a retry loop driven by [`BackoffPolicy`], with a
//! single [`CancellationToken`] propagating shutdown to every task it owns.
//!
//! The STANDARD and INTERNAL bastion types are two different
//! attempt strategies sharing the same outer retry/health/audit loop: a
//! STANDARD attempt builds a connection pool of in-process SSH clients via
//! `connect`, a generic factory seam so tests can substitute a fake
//! transport without touching `russh`; an INTERNAL attempt shells out to
//! the system `ssh` and tracks the child process's exit.

use crate::audit::AuditSink;
use crate::auth::{AuthProvider, ResolvedCredential};
use crate::backoff::BackoffPolicy;
use crate::config::BastionType;
use crate::endpoint::Endpoint;
use crate::error::{classify_forwarding_error, classify_pool_error, classify_session_error, ErrorKind, TunnelError};
use crate::forwarding::{DialChannel, ForwardingEngine};
use crate::health::{HealthRegistry, PoolStatsSnapshot, TunnelStatus};
use crate::hostkeys::HostKeyStore;
use crate::pool::{ConnectionPool, Factory, PoolClient};
use crate::process::{InternalDialSpec, InternalTunnelProcess};
use crate::provider::BastionSessionProvider;
use crate::realm;
use crate::session::SessionManager;
use crate::ssh::Socks5ProxyConfig;
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Interval between `SessionManager::needs_refresh` checks.
const REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Interval between pool health-check sweeps.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// SSH keepalive global-request interval for STANDARD connections.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Everything one tunnel needs that doesn't come from the shared
/// `Supervisor` (health registry, audit sink): per-cluster identity,
/// bastion routing, and pool sizing, all sourced from [`crate::config::ClusterConfig`].
#[derive(Clone)]
pub struct SupervisorOptions {
    pub cluster: String,
    pub region: String,
    pub bastion_type: BastionType,
    /// Required for STANDARD; used to derive the bastion host address and
    /// realm/domain routing.
    pub bastion_id: Option<String>,
    /// Required for INTERNAL.
    pub jumpbox_ip: Option<String>,
    pub local_host: String,
    pub local_port: u16,
    pub target: Endpoint,
    pub pool_size: usize,
    pub warmup_count: usize,
    pub max_concurrent: usize,
    pub socks_proxy: Option<Socks5ProxyConfig>,
    pub ssh_private_key_file: Option<PathBuf>,
    pub audit_logging: bool,
}

/// What a STANDARD attempt's connect factory needs to produce one pooled
/// client. The factory is supplied by the caller (production code wires it
/// to [`crate::ssh::SshClient::connect`]; tests wire it to a fake) so this
/// module never depends on `russh` directly.
pub struct StandardDialParams {
    pub bastion_host: String,
    pub user: String,
    pub credential: Arc<ResolvedCredential>,
    pub socks_proxy: Option<Socks5ProxyConfig>,
    pub keepalive_interval: Duration,
}

pub type StandardConnectFactory<C> =
    Arc<dyn Fn(StandardDialParams) -> BoxFuture<'static, Result<C, anyhow::Error>> + Send + Sync>;

/// Composes the tunnel-plane components for one running tunnel. Shares a
/// `HealthRegistry` and `AuditSink` across every tunnel in the process; each
/// `run` call registers and deregisters its own `TunnelStatus` entry.
pub struct Supervisor {
    health: Arc<HealthRegistry>,
    audit: Arc<AuditSink>,
}

impl Supervisor {
    pub fn new(health: Arc<HealthRegistry>, audit: Arc<AuditSink>) -> Self {
        Self { health, audit }
    }

    /// Runs one tunnel until cancellation, an unrecoverable error, or (for
    /// INTERNAL) a clean child-process exit. Never panics on a misconfigured
    /// `options`; STANDARD without a `bastion_id` or INTERNAL without a
    /// `jumpbox_ip` surface as `ConfigInvalid`.
    pub async fn run<P, C>(
        &self,
        provider: Arc<P>,
        auth: Arc<AuthProvider>,
        host_keys: Arc<HostKeyStore>,
        connect: StandardConnectFactory<C>,
        options: SupervisorOptions,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError>
    where
        P: BastionSessionProvider + 'static,
        C: PoolClient + DialChannel + 'static,
    {
        let tunnel_id = uuid::Uuid::new_v4().to_string();
        self.health.register(TunnelStatus::new(
            &tunnel_id,
            &options.cluster,
            &options.region,
            options.local_port,
            options.target.host(),
            options.target.port(),
        ));

        let session_manager = match options.bastion_type {
            BastionType::Standard => {
                let bastion_id = options.bastion_id.clone().ok_or_else(|| {
                    TunnelError::new(
                        "supervisor setup",
                        ErrorKind::ConfigInvalid,
                        anyhow::anyhow!("STANDARD bastion requires bastion_id"),
                    )
                });
                match bastion_id {
                    Ok(id) => Some(Arc::new(SessionManager::new(
                        provider.clone(),
                        auth.clone(),
                        id,
                        options.target.clone(),
                    ))),
                    Err(err) => {
                        self.health.deregister(&tunnel_id);
                        return Err(err);
                    }
                }
            }
            BastionType::Internal => None,
        };

        let backoff = BackoffPolicy::bastion_retry();
        let mut attempt = 0u32;
        let mut ever_healthy = false;
        let mut last_error: Option<String> = None;
        let mut audit_session_id: Option<String> = None;

        let outcome: Result<(), TunnelError> = loop {
            let attempt_result = match options.bastion_type {
                BastionType::Standard => {
                    let sm = session_manager
                        .clone()
                        .expect("STANDARD bastion always resolves a session manager above");
                    self.run_standard_attempt(
                        sm,
                        host_keys.clone(),
                        connect.clone(),
                        &options,
                        &tunnel_id,
                        &cancel,
                        &mut ever_healthy,
                        &mut audit_session_id,
                    )
                    .await
                }
                BastionType::Internal => {
                    self.run_internal_attempt(&options, &tunnel_id, &cancel, &mut ever_healthy, &mut audit_session_id)
                        .await
                }
            };

            match attempt_result {
                Ok(()) => break Ok(()),
                Err(err) if err.kind == ErrorKind::Cancelled => break Ok(()),
                Err(err) if !err.is_retryable() => {
                    // §7: AuthRejected/AuthzDenied/NotFound/ConfigInvalid/
                    // HostKeyMismatch surface immediately; retrying them
                    // against an unchanged bastion/config/host-key would
                    // only burn the attempt budget on a guaranteed repeat.
                    last_error = Some(err.to_string());
                    self.health.update_health(&tunnel_id, false, Some(&err.to_string()));
                    warn!(tunnel_id = %tunnel_id, cluster = %options.cluster, error = %err, "tunnel attempt failed with a non-retryable error, surfacing immediately");
                    break Err(err);
                }
                Err(err) => {
                    last_error = Some(err.to_string());
                    self.health.update_health(&tunnel_id, false, Some(&err.to_string()));
                    warn!(tunnel_id = %tunnel_id, cluster = %options.cluster, error = %err, attempt, "tunnel attempt failed");

                    let (delay, should_retry) = backoff.next(attempt);
                    attempt += 1;
                    if !should_retry {
                        break Err(TunnelError::new(
                            "supervisor retry budget",
                            ErrorKind::Transient,
                            anyhow::anyhow!(last_error.clone().unwrap_or_default()),
                        ));
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        // Each attempt ends its own audit session as it returns (see
        // `end_audit_session_for_attempt`), keeping I7's connect/disconnect
        // pairing scoped to one session-id per attempt rather than one pair
        // for the whole retry loop. This is a safety net for a session left
        // dangling by a path that didn't go through that helper.
        if let Some(session_id) = audit_session_id.take() {
            let _ = self.audit.end_session(&session_id, last_error.as_deref());
        }
        self.health.deregister(&tunnel_id);
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_standard_attempt<P, C>(
        &self,
        session_manager: Arc<SessionManager<P>>,
        host_keys: Arc<HostKeyStore>,
        connect: StandardConnectFactory<C>,
        options: &SupervisorOptions,
        tunnel_id: &str,
        cancel: &CancellationToken,
        ever_healthy: &mut bool,
        audit_session_id: &mut Option<String>,
    ) -> Result<(), TunnelError>
    where
        P: BastionSessionProvider + 'static,
        C: PoolClient + DialChannel + 'static,
    {
        let descriptor = session_manager
            .acquire()
            .await
            .map_err(|e| TunnelError::new("session acquire", classify_session_error(&e), e))?;
        let signer = session_manager.current_signer_blob().await.ok_or_else(|| {
            TunnelError::new(
                "session acquire",
                ErrorKind::ConfigInvalid,
                anyhow::anyhow!("no signer registered after a successful acquire"),
            )
        })?;

        let bastion_id = options
            .bastion_id
            .clone()
            .expect("STANDARD options always carry a bastion_id (checked in run)");
        let bastion_host = realm::bastion_host_address(&options.region, &bastion_id);
        // OCI bastion sessions authenticate with the session's own id as the
        // SSH username; see the bastion host address convention in realm.rs.
        let ssh_user = descriptor.id.clone();
        let credential = signer.credential.clone();
        let socks_proxy = options.socks_proxy.clone();

        let factory: Factory<C> = Box::new(move || {
            let params = StandardDialParams {
                bastion_host: bastion_host.clone(),
                user: ssh_user.clone(),
                credential: credential.clone(),
                socks_proxy: socks_proxy.clone(),
                keepalive_interval: KEEPALIVE_INTERVAL,
            };
            connect(params)
        });

        let pool = Arc::new(
            ConnectionPool::new(factory, options.pool_size, options.max_concurrent, options.warmup_count)
                .await
                .map_err(|e| TunnelError::new("pool warmup", classify_pool_error(&e), e))?,
        );

        let refresh_cancel = cancel.child_token();
        let refresh_manager = session_manager.clone();
        let refresh_handle =
            tokio::spawn(async move { refresh_manager.auto_refresh(REFRESH_INTERVAL, &refresh_cancel).await });

        let health_cancel = cancel.child_token();
        let health_pool = pool.clone();
        let health_registry = self.health.clone();
        let health_tunnel_id = tunnel_id.to_string();
        let health_check_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = health_cancel.cancelled() => break,
                    _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {
                        health_pool.health_check().await;
                        let stats = health_pool.stats().await;
                        health_registry.update_pool_stats(&health_tunnel_id, PoolStatsSnapshot::from(&stats));
                    }
                }
            }
        });

        let engine = ForwardingEngine::bind(&options.local_host, options.local_port)
            .await
            .map_err(|e| TunnelError::new("listener bind", classify_forwarding_error(&e), e))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let serve_cancel = cancel.clone();
        let serve_pool = pool.clone();
        let remote = options.target.clone();
        let engine_handle = tokio::spawn(engine.serve(serve_pool, remote, ready_tx, serve_cancel));

        if let Ok(actual_port) = ready_rx.await {
            self.health.update_health(tunnel_id, true, None);
            *ever_healthy = true;
            info!(tunnel_id = %tunnel_id, cluster = %options.cluster, local_port = actual_port, "tunnel ready");

            if options.audit_logging {
                match self.audit.start_session(
                    &descriptor.id,
                    &options.cluster,
                    &options.region,
                    actual_port,
                    options.target.host(),
                    options.target.port(),
                    &bastion_id,
                ) {
                    Ok(session_id) => *audit_session_id = Some(session_id),
                    Err(err) => warn!(tunnel_id = %tunnel_id, error = %err, "failed to record audit connect event"),
                }
            }
        }

        let engine_result = engine_handle.await;

        refresh_handle.abort();
        health_check_handle.abort();
        pool.close().await;

        let outcome = match engine_result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                let kind = classify_forwarding_error(&err);
                Err(TunnelError::new("forwarding engine", kind, err))
            }
            Err(join_err) if join_err.is_cancelled() => Err(TunnelError::new(
                "forwarding engine",
                ErrorKind::Cancelled,
                anyhow::anyhow!("engine task cancelled"),
            )),
            Err(join_err) => Err(TunnelError::new("forwarding engine", ErrorKind::Transient, join_err)),
        };

        self.end_audit_session_for_attempt(tunnel_id, audit_session_id, &outcome);
        outcome
    }

    /// Ends the audit session this attempt started (if any), pairing its
    /// `connect` event with exactly one `disconnect`/`error` before the
    /// attempt returns, whichever exit path it takes (I7). A clean
    /// cancellation is recorded as a plain disconnect, not an error.
    fn end_audit_session_for_attempt(
        &self,
        tunnel_id: &str,
        audit_session_id: &mut Option<String>,
        outcome: &Result<(), TunnelError>,
    ) {
        let Some(session_id) = audit_session_id.take() else {
            return;
        };
        let error_text = match outcome {
            Ok(()) => None,
            Err(err) if err.kind == ErrorKind::Cancelled => None,
            Err(err) => Some(err.to_string()),
        };
        if let Err(err) = self.audit.end_session(&session_id, error_text.as_deref()) {
            warn!(tunnel_id = %tunnel_id, error = %err, "failed to record audit disconnect event");
        }
    }

    async fn run_internal_attempt(
        &self,
        options: &SupervisorOptions,
        tunnel_id: &str,
        cancel: &CancellationToken,
        ever_healthy: &mut bool,
        audit_session_id: &mut Option<String>,
    ) -> Result<(), TunnelError> {
        let jumpbox_ip = options.jumpbox_ip.clone().ok_or_else(|| {
            TunnelError::new(
                "internal bastion setup",
                ErrorKind::ConfigInvalid,
                anyhow::anyhow!("INTERNAL bastion requires jumpbox_ip"),
            )
        })?;

        let proxy_host = realm::internal_bastion_proxy_address(&options.region);
        let spec = InternalDialSpec {
            ssh_binary: "ssh".to_string(),
            jumpbox_ip,
            user: "opc".to_string(),
            identity_file: options.ssh_private_key_file.clone(),
            local_port: options.local_port,
            target: options.target.clone(),
            proxy_host,
        };

        let mut process = InternalTunnelProcess::spawn(&spec)
            .map_err(|e| TunnelError::new("internal bastion ssh spawn", ErrorKind::Transient, e))?;

        self.health.update_health(tunnel_id, true, None);
        *ever_healthy = true;
        info!(tunnel_id = %tunnel_id, cluster = %options.cluster, command = %process.command_line(), "internal tunnel process started");

        if options.audit_logging {
            match self.audit.start_session(
                "",
                &options.cluster,
                &options.region,
                options.local_port,
                options.target.host(),
                options.target.port(),
                options.bastion_id.as_deref().unwrap_or(""),
            ) {
                Ok(session_id) => *audit_session_id = Some(session_id),
                Err(err) => warn!(tunnel_id = %tunnel_id, error = %err, "failed to record audit connect event"),
            }
        }

        let wait_result = tokio::select! {
            status = process.wait() => Some(status),
            _ = cancel.cancelled() => {
                process.terminate().await;
                None
            }
        };

        let outcome = match wait_result {
            None => Err(TunnelError::new(
                "internal bastion ssh",
                ErrorKind::Cancelled,
                anyhow::anyhow!("cancelled"),
            )),
            Some(Err(e)) => Err(TunnelError::new("internal bastion ssh wait", ErrorKind::Transient, e)),
            Some(Ok(status)) if status.success() => Ok(()),
            Some(Ok(status)) => Err(TunnelError::new(
                "internal bastion ssh exited",
                ErrorKind::Transient,
                anyhow::anyhow!("ssh child process exited with {status}"),
            )),
        };

        self.end_audit_session_for_attempt(tunnel_id, audit_session_id, &outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{EventType, QueryCriteria};
    use crate::auth::AuthMethod;
    use crate::provider::fakes::FakeBastionSessionProvider;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpStream;

    struct EchoClient {
        closed: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl PoolClient for EchoClient {
        async fn probe(&self) -> bool {
            true
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl DialChannel for EchoClient {
        type Stream = DuplexStream;
        async fn dial_channel(&self, _host: &str, _port: u16) -> Result<Self::Stream, anyhow::Error> {
            let (client_side, server_side) = duplex(4096);
            tokio::spawn(async move {
                let mut stream = server_side;
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
            });
            Ok(client_side)
        }
    }

    fn echo_connect_factory() -> StandardConnectFactory<EchoClient> {
        Arc::new(|_params: StandardDialParams| {
            Box::pin(async {
                Ok(EchoClient {
                    closed: Arc::new(AtomicBool::new(false)),
                })
            })
        })
    }

    #[tokio::test]
    async fn standard_tunnel_serves_traffic_end_to_end() {
        let health = Arc::new(HealthRegistry::new());
        let audit_dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditSink::new(audit_dir.path()));
        let hostkeys_dir = tempfile::tempdir().unwrap();
        let host_keys = Arc::new(HostKeyStore::open(hostkeys_dir.path().join("known_hosts")).unwrap());

        let provider = Arc::new(FakeBastionSessionProvider::new());
        let auth = Arc::new(AuthProvider::new(AuthMethod::Ephemeral));
        let supervisor = Supervisor::new(health.clone(), audit.clone());

        let options = SupervisorOptions {
            cluster: "prod".to_string(),
            region: "us-ashburn-1".to_string(),
            bastion_type: BastionType::Standard,
            bastion_id: Some("ocid1.bastion.oc1.us-ashburn-1.aaa".to_string()),
            jumpbox_ip: None,
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            target: Endpoint::new("10.0.0.5", 6443),
            pool_size: 5,
            warmup_count: 1,
            max_concurrent: 10,
            socks_proxy: None,
            ssh_private_key_file: None,
            audit_logging: true,
        };

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            supervisor
                .run(provider, auth, host_keys, echo_connect_factory(), options, run_cancel)
                .await
        });

        let mut port = 0u16;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(status) = health.snapshot().tunnels.first() {
                if status.healthy {
                    port = status.local_port;
                    break;
                }
            }
        }
        assert_ne!(port, 0, "tunnel never became healthy");

        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(b"hello\n").await.unwrap();
        let mut buf = [0u8; 6];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");

        cancel.cancel();
        let _ = handle.await.unwrap();
        assert_eq!(health.count(), 0, "supervisor must deregister on exit");
    }

    #[tokio::test]
    async fn internal_bastion_without_jumpbox_surfaces_config_invalid() {
        let health = Arc::new(HealthRegistry::new());
        let audit_dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditSink::new(audit_dir.path()));
        let hostkeys_dir = tempfile::tempdir().unwrap();
        let host_keys = Arc::new(HostKeyStore::open(hostkeys_dir.path().join("known_hosts")).unwrap());

        let provider = Arc::new(FakeBastionSessionProvider::new());
        let auth = Arc::new(AuthProvider::new(AuthMethod::Ephemeral));
        let supervisor = Supervisor::new(health.clone(), audit.clone());

        let options = SupervisorOptions {
            cluster: "prod".to_string(),
            region: "us-ashburn-1".to_string(),
            bastion_type: BastionType::Internal,
            bastion_id: None,
            jumpbox_ip: None,
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            target: Endpoint::new("10.0.0.5", 6443),
            pool_size: 5,
            warmup_count: 1,
            max_concurrent: 10,
            socks_proxy: None,
            ssh_private_key_file: None,
            audit_logging: false,
        };

        let err = supervisor
            .run(provider, auth, host_keys, echo_connect_factory(), options, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigInvalid);
        assert_eq!(health.count(), 0);
    }

    #[tokio::test]
    async fn audit_session_pairs_close_on_each_attempt_exit() {
        let health = Arc::new(HealthRegistry::new());
        let audit_dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditSink::new(audit_dir.path()));
        let supervisor = Supervisor::new(health, audit.clone());

        // First attempt: goes healthy, then ends cleanly.
        let mut first_session = Some(
            audit
                .start_session("", "prod", "us-ashburn-1", 6443, "10.0.0.5", 6443, "b1")
                .unwrap(),
        );
        supervisor.end_audit_session_for_attempt("t1", &mut first_session, &Ok(()));
        assert!(first_session.is_none());

        // Reconnect: a second attempt goes healthy again and starts its own
        // session, then fails and ends it. Each attempt's connect must be
        // paired with exactly one disconnect/error, never left for `run`'s
        // final cleanup to close both at once.
        let mut second_session = Some(
            audit
                .start_session("", "prod", "us-ashburn-1", 6443, "10.0.0.5", 6443, "b1")
                .unwrap(),
        );
        let reconnect_err = TunnelError::new("forwarding engine", ErrorKind::Transient, anyhow::anyhow!("reset"));
        supervisor.end_audit_session_for_attempt("t1", &mut second_session, &Err(reconnect_err));
        assert!(second_session.is_none());

        let events = audit.query(&QueryCriteria::default()).unwrap();
        let connects = events.iter().filter(|e| e.event_type == EventType::Connect).count();
        let closes = events
            .iter()
            .filter(|e| matches!(e.event_type, EventType::Disconnect | EventType::Error))
            .count();
        assert_eq!(connects, 2);
        assert_eq!(closes, 2);
    }
}
