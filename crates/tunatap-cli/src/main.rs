mod error;
mod health_server;
mod metrics;
mod ssh_connect;

use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use error::CliError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tunatap_core::audit::AuditSink;
use tunatap_core::auth::{AuthMethod, AuthProvider};
use tunatap_core::config::TunnelConfig;
use tunatap_core::endpoint::Endpoint;
use tunatap_core::health::HealthRegistry;
use tunatap_core::hostkeys::HostKeyStore;
use tunatap_core::provider::LocalSessionProvider;
use tunatap_core::ssh::Socks5ProxyConfig;
use tunatap_core::supervisor::{Supervisor, SupervisorOptions};

/// Authenticated SSH tunnels from this workstation to private endpoints
/// reachable only through a bastion.
#[derive(Parser, Debug)]
#[command(name = "tunatap", author, version, about)]
struct Args {
    /// Path to the tunnel configuration YAML file.
    #[arg(short, long, global = true, default_value = "tunatap.yaml")]
    config: PathBuf,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start every configured tunnel and serve until interrupted. Default
    /// when no subcommand is given.
    Run,
    /// Configuration file helpers.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Query a running instance's `/health` endpoint.
    Status {
        /// Base URL of the running instance's health endpoint.
        #[arg(long, default_value = "http://127.0.0.1:9090")]
        endpoint: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print a representative sample configuration to stdout.
    Generate,
    /// Parse and validate the configured file, printing a summary.
    Validate,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(err) = run(args).await {
        error!(error = %err, "tunatap exited with an error");
        std::process::exit(err.exit_code());
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    match args.command.unwrap_or(Command::Run) {
        Command::Config {
            action: ConfigAction::Generate,
        } => {
            let example = TunnelConfig::example();
            println!("{}", serde_yaml::to_string(&example).context("serializing example config")?);
            Ok(())
        }
        Command::Config {
            action: ConfigAction::Validate,
        } => {
            init_logging(&args.verbosity)?;
            let config = TunnelConfig::load_yaml(&args.config)?;
            info!(clusters = config.clusters.len(), path = %args.config.display(), "configuration is valid");
            Ok(())
        }
        Command::Status { endpoint } => {
            init_logging(&args.verbosity)?;
            print_status(&endpoint).await
        }
        Command::Run => {
            init_logging(&args.verbosity)?;
            run_service(&args.config).await
        }
    }
}

fn init_logging(verbosity: &Verbosity<InfoLevel>) -> Result<(), CliError> {
    tunatap_common::logging::init_logging(verbosity, "tunatap_cli,tunatap_core", "tunatap_cli=info,tunatap_core=info")
        .map_err(CliError::Other)
}

async fn print_status(endpoint: &str) -> Result<(), CliError> {
    let url = format!("{}/health", endpoint.trim_end_matches('/'));
    let response = reqwest::get(&url).await.context("requesting health endpoint")?;
    let body = response.text().await.context("reading health response body")?;
    println!("{body}");
    Ok(())
}

async fn run_service(config_path: &PathBuf) -> Result<(), CliError> {
    let config = TunnelConfig::load_yaml(config_path)?;
    if config.clusters.is_empty() {
        return Err(CliError::NoClusters);
    }

    let host_keys = Arc::new(HostKeyStore::open(known_hosts_path()).map_err(|e| CliError::Other(e.into()))?);
    let audit = Arc::new(AuditSink::new(audit_log_dir()));
    let health = Arc::new(HealthRegistry::new());
    let metrics = Arc::new(metrics::TunatapMetrics::install().context("installing prometheus recorder")?);

    // §4.3 AuthProvider strategy order: ephemeral (if forced) takes
    // priority, then a running ssh-agent (still using `ssh_private_key_file`
    // as a `.pub` hint for the bastion registration blob if one is
    // configured alongside it), then falling back to loading the key file
    // directly.
    let auth_method = if config.use_ephemeral_keys {
        AuthMethod::Ephemeral
    } else if std::env::var_os("SSH_AUTH_SOCK").is_some() {
        AuthMethod::Agent {
            key_hint: config.ssh_private_key_file.clone(),
        }
    } else if let Some(path) = &config.ssh_private_key_file {
        AuthMethod::KeyFile {
            path: path.clone(),
            passphrase: None,
        }
    } else {
        AuthMethod::Ephemeral
    };
    let auth = Arc::new(AuthProvider::new(auth_method));
    let provider = Arc::new(LocalSessionProvider::new(Duration::from_secs(config.cache_ttl_hours * 3600)));
    let connect = ssh_connect::standard_connect_factory(host_keys.clone());

    let cancel = CancellationToken::new();
    let supervisor = Arc::new(Supervisor::new(health.clone(), audit.clone()));

    let mut tunnel_handles = Vec::new();
    for cluster in &config.clusters {
        let Some(endpoint_config) = cluster.primary_endpoint() else {
            warn!(cluster = %cluster.cluster_name, "cluster has no endpoints configured, skipping");
            continue;
        };

        let options = SupervisorOptions {
            cluster: cluster.cluster_name.clone(),
            region: cluster.region.clone(),
            bastion_type: cluster.bastion_type,
            bastion_id: cluster.bastion_id.clone(),
            jumpbox_ip: cluster.jumpbox_ip.clone(),
            local_host: "127.0.0.1".to_string(),
            local_port: cluster.local_port,
            target: Endpoint::new(endpoint_config.ip.clone(), endpoint_config.port),
            pool_size: config.ssh_connection_pool_size,
            warmup_count: config.ssh_connection_warmup_count,
            max_concurrent: config.ssh_connection_max_concurrent_use,
            socks_proxy: config.ssh_socks_proxy.clone().map(|proxy_addr| Socks5ProxyConfig { proxy_addr }),
            ssh_private_key_file: config.ssh_private_key_file.clone(),
            audit_logging: config.audit_logging,
        };

        let supervisor = supervisor.clone();
        let provider = provider.clone();
        let auth = auth.clone();
        let host_keys = host_keys.clone();
        let connect = connect.clone();
        let tunnel_cancel = cancel.clone();
        let cluster_name = cluster.cluster_name.clone();

        tunnel_handles.push(tokio::spawn(async move {
            if let Err(err) = supervisor.run(provider, auth, host_keys, connect, options, tunnel_cancel).await {
                error!(cluster = %cluster_name, error = %err, "tunnel exited with an unrecoverable error");
            }
        }));
    }

    if tunnel_handles.is_empty() {
        return Err(CliError::NoClusters);
    }

    let health_addr: SocketAddr = config
        .health_endpoint
        .as_deref()
        .unwrap_or("127.0.0.1:9090")
        .parse()
        .context("parsing health_endpoint")?;
    let health_cancel = cancel.clone();
    let health_handle =
        tokio::spawn(async move { health_server::serve(health_addr, health, metrics, health_cancel).await });

    tokio::select! {
        _ = shutdown_signal() => {
            warn!("shutdown requested, cancelling all tunnels");
        }
        result = health_handle => {
            if let Ok(Err(err)) = result {
                error!(error = %err, "health endpoint exited unexpectedly");
            }
        }
    }

    cancel.cancel();
    for handle in tunnel_handles {
        let _ = handle.await;
    }

    info!("tunatap shut down cleanly");
    Ok(())
}

fn known_hosts_path() -> PathBuf {
    dirs_path(".tunatap/known_hosts")
}

fn audit_log_dir() -> PathBuf {
    dirs_path(".tunatap/audit")
}

fn dirs_path(suffix: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    home.join(suffix)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
