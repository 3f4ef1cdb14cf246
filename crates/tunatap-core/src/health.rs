//! `HealthRegistry` (C10) — process-wide shared state tracking one
//! `TunnelStatus` per running supervisor; mutation only via its own
//! synchronized operations. Exposed read-only to status and metrics
//! endpoints with sensitive fields redacted.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use crate::pool::PoolStats as LivePoolStats;

/// Snapshot of a pool's occupancy, copied out of the live pool so the
/// registry never holds a reference into another component's state.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStatsSnapshot {
    pub size: usize,
    pub active_uses: usize,
    pub available: usize,
}

impl From<&LivePoolStats> for PoolStatsSnapshot {
    fn from(stats: &LivePoolStats) -> Self {
        Self {
            size: stats.size,
            active_uses: stats.active_uses,
            available: stats.available,
        }
    }
}

/// One running tunnel's health, as tracked internally (unredacted).
#[derive(Debug, Clone)]
pub struct TunnelStatus {
    pub id: String,
    pub cluster: String,
    pub region: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub start_time: SystemTime,
    pub healthy: bool,
    pub last_error: Option<String>,
    pub pool_stats: PoolStatsSnapshot,
}

impl TunnelStatus {
    pub fn new(
        id: impl Into<String>,
        cluster: impl Into<String>,
        region: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            cluster: cluster.into(),
            region: region.into(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            start_time: SystemTime::now(),
            healthy: false,
            last_error: None,
            pool_stats: PoolStatsSnapshot::default(),
        }
    }
}

/// The public read view exposed to status and metrics endpoints:
/// session-id blanked, remote-host redacted by IP class, last-error
/// reduced to a constant string.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RedactedTunnelStatus {
    pub id: String,
    pub cluster: String,
    pub region: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub uptime_seconds: u64,
    pub healthy: bool,
    pub last_error: Option<String>,
    pub pool_size: usize,
    pub pool_active_uses: usize,
}

const LAST_ERROR_CONSTANT: &str = "connection error";

fn redact_remote_host(remote_host: &str) -> String {
    match remote_host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            if v4.is_loopback() {
                "[localhost]".to_string()
            } else if v4.is_private() {
                "[private-network]".to_string()
            } else {
                "[redacted]".to_string()
            }
        }
        Ok(IpAddr::V6(v6)) => {
            if v6.is_loopback() {
                "[localhost]".to_string()
            } else {
                "[redacted]".to_string()
            }
        }
        Err(_) => "[redacted]".to_string(),
    }
}

impl TunnelStatus {
    fn redact(&self) -> RedactedTunnelStatus {
        let uptime_seconds = SystemTime::now()
            .duration_since(self.start_time)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        RedactedTunnelStatus {
            id: self.id.clone(),
            cluster: self.cluster.clone(),
            region: self.region.clone(),
            local_port: self.local_port,
            remote_host: redact_remote_host(&self.remote_host),
            remote_port: self.remote_port,
            uptime_seconds,
            healthy: self.healthy,
            last_error: self
                .last_error
                .as_ref()
                .map(|_| LAST_ERROR_CONSTANT.to_string()),
            pool_size: self.pool_stats.size,
            pool_active_uses: self.pool_stats.active_uses,
        }
    }
}

/// A full snapshot of the registry: per-tunnel redacted status plus an
/// overall-healthy flag (true iff every tunnel is healthy, or there are
/// none).
pub struct HealthSnapshot {
    pub tunnels: Vec<RedactedTunnelStatus>,
    pub overall_healthy: bool,
}

/// Process-wide registry of running tunnels.
#[derive(Default)]
pub struct HealthRegistry {
    tunnels: RwLock<BTreeMap<String, TunnelStatus>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, status: TunnelStatus) {
        self.tunnels.write().insert(status.id.clone(), status);
    }

    pub fn deregister(&self, id: &str) {
        self.tunnels.write().remove(id);
    }

    pub fn update_health(&self, id: &str, healthy: bool, err: Option<&str>) {
        if let Some(status) = self.tunnels.write().get_mut(id) {
            status.healthy = healthy;
            if let Some(err) = err {
                if !err.is_empty() {
                    status.last_error = Some(err.to_string());
                }
            }
        }
    }

    pub fn update_pool_stats(&self, id: &str, stats: PoolStatsSnapshot) {
        if let Some(status) = self.tunnels.write().get_mut(id) {
            status.pool_stats = stats;
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let tunnels = self.tunnels.read();
        let overall_healthy = tunnels.values().all(|t| t.healthy);
        HealthSnapshot {
            tunnels: tunnels.values().map(TunnelStatus::redact).collect(),
            overall_healthy,
        }
    }

    pub fn count(&self) -> usize {
        self.tunnels.read().len()
    }
}
