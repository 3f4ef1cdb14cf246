//! Prometheus metrics recorder for `tunatap`, following the same
//! `metrics`+`metrics-exporter-prometheus` install-once-and-describe
//! pattern the workspace's other services use.
//!
//! Series names and labels match the `/metrics` contract exactly:
//! `tunatap_up`, `tunatap_uptime_seconds`, `tunatap_tunnels_total`, and the
//! per-tunnel `{tunnel,local_port}`-labelled series.

use metrics::{describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;
use tunatap_core::health::HealthRegistry;

pub struct TunatapMetrics {
    handle: PrometheusHandle,
    started_at: Instant,
}

impl TunatapMetrics {
    pub fn install() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("failed to install prometheus recorder: {e}"))?;

        describe_gauge!("tunatap_up", Unit::Count, "Always 1 while the process is serving");
        describe_gauge!("tunatap_uptime_seconds", Unit::Seconds, "Seconds since process start");
        describe_gauge!(
            "tunatap_tunnels_total",
            Unit::Count,
            "Number of tunnels currently registered"
        );
        describe_gauge!(
            "tunatap_tunnel_healthy",
            Unit::Count,
            "1 if the labelled tunnel is healthy, else 0"
        );
        describe_gauge!(
            "tunatap_tunnel_uptime_seconds",
            Unit::Seconds,
            "Seconds since the labelled tunnel last registered"
        );
        describe_gauge!(
            "tunatap_pool_size",
            Unit::Count,
            "Pooled connections for the labelled tunnel"
        );
        describe_gauge!(
            "tunatap_pool_active_uses",
            Unit::Count,
            "In-flight leases for the labelled tunnel's pool"
        );
        describe_counter!(
            "tunatap_forwarded_connections_total",
            Unit::Count,
            "Total forwarded TCP connections since process start"
        );

        Ok(Self {
            handle,
            started_at: Instant::now(),
        })
    }

    /// Renders the current Prometheus text exposition, refreshing every
    /// gauge from `health` first so a scrape always reflects live state.
    pub fn render(&self, health: &HealthRegistry) -> String {
        let snapshot = health.snapshot();

        gauge!("tunatap_up").set(1.0);
        gauge!("tunatap_uptime_seconds").set(self.started_at.elapsed().as_secs_f64());
        gauge!("tunatap_tunnels_total").set(snapshot.tunnels.len() as f64);

        for tunnel in &snapshot.tunnels {
            let tunnel_name = tunnel.cluster.clone();
            let local_port = tunnel.local_port.to_string();
            gauge!("tunatap_tunnel_healthy", "tunnel" => tunnel_name.clone(), "local_port" => local_port.clone())
                .set(if tunnel.healthy { 1.0 } else { 0.0 });
            gauge!("tunatap_tunnel_uptime_seconds", "tunnel" => tunnel_name.clone(), "local_port" => local_port.clone())
                .set(tunnel.uptime_seconds as f64);
            gauge!("tunatap_pool_size", "tunnel" => tunnel_name.clone(), "local_port" => local_port.clone())
                .set(tunnel.pool_size as f64);
            gauge!("tunatap_pool_active_uses", "tunnel" => tunnel_name, "local_port" => local_port)
                .set(tunnel.pool_active_uses as f64);
        }

        self.handle.render()
    }
}
