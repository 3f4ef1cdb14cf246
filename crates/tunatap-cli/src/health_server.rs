//! Loopback-bound HTTP surface: `/health`, `/healthz`, `/readyz`, `/metrics`.
//!
//! Mirrors the axum+tower server shape the workspace's API gateway uses
//! (tracing layer, timeout layer, graceful shutdown tied to one
//! `CancellationToken`), scaled down to the handful of read-only routes this
//! binary needs.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tunatap_core::health::HealthRegistry;

use crate::metrics::TunatapMetrics;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct AppState {
    health: Arc<HealthRegistry>,
    metrics: Arc<TunatapMetrics>,
}

/// Binds `addr` (expected loopback; enforced by `TunnelConfig::validate`)
/// and serves until `cancel` fires.
pub async fn serve(addr: SocketAddr, health: Arc<HealthRegistry>, metrics: Arc<TunatapMetrics>, cancel: CancellationToken) -> anyhow::Result<()> {
    let state = AppState { health, metrics };

    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

/// `/health`, `/healthz`: the full redacted tunnel status list.
async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let snapshot = state.health.snapshot();
    let status_code = if snapshot.overall_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status_code,
        Json(serde_json::json!({
            "healthy": snapshot.overall_healthy,
            "tunnels": snapshot.tunnels,
        })),
    )
}

/// `/healthz`: unconditional liveness probe. 200 as long as the process is
/// serving requests at all, independent of any tunnel's health.
async fn healthz_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok\n")
}

/// `/readyz`: 200 once at least one tunnel has registered and every
/// registered tunnel is healthy; 503 otherwise. `overall_healthy` is
/// vacuously true with zero tunnels, so the emptiness check is required to
/// distinguish "not started yet" from "ready".
async fn readyz_handler(State(state): State<AppState>) -> StatusCode {
    let snapshot = state.health.snapshot();
    if snapshot.overall_healthy && !snapshot.tunnels.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render(&state.health)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use tunatap_core::health::TunnelStatus;

    /// `PrometheusBuilder::install_recorder` sets a process-global recorder
    /// and errors on a second call, so every test in this module shares one
    /// installation instead of each building its own `AppState`.
    fn test_metrics() -> Arc<TunatapMetrics> {
        static METRICS: OnceLock<Arc<TunatapMetrics>> = OnceLock::new();
        METRICS
            .get_or_init(|| Arc::new(TunatapMetrics::install().expect("install test prometheus recorder")))
            .clone()
    }

    fn state_with(health: Arc<HealthRegistry>) -> AppState {
        AppState {
            health,
            metrics: test_metrics(),
        }
    }

    #[tokio::test]
    async fn healthz_is_unconditionally_ok() {
        let (status, body) = healthz_handler().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok\n");
    }

    #[tokio::test]
    async fn healthz_ok_even_when_a_tunnel_is_unhealthy() {
        let health = Arc::new(HealthRegistry::new());
        health.register(TunnelStatus::new("t1", "prod", "us-ashburn-1", 6443, "10.0.0.5", 6443));
        health.update_health("t1", false, Some("dial timeout"));

        let (status, _) = healthz_handler().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health.snapshot().overall_healthy, false);
    }

    #[tokio::test]
    async fn readyz_unavailable_with_no_tunnels_registered() {
        let state = state_with(Arc::new(HealthRegistry::new()));
        let status = readyz_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn readyz_ok_once_every_registered_tunnel_is_healthy() {
        let health = Arc::new(HealthRegistry::new());
        health.register(TunnelStatus::new("t1", "prod", "us-ashburn-1", 6443, "10.0.0.5", 6443));
        health.update_health("t1", true, None);

        let status = readyz_handler(State(state_with(health))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_unavailable_if_any_registered_tunnel_is_unhealthy() {
        let health = Arc::new(HealthRegistry::new());
        health.register(TunnelStatus::new("a", "prod", "us-ashburn-1", 6443, "10.0.0.5", 6443));
        health.register(TunnelStatus::new("b", "prod", "us-ashburn-1", 6444, "10.0.0.6", 6444));
        health.update_health("a", true, None);
        health.update_health("b", false, Some("dial timeout"));

        let status = readyz_handler(State(state_with(health))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
