//! Health/metrics surface: `/healthz` reporting HEALTHY/DEGRADED/UNHEALTHY
//! and a Prometheus scrape endpoint, per spec §7's closing paragraph and
//! supplemental operation #2.
//!
//! Grounded on the teacher's `axum` router construction in `main.rs`
//! (minimal `Router::new().route(...)`, no middleware stack needed here)
//! and its `metrics`/`metrics-exporter-prometheus` dependencies, which in
//! the teacher lived in the trimmed `performance` module.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Unhealthy => "UNHEALTHY",
        }
    }

    fn status_code(self) -> StatusCode {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Implemented by whatever owns the process-wide view of stream/circuit
/// state; the health server itself holds no domain knowledge (spec §7:
/// "a health endpoint (implementation-chosen) reports UNHEALTHY").
pub trait HealthProbe: Send + Sync {
    fn status(&self) -> HealthStatus;
}

#[derive(Clone)]
struct HealthState {
    probe: Arc<dyn HealthProbe>,
    prometheus: PrometheusHandle,
}

pub struct HealthServer {
    router: Router,
}

impl HealthServer {
    pub fn new(probe: Arc<dyn HealthProbe>) -> anyhow::Result<Self> {
        let prometheus = PrometheusBuilder::new().install_recorder()?;
        let state = HealthState { probe, prometheus };
        let router = Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_endpoint))
            .with_state(state);
        Ok(Self { router })
    }

    pub async fn serve(self, addr: SocketAddr, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "health_server_listening");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        Ok(())
    }
}

async fn healthz(State(state): State<HealthState>) -> impl IntoResponse {
    let status = state.probe.status();
    (status.status_code(), status.as_str())
}

async fn metrics_endpoint(State(state): State<HealthState>) -> impl IntoResponse {
    state.prometheus.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(HealthStatus);
    impl HealthProbe for FixedProbe {
        fn status(&self) -> HealthStatus {
            self.0
        }
    }

    #[test]
    fn healthy_maps_to_ok() {
        assert_eq!(HealthStatus::Healthy.status_code(), StatusCode::OK);
        assert_eq!(HealthStatus::Healthy.as_str(), "HEALTHY");
    }

    #[test]
    fn unhealthy_maps_to_service_unavailable() {
        assert_eq!(HealthStatus::Unhealthy.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn healthz_route_reflects_the_probe() {
        let state = HealthState {
            probe: Arc::new(FixedProbe(HealthStatus::Degraded)),
            prometheus: PrometheusBuilder::new().build_recorder().handle(),
        };
        let response = healthz(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
