//! Health endpoint combining the SSH circuit state, control-plane
//! reachability, and a namespace-list probe against the orchestrator.

use crate::cluster::ClusterClient;
use crate::controller::{ControllerClient, check_api_compat};
use crate::transport::Circuit;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct HealthState {
    pub circuit: Arc<Circuit>,
    pub controller: Arc<dyn ControllerClient>,
    pub cluster: Arc<dyn ClusterClient>,
}

/// Serve `/healthz` until the listener fails.
pub async fn start(port: u16, state: HealthState) -> Result<()> {
    let router = Router::new()
        .route("/healthz", get(healthz))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding health server to port {port}"))?;
    axum::serve(listener, router)
        .await
        .context("serving health endpoint")?;
    Ok(())
}

async fn healthz(State(state): State<HealthState>) -> StatusCode {
    if !state.circuit.is_closed() {
        tracing::warn!("health check failed: SSH transport circuit is open");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    let controller_probe = async {
        match tokio::time::timeout(PROBE_TIMEOUT, state.controller.healthcheck()).await {
            Ok(Ok(resp)) => {
                // A version mismatch is logged, never unhealthy.
                check_api_compat(&resp);
                true
            }
            Ok(Err(err)) => {
                tracing::warn!(%err, "health check failed: controller unreachable");
                false
            }
            Err(_) => {
                tracing::warn!("health check failed: controller probe timed out");
                false
            }
        }
    };
    let namespace_probe = async {
        match tokio::time::timeout(PROBE_TIMEOUT, state.cluster.list_namespaces()).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                tracing::warn!(%err, "health check failed: listing namespaces");
                false
            }
            Err(_) => {
                tracing::warn!("health check failed: namespace probe timed out");
                false
            }
        }
    };

    let (controller_ok, namespaces_ok) = tokio::join!(controller_probe, namespace_probe);
    if controller_ok && namespaces_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::controller::FakeController;

    fn state(circuit: Arc<Circuit>, controller: FakeController) -> HealthState {
        HealthState {
            circuit,
            controller: Arc::new(controller),
            cluster: Arc::new(FakeCluster::new()),
        }
    }

    #[tokio::test]
    async fn healthy_when_all_probes_pass() {
        let circuit = Arc::new(Circuit::new());
        circuit.close();
        let status = healthz(State(state(circuit, FakeController::default()))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_to_unavailable() {
        let circuit = Arc::new(Circuit::new());
        let status = healthz(State(state(circuit, FakeController::default()))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn controller_failure_is_unhealthy() {
        let circuit = Arc::new(Circuit::new());
        circuit.close();
        let controller = FakeController {
            fail_healthcheck: Some("connection refused".to_string()),
            ..FakeController::default()
        };
        let status = healthz(State(state(circuit, controller))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn api_version_mismatch_stays_healthy() {
        let circuit = Arc::new(Circuit::new());
        circuit.close();
        let controller = FakeController {
            api_version: "9.9".to_string(),
            ..FakeController::default()
        };
        let status = healthz(State(state(circuit, controller))).await;
        assert_eq!(status, StatusCode::OK);
    }
}
