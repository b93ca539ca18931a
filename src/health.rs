//! Liveness reporting for the bridge.
//!
//! [`HealthState`] is the always-available snapshot the orchestrator keeps
//! current; the `/health` HTTP endpoint on top of it is feature-gated so
//! library consumers do not pull in an HTTP stack they never serve.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::camera::CameraHealth;

/// Lifecycle phase of the bridge daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    Starting,
    Ok,
    ShuttingDown,
}

impl BridgePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgePhase::Starting => "starting",
            BridgePhase::Ok => "ok",
            BridgePhase::ShuttingDown => "shutting_down",
        }
    }
}

#[derive(Debug)]
struct HealthInner {
    started: Instant,
    phase: RwLock<BridgePhase>,
    camera: RwLock<CameraHealth>,
}

/// Shared view of bridge health. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct HealthState {
    inner: Arc<HealthInner>,
}

/// Point-in-time copy of everything health reporting exposes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSnapshot {
    pub phase: BridgePhase,
    pub battery_percent: Option<f32>,
    pub camera_connected: bool,
    pub uptime_secs: u64,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HealthInner {
                started: Instant::now(),
                phase: RwLock::new(BridgePhase::Starting),
                camera: RwLock::new(CameraHealth::default()),
            }),
        }
    }

    pub async fn set_phase(&self, phase: BridgePhase) {
        *self.inner.phase.write().await = phase;
    }

    pub async fn record_camera(&self, health: CameraHealth) {
        *self.inner.camera.write().await = health;
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let phase = *self.inner.phase.read().await;
        let camera = *self.inner.camera.read().await;
        HealthSnapshot {
            phase,
            battery_percent: camera.battery_percent,
            camera_connected: camera.connected,
            uptime_secs: self.inner.started.elapsed().as_secs(),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "health")]
mod endpoint {
    use std::net::SocketAddr;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use tokio_util::sync::CancellationToken;
    use tracing::info;

    use crate::error::Result;

    use super::{BridgePhase, HealthState};

    fn status_for(phase: BridgePhase) -> StatusCode {
        match phase {
            BridgePhase::Ok => StatusCode::OK,
            BridgePhase::Starting => StatusCode::SERVICE_UNAVAILABLE,
            BridgePhase::ShuttingDown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    async fn report(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
        let snapshot = state.snapshot().await;
        let body = json!({
            "status": snapshot.phase.as_str(),
            "battery": snapshot.battery_percent,
            "uptime": snapshot.uptime_secs,
        });
        (status_for(snapshot.phase), Json(body))
    }

    pub fn health_router(state: HealthState) -> Router {
        Router::new()
            .route("/health", get(report))
            .with_state(state)
    }

    /// Serve `/health` until `shutdown` fires. Binding to port 0 picks a
    /// free port; the bound address is logged either way.
    pub async fn serve_health(
        addr: SocketAddr,
        state: HealthState,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        info!(address = %bound, "health endpoint listening");

        axum::serve(listener, health_router(state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn phase_maps_to_http_status() {
            assert_eq!(status_for(BridgePhase::Ok), StatusCode::OK);
            assert_eq!(
                status_for(BridgePhase::Starting),
                StatusCode::SERVICE_UNAVAILABLE
            );
            assert_eq!(
                status_for(BridgePhase::ShuttingDown),
                StatusCode::INTERNAL_SERVER_ERROR
            );
        }

        #[tokio::test]
        async fn report_body_carries_battery_and_uptime() {
            let state = HealthState::new();
            state.set_phase(BridgePhase::Ok).await;
            state
                .record_camera(crate::camera::CameraHealth {
                    battery_percent: Some(87.5),
                    connected: true,
                })
                .await;

            let (status, Json(body)) = report(State(state)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "ok");
            assert_eq!(body["battery"], 87.5);
            assert!(body["uptime"].is_u64());
        }
    }
}

#[cfg(feature = "health")]
pub use endpoint::{health_router, serve_health};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_tracks_phase_and_camera_vitals() {
        let state = HealthState::new();

        let initial = state.snapshot().await;
        assert_eq!(initial.phase, BridgePhase::Starting);
        assert_eq!(initial.battery_percent, None);
        assert!(!initial.camera_connected);

        state.set_phase(BridgePhase::Ok).await;
        state
            .record_camera(CameraHealth {
                battery_percent: Some(42.0),
                connected: true,
            })
            .await;

        let updated = state.snapshot().await;
        assert_eq!(updated.phase, BridgePhase::Ok);
        assert_eq!(updated.battery_percent, Some(42.0));
        assert!(updated.camera_connected);
    }

    #[tokio::test]
    async fn clones_share_the_same_state() {
        let state = HealthState::new();
        let observer = state.clone();

        state.set_phase(BridgePhase::ShuttingDown).await;
        assert_eq!(observer.snapshot().await.phase, BridgePhase::ShuttingDown);
    }
}
