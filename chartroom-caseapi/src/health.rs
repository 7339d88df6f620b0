//! Health/liveness endpoint for orchestration probes.
//!
//! Reports whether the process is serving and whether the fan-out bus is
//! able to move events. A degraded bus is surfaced here, never hidden:
//! already-joined local members keep working, but cross-instance
//! visibility is impaired until the bus recovers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::api::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub bus_healthy: bool,
    pub active_connections: u64,
    pub active_rooms: usize,
}

/// `GET /healthz`. Degraded service still answers 200 so orchestrators
/// don't restart a process that is serving its local members; the body
/// distinguishes the two states.
pub async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let snapshot = state.health.snapshot().await;
    let report = HealthReport {
        status: if snapshot.bus_healthy { "ok" } else { "degraded" },
        bus_healthy: snapshot.bus_healthy,
        active_connections: snapshot.active_connections,
        active_rooms: snapshot.active_rooms,
    };
    (StatusCode::OK, Json(report))
}
