//! Structured case-update API.
//!
//! The request/response path for structured fields, independent of the
//! WebSocket gateway:
//!
//! - `PATCH /case/{case_id}` — version-gated section update; 200 with the
//!   updated aggregate, 409 with the current authoritative state on a
//!   stale version.
//! - `GET /case/{case_id}` — current aggregate.
//! - `GET /healthz` — process and bus health.
//!
//! Bearer auth reuses the collaboration gateway's [`IdentityVerifier`];
//! token issuance stays out of scope.

use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::routing::{get, patch};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

use chartroom_collab::{HealthHandle, Identity, IdentityVerifier};

use crate::error::ApiError;
use crate::health::healthz;
use crate::store::{CaseAggregate, CaseStore};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<CaseStore>,
    pub verifier: Arc<IdentityVerifier>,
    pub health: HealthHandle,
}

/// Body of a `PATCH /case/{case_id}` request.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRequest {
    pub section: String,
    pub data: serde_json::Value,
    /// The aggregate version the caller last read.
    pub version: u64,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/case/{case_id}", patch(update_case).get(get_case))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serve the router until the listener fails or the task is dropped.
pub async fn serve(state: AppState, listener: tokio::net::TcpListener) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

async fn update_case(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<CaseAggregate>, ApiError> {
    let identity = bearer_identity(&state, &headers)?;
    if request.section.trim().is_empty() {
        return Err(ApiError::BadRequest("section must not be empty".into()));
    }

    let aggregate = state
        .store
        .update(&case_id, &request.section, request.data, request.version)
        .await?;
    log::info!(
        "{} updated {case_id}/{} to version {}",
        identity.display_name,
        request.section,
        aggregate.version
    );
    Ok(Json(aggregate))
}

async fn get_case(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CaseAggregate>, ApiError> {
    bearer_identity(&state, &headers)?;
    Ok(Json(state.store.get(&case_id)?))
}

fn bearer_identity(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthenticated("missing bearer token".into()))?;
    Ok(state.verifier.verify(token)?)
}
