//! HTTP-facing error type with status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use chartroom_collab::AuthError;

use crate::store::{CaseAggregate, UpdateError};

/// Everything a handler can fail with, mapped to a status code and a JSON
/// body. A version conflict additionally carries the current authoritative
/// aggregate so the caller can show a "modified by someone else" notice
/// and reconcile.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("case {0} not found")]
    NotFound(String),
    #[error("modified by someone else (authoritative version {})", current.version)]
    VersionConflict { current: Box<CaseAggregate> },
    #[error("storage failure: {0}")]
    Storage(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::VersionConflict { .. } => StatusCode::CONFLICT,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<UpdateError> for ApiError {
    fn from(e: UpdateError) -> Self {
        match e {
            UpdateError::NotFound(case_id) => ApiError::NotFound(case_id),
            UpdateError::VersionConflict { current } => ApiError::VersionConflict { current },
            UpdateError::Storage(e) | UpdateError::Serialization(e) => ApiError::Storage(e),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::Unauthenticated(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            ApiError::VersionConflict { current } => json!({
                "error": self.to_string(),
                "current": current,
            }),
            _ => json!({ "error": self.to_string() }),
        };
        if status.is_server_error() {
            log::error!("Request failed: {self}");
        }
        (status, Json(body)).into_response()
    }
}
