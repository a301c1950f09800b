//! Thin HTTP adapters over the core services.

pub mod auth;
pub mod dashboard;
pub mod media;
pub mod streaming;

use crate::error::LumiereError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

impl IntoResponse for LumiereError {
    fn into_response(self) -> Response {
        let status = match &self {
            LumiereError::NotFound(_) => StatusCode::NOT_FOUND,
            LumiereError::Conflict(_) | LumiereError::Cancelled => StatusCode::CONFLICT,
            LumiereError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            LumiereError::Forbidden(_) => StatusCode::FORBIDDEN,
            LumiereError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            LumiereError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            LumiereError::Config(_)
            | LumiereError::ProbeFailed(_)
            | LumiereError::EncoderFailed(_)
            | LumiereError::Database(_)
            | LumiereError::Io(_)
            | LumiereError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// 401 with the standard error body.
pub fn unauthorized(detail: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "detail": detail })),
    )
        .into_response()
}
