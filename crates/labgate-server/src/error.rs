//! API error types with HTTP status code mapping.
//!
//! [`ApiError`] is the unified error type for all API endpoints. It implements
//! `axum::response::IntoResponse` to produce structured JSON error responses
//! with appropriate HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use labgate_core::{ArbitrationError, EquipmentId};

use crate::concurrency::DenialReason;

/// Structured error detail in API responses.
#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorDetail {
    /// Machine-readable error code (e.g., "NOT_FOUND", "LOCK_DENIED").
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Optional structured details (e.g., the denial reason).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API errors with HTTP status code mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Entity not found (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request (400).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Internal server error (500).
    #[error("internal error: {0}")]
    InternalError(String),

    /// Resource conflict (409).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Equipment lock prevents the operation (423).
    #[error("lock denied: {message}")]
    Locked {
        message: String,
        details: Option<serde_json::Value>,
    },

    /// Missing or malformed `X-Session-Id` header (401).
    #[error("session required: {0}")]
    SessionRequired(String),
}

impl ApiError {
    /// 423 for an acquire request the lock manager denied.
    pub fn lock_denied(equipment_id: &EquipmentId, reason: &DenialReason) -> Self {
        ApiError::Locked {
            message: format!("{equipment_id}: {}", reason.describe()),
            details: serde_json::to_value(reason).ok(),
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Locked { .. } => (StatusCode::LOCKED, "LOCK_DENIED"),
            ApiError::SessionRequired(_) => (StatusCode::UNAUTHORIZED, "SESSION_REQUIRED"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let detail = match self {
            ApiError::NotFound(msg)
            | ApiError::BadRequest(msg)
            | ApiError::InternalError(msg)
            | ApiError::Conflict(msg)
            | ApiError::SessionRequired(msg) => ApiErrorDetail {
                code: code.to_string(),
                message: msg,
                details: None,
            },
            ApiError::Locked { message, details } => ApiErrorDetail {
                code: code.to_string(),
                message,
                details,
            },
        };

        let body = serde_json::json!({
            "success": false,
            "error": detail,
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<ArbitrationError> for ApiError {
    fn from(err: ArbitrationError) -> Self {
        match &err {
            ArbitrationError::SessionNotFound(_) => ApiError::NotFound(err.to_string()),
            ArbitrationError::DuplicateSession(_) => ApiError::Conflict(err.to_string()),
            ArbitrationError::PermissionDenied {
                equipment_id,
                command,
                ..
            } => ApiError::Locked {
                details: Some(serde_json::json!({
                    "equipment_id": equipment_id,
                    "command": command,
                })),
                message: err.to_string(),
            },
            ArbitrationError::InvalidConfig { .. } => ApiError::InternalError(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use labgate_core::SessionId;

    use super::*;

    #[test]
    fn arbitration_errors_map_to_status_codes() {
        let cases = [
            (
                ArbitrationError::SessionNotFound(SessionId::from("s1")),
                StatusCode::NOT_FOUND,
            ),
            (
                ArbitrationError::DuplicateSession(SessionId::from("s1")),
                StatusCode::CONFLICT,
            ),
            (
                ArbitrationError::PermissionDenied {
                    equipment_id: EquipmentId::from("scope-1"),
                    command: "run".to_string(),
                    reason: "equipment is locked by s2".to_string(),
                },
                StatusCode::LOCKED,
            ),
            (
                ArbitrationError::InvalidConfig {
                    key: "LABGATE_LOCK_TIMEOUT_SEC".to_string(),
                    reason: "must be greater than zero".to_string(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), expected);
        }
    }

    #[test]
    fn missing_session_is_unauthorized() {
        let response = ApiError::SessionRequired("X-Session-Id header required".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
