//! Unified HTTP error type for axum request handlers.
//!
//! Every failure the relay reports to a caller has the same shape: an HTTP
//! status plus a JSON body `{"error": ...}`. [`ApiError`] carries both and
//! converts into a response via [`IntoResponse`], so handlers can return
//! `Result<T, ApiError>`.
//!
//! The `error` value is usually a short string, but structured upstream errors
//! are relayed verbatim and may be JSON objects.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

/// An HTTP status plus the value placed under `"error"` in the response body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: Value,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            error: Value::String(message.into()),
        }
    }

    /// Relay an arbitrary upstream error value unchanged.
    pub fn with_value(status: StatusCode, error: Value) -> Self {
        Self { status, error }
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn error(&self) -> &Value {
        &self.error
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(status = self.status.as_u16(), error = %self.error, "handler error");
        } else {
            tracing::debug!(status = self.status.as_u16(), error = %self.error, "handler error");
        }
        (self.status, Json(json!({ "error": self.error }))).into_response()
    }
}
