//! Error types for the Observer API server.
//!
//! [`ObserverError`] unifies all failure modes into a single enum that
//! can be converted into an Axum HTTP response via its
//! [`IntoResponse`](axum::response::IntoResponse) implementation.
//! Every variant is a client error: the engine itself never fails a
//! request.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use retrace_core::{QueryError, StoreError};

/// Errors that can occur in the Observer API layer.
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    /// A process reference could not be parsed from the request path.
    #[error("invalid process reference: {0}")]
    InvalidProcessRef(String),

    /// A query parameter was missing, malformed, or out of range.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The request body could not be decoded.
    #[error("invalid body: {0}")]
    InvalidBody(String),
}

impl From<StoreError> for ObserverError {
    fn from(err: StoreError) -> Self {
        Self::InvalidQuery(err.to_string())
    }
}

impl From<QueryError> for ObserverError {
    fn from(err: QueryError) -> Self {
        Self::InvalidQuery(err.to_string())
    }
}

impl From<QueryRejection> for ObserverError {
    fn from(rejection: QueryRejection) -> Self {
        Self::InvalidQuery(rejection.body_text())
    }
}

impl From<JsonRejection> for ObserverError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidBody(rejection.body_text())
    }
}

impl IntoResponse for ObserverError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
