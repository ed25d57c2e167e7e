//! HTTP and protocol-level error types.
//!
//! `AppError` wraps any error for use as an axum handler's error type.
//! `ApplyRejection` is a typed reason a live WebSocket edit was rejected,
//! so the client can react to it (reconcile, retry, disconnect) instead of
//! just seeing an opaque 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

/// Wraps any error for use as an axum handler's error type. Use `?` on
/// functions returning `anyhow::Result` to convert automatically.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error, pub StatusCode);

impl AppError {
    pub fn unauthorized() -> Self {
        Self(anyhow::anyhow!("unauthorised"), StatusCode::UNAUTHORIZED)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(anyhow::anyhow!(message.into()), StatusCode::BAD_REQUEST)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.1 == StatusCode::INTERNAL_SERVER_ERROR {
            error!("application error: {:#}", self.0);
            (self.1, "something went wrong").into_response()
        } else {
            (self.1, self.0.to_string()).into_response()
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into(), StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// Why a live `apply_edit` was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyRejection {
    BaseTooOld,
    Malformed,
    Unauthorised,
    StorageUnavailable,
}

impl From<ApplyRejection> for inkwell_protocol::RejectReason {
    fn from(value: ApplyRejection) -> Self {
        match value {
            ApplyRejection::BaseTooOld => inkwell_protocol::RejectReason::BaseTooOld,
            ApplyRejection::Malformed => inkwell_protocol::RejectReason::Malformed,
            ApplyRejection::Unauthorised => inkwell_protocol::RejectReason::Unauthorised,
            ApplyRejection::StorageUnavailable => inkwell_protocol::RejectReason::StorageUnavailable,
        }
    }
}
