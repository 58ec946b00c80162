//! Error kinds surfaced at the dispatch/coordination boundaries.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use skyops_core::state_machine::TransitionError;

/// Failure modes of command dispatch and mission coordination.
///
/// REST maps these onto status codes; per-record processors log-and-count
/// instead of returning them.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("a command is already in flight for mission {0}")]
    AlreadyDispatching(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("command {action} timed out waiting for ack")]
    Timeout { action: &'static str },
    #[error("drone rejected command: {reason}")]
    Rejected { reason: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlError::Validation(_) => StatusCode::BAD_REQUEST,
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Conflict(_) | ControlError::AlreadyDispatching(_) => {
                StatusCode::CONFLICT
            }
            ControlError::Transport(_) => StatusCode::BAD_GATEWAY,
            ControlError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            ControlError::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ControlError::Cancelled | ControlError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::Validation(_) => "validation",
            ControlError::NotFound(_) => "not_found",
            ControlError::Conflict(_) => "conflict",
            ControlError::AlreadyDispatching(_) => "already_dispatching",
            ControlError::Transport(_) => "transport",
            ControlError::Timeout { .. } => "timeout",
            ControlError::Rejected { .. } => "rejected",
            ControlError::Cancelled => "cancelled",
            ControlError::Internal(_) => "internal",
        }
    }
}

impl From<TransitionError> for ControlError {
    fn from(err: TransitionError) -> Self {
        ControlError::Validation(err.to_string())
    }
}

impl From<sqlx::Error> for ControlError {
    fn from(err: sqlx::Error) -> Self {
        ControlError::Internal(format!("database: {}", err))
    }
}

impl From<anyhow::Error> for ControlError {
    fn from(err: anyhow::Error) -> Self {
        ControlError::Internal(err.to_string())
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {}", self);
        }
        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));
        (status, body).into_response()
    }
}
