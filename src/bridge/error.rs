use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::session::SessionError;

/// Everything a bridge client can be told went wrong.
///
/// Each variant maps to a machine-readable code string and a human-readable
/// message. Request failures travel inside a WebSocket response; the
/// HTTP-level ones (authentication, origin) go through [`IntoResponse`].
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Authentication required. Provide a token via Authorization header or ?token= query parameter.")]
    AuthRequired,

    #[error("Invalid authentication token.")]
    AuthInvalid,

    #[error("WebSocket origin not allowed.")]
    OriginNotAllowed,

    #[error("Unknown method '{0}'.")]
    UnknownMethod(String),

    #[error("Invalid request: {0}.")]
    InvalidRequest(String),

    #[error("Unknown session: {0}.")]
    UnknownSession(String),

    #[error("Failed to start session: {0}.")]
    SpawnFailed(String),

    #[error("Maximum number of sessions reached.")]
    MaxSessionsReached,

    #[error("Shell not allowed: {0}.")]
    ShellNotAllowed(String),

    #[error("Terminal size must be non-zero.")]
    InvalidSize,

    #[error("Server is shutting down.")]
    ShuttingDown,

    #[error("Internal error: {0}.")]
    Internal(String),
}

impl BridgeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::AuthRequired => StatusCode::UNAUTHORIZED,
            BridgeError::AuthInvalid | BridgeError::OriginNotAllowed => StatusCode::FORBIDDEN,
            BridgeError::UnknownMethod(_)
            | BridgeError::InvalidRequest(_)
            | BridgeError::InvalidSize => StatusCode::BAD_REQUEST,
            BridgeError::UnknownSession(_) => StatusCode::NOT_FOUND,
            BridgeError::ShellNotAllowed(_) => StatusCode::FORBIDDEN,
            BridgeError::MaxSessionsReached | BridgeError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BridgeError::SpawnFailed(_) | BridgeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::AuthRequired => "auth_required",
            BridgeError::AuthInvalid => "auth_invalid",
            BridgeError::OriginNotAllowed => "origin_not_allowed",
            BridgeError::UnknownMethod(_) => "unknown_method",
            BridgeError::InvalidRequest(_) => "invalid_request",
            BridgeError::UnknownSession(_) => "unknown_session",
            BridgeError::SpawnFailed(_) => "spawn_failed",
            BridgeError::MaxSessionsReached => "max_sessions_reached",
            BridgeError::ShellNotAllowed(_) => "shell_not_allowed",
            BridgeError::InvalidSize => "invalid_size",
            BridgeError::ShuttingDown => "shutting_down",
            BridgeError::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl From<SessionError> for BridgeError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Spawn(e) => BridgeError::SpawnFailed(e.to_string()),
            SessionError::SpawnTask(e) => BridgeError::SpawnFailed(e.to_string()),
            SessionError::UnknownSession(id) => BridgeError::UnknownSession(id.to_string()),
            SessionError::MaxSessionsReached => BridgeError::MaxSessionsReached,
            SessionError::ShellNotAllowed(shell) => BridgeError::ShellNotAllowed(shell),
            SessionError::InvalidSize => BridgeError::InvalidSize,
            SessionError::ShuttingDown => BridgeError::ShuttingDown,
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
