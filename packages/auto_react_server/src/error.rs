use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::warn;

use auto_react::{PairingError, ReactorError};

/// Errors surfaced by the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("no session: set the sessionId cookie or the x-session-id header")]
    NoSession,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    Reactor(#[from] ReactorError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoSession => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Pairing(PairingError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            Self::Pairing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Reactor(e) => match e {
                ReactorError::SessionNotFound(_) | ReactorError::NoActiveReactor(_) => {
                    StatusCode::NOT_FOUND
                }
                ReactorError::AlreadyRunning(_) | ReactorError::Aborted(_) => StatusCode::CONFLICT,
                ReactorError::Gateway(_) | ReactorError::Credentials(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::NoSession => "no_session",
            Self::BadRequest(_) => "bad_request",
            Self::Internal(_) => "internal_error",
            Self::Pairing(e) => e.error_code(),
            Self::Reactor(e) => e.error_code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.to_string(),
                "code": self.error_code(),
            })),
        )
            .into_response()
    }
}
