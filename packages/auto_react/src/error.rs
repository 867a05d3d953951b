use crate::gateway::RATE_LIMIT_STATUS;

/// Errors raised by a [`crate::CredentialStore`].
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("credential store I/O failed for session {session_id}: {source}")]
    Io {
        session_id: String,
        #[source]
        source: std::io::Error,
    },
}

impl CredentialError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidSessionId(_) => "invalid_session_id",
            Self::Io { .. } => "credential_store_failed",
        }
    }
}

/// Errors raised while establishing a gateway connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway connection failed: {0}")]
    ConnectFailed(String),

    #[error("gateway connection timed out")]
    Timeout,

    #[error("gateway connection is closed")]
    Closed,
}

impl GatewayError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::ConnectFailed(_) => "gateway_connect_failed",
            Self::Timeout => "gateway_timeout",
            Self::Closed => "gateway_closed",
        }
    }
}

/// A failed reaction send, as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SendError {
    /// Provider status code, when the gateway reported one.
    pub status_code: Option<u16>,
    pub message: String,
}

impl SendError {
    pub fn new(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }

    /// Provider throttling: status 429, or a message mentioning "429" or "rate".
    pub fn is_rate_limited(&self) -> bool {
        if self.status_code == Some(RATE_LIMIT_STATUS) {
            return true;
        }
        let message = self.message.to_ascii_lowercase();
        message.contains("429") || message.contains("rate")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("timed out waiting for pairing code")]
    Timeout,

    #[error("connection closed before pairing code was received")]
    Failed {
        status_code: Option<u16>,
        reason: Option<String>,
    },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

impl PairingError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Timeout => "pairing_timeout",
            Self::Failed { .. } => "pairing_failed",
            Self::Gateway(e) => e.error_code(),
            Self::Credentials(e) => e.error_code(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("reactor already running for session {0}")]
    AlreadyRunning(String),

    #[error("no active reactor for session {0}")]
    NoActiveReactor(String),

    #[error("reactor for session {0} was stopped before it finished starting")]
    Aborted(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

impl ReactorError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::AlreadyRunning(_) => "already_running",
            Self::NoActiveReactor(_) => "no_active_reactor",
            Self::Aborted(_) => "aborted",
            Self::Gateway(e) => e.error_code(),
            Self::Credentials(e) => e.error_code(),
        }
    }
}
