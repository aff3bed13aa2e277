//! Error taxonomy for the session layer.
//!
//! Four families, handled at different layers:
//! * [`AuthError`]: credential invalid/expired/rejected; always clears the
//!   session before surfacing.
//! * Connection errors: open/timeout failures on the transport; always
//!   force a clean disconnect before surfacing.
//! * Protocol errors: undecodable inbound frames; logged and dropped by
//!   the router, surfaced only when the caller itself sent bad data.
//! * [`ErrorData`]: normalized project/job failures; attached to the
//!   failing entity and delivered via its terminal event, never thrown.

use pictor_protocol::{ApiErrorResponse, WireError};
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

/// Credential failure. Cloneable so concurrent callers sharing one renewal
/// all receive the same outcome.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("{message}")]
pub struct AuthError {
    pub message: String,
    /// Service error code when the server rejected the credential.
    pub code: Option<u32>,
}

impl AuthError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }
}

/// Normalized failure attached to a Project or Job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: u32,
    pub message: String,
}

impl std::fmt::Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("backup not supported for this authentication mode")]
    BackupNotSupported,
    #[error("socket is not connected")]
    NotConnected,
    #[error("socket connection timeout")]
    ConnectionTimeout,
    #[error("socket connection failed")]
    ConnectionFailed,
    #[error("api error {status}: {message} (code {error_code})")]
    Api {
        status: u16,
        message: String,
        error_code: u32,
    },
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    pub(crate) fn api(status: u16, payload: ApiErrorResponse) -> Self {
        Self::Api {
            status,
            message: payload.message,
            error_code: payload.error_code,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}
