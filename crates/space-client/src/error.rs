use reqwest::StatusCode;
use thiserror::Error;

use crate::transport::TransportError;

pub type SpaceResult<T> = Result<T, SpaceError>;

/// Every failure the client surfaces. Only [`SpaceError::Server`] is
/// transient; everything else ends the operation on first sight.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpaceError {
    #[error("invalid space reference: {0}")]
    InvalidReference(String),
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
    #[error("space not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl SpaceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SpaceError::Server(_))
    }

    /// Maps a non-success status onto the taxonomy. Callers with
    /// endpoint-specific rules match on the status before falling back here.
    pub fn from_status(status: StatusCode, context: &str) -> Self {
        match status {
            StatusCode::NOT_FOUND => SpaceError::NotFound(context.to_string()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                SpaceError::Unauthorized(format!("{context} ({status})"))
            }
            s if s.is_server_error() => SpaceError::Server(format!("{context} ({status})")),
            _ => SpaceError::Rejected(format!("{context} ({status})")),
        }
    }
}

impl From<TransportError> for SpaceError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Network(message) => SpaceError::Server(format!("network: {message}")),
            TransportError::Status(status) => SpaceError::from_status(status, "event stream"),
            TransportError::InvalidRequest(message) => SpaceError::InvalidConfig(message),
        }
    }
}
