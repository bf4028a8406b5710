use std::fmt;

use thiserror::Error;

use crate::envelope::ResponseEnvelope;
use crate::transport::TransportError;
use crate::validator::Rejection;

/// Failure of one logical fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The initial URL, or the URL reached after redirects, is unsafe.
    #[error("URL rejected: {0}")]
    Rejected(#[from] Rejection),

    /// Permanent transport failure; not retried.
    #[error(transparent)]
    Transport(TransportError),

    #[error("gave up after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: LastFailure },

    /// Raised by [`ResponseEnvelope::error_for_status`].
    #[error("HTTP {}", .0.status)]
    Status(Box<ResponseEnvelope>),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Status code of the response behind this error, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status(envelope) => Some(envelope.status),
            Self::ExhaustedRetries {
                last: LastFailure::Status(envelope),
                ..
            } => Some(envelope.status),
            _ => None,
        }
    }
}

impl From<TransportError> for FetchError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Blocked(rejection) => Self::Rejected(rejection),
            TransportError::InvalidRequest(detail) => Self::InvalidRequest(detail),
            other => Self::Transport(other),
        }
    }
}

/// What the final retryable attempt ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum LastFailure {
    Transport(TransportError),
    Status(Box<ResponseEnvelope>),
}

impl fmt::Display for LastFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "{err}"),
            Self::Status(envelope) => write!(f, "HTTP {}", envelope.status),
        }
    }
}
