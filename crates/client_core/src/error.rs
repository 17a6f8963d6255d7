use reqwest::StatusCode;
use shared::error::ApiErrorBody;
use thiserror::Error;

use crate::{lifecycle::Denial, validation::ValidationErrors};

/// Failure taxonomy shared by every client operation.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// A local rule rejected the action; no request was sent.
    #[error("{0}")]
    Precondition(#[from] Denial),
    /// Input failed form validation; no request was sent.
    #[error("{0}")]
    Validation(#[from] ValidationErrors),
    /// The backend rejected an otherwise locally valid request because its
    /// state diverged from ours.
    #[error("rejected by server ({status}): {message}")]
    Conflict { status: u16, message: String },
    #[error("{what} not found")]
    NotFound { what: String },
    /// Credentials were refused by an unauthenticated endpoint (login, signup).
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Network failure, timeout or 5xx. Retrying is left to the user.
    #[error("temporary failure: {0}")]
    Transient(String),
    #[error("session expired, sign in again")]
    SessionExpired,
    #[error("not signed in")]
    NotAuthenticated,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid server response: {0}")]
    InvalidResponse(String),
    #[error("session persistence failed: {0}")]
    Persistence(String),
    /// The owning screen went away before the response arrived.
    #[error("response discarded after detach")]
    Detached,
}

impl ClientError {
    /// Whether the failure should reach the user at all.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Detached)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub(crate) fn from_status(status: StatusCode, body: &ApiErrorBody) -> Self {
        let message = body
            .text()
            .map(str::to_string)
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| "request failed".to_string());

        if status.is_server_error() {
            return Self::Transient(format!("server error {}: {message}", status.as_u16()));
        }

        match status {
            StatusCode::UNAUTHORIZED => Self::Unauthorized(message),
            StatusCode::NOT_FOUND => Self::NotFound { what: message },
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                Self::Transient(format!("{} {message}", status.as_u16()))
            }
            _ => Self::Conflict {
                status: status.as_u16(),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transient("request timed out".to_string())
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}
