//! Error taxonomy for the session subsystem.
//!
//! Every failure the scheduler and controller reason about is a
//! `SessionError`. The enum is `Clone` so that one refresh outcome can be
//! handed to every caller that coalesced onto the same in-flight request.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unauthorized - access token rejected: {0}")]
    Unauthorized(String),

    #[error("Refresh token rejected: {0}")]
    InvalidRefreshToken(String),

    #[error("Malformed credential: {0}")]
    MalformedCredential(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("No active session")]
    NotAuthenticated,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl SessionError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Map a non-success status from the verify or login endpoints.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 | 403 => SessionError::Unauthorized(truncated),
            429 => SessionError::RateLimited,
            500..=599 => SessionError::ServerError(truncated),
            _ => SessionError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Map a non-success status from either refresh endpoint.
    ///
    /// Client errors mean the refresh token itself was refused; nothing
    /// retried on a later tick can change that answer.
    pub fn from_refresh_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            400 | 401 | 403 => SessionError::InvalidRefreshToken(Self::truncate_body(body)),
            _ => Self::from_status(status, body),
        }
    }

    /// Only a rejected refresh token ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::InvalidRefreshToken(_))
    }

    /// Failures worth retrying on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::Network(_)
                | SessionError::ServerError(_)
                | SessionError::RateLimited
                | SessionError::InvalidResponse(_)
        )
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SessionError::InvalidResponse(e.to_string())
        } else {
            SessionError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::InvalidResponse(e.to_string())
    }
}
