//! HTTP-facing error taxonomy.
//!
//! Component errors convert into [`SecurityError`]; its `IntoResponse`
//! implementation lives in `http::response`. Backing store failures never
//! appear here: components absorb them into their fallback behaviour.

use axum::http::StatusCode;
use thiserror::Error;

use crate::auth::AuthRejection;
use crate::security::fetch::FetchError;
use crate::security::paths::PathError;
use crate::security::ssrf::SsrfError;
use crate::security::upload::UploadError;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("{0}")]
    AuthRejected(#[from] AuthRejection),

    #[error("invalid username or password, {remaining_attempts} attempts remaining")]
    InvalidCredentials { remaining_attempts: u32 },

    #[error("too many requests, retry in {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("too many failed login attempts, locked for another {retry_after_secs} seconds")]
    LockedOut { retry_after_secs: u64 },

    #[error("{0}")]
    SsrfRejected(#[from] SsrfError),

    #[error("{0}")]
    Fetch(FetchError),

    #[error("{0}")]
    UploadRejected(#[from] UploadError),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error")]
    Internal(String),
}

impl From<FetchError> for SecurityError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Rejected(rejection) => SecurityError::SsrfRejected(rejection),
            other => SecurityError::Fetch(other),
        }
    }
}

impl From<PathError> for SecurityError {
    fn from(err: PathError) -> Self {
        SecurityError::UploadRejected(UploadError::UnsafePath(err))
    }
}

impl SecurityError {
    pub fn status(&self) -> StatusCode {
        match self {
            SecurityError::AuthRejected(_) | SecurityError::InvalidCredentials { .. } => {
                StatusCode::UNAUTHORIZED
            }
            SecurityError::RateLimited { .. } | SecurityError::LockedOut { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            SecurityError::SsrfRejected(_)
            | SecurityError::UploadRejected(_)
            | SecurityError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SecurityError::Fetch(FetchError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            SecurityError::Fetch(_) => StatusCode::BAD_GATEWAY,
            SecurityError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            SecurityError::AuthRejected(_) => "unauthorized",
            SecurityError::InvalidCredentials { .. } => "invalid_credentials",
            SecurityError::RateLimited { .. } => "rate_limited",
            SecurityError::LockedOut { .. } => "locked_out",
            SecurityError::SsrfRejected(_) => "url_rejected",
            SecurityError::Fetch(_) => "fetch_failed",
            SecurityError::UploadRejected(_) => "upload_rejected",
            SecurityError::BadRequest(_) => "bad_request",
            SecurityError::Internal(_) => "internal_error",
        }
    }

    /// Seconds for a `Retry-After` header, when one applies.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            SecurityError::RateLimited { retry_after_secs }
            | SecurityError::LockedOut { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            SecurityError::from(AuthRejection::Revoked).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            SecurityError::LockedOut { retry_after_secs: 9 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            SecurityError::from(UploadError::Empty).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SecurityError::from(FetchError::TooManyRedirects(5)).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_fetch_rejections_surface_as_ssrf() {
        let err = SecurityError::from(FetchError::Rejected(SsrfError::BlockedPort(6379)));
        assert_eq!(err.code(), "url_rejected");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("6379"));
    }

    #[test]
    fn test_retry_after_only_for_throttling() {
        assert_eq!(SecurityError::RateLimited { retry_after_secs: 60 }.retry_after(), Some(60));
        assert_eq!(SecurityError::BadRequest("x".into()).retry_after(), None);
    }
}
