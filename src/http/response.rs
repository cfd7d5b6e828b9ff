//! Error responses.
//!
//! # Responsibilities
//! - Map [`SecurityError`] to a status code and JSON body
//! - Add `Retry-After` to throttling responses and `WWW-Authenticate` to 401s
//!
//! # Design Decisions
//! - Internal errors are logged in full but answered with a generic message
//! - The body shape is the same for every error

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::SecurityError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    pub status: u16,
}

impl IntoResponse for SecurityError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let SecurityError::Internal(detail) = &self {
            tracing::error!(detail = %detail, "Internal error while handling request");
        }

        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        let mut response = (status, Json(body)).into_response();

        if let Some(secs) = self.retry_after() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthRejection;

    #[test]
    fn test_throttling_sets_retry_after() {
        let response = SecurityError::LockedOut { retry_after_secs: 540 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "540");
    }

    #[test]
    fn test_unauthorized_sets_challenge() {
        let response = SecurityError::from(AuthRejection::Expired).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }
}
