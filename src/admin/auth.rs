use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request},
    middleware::Next,
    response::Response,
};

use subtle::ConstantTimeEq;

use crate::auth::AuthRejection;
use crate::error::SecurityError;

/// Compare without leaking where the first differing byte is.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// The configured admin API key.
#[derive(Clone)]
pub struct AdminKey(pub Arc<str>);

pub async fn admin_auth_middleware(
    State(AdminKey(key)): State<AdminKey>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, SecurityError> {
    let accepted = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|candidate| constant_time_eq(candidate.trim(), &key));

    match accepted {
        Some(true) => Ok(next.run(request).await),
        Some(false) => {
            tracing::warn!(path = %request.uri().path(), "Admin request with wrong key");
            Err(AuthRejection::BadSignature.into())
        }
        None => Err(AuthRejection::Missing.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_comparison() {
        assert!(constant_time_eq("abcd", "abcd"));
        assert!(!constant_time_eq("abcd", "abce"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(!constant_time_eq("", "abcd"));
    }
}
