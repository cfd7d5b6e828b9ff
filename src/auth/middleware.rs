//! Bearer token middleware for protected routes.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request},
    middleware::Next,
    response::Response,
};

use crate::auth::claims::AccessClaims;
use crate::auth::token::{AuthRejection, TokenLifecycle};
use crate::error::SecurityError;

/// Inserted into request extensions once a token is accepted.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub claims: AccessClaims,
    /// The raw token, kept so logout can revoke it.
    pub token: String,
}

/// Pull the token out of `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthRejection> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(AuthRejection::Missing)?
        .to_str()
        .map_err(|_| AuthRejection::Malformed)?;

    let (scheme, token) = value.split_once(' ').ok_or(AuthRejection::Malformed)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthRejection::Malformed);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthRejection::Missing);
    }
    Ok(token)
}

pub async fn require_bearer(
    State(tokens): State<Arc<TokenLifecycle>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, SecurityError> {
    let token = bearer_token(request.headers())?.to_string();
    let claims = tokens.authenticate(&token).await?;

    tracing::debug!(user_id = %claims.sub, "Bearer token accepted");
    request
        .extensions_mut()
        .insert(AuthenticatedUser { claims, token });

    Ok(next.run(request).await)
}
