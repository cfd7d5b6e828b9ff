//! Request handlers.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    Extension, Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::credentials::normalize_username;
use crate::auth::{AccessClaims, AuthenticatedUser, IssuedToken, TokenClaims};
use crate::error::SecurityError;
use crate::http::server::AppState;
use crate::observability::metrics;
use crate::security::fetch::FetchKind;
use crate::security::paths::resolve_within;
use crate::security::upload::{MediaCategory, UploadDecision, UploadFile};

/// Header carrying the original filename of a raw upload.
pub const X_FILENAME: &str = "x-filename";

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<IssuedToken>, SecurityError> {
    let identifier = normalize_username(&request.username);
    if identifier.is_empty() || request.password.is_empty() {
        return Err(SecurityError::BadRequest(
            "username and password are required".to_string(),
        ));
    }

    let locked_for = state.logins.seconds_remaining(&identifier).await;
    if locked_for > 0 {
        tracing::info!(identifier = %identifier, locked_for, "Login refused, identifier locked");
        metrics::record_login("locked");
        return Err(SecurityError::LockedOut {
            retry_after_secs: locked_for,
        });
    }

    let Some(principal) = state.credentials.verify(&identifier, &request.password).await else {
        let remaining = state.logins.record_failure(&identifier).await;
        metrics::record_login("failure");
        tracing::info!(identifier = %identifier, remaining, "Login failed");
        if remaining == 0 {
            let retry_after_secs = state.logins.seconds_remaining(&identifier).await.max(1);
            return Err(SecurityError::LockedOut { retry_after_secs });
        }
        return Err(SecurityError::InvalidCredentials {
            remaining_attempts: remaining,
        });
    };

    state.logins.record_success(&identifier).await;
    let claims = TokenClaims {
        email: principal.email,
        roles: principal.roles,
    };
    let issued = state
        .tokens
        .issue(&principal.user_id, claims, None)
        .map_err(|e| SecurityError::Internal(e.to_string()))?;

    tracing::info!(user_id = %principal.user_id, "Login succeeded");
    metrics::record_login("success");
    Ok(Json(issued))
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> StatusCode {
    state
        .tokens
        .revoke(&user.token, Some(&user.claims.sub))
        .await;
    StatusCode::NO_CONTENT
}

pub async fn me(Extension(user): Extension<AuthenticatedUser>) -> Json<AccessClaims> {
    Json(user.claims)
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub url: String,
    /// Name to store the file under. Defaults to the last URL path segment.
    #[serde(default)]
    pub filename: Option<String>,
}

/// A file accepted and written to the upload directory.
#[derive(Debug, Serialize)]
pub struct StoredMedia {
    pub id: String,
    pub filename: String,
    pub stored_as: String,
    pub mime: String,
    pub category: MediaCategory,
    pub size: u64,
}

pub async fn import_media(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<ImportRequest>,
) -> Result<(StatusCode, Json<StoredMedia>), SecurityError> {
    let policies = state.policies.load_full();
    let fetched = policies.fetcher.fetch(&request.url, FetchKind::Image).await?;

    let filename = request.filename.unwrap_or_else(|| {
        fetched
            .final_url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_string()
    });
    let content_type = fetched.content_type.as_deref().unwrap_or_default();

    let decision = validate_upload(&state, &filename, content_type, &fetched.bytes)?;
    let stored = store_media(&state, decision, &fetched.bytes).await?;
    tracing::info!(
        user_id = %user.claims.sub,
        source = %fetched.final_url,
        stored_as = %stored.stored_as,
        "Imported remote media"
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

/// Raw-body upload: the body is the file, `Content-Type` its declared type,
/// `X-Filename` its name.
pub async fn upload_media(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<StoredMedia>), SecurityError> {
    let filename = headers
        .get(X_FILENAME)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| SecurityError::BadRequest("missing X-Filename header".to_string()))?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let decision = validate_upload(&state, filename, content_type, &body)?;
    let stored = store_media(&state, decision, &body).await?;
    tracing::info!(
        user_id = %user.claims.sub,
        stored_as = %stored.stored_as,
        size = stored.size,
        "Stored upload"
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

fn validate_upload(
    state: &AppState,
    filename: &str,
    content_type: &str,
    bytes: &[u8],
) -> Result<UploadDecision, SecurityError> {
    let policies = state.policies.load();
    let file = UploadFile {
        filename,
        content_type,
        bytes,
    };
    match policies.uploads.validate(&file) {
        Ok(decision) => Ok(decision),
        Err(err) => {
            tracing::warn!(filename = %filename, content_type = %content_type, reason = %err, "Upload rejected");
            metrics::record_upload(err.reason());
            Err(err.into())
        }
    }
}

async fn store_media(
    state: &AppState,
    decision: UploadDecision,
    bytes: &[u8],
) -> Result<StoredMedia, SecurityError> {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let stored_as = format!("{}-{}", id, decision.sanitized_filename);
    let path = resolve_within(&state.upload_dir, &stored_as)?;

    tokio::fs::create_dir_all(&state.upload_dir)
        .await
        .map_err(|e| SecurityError::Internal(format!("creating upload directory: {}", e)))?;
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| SecurityError::Internal(format!("writing {}: {}", path.display(), e)))?;

    metrics::record_upload("accepted");
    Ok(StoredMedia {
        id,
        filename: decision.sanitized_filename,
        stored_as,
        mime: decision.mime,
        category: decision.category,
        size: decision.size,
    })
}
