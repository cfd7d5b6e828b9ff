use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::credentials::normalize_username;
use crate::http::server::AppState;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub store: &'static str,
    pub uptime_secs: u64,
}

#[derive(Serialize)]
pub struct LockoutStatus {
    pub identifier: String,
    pub locked: bool,
    pub seconds_remaining: u64,
    pub failed_attempts: u32,
    pub max_attempts: u32,
}

#[derive(Deserialize)]
pub struct RevokeRequest {
    pub token: String,
    #[serde(default)]
    pub owner_user_id: Option<String>,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        store: state.store.name(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

pub async fn invalidate_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> StatusCode {
    state.tokens.invalidate_all_for_user(&user_id).await;
    StatusCode::NO_CONTENT
}

pub async fn get_lockout(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Json<LockoutStatus> {
    let identifier = normalize_username(&identifier);
    let seconds_remaining = state.logins.seconds_remaining(&identifier).await;
    Json(LockoutStatus {
        locked: seconds_remaining > 0,
        seconds_remaining,
        failed_attempts: state.logins.failed_attempts(&identifier).await,
        max_attempts: state.logins.max_attempts(),
        identifier,
    })
}

pub async fn clear_lockout(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> StatusCode {
    let identifier = normalize_username(&identifier);
    state.logins.record_success(&identifier).await;
    tracing::info!(identifier = %identifier, "Lockout cleared by admin");
    StatusCode::NO_CONTENT
}

pub async fn revoke_token(
    State(state): State<AppState>,
    Json(request): Json<RevokeRequest>,
) -> StatusCode {
    state
        .tokens
        .revoke(request.token.trim(), request.owner_user_id.as_deref())
        .await;
    StatusCode::NO_CONTENT
}
