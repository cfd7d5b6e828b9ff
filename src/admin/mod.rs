//! Operator API under `/admin`, guarded by a static bearer key.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::auth::{admin_auth_middleware, AdminKey};
use self::handlers::*;
use crate::config::AdminConfig;
use crate::http::server::AppState;

pub fn setup_admin_router(config: &AdminConfig) -> Router<AppState> {
    let key = AdminKey(Arc::from(config.api_key.as_str()));
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/users/{user_id}/invalidate", post(invalidate_user))
        .route(
            "/admin/lockouts/{identifier}",
            get(get_lockout).delete(clear_lockout),
        )
        .route("/admin/tokens/revoke", post(revoke_token))
        .route_layer(middleware::from_fn_with_state(key, admin_auth_middleware))
}
