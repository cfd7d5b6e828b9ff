//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (request ID, tracing, timeout, body limit, rate limit)
//! - Put bearer authentication in front of protected routes
//! - Swap outbound URL and upload policies when the config file changes
//! - Serve until the shutdown signal fires

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::admin;
use crate::auth::{require_bearer, CredentialVerifier, TokenLifecycle};
use crate::config::GatewayConfig;
use crate::http::handlers;
use crate::security::fetch::SafeFetcher;
use crate::security::lockout::LoginAttemptTracker;
use crate::security::rate_limit::{rate_limit_middleware, RateLimitState, RateLimiter};
use crate::security::ssrf::{HostResolver, SsrfGuard};
use crate::security::upload::UploadValidator;
use crate::store::BackingStore;

/// Headroom above the upload size cap for the request body limit.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

/// Policies that can be replaced while the server runs.
pub struct PolicySet {
    pub guard: Arc<SsrfGuard>,
    pub fetcher: SafeFetcher,
    pub uploads: UploadValidator,
}

impl PolicySet {
    pub fn from_config(
        config: &GatewayConfig,
        resolver: Arc<dyn HostResolver>,
    ) -> Result<Self, regex::Error> {
        let guard = Arc::new(SsrfGuard::new(config.ssrf.clone(), resolver)?);
        Ok(Self {
            fetcher: SafeFetcher::new(guard.clone(), &config.fetch),
            guard,
            uploads: UploadValidator::new(config.upload.clone()),
        })
    }
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub tokens: Arc<TokenLifecycle>,
    pub limiter: Arc<RateLimiter>,
    pub logins: Arc<LoginAttemptTracker>,
    pub credentials: Arc<dyn CredentialVerifier>,
    pub policies: Arc<ArcSwap<PolicySet>>,
    pub resolver: Arc<dyn HostResolver>,
    pub store: Arc<dyn BackingStore>,
    pub upload_dir: PathBuf,
    pub started_at: Instant,
}

/// HTTP server for the security gateway.
pub struct GatewayServer {
    router: Router,
    config: GatewayConfig,
    state: AppState,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, state: AppState) -> Self {
        let router = Self::build_router(&config, state.clone());
        Self {
            router,
            config,
            state,
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &GatewayConfig, state: AppState) -> Router {
        let rate_state = RateLimitState::new(state.limiter.clone(), &config.rate_limit);
        let body_limit = (config.upload.max_size_bytes as usize).saturating_add(BODY_LIMIT_SLACK);

        let protected = Router::new()
            .route("/api/auth/logout", post(handlers::logout))
            .route("/api/auth/me", get(handlers::me))
            .route("/api/media/import", post(handlers::import_media))
            .route("/api/media/upload", post(handlers::upload_media))
            .route_layer(middleware::from_fn_with_state(
                state.tokens.clone(),
                require_bearer,
            ));

        let mut app = Router::new()
            .route("/health", get(handlers::health))
            .route("/api/auth/login", post(handlers::login))
            .merge(protected);

        if config.admin.enabled {
            app = app.merge(admin::setup_admin_router(&config.admin));
        }

        app.with_state(state)
            .layer(middleware::from_fn_with_state(rate_state, rate_limit_middleware))
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(body_limit))
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<GatewayConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            store = self.state.store.name(),
            admin = self.config.admin.enabled,
            "HTTP server starting"
        );

        let policies = self.state.policies.clone();
        let resolver = self.state.resolver.clone();
        tokio::spawn(async move {
            while let Some(new_config) = config_updates.recv().await {
                match PolicySet::from_config(&new_config, resolver.clone()) {
                    Ok(set) => {
                        policies.store(Arc::new(set));
                        tracing::info!("Outbound URL and upload policies reloaded");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Rejected reloaded policies, keeping current ones");
                    }
                }
            }
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// The fully layered router, for in-process tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}
