//! Startup orchestration.
//!
//! # Responsibilities
//! - Connect the backing store, falling back to in-process state
//! - Initialize all components in dependency order
//!
//! # Design Decisions
//! - Fail fast on bad token settings or policies
//! - Subsystems initialize in order, not concurrently

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use thiserror::Error;

use crate::auth::{StaticCredentials, TokenError, TokenLifecycle, TokenSettings};
use crate::clock::{Clock, SystemClock};
use crate::config::{GatewayConfig, StoreConfig};
use crate::http::server::{AppState, PolicySet};
use crate::security::lockout::LoginAttemptTracker;
use crate::security::rate_limit::{RateLimitSettings, RateLimiter};
use crate::security::ssrf::{HostResolver, SystemResolver};
use crate::store::{BackingStore, FallbackStore, MemoryStore, RedisStore};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid token settings: {0}")]
    Token(#[from] TokenError),

    #[error("invalid outbound URL policy: {0}")]
    Policy(#[from] regex::Error),
}

/// Connect Redis when configured. The in-process store is always present
/// and serves any operation the remote cannot.
pub async fn connect_store(config: &StoreConfig, clock: Arc<dyn Clock>) -> Arc<dyn BackingStore> {
    let local = MemoryStore::new(clock).with_sweep_interval(config.sweep_interval);

    let remote: Option<Arc<dyn BackingStore>> = match &config.redis_url {
        Some(url) => {
            let timeout = Duration::from_millis(config.connect_timeout_ms);
            match RedisStore::connect(url, timeout).await {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Redis unreachable at startup, limits and revocations are per instance"
                    );
                    None
                }
            }
        }
        None => {
            tracing::info!("No Redis configured, using in-process state");
            None
        }
    };

    Arc::new(FallbackStore::new(remote, local))
}

/// Build every component on top of `store`.
pub fn build_state(
    config: &GatewayConfig,
    store: Arc<dyn BackingStore>,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn HostResolver>,
) -> Result<AppState, StartupError> {
    let settings = TokenSettings::from_config(&config.tokens)?;
    let tokens = TokenLifecycle::new(settings, store.clone(), clock.clone());

    let limiter = RateLimiter::new(
        RateLimitSettings::from_config(&config.rate_limit),
        store.clone(),
        clock.clone(),
    );
    let logins = LoginAttemptTracker::from_config(&config.login, store.clone(), clock);
    let policies = PolicySet::from_config(config, resolver.clone())?;

    let credentials = StaticCredentials::from_config(&config.users);
    if credentials.is_empty() {
        tracing::warn!("No users configured, every login will fail");
    }

    tracing::info!(
        store = store.name(),
        users = credentials.len(),
        token_ttl_secs = config.tokens.ttl_secs,
        rate_limit = config.rate_limit.enabled,
        "Gateway components initialized"
    );

    Ok(AppState {
        tokens: Arc::new(tokens),
        limiter: Arc::new(limiter),
        logins: Arc::new(logins),
        credentials: Arc::new(credentials),
        policies: Arc::new(ArcSwap::from_pointee(policies)),
        resolver,
        store,
        upload_dir: config.storage.upload_dir.clone(),
        started_at: Instant::now(),
    })
}

/// Production wiring: system clock, system resolver, configured store.
pub async fn start(config: &GatewayConfig) -> Result<AppState, StartupError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = connect_store(&config.store, clock.clone()).await;
    build_state(config, store, clock, Arc::new(SystemResolver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[tokio::test]
    async fn test_start_without_redis() {
        let mut config = GatewayConfig::default();
        config.tokens.signing_key = base64::engine::general_purpose::STANDARD.encode([1u8; 32]);
        let state = start(&config).await.unwrap();
        assert_eq!(state.store.name(), "memory");
    }

    #[tokio::test]
    async fn test_unreachable_redis_falls_back() {
        let config = StoreConfig {
            redis_url: Some("redis://127.0.0.1:1".to_string()),
            connect_timeout_ms: 200,
            sweep_interval: 16,
        };
        let store = connect_store(&config, Arc::new(SystemClock)).await;
        assert_eq!(store.name(), "memory");
        store.set("k", "v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_weak_key_is_fatal() {
        let mut config = GatewayConfig::default();
        config.tokens.signing_key = base64::engine::general_purpose::STANDARD.encode([1u8; 8]);
        let store = connect_store(&StoreConfig::default(), Arc::new(SystemClock)).await;
        let result = build_state(&config, store, Arc::new(SystemClock), Arc::new(SystemResolver));
        assert!(matches!(result, Err(StartupError::Token(TokenError::WeakKey { bits: 64 }))));
    }
}
