//! Behaviour of each component when the shared store stops answering.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, http::Request};
use reqwest::header::AUTHORIZATION;
use tower::ServiceExt;

use common::{start_gateway_with_store, test_config, FailingStore, PASSWORD, USERNAME};
use pim_security_gateway::auth::{AuthRejection, TokenClaims, TokenLifecycle, TokenSettings};
use pim_security_gateway::clock::{Clock, ManualClock, SystemClock};
use pim_security_gateway::lifecycle::startup;
use pim_security_gateway::security::lockout::LoginAttemptTracker;
use pim_security_gateway::security::rate_limit::{RateLimitSettings, RateLimiter};
use pim_security_gateway::security::ssrf::StaticResolver;
use pim_security_gateway::store::{BackingStore, FallbackStore, MemoryStore};
use pim_security_gateway::GatewayServer;

fn claims() -> TokenClaims {
    TokenClaims {
        email: None,
        roles: vec!["viewer".to_string()],
    }
}

fn tokens_over(store: Arc<dyn BackingStore>) -> TokenLifecycle {
    let settings = TokenSettings::new(vec![7u8; 32], Duration::from_secs(300), None).unwrap();
    TokenLifecycle::new(settings, store, Arc::new(SystemClock))
}

#[tokio::test]
async fn test_rate_limiter_fails_open() {
    let store = Arc::new(FailingStore::default());
    let settings = RateLimitSettings {
        requests_per_window: 1,
        strict_requests_per_window: 1,
        window: Duration::from_secs(60),
    };
    let limiter = RateLimiter::new(settings, store.clone(), Arc::new(SystemClock));

    for _ in 0..5 {
        assert!(limiter.is_allowed("rate:10.0.0.1").await);
        let strict = limiter.check_strict("10.0.0.1", "/api/auth/login").await;
        assert!(strict.allowed);
        assert_eq!(strict.remaining, 1);
    }
    assert!(store.calls.load(Ordering::SeqCst) >= 10);
}

#[tokio::test]
async fn test_lockout_fails_closed() {
    let store = Arc::new(FailingStore::default());
    let tracker = LoginAttemptTracker::new(
        5,
        Duration::from_secs(900),
        store,
        Arc::new(SystemClock),
    );

    assert!(tracker.is_locked("alice").await);
    assert_eq!(tracker.seconds_remaining("alice").await, 900);
    assert_eq!(tracker.record_failure("alice").await, 0);
}

#[tokio::test]
async fn test_token_checks_fail_closed_without_store() {
    let tokens = tokens_over(Arc::new(FailingStore::default()));
    let issued = tokens.issue("u-1", claims(), None).unwrap();

    assert_eq!(
        tokens.authenticate(&issued.access_token).await,
        Err(AuthRejection::StoreUnavailable)
    );
    assert!(!tokens.validate(&issued.access_token).await);
}

#[tokio::test]
async fn test_revocation_survives_remote_outage() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
    let remote = Arc::new(FailingStore::default());
    let store = Arc::new(FallbackStore::new(
        Some(remote.clone()),
        MemoryStore::new(clock.clone()),
    ));
    assert_eq!(store.name(), "failing");

    let tokens = tokens_over(store);
    let issued = tokens.issue("u-1", claims(), None).unwrap();
    assert!(tokens.validate(&issued.access_token).await);

    tokens.revoke(&issued.access_token, None).await;
    assert_eq!(
        tokens.authenticate(&issued.access_token).await,
        Err(AuthRejection::Revoked)
    );
    assert!(remote.calls.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn test_gateway_serves_logins_with_failing_remote() {
    let dir = tempfile::tempdir().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(FallbackStore::new(
        Some(Arc::new(FailingStore::default())),
        MemoryStore::new(clock),
    ));
    let gateway = start_gateway_with_store(test_config(dir.path()), StaticResolver::new(), store).await;

    let token = gateway.token().await;
    let me = gateway
        .client
        .get(gateway.url("/api/auth/me"))
        .header(AUTHORIZATION, format!("Bearer {}", token))
        .send()
        .await
        .unwrap();
    assert_eq!(me.status(), 200);

    let wrong = gateway.login(USERNAME, "wrong").await;
    assert_eq!(wrong.status(), 401);
    let right = gateway.login(USERNAME, PASSWORD).await;
    assert_eq!(right.status(), 200);
}

#[tokio::test]
async fn test_raw_failing_store_locks_every_login() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let state = startup::build_state(
        &config,
        Arc::new(FailingStore::default()),
        Arc::new(SystemClock),
        Arc::new(StaticResolver::new()),
    )
    .unwrap();
    let router = GatewayServer::new(config, state).router();

    let request = Request::post("/api/auth/login")
        .header("content-type", "application/json")
        .body(Body::from(format!(
            r#"{{"username":"{}","password":"{}"}}"#,
            USERNAME, PASSWORD
        )))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), 429);
    assert!(response.headers().contains_key("retry-after"));

    // Rate limiting still let the request through; health is unaffected.
    let health = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
}
