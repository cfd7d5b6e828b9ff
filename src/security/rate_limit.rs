//! Sliding-window rate limiting.
//!
//! Each key owns an ordered set of request timestamps. A check prunes
//! timestamps older than the window, counts the rest, and records the new
//! request only when the count is below the limit. The store performs the
//! three steps atomically, so concurrent requests sharing a key can never be
//! allowed more than `limit` times per window.
//!
//! On any store error the limiter fails open: throttling is not worth an
//! outage.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::error::SecurityError;
use crate::observability::metrics;
use crate::store::{BackingStore, WindowRequest};

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Limits applied by a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub requests_per_window: u64,
    /// Budget for authentication endpoints under the `strict:` namespace.
    pub strict_requests_per_window: u64,
    pub window: Duration,
}

impl RateLimitSettings {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            requests_per_window: config.requests_per_minute,
            strict_requests_per_window: config.strict_requests_per_minute,
            window: Duration::from_secs(config.window_secs),
        }
    }
}

/// Outcome of one limiter check, with the values for the response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// When the oldest counted request leaves the window, epoch seconds.
    pub reset_at: u64,
}

impl RateDecision {
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_at));
    }
}

pub struct RateLimiter {
    store: Arc<dyn BackingStore>,
    clock: Arc<dyn Clock>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings, store: Arc<dyn BackingStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> RateLimitSettings {
        self.settings
    }

    /// Key for general traffic from one client.
    pub fn client_key(client: &str) -> String {
        format!("rate:{}", client)
    }

    /// Key for an authentication endpoint, kept apart from general traffic.
    pub fn strict_key(client: &str, path: &str) -> String {
        format!("strict:{}:{}", client, path)
    }

    /// Check and record one request under `key` with the general limit.
    pub async fn is_allowed(&self, key: &str) -> bool {
        self.check(key).await.allowed
    }

    pub async fn check(&self, key: &str) -> RateDecision {
        self.check_with_limit(key, self.settings.requests_per_window).await
    }

    /// Check and record one request to a strict endpoint.
    pub async fn check_strict(&self, client: &str, path: &str) -> RateDecision {
        let key = Self::strict_key(client, path);
        self.check_with_limit(&key, self.settings.strict_requests_per_window)
            .await
    }

    async fn check_with_limit(&self, key: &str, limit: u64) -> RateDecision {
        let now = self.clock.now_millis();
        let window_ms = self.settings.window.as_millis() as u64;
        let request = WindowRequest {
            now_millis: now,
            window: self.settings.window,
            limit,
            member: format!("{}-{}", now, uuid::Uuid::new_v4().simple()),
        };

        match self.store.acquire_in_window(key, &request).await {
            Ok(outcome) => {
                let oldest = outcome.oldest_millis.unwrap_or(now);
                RateDecision {
                    allowed: outcome.allowed,
                    limit,
                    remaining: limit.saturating_sub(outcome.count),
                    reset_at: (oldest + window_ms).div_ceil(1000),
                }
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "Rate limiter store failed, allowing request");
                metrics::record_rate_limit_fail_open();
                RateDecision {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset_at: (now + window_ms).div_ceil(1000),
                }
            }
        }
    }

    /// Requests left for `key` in the current window, without recording one.
    pub async fn remaining(&self, key: &str) -> u64 {
        let limit = self.settings.requests_per_window;
        let now = self.clock.now_millis();
        let window_start = now.saturating_sub(self.settings.window.as_millis() as u64);

        let counted = async {
            if window_start > 0 {
                self.store
                    .remove_range_by_score(key, f64::MIN, (window_start - 1) as f64)
                    .await?;
            }
            self.store
                .count_in_range(key, window_start as f64, f64::MAX)
                .await
        };

        match counted.await {
            Ok(count) => limit.saturating_sub(count),
            Err(err) => {
                tracing::warn!(key, error = %err, "Rate limiter store failed while counting");
                limit
            }
        }
    }
}

/// Shared state for [`rate_limit_middleware`].
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub enabled: bool,
    pub strict_paths: Arc<Vec<String>>,
    pub trust_forwarded_for: bool,
}

impl RateLimitState {
    pub fn new(limiter: Arc<RateLimiter>, config: &RateLimitConfig) -> Self {
        Self {
            limiter,
            enabled: config.enabled,
            strict_paths: Arc::new(config.strict_paths.clone()),
            trust_forwarded_for: config.trust_forwarded_for,
        }
    }

    fn is_strict(&self, path: &str) -> bool {
        let path = path.trim_end_matches('/');
        self.strict_paths
            .iter()
            .any(|strict| strict.trim_end_matches('/') == path)
    }
}

/// Identify the caller: the socket peer, or the first `X-Forwarded-For`
/// hop when the deployment sits behind a trusted proxy.
pub fn client_id(request: &Request<Body>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Rejects over-limit requests with 429 before any authentication work, and
/// stamps the rate-limit headers on every response.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.enabled {
        return next.run(request).await;
    }

    let client = client_id(&request, state.trust_forwarded_for);
    let path = request.uri().path().to_string();
    let strict = state.is_strict(&path);

    let decision = if strict {
        state.limiter.check_strict(&client, &path).await
    } else {
        state
            .limiter
            .check(&RateLimiter::client_key(&client))
            .await
    };

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        tracing::warn!(client = %client, path = %path, strict, "Rate limit exceeded");
        metrics::record_rate_limited(if strict { "strict" } else { "general" });
        SecurityError::RateLimited {
            retry_after_secs: state.limiter.settings().window.as_secs(),
        }
        .into_response()
    };

    decision.apply_headers(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn limiter(limit: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let settings = RateLimitSettings {
            requests_per_window: limit,
            strict_requests_per_window: 2,
            window: Duration::from_secs(60),
        };
        (RateLimiter::new(settings, store, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_sliding_window_allows_limit_then_denies() {
        let (limiter, clock) = limiter(5);
        for _ in 0..5 {
            assert!(limiter.is_allowed("rate:1.2.3.4").await);
            clock.advance(Duration::from_millis(100));
        }
        assert!(!limiter.is_allowed("rate:1.2.3.4").await);
        assert_eq!(limiter.remaining("rate:1.2.3.4").await, 0);

        clock.advance(Duration::from_secs(60));
        assert!(limiter.is_allowed("rate:1.2.3.4").await);
    }

    #[tokio::test]
    async fn test_window_slides_gradually() {
        let (limiter, clock) = limiter(2);
        assert!(limiter.is_allowed("k").await);
        clock.advance(Duration::from_secs(30));
        assert!(limiter.is_allowed("k").await);
        assert!(!limiter.is_allowed("k").await);

        // The first request leaves the window, the second has not.
        clock.advance(Duration::from_secs(31));
        assert_eq!(limiter.remaining("k").await, 1);
        assert!(limiter.is_allowed("k").await);
        assert!(!limiter.is_allowed("k").await);
    }

    #[tokio::test]
    async fn test_decision_carries_header_values() {
        let (limiter, clock) = limiter(3);
        let first = limiter.check("k").await;
        assert!(first.allowed);
        assert_eq!(first.limit, 3);
        assert_eq!(first.remaining, 2);
        assert_eq!(first.reset_at, clock.now_secs() + 60);

        let mut headers = HeaderMap::new();
        first.apply_headers(&mut headers);
        assert_eq!(headers[X_RATELIMIT_REMAINING], "2");
    }

    #[tokio::test]
    async fn test_strict_namespace_has_its_own_budget() {
        let (limiter, _) = limiter(100);
        assert!(limiter.check_strict("1.2.3.4", "/api/auth/login").await.allowed);
        assert!(limiter.check_strict("1.2.3.4", "/api/auth/login").await.allowed);
        assert!(!limiter.check_strict("1.2.3.4", "/api/auth/login").await.allowed);

        // General traffic is unaffected.
        assert!(limiter.is_allowed(&RateLimiter::client_key("1.2.3.4")).await);
        assert_eq!(
            RateLimiter::strict_key("1.2.3.4", "/api/auth/login"),
            "strict:1.2.3.4:/api/auth/login"
        );
    }

    #[test]
    fn test_client_id_prefers_trusted_forwarded_for() {
        let request = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_id(&request, true), "203.0.113.7");
        assert_eq!(client_id(&request, false), "unknown");
    }
}
