//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::security::ssrf::SsrfPolicy;
use crate::security::upload::UploadPolicy;

/// Root configuration for the security gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Shared backing store.
    pub store: StoreConfig,

    /// Access token settings.
    pub tokens: TokenConfig,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Failed login lockout.
    pub login: LoginConfig,

    /// Outbound URL policy.
    pub ssrf: SsrfPolicy,

    /// Outbound fetch limits.
    pub fetch: FetchConfig,

    /// Upload validation policy.
    pub upload: UploadPolicy,

    /// Where accepted files are written.
    pub storage: StorageConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,

    /// Accounts accepted by the bundled credential verifier.
    pub users: Vec<UserConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Backing store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis URL. Without one, all state is kept in-process.
    pub redis_url: Option<String>,

    /// Time allowed for the initial Redis connection, in milliseconds.
    pub connect_timeout_ms: u64,

    /// Full expiry sweep of the in-process store every N operations.
    pub sweep_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            connect_timeout_ms: 2000,
            sweep_interval: 1024,
        }
    }
}

/// Access token configuration.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Base64 HMAC key, at least 32 bytes once decoded. Usually supplied
    /// through `PIM_GATEWAY_SIGNING_KEY` rather than the file.
    pub signing_key: String,

    /// Token lifetime in seconds.
    pub ttl_secs: u64,

    /// Longest lifetime a caller may request for a single token.
    pub max_ttl_secs: u64,

    /// Optional `iss` claim, required on validation when set.
    pub issuer: Option<String>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            signing_key: String::new(),
            ttl_secs: 3600,
            max_ttl_secs: 24 * 60 * 60,
            issuer: None,
        }
    }
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("signing_key", &"<redacted>")
            .field("ttl_secs", &self.ttl_secs)
            .field("max_ttl_secs", &self.max_ttl_secs)
            .field("issuer", &self.issuer)
            .finish()
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Requests per window per client for general traffic.
    pub requests_per_minute: u64,

    /// Requests per window per client for each strict path.
    pub strict_requests_per_minute: u64,

    /// Window length in seconds.
    pub window_secs: u64,

    /// Paths counted under the strict budget instead of the general one.
    pub strict_paths: Vec<String>,

    /// Take the client address from `X-Forwarded-For`. Only safe behind a
    /// proxy that overwrites the header.
    pub trust_forwarded_for: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 100,
            strict_requests_per_minute: 10,
            window_secs: 60,
            strict_paths: vec![
                "/api/auth/login".to_string(),
                "/api/auth/register".to_string(),
                "/api/auth/refresh".to_string(),
            ],
            trust_forwarded_for: false,
        }
    }
}

/// Failed login lockout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoginConfig {
    /// Failures allowed before the identifier is locked.
    pub max_attempts: u32,

    /// Lockout length, also the failure counting window.
    pub lockout_minutes: u64,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout_minutes: 15,
        }
    }
}

/// Outbound fetch configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-hop timeout in seconds.
    pub timeout_secs: u64,

    /// Largest response body accepted.
    pub max_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Upload storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("./uploads"),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Mount the `/admin` routes.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
        }
    }
}

/// One account for the bundled credential verifier.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserConfig {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Argon2id PHC string, as printed by `gatewayctl hash-password`.
    pub password_hash: String,
}
