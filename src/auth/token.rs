//! Access token lifecycle: issuance, validation, revocation and per-user
//! invalidation.
//!
//! A token is valid iff its signature verifies, it has not expired, its hash
//! is not on the revocation list, and it was issued no earlier than the
//! subject's invalidation mark. Anything that goes wrong while checking is a
//! rejection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::auth::claims::{AccessClaims, IssuedToken, RevokedTokenEntry, TokenClaims};
use crate::clock::Clock;
use crate::config::TokenConfig;
use crate::observability::metrics;
use crate::store::{BackingStore, MemoryStore, StoreError};

/// Smallest accepted HMAC key.
pub const MIN_SIGNING_KEY_BITS: usize = 256;

/// Per-token lifetime cap when none is configured.
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// `exp` has whole-second precision.
const MIN_TTL: Duration = Duration::from_secs(1);

/// Errors raised while configuring or issuing tokens.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("signing key is {bits} bits, at least 256 required")]
    WeakKey { bits: usize },

    #[error("signing key is not valid base64: {0}")]
    KeyEncoding(#[from] base64::DecodeError),

    #[error("token lifetime must be at least one second")]
    LifetimeTooShort,

    #[error("token lifetime of {requested:?} exceeds the {max:?} maximum")]
    LifetimeTooLong { requested: Duration, max: Duration },

    #[error("failed to sign token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// Why a presented token was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthRejection {
    #[error("missing bearer token")]
    Missing,
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token has expired")]
    Expired,
    #[error("token has been revoked")]
    Revoked,
    #[error("token was issued before the user's sessions were invalidated")]
    InvalidatedForUser,
    #[error("token state could not be verified")]
    StoreUnavailable,
}

impl AuthRejection {
    /// Stable label for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthRejection::Missing => "missing",
            AuthRejection::Malformed => "malformed",
            AuthRejection::BadSignature => "bad_signature",
            AuthRejection::Expired => "expired",
            AuthRejection::Revoked => "revoked",
            AuthRejection::InvalidatedForUser => "invalidated",
            AuthRejection::StoreUnavailable => "store_unavailable",
        }
    }
}

/// Validated token settings.
#[derive(Clone)]
pub struct TokenSettings {
    signing_key: Vec<u8>,
    pub ttl: Duration,
    /// Upper bound for lifetimes passed to [`TokenLifecycle::issue`].
    pub max_ttl: Duration,
    pub issuer: Option<String>,
}

impl TokenSettings {
    pub fn new(signing_key: Vec<u8>, ttl: Duration, issuer: Option<String>) -> Result<Self, TokenError> {
        let bits = signing_key.len() * 8;
        if bits < MIN_SIGNING_KEY_BITS {
            return Err(TokenError::WeakKey { bits });
        }
        if ttl < MIN_TTL {
            return Err(TokenError::LifetimeTooShort);
        }
        Ok(Self {
            signing_key,
            ttl,
            max_ttl: ttl.max(DEFAULT_MAX_TTL),
            issuer,
        })
    }

    /// Replace the lifetime cap. It may not be below the default lifetime.
    pub fn with_max_ttl(mut self, max_ttl: Duration) -> Result<Self, TokenError> {
        if max_ttl < self.ttl {
            return Err(TokenError::LifetimeTooLong {
                requested: self.ttl,
                max: max_ttl,
            });
        }
        self.max_ttl = max_ttl;
        Ok(self)
    }

    /// Decode the base64 key from configuration.
    pub fn from_config(config: &TokenConfig) -> Result<Self, TokenError> {
        let key = STANDARD.decode(config.signing_key.trim())?;
        let issuer = config.issuer.clone().filter(|iss| !iss.is_empty());
        Self::new(key, Duration::from_secs(config.ttl_secs), issuer)?
            .with_max_ttl(Duration::from_secs(config.max_ttl_secs))
    }
}

impl std::fmt::Debug for TokenSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSettings")
            .field("signing_key", &"<redacted>")
            .field("ttl", &self.ttl)
            .field("max_ttl", &self.max_ttl)
            .field("issuer", &self.issuer)
            .finish()
    }
}

/// Hex SHA-256 of a raw token. Raw tokens are never stored.
pub fn token_fingerprint(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn revoked_key(token: &str) -> String {
    format!("revoked:{}", token_fingerprint(token))
}

fn invalidation_key(user_id: &str) -> String {
    format!("invalidated:{}", user_id)
}

pub struct TokenLifecycle {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
    max_ttl: Duration,
    issuer: Option<String>,
    store: Arc<dyn BackingStore>,
    /// Local copy of every revocation and invalidation write.
    mirror: MemoryStore,
    clock: Arc<dyn Clock>,
}

impl TokenLifecycle {
    pub fn new(settings: TokenSettings, store: Arc<dyn BackingStore>, clock: Arc<dyn Clock>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the injected clock with zero leeway.
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.required_spec_claims = HashSet::from(["sub".to_string(), "exp".to_string()]);
        if let Some(iss) = &settings.issuer {
            validation.set_issuer(&[iss]);
        }

        Self {
            encoding: EncodingKey::from_secret(&settings.signing_key),
            decoding: DecodingKey::from_secret(&settings.signing_key),
            validation,
            ttl: settings.ttl,
            max_ttl: settings.max_ttl,
            issuer: settings.issuer,
            store,
            mirror: MemoryStore::new(clock.clone()),
            clock,
        }
    }

    /// Default token lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sign a new token for `subject`. `ttl` overrides the configured
    /// lifetime and must lie between one second and the configured maximum.
    pub fn issue(
        &self,
        subject: &str,
        claims: TokenClaims,
        ttl: Option<Duration>,
    ) -> Result<IssuedToken, TokenError> {
        let ttl = ttl.unwrap_or(self.ttl);
        if ttl < MIN_TTL {
            return Err(TokenError::LifetimeTooShort);
        }
        if ttl > self.max_ttl {
            return Err(TokenError::LifetimeTooLong {
                requested: ttl,
                max: self.max_ttl,
            });
        }
        let now_ms = self.clock.now_millis();
        // Rounded up so the token lives at least `ttl`.
        let exp = (now_ms + ttl.as_millis() as u64).div_ceil(1000);

        let access = AccessClaims {
            sub: subject.to_string(),
            email: claims.email,
            roles: claims.roles,
            iat: now_ms / 1000,
            iat_ms: now_ms,
            exp,
            jti: uuid::Uuid::new_v4().to_string(),
            iss: self.issuer.clone(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &access, &self.encoding)?;

        tracing::debug!(subject, jti = %access.jti, exp, "Issued access token");
        Ok(IssuedToken {
            access_token: token,
            token_type: "Bearer",
            expires_in: ttl.as_secs(),
            expires_at: exp,
        })
    }

    /// Signature check only; expiry and revocation are not consulted.
    fn decode_claims(&self, token: &str) -> Result<AccessClaims, AuthRejection> {
        decode::<AccessClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::InvalidSignature => AuthRejection::BadSignature,
                _ => AuthRejection::Malformed,
            })
    }

    /// Full validation, returning the claims of an acceptable token.
    pub async fn authenticate(&self, token: &str) -> Result<AccessClaims, AuthRejection> {
        let result = self.check(token).await;
        if let Err(rejection) = &result {
            tracing::debug!(reason = rejection.reason(), "Rejected access token");
            metrics::record_auth_rejected(rejection.reason());
        }
        result
    }

    /// True iff the token is currently acceptable. Never fails.
    pub async fn validate(&self, token: &str) -> bool {
        self.authenticate(token).await.is_ok()
    }

    async fn check(&self, token: &str) -> Result<AccessClaims, AuthRejection> {
        let claims = self.decode_claims(token)?;

        if self.clock.now_millis() >= claims.exp.saturating_mul(1000) {
            return Err(AuthRejection::Expired);
        }

        match self.is_revoked(token).await {
            Ok(false) => {}
            Ok(true) => return Err(AuthRejection::Revoked),
            Err(err) => {
                tracing::warn!(error = %err, "Could not read revocation list");
                return Err(AuthRejection::StoreUnavailable);
            }
        }

        match self.invalidation_mark(&claims.sub).await {
            Ok(Some(mark)) if claims.iat_ms < mark => Err(AuthRejection::InvalidatedForUser),
            Ok(_) => Ok(claims),
            Err(err) => {
                tracing::warn!(error = %err, subject = %claims.sub, "Could not read invalidation mark");
                Err(AuthRejection::StoreUnavailable)
            }
        }
    }

    /// Revoked if either the shared store or the local mirror says so.
    async fn is_revoked(&self, token: &str) -> Result<bool, StoreError> {
        let key = revoked_key(token);
        let shared = self.store.exists(&key).await;
        if matches!(shared, Ok(true)) || self.mirror.exists(&key).await.unwrap_or(false) {
            return Ok(true);
        }
        shared
    }

    /// Latest invalidation mark across the shared store and the mirror.
    async fn invalidation_mark(&self, user_id: &str) -> Result<Option<u64>, StoreError> {
        let key = invalidation_key(user_id);
        let shared = self.store.get(&key).await?;
        let local = self.mirror.get(&key).await.unwrap_or(None);

        let mut latest = None;
        for raw in [shared, local].into_iter().flatten() {
            let mark = raw
                .parse::<u64>()
                .map_err(|_| StoreError::NotAnInteger { key: key.clone() })?;
            latest = latest.max(Some(mark));
        }
        Ok(latest)
    }

    /// Put the token on the revocation list until its own expiry.
    ///
    /// Tokens that cannot be decoded are still revoked, for the default
    /// lifetime. Store failures are logged, never surfaced.
    pub async fn revoke(&self, token: &str, owner_user_id: Option<&str>) {
        let now_ms = self.clock.now_millis();
        let (ttl, subject, expires_at) = match self.decode_claims(token) {
            Ok(claims) => {
                let remaining = claims.exp.saturating_mul(1000).saturating_sub(now_ms);
                let ttl = Duration::from_millis(remaining).max(Duration::from_secs(1));
                (ttl, Some(claims.sub), claims.exp)
            }
            Err(rejection) => {
                tracing::debug!(
                    reason = rejection.reason(),
                    "Revoking undecodable token with default lifetime"
                );
                (self.ttl, None, (now_ms + self.ttl.as_millis() as u64).div_ceil(1000))
            }
        };

        let entry = RevokedTokenEntry {
            owner_user_id: owner_user_id.map(str::to_string).or(subject),
            expires_at,
        };
        let value = match serde_json::to_string(&entry) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to encode revocation entry");
                String::new()
            }
        };

        let key = revoked_key(token);
        if let Err(err) = self.store.set(&key, &value, ttl).await {
            tracing::warn!(error = %err, "Shared revocation write failed, kept in-process only");
        }
        if let Err(err) = self.mirror.set(&key, &value, ttl).await {
            tracing::warn!(error = %err, "In-process revocation write failed");
        }

        tracing::info!(
            owner = entry.owner_user_id.as_deref().unwrap_or("unknown"),
            ttl_secs = ttl.as_secs(),
            "Token revoked"
        );
    }

    /// Invalidate every token for `user_id` issued before now.
    pub async fn invalidate_all_for_user(&self, user_id: &str) {
        let mark = self.clock.now_millis();
        let key = invalidation_key(user_id);
        // Outlives any earlier token, even one issued at the maximum lifetime.
        let ttl = self.max_ttl + MIN_TTL;
        let value = mark.to_string();

        if let Err(err) = self.store.set(&key, &value, ttl).await {
            tracing::warn!(error = %err, user_id, "Shared invalidation write failed, kept in-process only");
        }
        if let Err(err) = self.mirror.set(&key, &value, ttl).await {
            tracing::warn!(error = %err, user_id, "In-process invalidation write failed");
        }
        tracing::info!(user_id, mark, "Invalidated all tokens for user");
    }
}
