//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (lifetimes > 0, limits > 0, addresses parse)
//! - Reject placeholder secrets when the admin API is enabled
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use argon2::password_hash::PasswordHash;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

use crate::auth::credentials::PASSWORD_ALGORITHM;
use crate::auth::token::MIN_SIGNING_KEY_BITS;
use crate::config::schema::GatewayConfig;

/// A single semantic problem in a config file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be positive"));
    }

    match STANDARD.decode(config.tokens.signing_key.trim()) {
        Ok(key) if key.len() * 8 >= MIN_SIGNING_KEY_BITS => {}
        Ok(key) => errors.push(ValidationError::new(
            "tokens.signing_key",
            format!(
                "decodes to {} bits, at least {} required",
                key.len() * 8,
                MIN_SIGNING_KEY_BITS
            ),
        )),
        Err(_) => errors.push(ValidationError::new("tokens.signing_key", "must be base64")),
    }
    if config.tokens.ttl_secs == 0 {
        errors.push(ValidationError::new("tokens.ttl_secs", "must be positive"));
    }
    if config.tokens.max_ttl_secs < config.tokens.ttl_secs {
        errors.push(ValidationError::new(
            "tokens.max_ttl_secs",
            format!("must be at least ttl_secs ({})", config.tokens.ttl_secs),
        ));
    }

    let rate = &config.rate_limit;
    if rate.window_secs == 0 {
        errors.push(ValidationError::new("rate_limit.window_secs", "must be positive"));
    }
    if rate.enabled && (rate.requests_per_minute == 0 || rate.strict_requests_per_minute == 0) {
        errors.push(ValidationError::new(
            "rate_limit",
            "request limits must be positive when rate limiting is enabled",
        ));
    }

    if config.login.max_attempts == 0 {
        errors.push(ValidationError::new("login.max_attempts", "must be positive"));
    }
    if config.login.lockout_minutes == 0 {
        errors.push(ValidationError::new("login.lockout_minutes", "must be positive"));
    }

    if config.ssrf.allowed_schemes.is_empty() {
        errors.push(ValidationError::new("ssrf.allowed_schemes", "must not be empty"));
    }
    for pattern in &config.ssrf.private_address_patterns {
        if let Err(err) = regex::Regex::new(pattern) {
            errors.push(ValidationError::new(
                "ssrf.private_address_patterns",
                format!("'{}' is not a valid regex: {}", pattern, err),
            ));
        }
    }
    if config.fetch.timeout_secs == 0 {
        errors.push(ValidationError::new("fetch.timeout_secs", "must be positive"));
    }

    if config.upload.max_size_bytes == 0 {
        errors.push(ValidationError::new("upload.max_size_bytes", "must be positive"));
    }
    for (field, signatures) in [
        ("upload.signatures", &config.upload.signatures),
        ("upload.executable_signatures", &config.upload.executable_signatures),
    ] {
        for signature in signatures.iter().filter(|sig| sig.bytes.is_empty()) {
            errors.push(ValidationError::new(
                field,
                format!("signature for '{}' has no bytes and would match anything", signature.mime),
            ));
        }
    }
    let mapped: HashSet<String> = config
        .upload
        .extension_types
        .keys()
        .map(|ext| ext.trim().to_ascii_lowercase())
        .collect();
    for extension in &config.upload.allowed_extensions {
        if !mapped.contains(&extension.trim().to_ascii_lowercase()) {
            errors.push(ValidationError::new(
                "upload.extension_types",
                format!("allowed extension '{}' has no declared types", extension),
            ));
        }
    }

    if config.admin.enabled
        && (config.admin.api_key.len() < 16 || config.admin.api_key == "CHANGE_ME_IN_PRODUCTION")
    {
        errors.push(ValidationError::new(
            "admin.api_key",
            "must be changed from the placeholder and be at least 16 characters",
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    let mut usernames = HashSet::new();
    for user in &config.users {
        if !usernames.insert(user.username.trim().to_lowercase()) {
            errors.push(ValidationError::new(
                "users",
                format!("duplicate username '{}'", user.username),
            ));
        }
        match PasswordHash::new(user.password_hash.trim()) {
            Ok(hash) if hash.algorithm.as_str() == PASSWORD_ALGORITHM => {}
            Ok(hash) => errors.push(ValidationError::new(
                "users.password_hash",
                format!("'{}' uses {}, expected {}", user.username, hash.algorithm, PASSWORD_ALGORITHM),
            )),
            Err(_) => errors.push(ValidationError::new(
                "users.password_hash",
                format!("'{}' must be an argon2id PHC string", user.username),
            )),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
