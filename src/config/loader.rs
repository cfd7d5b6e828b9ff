//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::GatewayConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Overrides `tokens.signing_key`, so the key can stay out of the file.
pub const SIGNING_KEY_ENV: &str = "PIM_GATEWAY_SIGNING_KEY";
/// Overrides `store.redis_url`.
pub const REDIS_URL_ENV: &str = "PIM_GATEWAY_REDIS_URL";
/// Overrides `admin.api_key`.
pub const ADMIN_KEY_ENV: &str = "PIM_GATEWAY_ADMIN_KEY";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_config_str(&content)
}

/// Parse, apply environment overrides, and validate.
pub fn load_config_str(content: &str) -> Result<GatewayConfig, ConfigError> {
    let mut config: GatewayConfig = toml::from_str(content)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Defaults plus environment overrides, for running without a file.
pub fn default_config() -> Result<GatewayConfig, ConfigError> {
    load_config_str("")
}

fn apply_env_overrides(config: &mut GatewayConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(key) = lookup(SIGNING_KEY_ENV).filter(|v| !v.is_empty()) {
        config.tokens.signing_key = key;
    }
    if let Some(url) = lookup(REDIS_URL_ENV).filter(|v| !v.is_empty()) {
        config.store.redis_url = Some(url);
    }
    if let Some(key) = lookup(ADMIN_KEY_ENV).filter(|v| !v.is_empty()) {
        config.admin.api_key = key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[listener]
bind_address = "127.0.0.1:9000"

[tokens]
signing_key = "{KEY}"
ttl_secs = 600

[rate_limit]
requests_per_minute = 20

[ssrf]
blocked_ports = [6379]

[[users]]
id = "u-1"
username = "editor"
password_hash = "{hash}"
"#,
            hash = "$argon2id$v=19$m=1024,t=1,p=1$c2FsdHNhbHQ$ZmFrZWhhc2hmYWtlaGFzaA"
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:9000");
        assert_eq!(config.tokens.ttl_secs, 600);
        assert_eq!(config.rate_limit.requests_per_minute, 20);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.ssrf.blocked_ports, vec![6379]);
        assert_eq!(config.ssrf.max_redirects, 5);
        assert_eq!(config.users.len(), 1);
    }

    #[test]
    fn test_validation_errors_surface() {
        let err = load_config_str("[tokens]\nsigning_key = \"c2hvcnQ=\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("tokens.signing_key"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/gateway.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GatewayConfig::default();
        apply_env_overrides(&mut config, |name| match name {
            SIGNING_KEY_ENV => Some(KEY.to_string()),
            REDIS_URL_ENV => Some("redis://cache:6379".to_string()),
            _ => None,
        });
        assert_eq!(config.tokens.signing_key, KEY);
        assert_eq!(config.store.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.admin.api_key, "CHANGE_ME_IN_PRODUCTION");
    }
}
