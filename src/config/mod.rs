//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + PIM_GATEWAY_* environment overrides
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → lifecycle::startup builds every component from it
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → http::server swaps the outbound URL and upload policies
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs, except the
//!   signing key, which has none
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AdminConfig, FetchConfig, GatewayConfig, ListenerConfig, LogFormat, LoginConfig,
    ObservabilityConfig, RateLimitConfig, StorageConfig, StoreConfig, TimeoutConfig, TokenConfig,
    UserConfig,
};
