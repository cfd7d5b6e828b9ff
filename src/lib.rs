//! PIM request security gateway.
//!
//! Guards a product information management service: sliding-window rate
//! limiting, signed access tokens with revocation and per-user
//! invalidation, failed-login lockout, SSRF-safe fetching of remote media,
//! and upload validation. Shared state lives in Redis when reachable and
//! in-process otherwise.

pub mod admin;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod security;
pub mod store;

pub use config::GatewayConfig;
pub use error::SecurityError;
pub use http::GatewayServer;
pub use lifecycle::Shutdown;
