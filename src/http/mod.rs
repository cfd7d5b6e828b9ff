//! HTTP surface of the gateway.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, trace span, timeout, body limit)
//!     → security::rate_limit (per-client sliding window, 429 before any auth work)
//!     → auth::middleware (bearer token on protected routes)
//!     → handlers.rs (login, logout, media import and upload)
//!     → response.rs (errors become JSON bodies)
//! ```

pub mod handlers;
pub mod response;
pub mod server;

pub use server::{AppState, GatewayServer, PolicySet};
