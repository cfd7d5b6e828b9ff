//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → connect store (or fall back to in-process)
//!     → build token, limiter, lockout and policy components → AppState
//!
//! Shutdown (shutdown.rs):
//!     Signal received → broadcast → server stops accepting and drains
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Fail fast: a bad signing key or policy is fatal at startup
//! - An unreachable Redis is not fatal; the gateway runs on in-process state
//! - Listeners start last (traffic only when ready)

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
