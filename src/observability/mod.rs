//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (security counters)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through all log lines via the HTTP trace span
//! - Metrics are cheap (atomic increments) and no-ops until a recorder is installed
//! - Raw tokens, passwords and signing keys are never logged

pub mod logging;
pub mod metrics;
