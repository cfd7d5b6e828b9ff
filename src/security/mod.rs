//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (sliding window per client, strict budget for login)
//!     → [bearer authentication in auth::middleware]
//!     → lockout.rs (login attempts only)
//!
//! Media import:
//!     → ssrf.rs (validate URL, resolve, reject non-public addresses)
//!     → fetch.rs (pinned connection, every redirect revalidated)
//!     → upload.rs (type, signature and content checks)
//!     → paths.rs (contained write under the upload directory)
//! ```
//!
//! # Design Decisions
//! - Defense in depth: multiple layers of protection
//! - Rate limiting fails open, everything else fails closed
//! - No trust in client input

pub mod fetch;
pub mod lockout;
pub mod paths;
pub mod rate_limit;
pub mod ssrf;
pub mod upload;
