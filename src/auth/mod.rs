//! Authentication subsystem.
//!
//! # Data Flow
//! ```text
//! POST /api/auth/login
//!     → credentials.rs (verify username and password)
//!     → security::lockout (count failures, lock the identifier)
//!     → token.rs (issue a signed access token)
//!
//! Protected request:
//!     → middleware.rs (extract the bearer token)
//!     → token.rs (signature, expiry, revocation list, user invalidation)
//!     → handler receives AuthenticatedUser
//! ```
//!
//! # Design Decisions
//! - Fail closed: a token is rejected when its state cannot be checked
//! - Revocations and invalidations are mirrored in-process, so they hold
//!   even while the shared store is unreachable
//! - Only SHA-256 fingerprints of tokens are ever stored

pub mod claims;
pub mod credentials;
pub mod middleware;
pub mod token;

pub use claims::{AccessClaims, IssuedToken, TokenClaims};
pub use credentials::{CredentialVerifier, Principal, StaticCredentials};
pub use middleware::{require_bearer, AuthenticatedUser};
pub use token::{AuthRejection, TokenError, TokenLifecycle, TokenSettings};
