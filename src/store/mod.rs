//! Shared backing store subsystem.
//!
//! # Data Flow
//! ```text
//! Component (tokens, rate limiter, login attempts)
//!     → Arc<dyn BackingStore>
//!     → fallback.rs (per-operation selection)
//!         → remote.rs (shared Redis store, when configured and reachable)
//!         → memory.rs (in-process map, when remote is absent or a call fails)
//! ```
//!
//! # Design Decisions
//! - The store never interprets values; it is a pure TTL key-value surface
//! - Failover is decided per call, never permanently
//! - Same-key read-modify-write is atomic in every implementation
//! - In-process state is per instance; multi-instance deployments without
//!   a remote store get per-instance limits and revocation lists

pub mod fallback;
pub mod memory;
pub mod remote;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use fallback::FallbackStore;
pub use memory::MemoryStore;
pub use remote::RedisStore;

/// Errors raised by a backing store. Internal only: components convert
/// these into their documented fallback behaviour.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    #[error("key {key} holds a value of the wrong type for {operation}")]
    WrongType { key: String, operation: &'static str },

    #[error("stored value for {key} is not an integer")]
    NotAnInteger { key: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Parameters for one atomic sliding-window acquisition.
#[derive(Debug, Clone)]
pub struct WindowRequest {
    /// Score recorded for this request (epoch millis).
    pub now_millis: u64,
    /// Trailing window length.
    pub window: Duration,
    /// Maximum members allowed inside the window.
    pub limit: u64,
    /// Unique member name for this request.
    pub member: String,
}

impl WindowRequest {
    /// Oldest score that still counts toward the limit.
    pub fn window_start(&self) -> u64 {
        self.now_millis.saturating_sub(self.window.as_millis() as u64)
    }
}

/// Result of a sliding-window acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub allowed: bool,
    /// Members inside the window after this call.
    pub count: u64,
    /// Score of the oldest member still inside the window.
    pub oldest_millis: Option<u64>,
}

/// TTL-capable key-value store with an ordered-set variant.
///
/// Scores are epoch milliseconds; `remove_range_by_score` and
/// `count_in_range` bounds are inclusive.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Short name used in log fields.
    fn name(&self) -> &'static str;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically adds one, creating the key at 1 if absent. Existing TTL is kept.
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// Like [`increment`](Self::increment), and gives the key `ttl` in the
    /// same step whenever it has no expiry yet.
    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn add_scored(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    async fn remove_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError>;

    async fn count_in_range(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError>;

    /// Prune members older than the window, count the rest, and record the
    /// request if the count is below the limit, as one atomic step.
    async fn acquire_in_window(
        &self,
        key: &str,
        request: &WindowRequest,
    ) -> Result<WindowOutcome, StoreError>;
}

/// Convert a TTL to whole milliseconds, never below one.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
