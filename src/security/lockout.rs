//! Failed-login counting and temporary lockout.
//!
//! Failures for an identifier are counted under `login:attempts:{id}`, which
//! expires one lockout duration after the first failure. Reaching the
//! maximum writes `login:lockout:{id}` holding the lock's end time in epoch
//! milliseconds, so the remaining time survives restarts of any one
//! instance. A successful login clears both keys.
//!
//! Store errors fail closed: an identifier whose state cannot be read is
//! treated as locked.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::LoginConfig;
use crate::observability::metrics;
use crate::store::BackingStore;

pub struct LoginAttemptTracker {
    store: Arc<dyn BackingStore>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    lockout: Duration,
}

impl LoginAttemptTracker {
    pub fn new(
        max_attempts: u32,
        lockout: Duration,
        store: Arc<dyn BackingStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            clock,
            max_attempts: max_attempts.max(1),
            lockout,
        }
    }

    pub fn from_config(config: &LoginConfig, store: Arc<dyn BackingStore>, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_secs(config.lockout_minutes * 60),
            store,
            clock,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn attempts_key(identifier: &str) -> String {
        format!("login:attempts:{}", identifier)
    }

    fn lockout_key(identifier: &str) -> String {
        format!("login:lockout:{}", identifier)
    }

    /// Count one failed attempt. Returns the attempts left before lockout;
    /// zero means the identifier is now locked.
    pub async fn record_failure(&self, identifier: &str) -> u32 {
        let attempts_key = Self::attempts_key(identifier);
        let count = match self.store.increment_with_ttl(&attempts_key, self.lockout).await {
            Ok(count) => count.max(0) as u64,
            Err(err) => {
                tracing::error!(identifier, error = %err, "Failed to record login failure");
                return 0;
            }
        };

        if count < u64::from(self.max_attempts) {
            return self.max_attempts - count as u32;
        }

        let locked_until = self.clock.now_millis() + self.lockout.as_millis() as u64;
        let lockout_key = Self::lockout_key(identifier);
        if let Err(err) = self
            .store
            .set(&lockout_key, &locked_until.to_string(), self.lockout)
            .await
        {
            tracing::error!(identifier, error = %err, "Failed to write login lockout");
        }

        tracing::warn!(
            identifier,
            attempts = count,
            lockout_secs = self.lockout.as_secs(),
            "Identifier locked after repeated login failures"
        );
        metrics::record_lockout();
        0
    }

    /// Clear the counter and any lockout.
    pub async fn record_success(&self, identifier: &str) {
        for key in [Self::attempts_key(identifier), Self::lockout_key(identifier)] {
            if let Err(err) = self.store.delete(&key).await {
                tracing::warn!(identifier, key = %key, error = %err, "Failed to clear login state");
            }
        }
    }

    pub async fn is_locked(&self, identifier: &str) -> bool {
        !self.time_remaining(identifier).await.is_zero()
    }

    /// Time until the lockout ends, zero when not locked.
    pub async fn time_remaining(&self, identifier: &str) -> Duration {
        match self.store.get(&Self::lockout_key(identifier)).await {
            Ok(None) => Duration::ZERO,
            Ok(Some(raw)) => match raw.parse::<u64>() {
                Ok(locked_until) => {
                    Duration::from_millis(locked_until.saturating_sub(self.clock.now_millis()))
                }
                Err(_) => {
                    tracing::warn!(identifier, value = %raw, "Unreadable lockout marker, treating as locked");
                    self.lockout
                }
            },
            Err(err) => {
                tracing::error!(identifier, error = %err, "Failed to read login lockout, treating as locked");
                self.lockout
            }
        }
    }

    /// Whole seconds until the lockout ends, rounded up.
    pub async fn seconds_remaining(&self, identifier: &str) -> u64 {
        let remaining = self.time_remaining(identifier).await;
        (remaining.as_millis() as u64).div_ceil(1000)
    }

    /// Failures counted in the current attempt window.
    pub async fn failed_attempts(&self, identifier: &str) -> u32 {
        match self.store.get(&Self::attempts_key(identifier)).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(0),
            Ok(None) => 0,
            Err(err) => {
                tracing::warn!(identifier, error = %err, "Failed to read login attempts");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, StoreError, WindowOutcome, WindowRequest};

    fn tracker() -> (LoginAttemptTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let tracker = LoginAttemptTracker::new(5, Duration::from_secs(15 * 60), store, clock.clone());
        (tracker, clock)
    }

    #[tokio::test]
    async fn test_fifth_failure_locks() {
        let (tracker, _) = tracker();
        for expected in [4, 3, 2, 1] {
            assert_eq!(tracker.record_failure("alice").await, expected);
            assert!(!tracker.is_locked("alice").await);
        }
        assert_eq!(tracker.record_failure("alice").await, 0);
        assert!(tracker.is_locked("alice").await);
        assert_eq!(tracker.seconds_remaining("alice").await, 15 * 60);

        // Other identifiers are independent.
        assert!(!tracker.is_locked("bob").await);
    }

    #[tokio::test]
    async fn test_lockout_expires() {
        let (tracker, clock) = tracker();
        for _ in 0..5 {
            tracker.record_failure("alice").await;
        }
        clock.advance(Duration::from_secs(10 * 60));
        assert_eq!(tracker.seconds_remaining("alice").await, 5 * 60);

        clock.advance(Duration::from_secs(5 * 60));
        assert!(!tracker.is_locked("alice").await);
        assert_eq!(tracker.time_remaining("alice").await, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_success_clears_state() {
        let (tracker, _) = tracker();
        tracker.record_failure("alice").await;
        tracker.record_failure("alice").await;
        assert_eq!(tracker.failed_attempts("alice").await, 2);

        tracker.record_success("alice").await;
        assert_eq!(tracker.failed_attempts("alice").await, 0);
        assert_eq!(tracker.record_failure("alice").await, 4);
    }

    #[tokio::test]
    async fn test_attempt_counter_expires_after_window() {
        let (tracker, clock) = tracker();
        tracker.record_failure("alice").await;
        tracker.record_failure("alice").await;
        clock.advance(Duration::from_secs(15 * 60));
        assert_eq!(tracker.failed_attempts("alice").await, 0);
        assert_eq!(tracker.record_failure("alice").await, 4);
    }

    /// Delegates to a memory store but refuses standalone expiry updates.
    struct NoExpireStore(MemoryStore);

    #[async_trait::async_trait]
    impl BackingStore for NoExpireStore {
        fn name(&self) -> &'static str {
            "no-expire"
        }
        async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
            self.0.set(key, value, ttl).await
        }
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.0.get(key).await
        }
        async fn exists(&self, key: &str) -> Result<bool, StoreError> {
            self.0.exists(key).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key).await
        }
        async fn increment(&self, key: &str) -> Result<i64, StoreError> {
            self.0.increment(key).await
        }
        async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
            self.0.increment_with_ttl(key, ttl).await
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("PEXPIRE timed out".into()))
        }
        async fn add_scored(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
            self.0.add_scored(key, member, score).await
        }
        async fn remove_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
            self.0.remove_range_by_score(key, min, max).await
        }
        async fn count_in_range(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
            self.0.count_in_range(key, min, max).await
        }
        async fn acquire_in_window(
            &self,
            key: &str,
            request: &WindowRequest,
        ) -> Result<WindowOutcome, StoreError> {
            self.0.acquire_in_window(key, request).await
        }
    }

    #[tokio::test]
    async fn test_counter_expires_without_separate_expire_call() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(NoExpireStore(MemoryStore::new(clock.clone())));
        let tracker = LoginAttemptTracker::new(5, Duration::from_secs(15 * 60), store, clock.clone());

        assert_eq!(tracker.record_failure("alice").await, 4);
        assert_eq!(tracker.record_failure("alice").await, 3);
        clock.advance(Duration::from_secs(15 * 60));
        assert_eq!(tracker.failed_attempts("alice").await, 0);
        assert_eq!(tracker.record_failure("alice").await, 4);
    }
}
