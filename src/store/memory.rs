//! In-process backing store.
//!
//! A `DashMap` of typed slots with optional expiry. There is no server-side
//! expiry here, so every read checks the slot it touches and drops it when
//! stale, and every `sweep_interval` operations a full sweep removes all
//! expired slots.
//!
//! Read-modify-write operations run while holding the shard entry lock, so
//! concurrent callers on one key never lose updates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::clock::{Clock, SystemClock};
use crate::store::{ttl_millis, BackingStore, StoreError, WindowOutcome, WindowRequest};

const DEFAULT_SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug)]
enum SlotValue {
    /// Placeholder created by an entry lookup; reads treat it as absent.
    Empty,
    Text(String),
    Counter(i64),
    /// Members ordered by ascending score.
    Scored(Vec<(f64, String)>),
}

#[derive(Debug)]
struct Slot {
    value: SlotValue,
    expires_at: Option<u64>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            value: SlotValue::Empty,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    fn is_live(&self, now: u64) -> bool {
        !self.is_expired(now) && !matches!(self.value, SlotValue::Empty)
    }
}

/// Thread-safe in-process store used when no remote store is reachable.
#[derive(Clone)]
pub struct MemoryStore {
    slots: Arc<DashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
    operations: Arc<AtomicU64>,
    sweep_interval: u64,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            clock,
            operations: Arc::new(AtomicU64::new(0)),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Run a full sweep every `interval` operations instead of the default.
    pub fn with_sweep_interval(mut self, interval: u64) -> Self {
        self.sweep_interval = interval.max(1);
        self
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.slots.iter().filter(|slot| slot.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired slot now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.slots.len())
    }

    /// Must be called before taking any map reference.
    fn tick(&self) -> u64 {
        let now = self.clock.now_millis();
        let count = self.operations.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.sweep_interval == 0 {
            let removed = self.purge_expired();
            if removed > 0 {
                tracing::trace!(removed, "Swept expired in-memory entries");
            }
        }
        now
    }

    /// Read a live slot, dropping it if it has expired.
    fn read<R>(&self, key: &str, now: u64, f: impl FnOnce(&SlotValue) -> R) -> Option<R> {
        let stale = match self.slots.get(key) {
            Some(slot) if slot.is_live(now) => return Some(f(&slot.value)),
            Some(slot) => slot.is_expired(now),
            None => false,
        };
        if stale {
            self.slots.remove_if(key, |_, slot| slot.is_expired(now));
        }
        None
    }

    /// Entry for a write, reset to empty when the previous value expired.
    fn fresh_entry(
        &self,
        key: &str,
        now: u64,
    ) -> dashmap::mapref::one::RefMut<'_, String, Slot> {
        let mut entry = self.slots.entry(key.to_owned()).or_insert_with(Slot::empty);
        if entry.is_expired(now) {
            *entry = Slot::empty();
        }
        entry
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("slots", &self.slots.len())
            .finish()
    }
}

fn in_range(score: f64, min: f64, max: f64) -> bool {
    score >= min && score <= max
}

#[async_trait]
impl BackingStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = self.tick();
        self.slots.insert(
            key.to_owned(),
            Slot {
                value: SlotValue::Text(value.to_owned()),
                expires_at: Some(now + ttl_millis(ttl)),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.tick();
        self.read(key, now, |value| match value {
            SlotValue::Text(text) => Ok(Some(text.clone())),
            SlotValue::Counter(n) => Ok(Some(n.to_string())),
            SlotValue::Empty => Ok(None),
            SlotValue::Scored(_) => Err(StoreError::WrongType {
                key: key.to_owned(),
                operation: "get",
            }),
        })
        .unwrap_or(Ok(None))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.tick();
        Ok(self.read(key, now, |_| true).unwrap_or(false))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.tick();
        self.slots.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.tick();
        let mut entry = self.fresh_entry(key, now);
        let next = match &entry.value {
            SlotValue::Empty => 1,
            SlotValue::Counter(n) => n + 1,
            SlotValue::Text(text) => {
                text.parse::<i64>()
                    .map_err(|_| StoreError::NotAnInteger { key: key.to_owned() })?
                    + 1
            }
            SlotValue::Scored(_) => {
                return Err(StoreError::WrongType {
                    key: key.to_owned(),
                    operation: "increment",
                })
            }
        };
        entry.value = SlotValue::Counter(next);
        Ok(next)
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let now = self.tick();
        let mut entry = self.fresh_entry(key, now);
        let next = match &entry.value {
            SlotValue::Empty => 1,
            SlotValue::Counter(n) => n + 1,
            SlotValue::Text(text) => {
                text.parse::<i64>()
                    .map_err(|_| StoreError::NotAnInteger { key: key.to_owned() })?
                    + 1
            }
            SlotValue::Scored(_) => {
                return Err(StoreError::WrongType {
                    key: key.to_owned(),
                    operation: "increment_with_ttl",
                })
            }
        };
        entry.value = SlotValue::Counter(next);
        if entry.expires_at.is_none() {
            entry.expires_at = Some(now + ttl_millis(ttl));
        }
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = self.tick();
        if let Some(mut slot) = self.slots.get_mut(key) {
            if slot.is_live(now) {
                slot.expires_at = Some(now + ttl_millis(ttl));
            }
        }
        Ok(())
    }

    async fn add_scored(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let now = self.tick();
        let mut entry = self.fresh_entry(key, now);
        if matches!(entry.value, SlotValue::Empty) {
            entry.value = SlotValue::Scored(Vec::new());
        }
        match &mut entry.value {
            SlotValue::Scored(members) => {
                members.retain(|(_, existing)| existing != member);
                let at = members.partition_point(|(s, _)| *s <= score);
                members.insert(at, (score, member.to_owned()));
                Ok(())
            }
            _ => Err(StoreError::WrongType {
                key: key.to_owned(),
                operation: "add_scored",
            }),
        }
    }

    async fn remove_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let now = self.tick();
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Ok(0);
        };
        if !slot.is_live(now) {
            return Ok(0);
        }
        match &mut slot.value {
            SlotValue::Scored(members) => {
                let before = members.len();
                members.retain(|(score, _)| !in_range(*score, min, max));
                Ok((before - members.len()) as u64)
            }
            _ => Err(StoreError::WrongType {
                key: key.to_owned(),
                operation: "remove_range_by_score",
            }),
        }
    }

    async fn count_in_range(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let now = self.tick();
        self.read(key, now, |value| match value {
            SlotValue::Scored(members) => Ok(members
                .iter()
                .filter(|(score, _)| in_range(*score, min, max))
                .count() as u64),
            _ => Err(StoreError::WrongType {
                key: key.to_owned(),
                operation: "count_in_range",
            }),
        })
        .unwrap_or(Ok(0))
    }

    async fn acquire_in_window(
        &self,
        key: &str,
        request: &WindowRequest,
    ) -> Result<WindowOutcome, StoreError> {
        let now = self.tick();
        let mut entry = self.fresh_entry(key, now);
        if matches!(entry.value, SlotValue::Empty) {
            entry.value = SlotValue::Scored(Vec::new());
        }
        let window_start = request.window_start() as f64;
        let outcome = match &mut entry.value {
            SlotValue::Scored(members) => {
                members.retain(|(score, _)| *score >= window_start);
                let allowed = (members.len() as u64) < request.limit;
                if allowed {
                    let score = request.now_millis as f64;
                    let at = members.partition_point(|(s, _)| *s <= score);
                    members.insert(at, (score, request.member.clone()));
                }
                WindowOutcome {
                    allowed,
                    count: members.len() as u64,
                    oldest_millis: members.first().map(|(score, _)| *score as u64),
                }
            }
            _ => {
                return Err(StoreError::WrongType {
                    key: key.to_owned(),
                    operation: "acquire_in_window",
                })
            }
        };
        entry.expires_at = Some(now + ttl_millis(request.window));
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (MemoryStore::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_set_get_and_expiry() {
        let (store, clock) = store_with_clock();
        store.set("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.exists("k").await.unwrap());

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_increment_keeps_ttl_and_resets_after_expiry() {
        let (store, clock) = store_with_clock();
        assert_eq!(store.increment("n").await.unwrap(), 1);
        store.expire("n", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.increment("n").await.unwrap(), 2);

        clock.advance(Duration::from_secs(4));
        assert_eq!(store.increment("n").await.unwrap(), 3);

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.increment("n").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_increment_on_text_value() {
        let (store, _) = store_with_clock();
        store.set("n", "41", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.increment("n").await.unwrap(), 42);

        store.set("s", "abc", Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            store.increment("s").await,
            Err(StoreError::NotAnInteger { .. })
        ));
    }

    #[tokio::test]
    async fn test_scored_set_operations() {
        let (store, _) = store_with_clock();
        for (member, score) in [("a", 10.0), ("b", 20.0), ("c", 30.0)] {
            store.add_scored("z", member, score).await.unwrap();
        }
        assert_eq!(store.count_in_range("z", 0.0, 25.0).await.unwrap(), 2);
        assert_eq!(store.remove_range_by_score("z", 0.0, 15.0).await.unwrap(), 1);
        assert_eq!(store.count_in_range("z", f64::MIN, f64::MAX).await.unwrap(), 2);

        // Re-adding a member moves it instead of duplicating it.
        store.add_scored("z", "b", 40.0).await.unwrap();
        assert_eq!(store.count_in_range("z", f64::MIN, f64::MAX).await.unwrap(), 2);
        assert_eq!(store.count_in_range("z", 35.0, 45.0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wrong_type_is_reported() {
        let (store, _) = store_with_clock();
        store.set("t", "text", Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            store.add_scored("t", "m", 1.0).await,
            Err(StoreError::WrongType { .. })
        ));
    }

    #[tokio::test]
    async fn test_acquire_in_window_limits_and_slides() {
        let (store, clock) = store_with_clock();
        let request = |now: u64, n: u32| WindowRequest {
            now_millis: now,
            window: Duration::from_secs(60),
            limit: 2,
            member: format!("m{}", n),
        };

        let now = clock.now_millis();
        assert!(store.acquire_in_window("w", &request(now, 1)).await.unwrap().allowed);
        assert!(store.acquire_in_window("w", &request(now, 2)).await.unwrap().allowed);
        let denied = store.acquire_in_window("w", &request(now, 3)).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 2);
        assert_eq!(denied.oldest_millis, Some(now));

        clock.advance(Duration::from_secs(61));
        let now = clock.now_millis();
        let outcome = store.acquire_in_window("w", &request(now, 4)).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.count, 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_slots() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock.clone()).with_sweep_interval(1);
        store.set("a", "1", Duration::from_secs(1)).await.unwrap();
        store.set("b", "2", Duration::from_secs(100)).await.unwrap();

        clock.advance(Duration::from_secs(2));
        // Any operation triggers the sweep.
        store.exists("b").await.unwrap();
        assert_eq!(store.slots.len(), 1);
    }

    #[tokio::test]
    async fn test_increment_with_ttl_sets_expiry_once() {
        let (store, clock) = store_with_clock();
        let ttl = Duration::from_secs(10);
        assert_eq!(store.increment_with_ttl("n", ttl).await.unwrap(), 1);
        clock.advance(Duration::from_secs(6));
        assert_eq!(store.increment_with_ttl("n", ttl).await.unwrap(), 2);

        // The first call's expiry stands.
        clock.advance(Duration::from_secs(4));
        assert_eq!(store.get("n").await.unwrap(), None);

        // A counter left without expiry gets one on the next call.
        assert_eq!(store.increment("m").await.unwrap(), 1);
        assert_eq!(store.increment_with_ttl("m", ttl).await.unwrap(), 2);
        clock.advance(ttl);
        assert!(!store.exists("m").await.unwrap());
    }
}
