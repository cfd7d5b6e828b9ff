//! Per-operation selection between the remote store and the local map.
//!
//! Every call first tries the remote store. When no remote is configured, or
//! the call fails, a warning is logged and that single operation is served
//! from the in-process [`MemoryStore`]. The next call tries the remote again,
//! so a partial outage heals itself at the cost of possible divergence
//! between the two stores.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::observability::metrics;
use crate::store::{BackingStore, MemoryStore, StoreError, WindowOutcome, WindowRequest};

pub struct FallbackStore {
    remote: Option<Arc<dyn BackingStore>>,
    local: MemoryStore,
}

impl FallbackStore {
    pub fn new(remote: Option<Arc<dyn BackingStore>>, local: MemoryStore) -> Self {
        Self { remote, local }
    }

    /// Local-only store.
    pub fn local_only(local: MemoryStore) -> Self {
        Self::new(None, local)
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn local(&self) -> &MemoryStore {
        &self.local
    }

    fn note_fallback(&self, operation: &'static str, key: &str, remote: &str, err: &StoreError) {
        tracing::warn!(
            operation,
            key,
            remote,
            error = %err,
            "Remote backing store call failed, serving from in-process store"
        );
        metrics::record_store_fallback(operation);
    }
}

/// Try the remote store, falling back to the local map on error.
macro_rules! with_fallback {
    ($self:ident, $op:literal, $key:expr, |$store:ident| $call:expr) => {{
        if let Some($store) = $self.remote.as_deref() {
            match $call.await {
                Ok(value) => return Ok(value),
                Err(err) => $self.note_fallback($op, $key, $store.name(), &err),
            }
        }
        let $store: &dyn BackingStore = &$self.local;
        $call.await
    }};
}

#[async_trait]
impl BackingStore for FallbackStore {
    fn name(&self) -> &'static str {
        match &self.remote {
            Some(remote) => remote.name(),
            None => self.local.name(),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        with_fallback!(self, "set", key, |store| store.set(key, value, ttl))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        with_fallback!(self, "get", key, |store| store.get(key))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        with_fallback!(self, "exists", key, |store| store.exists(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        with_fallback!(self, "delete", key, |store| store.delete(key))
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        with_fallback!(self, "increment", key, |store| store.increment(key))
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        with_fallback!(self, "increment_with_ttl", key, |store| store.increment_with_ttl(key, ttl))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        with_fallback!(self, "expire", key, |store| store.expire(key, ttl))
    }

    async fn add_scored(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        with_fallback!(self, "add_scored", key, |store| store.add_scored(key, member, score))
    }

    async fn remove_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        with_fallback!(self, "remove_range_by_score", key, |store| store
            .remove_range_by_score(key, min, max))
    }

    async fn count_in_range(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        with_fallback!(self, "count_in_range", key, |store| store.count_in_range(key, min, max))
    }

    async fn acquire_in_window(
        &self,
        key: &str,
        request: &WindowRequest,
    ) -> Result<WindowOutcome, StoreError> {
        with_fallback!(self, "acquire_in_window", key, |store| store
            .acquire_in_window(key, request))
    }
}
