//! Redis-backed store shared by every gateway instance.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::store::{ttl_millis, BackingStore, StoreError, WindowOutcome, WindowRequest};

/// Prune, count and conditionally record in one server-side step.
///
/// KEYS[1] window key
/// ARGV[1] window start (inclusive), ARGV[2] score, ARGV[3] limit,
/// ARGV[4] member, ARGV[5] key ttl in millis
const ACQUIRE_WINDOW_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
local allowed = 0
if count < tonumber(ARGV[3]) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[4])
  count = count + 1
  allowed = 1
end
redis.call('PEXPIRE', KEYS[1], ARGV[5])
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local oldest_score = -1
if oldest[2] then
  oldest_score = tonumber(oldest[2])
end
return {allowed, count, oldest_score}
"#;

/// Increment and give the key a TTL when it has none.
///
/// KEYS[1] counter key
/// ARGV[1] ttl in millis
const INCREMENT_WITH_TTL_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Backing store delegating to a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    acquire_script: Script,
    increment_script: Script,
}

impl RedisStore {
    /// Connect to `url`, giving up after `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let manager = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                StoreError::Unavailable(format!("timed out connecting after {:?}", timeout))
            })??;

        tracing::info!(url = %redact(url), "Connected to Redis backing store");
        Ok(Self::from_manager(manager))
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self {
            manager,
            acquire_script: Script::new(ACQUIRE_WINDOW_SCRIPT),
            increment_script: Script::new(INCREMENT_WITH_TTL_SCRIPT),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

/// Strip credentials from a connection URL before logging it.
fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparsable>".to_string(),
    }
}

/// Redis score bound formatting; infinities use Redis' own spelling.
fn bound(value: f64) -> String {
    if value == f64::INFINITY || value >= f64::MAX {
        "+inf".to_string()
    } else if value == f64::NEG_INFINITY || value <= f64::MIN {
        "-inf".to_string()
    } else {
        value.to_string()
    }
}

#[async_trait]
impl BackingStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        Ok(conn.exists(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        Ok(conn.incr(key, 1i64).await?)
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        Ok(self
            .increment_script
            .key(key)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn add_scored(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn remove_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        Ok(conn.zrembyscore(key, bound(min), bound(max)).await?)
    }

    async fn count_in_range(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        Ok(conn.zcount(key, bound(min), bound(max)).await?)
    }

    async fn acquire_in_window(
        &self,
        key: &str,
        request: &WindowRequest,
    ) -> Result<WindowOutcome, StoreError> {
        let mut conn = self.conn();
        let (allowed, count, oldest): (i64, i64, i64) = self
            .acquire_script
            .key(key)
            .arg(request.window_start())
            .arg(request.now_millis)
            .arg(request.limit)
            .arg(&request.member)
            .arg(ttl_millis(request.window))
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowOutcome {
            allowed: allowed == 1,
            count: count.max(0) as u64,
            oldest_millis: (oldest >= 0).then_some(oldest as u64),
        })
    }
}
