//! Redis-backed shared counter store.

use std::time::Duration;

use config::{RedisConfig, RedisPoolConfig};
use deadpool_redis::{Pool, Runtime};
use redis::{RedisError, Script};

use super::{CounterStore, StorageError, StoreVerdict, now_epoch_ms};

/// Fixed-window admission script.
///
/// Runs atomically on the Redis server, so concurrent admissions for the
/// same key never under-count: the first request of a window creates the
/// counter with the window TTL, later requests increment it only while
/// below the limit. Returns the count, the remaining window in
/// milliseconds and the admission flag.
const FIXED_WINDOW_SCRIPT: &str = r#"
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local current = tonumber(redis.call('GET', KEYS[1]) or '-1')

if current == -1 then
  redis.call('SET', KEYS[1], 1, 'PX', window_ms)
  return {1, window_ms, 1}
end

if current < limit then
  current = redis.call('INCR', KEYS[1])
  return {current, redis.call('PTTL', KEYS[1]), 1}
end

return {current, redis.call('PTTL', KEYS[1]), 0}
"#;

/// Redis-backed counter store implementation.
pub struct RedisStore {
    /// Redis connection pool.
    pool: Pool,
    /// Admission script, cached server-side by its hash.
    script: Script,
    /// Key prefix for all counter keys.
    key_prefix: String,
    /// Response timeout for Redis commands.
    response_timeout: Duration,
}

impl RedisStore {
    /// Create a new Redis store and verify connectivity.
    pub async fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        let mut redis_config = deadpool_redis::Config {
            url: Some(config.url.clone()),
            connection: None,
            ..Default::default()
        };

        if let Some(pool_config) = build_pool_config(&config.pool) {
            redis_config.pool = Some(pool_config);
        }

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StorageError::Connection(format!("Failed to create Redis connection pool: {e}")))?;

        let store = Self {
            pool,
            script: Script::new(FIXED_WINDOW_SCRIPT),
            key_prefix: config
                .key_prefix
                .clone()
                .unwrap_or_else(|| "shopgate:rate_limit:".to_string()),
            response_timeout: config.response_timeout.unwrap_or_else(|| Duration::from_secs(1)),
        };

        store.ping().await?;

        Ok(store)
    }

    /// Liveness probe, also used by the engine's recovery task.
    pub(crate) async fn ping(&self) -> Result<(), StorageError> {
        let probe = async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| StorageError::Connection(format!("Failed to get Redis connection from pool: {e}")))?;

            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| StorageError::Connection(format!("Failed to ping Redis server: {e}")))?;

            Ok(())
        };

        tokio::time::timeout(self.response_timeout, probe)
            .await
            .map_err(|_| StorageError::Timeout(self.response_timeout))?
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn run_script(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
    ) -> Result<StoreVerdict, StorageError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let (count, ttl_ms, allowed): (u64, i64, u8) = self
            .script
            .key(self.storage_key(key))
            .arg(max_requests)
            .arg(window.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e: RedisError| StorageError::Query(e.to_string()))?;

        Ok(StoreVerdict {
            allowed: allowed == 1,
            count,
            reset_at_ms: now_epoch_ms() + ttl_ms.max(0) as u64,
        })
    }

    #[cfg(test)]
    pub(crate) fn unreachable_for_tests() -> Self {
        let redis_config = deadpool_redis::Config {
            url: Some("redis://127.0.0.1:1/0".to_string()),
            connection: None,
            ..Default::default()
        };

        Self {
            pool: redis_config
                .create_pool(Some(Runtime::Tokio1))
                .expect("pool creation does not connect"),
            script: Script::new(FIXED_WINDOW_SCRIPT),
            key_prefix: "test:".to_string(),
            response_timeout: Duration::from_millis(100),
        }
    }
}

impl CounterStore for RedisStore {
    async fn check_and_increment(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
    ) -> Result<StoreVerdict, StorageError> {
        tokio::time::timeout(self.response_timeout, self.run_script(key, max_requests, window))
            .await
            .map_err(|_| StorageError::Timeout(self.response_timeout))?
    }
}

/// Build deadpool configuration from our config.
fn build_pool_config(config: &RedisPoolConfig) -> Option<deadpool_redis::PoolConfig> {
    use deadpool_redis::{PoolConfig, Timeouts};

    let mut pool_config = PoolConfig::default();

    if let Some(max_size) = config.max_size {
        pool_config.max_size = max_size;
    }

    let mut has_timeouts = false;
    let mut timeouts = Timeouts::default();

    if let Some(timeout_create) = config.timeout_create {
        timeouts.create = Some(timeout_create);
        has_timeouts = true;
    }

    if let Some(timeout_wait) = config.timeout_wait {
        timeouts.wait = Some(timeout_wait);
        has_timeouts = true;
    }

    if let Some(timeout_recycle) = config.timeout_recycle {
        timeouts.recycle = Some(timeout_recycle);
        has_timeouts = true;
    }

    if has_timeouts {
        pool_config.timeouts = timeouts;
    }

    Some(pool_config)
}
