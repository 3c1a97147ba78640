//! Redis-backed [`RemoteStore`] over a deadpool connection pool.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use redis::AsyncCommands;

use super::{DisabledStore, RemoteStore, WindowCount};
use crate::config::RedisConfig;
use crate::error::RemoteError;

/// INCR and, on first hit, EXPIRE in one round-trip. A counter that somehow
/// lost its expiry is re-armed so it can never pin a client forever.
const INCR_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('TTL', KEYS[1])
if ttl < 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    window_script: Arc<redis::Script>,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            window_script: Arc::new(redis::Script::new(INCR_WINDOW_SCRIPT)),
        }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, RemoteError> {
        self.pool
            .get()
            .await
            .map_err(|e| RemoteError::unavailable(format!("failed to get Redis connection: {e}")))
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RemoteError::command(format!("PING: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(|e| RemoteError::command(format!("GET {key}: {e}")))
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), RemoteError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl_secs.max(1))
            .await
            .map_err(|e| RemoteError::command(format!("SET {key}: {e}")))
    }

    async fn del(&self, key: &str) -> Result<(), RemoteError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| RemoteError::command(format!("DEL {key}: {e}")))
    }

    async fn incr_window(&self, key: &str, window_secs: u64) -> Result<WindowCount, RemoteError> {
        let mut conn = self.conn().await?;
        let (count, ttl): (i64, i64) = self
            .window_script
            .key(key)
            .arg(window_secs.max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RemoteError::command(format!("INCR window {key}: {e}")))?;

        Ok(WindowCount {
            count: count.max(0) as u64,
            ttl_secs: ttl.max(0) as u64,
        })
    }
}

/// Build the shared store from configuration.
///
/// ## Graceful Degradation
///
/// - **Redis disabled**: returns [`DisabledStore`]
/// - **Pool cannot be created** (bad URL or pool settings): logs and returns
///   [`DisabledStore`]
/// - **Redis unreachable at startup**: logs and still returns the
///   [`RedisStore`]. Connections are made lazily, so each call degrades to
///   a miss until Redis comes back and then recovers on its own.
pub async fn connect_redis(config: &RedisConfig) -> Arc<dyn RemoteStore> {
    if !config.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return Arc::new(DisabledStore);
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let pool_config = redis_config
        .pool
        .get_or_insert_with(|| deadpool_redis::PoolConfig::new(config.pool_size));
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = Some(config.timeout());
    pool_config.timeouts.create = Some(config.timeout());
    pool_config.timeouts.recycle = Some(config.timeout());

    let pool = match redis_config.create_pool(Some(Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to local cache."
            );
            return Arc::new(DisabledStore);
        }
    };

    let store = RedisStore::new(pool);
    match store.ping().await {
        Ok(()) => tracing::info!("Connected to Redis"),
        Err(e) => tracing::warn!(
            error = %e,
            "Redis unreachable at startup. Serving from local cache until it recovers."
        ),
    }
    Arc::new(store)
}
