//! Redis-backed cache layer implementation.
//!
//! Uses [`redis::aio::ConnectionManager`] for automatic reconnection so that
//! several relay instances can share spending plans and identity links.
//! Conditional writes (`SET NX`, compare-and-delete) run server-side so
//! leases taken by one relay are respected by the others.
//!
//! Gated behind the `redis_backend` Cargo feature.

use async_trait::async_trait;
use hbarlimit_core::{CacheLayer, HbarLimitError, Result};
use redis::AsyncCommands;
use std::time::Duration;

/// Redis-backed cache layer with automatic reconnection.
///
/// Uses `SET EX` for writes, `GET` for reads, `DEL` for invalidation,
/// `KEYS` for prefix listing and `PING` for health checks. Leases use
/// `SET NX PX` and a Lua compare-and-delete.
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> hbarlimit_core::Result<()> {
/// use hbarlimit_core::CacheLayer;
/// let cache = hbarlimit_storage::RedisCacheLayer::new("redis://127.0.0.1:6379").await?;
/// cache.health_check().await?;
/// # Ok(())
/// # }
/// ```
pub struct RedisCacheLayer {
    conn: redis::aio::ConnectionManager,
}

impl RedisCacheLayer {
    /// Connect to a Redis instance.
    ///
    /// The `url` should be a valid Redis connection string,
    /// e.g. `redis://127.0.0.1:6379` or `redis://:password@host:port/db`.
    pub async fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| HbarLimitError::Storage(format!("Invalid Redis URL: {e}")))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| HbarLimitError::Storage(format!("Failed to connect to Redis: {e}")))?;
        Ok(Self { conn })
    }
}

/// Delete `KEYS[1]` only while it holds `ARGV[1]`.
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Escape glob metacharacters so identities are matched literally.
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

#[async_trait]
impl CacheLayer for RedisCacheLayer {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let result: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| HbarLimitError::Storage(format!("Redis GET failed: {e}")))?;
        Ok(result)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, seconds)
            .await
            .map_err(|e| HbarLimitError::Storage(format!("Redis SET EX failed: {e}")))?;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| HbarLimitError::Storage(format!("Redis DEL failed: {e}")))?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn
            .keys(escape_glob(prefix))
            .await
            .map_err(|e| HbarLimitError::Storage(format!("Redis KEYS failed: {e}")))?;
        Ok(keys)
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await
            .map_err(|e| HbarLimitError::Storage(format!("Redis SET NX failed: {e}")))?;
        Ok(reply.is_some())
    }

    async fn invalidate_if_eq(&self, key: &str, value: &[u8]) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                HbarLimitError::Storage(format!("Redis compare-and-delete failed: {e}"))
            })?;
        Ok(removed == 1)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| HbarLimitError::Storage(format!("Redis PING failed: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
