//! In-memory cache layer implementation.
//!
//! Uses [`DashMap`] with per-entry TTL expiry. Suitable for a single relay
//! process; deployments running several relays behind a load balancer share
//! state through [`RedisCacheLayer`](crate::RedisCacheLayer) instead.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hbarlimit_core::{CacheLayer, Result};
use std::time::{Duration, Instant};

/// A cached value with its expiry instant.
struct CacheEntry {
    data: Vec<u8>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory cache backed by [`DashMap`] with TTL expiry.
///
/// Expired entries are lazily evicted on access and skipped by
/// [`CacheLayer::keys`].
pub struct InMemoryCacheLayer {
    map: DashMap<String, CacheEntry>,
}

impl InMemoryCacheLayer {
    /// Create a new, empty in-memory cache.
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }
}

impl Default for InMemoryCacheLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheLayer for InMemoryCacheLayer {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.map.get(key) {
            if entry.is_live(Instant::now()) {
                return Ok(Some(entry.data.clone()));
            }
            // Drop the read guard before removing to avoid deadlocking the shard
            drop(entry);
            self.map.remove_if(key, |_, e| !e.is_live(Instant::now()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.map.insert(
            key.to_string(),
            CacheEntry {
                data: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let keys = self
            .map
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();
        Ok(keys)
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let fresh = CacheEntry {
            data: value.to_vec(),
            expires_at: now + ttl,
        };
        // The entry guard holds the shard lock across the check and the write
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut entry) if !entry.get().is_live(now) => {
                entry.insert(fresh);
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn invalidate_if_eq(&self, key: &str, value: &[u8]) -> Result<bool> {
        Ok(self.map.remove_if(key, |_, e| e.data == value).is_some())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
