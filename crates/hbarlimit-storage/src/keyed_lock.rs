//! Per-key async mutual exclusion.
//!
//! Read-modify-write cycles against the cache are not atomic on their own;
//! repositories take the lock for a record's key for the duration of the
//! cycle so concurrent updates to the same record are applied one at a time.
//!
//! [`KeyedLocks`] is process-local. [`LeaseLocks`] layers a lease in the
//! shared [`CacheLayer`] on top, so relays sharing one backing store also
//! exclude each other. A lease expires on its own if its holder dies.

use dashmap::DashMap;
use hbarlimit_core::{CacheLayer, HbarLimitError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;
use uuid::Uuid;

/// Prefix of every lease key in the cache.
pub const LEASE_KEY_PREFIX: &str = "hbar_limit:lock:";

/// How long a lease survives a holder that never releases it.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);

/// How long [`LeaseLocks::lock`] waits for a lease held elsewhere.
pub const DEFAULT_LEASE_WAIT: Duration = Duration::from_secs(10);

const MIN_BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// A set of async mutexes addressed by string key, created on demand and
/// dropped once no task holds or waits on them.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    /// Create an empty lock set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = Arc::clone(&lock).lock_owned().await;
        KeyedGuard {
            owner: self,
            key: key.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// `true` when no key is held or awaited.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one key; released on drop.
pub struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Two references left means only the map and this guard know the lock
        let lock = &self.lock;
        self.owner
            .locks
            .remove_if(&self.key, |_, held| {
                Arc::ptr_eq(held, lock) && Arc::strong_count(held) <= 2
            });
    }
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

/// Per-key locks held both in this process and as a lease in the cache.
///
/// Waiters in the same process queue on a [`KeyedLocks`] mutex first, so
/// only one task per process polls the cache for a given key.
pub struct LeaseLocks {
    local: KeyedLocks,
    cache: Arc<dyn CacheLayer>,
    lease_ttl: Duration,
    wait: Duration,
}

impl LeaseLocks {
    /// Lease locks with [`DEFAULT_LEASE_TTL`] and [`DEFAULT_LEASE_WAIT`].
    pub fn new(cache: Arc<dyn CacheLayer>) -> Self {
        Self::with_timeouts(cache, DEFAULT_LEASE_TTL, DEFAULT_LEASE_WAIT)
    }

    /// Lease locks with explicit lease expiry and wait limit.
    pub fn with_timeouts(
        cache: Arc<dyn CacheLayer>,
        lease_ttl: Duration,
        wait: Duration,
    ) -> Self {
        Self {
            local: KeyedLocks::new(),
            cache,
            lease_ttl,
            wait,
        }
    }

    /// Wait for exclusive access to `key` across every process sharing the
    /// cache.
    ///
    /// Release the guard with [`LeaseGuard::release`]. A guard dropped
    /// without it frees the lease from a background task.
    ///
    /// # Errors
    ///
    /// Fails with [`HbarLimitError::Storage`] when the cache is unreachable
    /// or the lease is still held elsewhere after the wait limit.
    pub async fn lock(&self, key: &str) -> Result<LeaseGuard<'_>> {
        let local = self.local.lock(key).await;
        let lease_key = format!("{LEASE_KEY_PREFIX}{key}");
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.wait;
        let mut backoff = MIN_BACKOFF;

        loop {
            if self
                .cache
                .set_if_absent(&lease_key, token.as_bytes(), self.lease_ttl)
                .await?
            {
                return Ok(LeaseGuard {
                    cache: Arc::clone(&self.cache),
                    lease_key,
                    token,
                    released: false,
                    _local: local,
                });
            }
            if Instant::now() >= deadline {
                return Err(HbarLimitError::Storage(format!(
                    "Timed out waiting for lease on {key}"
                )));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

/// A held lease plus the local lock for the same key.
pub struct LeaseGuard<'a> {
    cache: Arc<dyn CacheLayer>,
    lease_key: String,
    token: String,
    released: bool,
    _local: KeyedGuard<'a>,
}

impl LeaseGuard<'_> {
    /// Give the lease back. Only this holder's lease is removed: one that
    /// expired and was taken by another process stays in place.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self
            .cache
            .invalidate_if_eq(&self.lease_key, self.token.as_bytes())
            .await
        {
            warn!(key = %self.lease_key, "Failed to release lease: {e}");
        }
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Cancelled before release; the lease TTL covers a missing runtime
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let cache = Arc::clone(&self.cache);
            let key = std::mem::take(&mut self.lease_key);
            let token = std::mem::take(&mut self.token);
            handle.spawn(async move {
                if let Err(e) = cache.invalidate_if_eq(&key, token.as_bytes()).await {
                    warn!(%key, "Failed to release lease: {e}");
                }
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
