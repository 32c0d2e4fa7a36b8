//! Storage layer for hbarlimit
//!
//! Spending plans and identity links are persisted through a [`CacheLayer`]:
//! an in-process [`InMemoryCacheLayer`] for a single relay, or a shared
//! [`RedisCacheLayer`] (feature `redis_backend`) when several relays must
//! see the same spending plans. Plan updates and lazy plan creation are
//! serialized through [`LeaseLocks`], whose leases live in the same cache,
//! so relays sharing it never lose each other's spend. Each relay keeps its
//! own operator budget. [`StorageProfile`] wires the repositories up from
//! configuration.

use hbarlimit_core::{
    CacheLayer, HbarLimitError, IdentityLinkRepository, Result, SpendingPlanRepository,
    StorageConfig,
};
use std::sync::Arc;
use std::time::Duration;

pub mod cache;
pub mod identity_link;
pub mod keyed_lock;
pub mod spending_plan;

#[cfg(feature = "redis_backend")]
pub mod redis_cache;

pub use cache::InMemoryCacheLayer;
pub use identity_link::CacheIdentityLinkRepository;
pub use keyed_lock::{KeyedLocks, LeaseGuard, LeaseLocks};
pub use spending_plan::CacheSpendingPlanRepository;

#[cfg(feature = "redis_backend")]
pub use redis_cache::RedisCacheLayer;

/// The repositories the admission controller needs, sharing one cache.
#[derive(Clone)]
pub struct BudgetStorage {
    /// Spending plans with their daily counters and history.
    pub plans: Arc<dyn SpendingPlanRepository>,
    /// Eth address → plan links.
    pub eth_address_links: Arc<dyn IdentityLinkRepository>,
    /// IP address → plan links.
    pub ip_address_links: Arc<dyn IdentityLinkRepository>,
    /// Backing cache, shared with callers that take [`LeaseLocks`] on it.
    pub cache: Arc<dyn CacheLayer>,
}

impl BudgetStorage {
    /// Build the repositories on top of an existing cache.
    pub fn from_cache(
        cache: Arc<dyn CacheLayer>,
        reset_interval: Duration,
        config: &StorageConfig,
    ) -> Self {
        Self {
            plans: Arc::new(CacheSpendingPlanRepository::new(
                Arc::clone(&cache),
                reset_interval,
                config.plan_ttl(),
            )),
            eth_address_links: Arc::new(CacheIdentityLinkRepository::eth_address(
                Arc::clone(&cache),
                config.identity_link_ttl(),
            )),
            ip_address_links: Arc::new(CacheIdentityLinkRepository::ip_address(
                Arc::clone(&cache),
                config.identity_link_ttl(),
            )),
            cache,
        }
    }
}

/// Which cache the repositories persist through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProfile {
    /// In-process `DashMap` cache. State is lost on restart.
    Memory,
    /// Shared Redis cache at the given URL.
    Redis {
        /// Redis connection string.
        url: String,
    },
}

impl StorageProfile {
    /// Derive the profile from configuration.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.profile.as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => {
                let url = config.redis_url.clone().ok_or_else(|| {
                    HbarLimitError::Config("redis profile requires storage.redis_url".to_string())
                })?;
                Ok(Self::Redis { url })
            }
            other => Err(HbarLimitError::Config(format!(
                "unknown storage profile: {other}"
            ))),
        }
    }

    /// Build the repositories with default record expiry.
    pub async fn build(&self) -> Result<BudgetStorage> {
        self.build_with(
            Duration::from_secs(86_400),
            &StorageConfig::default(),
        )
        .await
    }

    /// Build the repositories.
    ///
    /// `reset_interval` is the budget period plans count `spent_today` over.
    pub async fn build_with(
        &self,
        reset_interval: Duration,
        config: &StorageConfig,
    ) -> Result<BudgetStorage> {
        let cache: Arc<dyn CacheLayer> = match self {
            Self::Memory => Arc::new(InMemoryCacheLayer::new()),
            #[cfg(feature = "redis_backend")]
            Self::Redis { url } => Arc::new(RedisCacheLayer::new(url).await?),
            #[cfg(not(feature = "redis_backend"))]
            Self::Redis { .. } => {
                return Err(HbarLimitError::Config(
                    "redis profile requires the redis_backend feature".to_string(),
                ))
            }
        };
        Ok(BudgetStorage::from_cache(cache, reset_interval, config))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
