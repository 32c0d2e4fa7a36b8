//! Identity → spending plan links persisted through a [`CacheLayer`].
//!
//! One repository instance serves one [`IdentityDimension`]; the dimension
//! is part of every key so address and origin links never collide.

use async_trait::async_trait;
use hbarlimit_core::{
    CacheLayer, HbarLimitError, IdentityDimension, IdentityLink, IdentityLinkRepository, Result,
    SpendingPlanId,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// [`IdentityLinkRepository`] over any [`CacheLayer`].
pub struct CacheIdentityLinkRepository {
    dimension: IdentityDimension,
    cache: Arc<dyn CacheLayer>,
    ttl: Duration,
}

impl CacheIdentityLinkRepository {
    /// Create a repository for `dimension` whose links expire after `ttl`.
    pub fn new(dimension: IdentityDimension, cache: Arc<dyn CacheLayer>, ttl: Duration) -> Self {
        Self {
            dimension,
            cache,
            ttl,
        }
    }

    /// Shorthand for the eth address dimension.
    pub fn eth_address(cache: Arc<dyn CacheLayer>, ttl: Duration) -> Self {
        Self::new(IdentityDimension::EthAddress, cache, ttl)
    }

    /// Shorthand for the IP address dimension.
    pub fn ip_address(cache: Arc<dyn CacheLayer>, ttl: Duration) -> Self {
        Self::new(IdentityDimension::IpAddress, cache, ttl)
    }

    /// `hbar_limit:link:{dimension}:`
    fn prefix(&self) -> String {
        format!("hbar_limit:link:{}:", self.dimension.key_segment())
    }

    fn key(&self, identity: &str) -> String {
        format!("{}{identity}", self.prefix())
    }
}

#[async_trait]
impl IdentityLinkRepository for CacheIdentityLinkRepository {
    fn dimension(&self) -> IdentityDimension {
        self.dimension
    }

    async fn find_by_address(&self, identity: &str) -> Result<IdentityLink> {
        match self.cache.get(&self.key(identity)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(HbarLimitError::IdentityLinkNotFound {
                dimension: self.dimension,
                identity: identity.to_string(),
            }),
        }
    }

    async fn save(&self, identity: &str, plan_id: SpendingPlanId) -> Result<()> {
        if identity.is_empty() {
            return Err(HbarLimitError::InvalidArguments(format!(
                "cannot link an empty {} to a spending plan",
                self.dimension
            )));
        }
        let link = IdentityLink {
            identity: identity.to_string(),
            plan_id,
        };
        let bytes = serde_json::to_vec(&link)?;
        self.cache.set(&self.key(identity), &bytes, self.ttl).await?;
        debug!(dimension = %self.dimension, %plan_id, "Linked identity to spending plan");
        Ok(())
    }

    async fn delete(&self, identity: &str) -> Result<()> {
        self.cache.invalidate(&self.key(identity)).await
    }

    async fn delete_all(&self) -> Result<()> {
        let keys = self.cache.keys(&self.prefix()).await?;
        let count = keys.len();
        for key in keys {
            self.cache.invalidate(&key).await?;
        }
        debug!(dimension = %self.dimension, count, "Deleted all identity links");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryCacheLayer;

    const TTL: Duration = Duration::from_secs(3_600);

    fn repos() -> (CacheIdentityLinkRepository, CacheIdentityLinkRepository) {
        let cache: Arc<dyn CacheLayer> = Arc::new(InMemoryCacheLayer::new());
        (
            CacheIdentityLinkRepository::eth_address(cache.clone(), TTL),
            CacheIdentityLinkRepository::ip_address(cache, TTL),
        )
    }

    #[tokio::test]
    async fn test_save_and_find() {
        let (eth, _) = repos();
        let plan_id = SpendingPlanId::new();
        eth.save("0xabc", plan_id).await.unwrap();

        let link = eth.find_by_address("0xabc").await.unwrap();
        assert_eq!(link.identity, "0xabc");
        assert_eq!(link.plan_id, plan_id);
    }

    #[tokio::test]
    async fn test_find_missing_link() {
        let (eth, _) = repos();
        let err = eth.find_by_address("0xnone").await.unwrap_err();
        assert!(matches!(
            err,
            HbarLimitError::IdentityLinkNotFound { dimension: IdentityDimension::EthAddress, ref identity }
                if identity == "0xnone"
        ));
    }

    #[tokio::test]
    async fn test_identities_are_case_sensitive() {
        let (eth, _) = repos();
        eth.save("0xAbC", SpendingPlanId::new()).await.unwrap();
        assert!(eth.find_by_address("0xabc").await.is_err());
    }

    #[tokio::test]
    async fn test_save_replaces_existing_link() {
        let (eth, _) = repos();
        let first = SpendingPlanId::new();
        let second = SpendingPlanId::new();
        eth.save("0xabc", first).await.unwrap();
        eth.save("0xabc", second).await.unwrap();
        assert_eq!(eth.find_by_address("0xabc").await.unwrap().plan_id, second);
    }

    #[tokio::test]
    async fn test_save_rejects_empty_identity() {
        let (_, ip) = repos();
        let err = ip.save("", SpendingPlanId::new()).await.unwrap_err();
        assert!(matches!(err, HbarLimitError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn test_dimensions_are_independent() {
        let (eth, ip) = repos();
        let plan_id = SpendingPlanId::new();
        eth.save("shared", plan_id).await.unwrap();

        assert!(ip.find_by_address("shared").await.is_err());
        assert_eq!(eth.dimension(), IdentityDimension::EthAddress);
        assert_eq!(ip.dimension(), IdentityDimension::IpAddress);
    }

    #[tokio::test]
    async fn test_delete_and_delete_all() {
        let (eth, ip) = repos();
        let plan_id = SpendingPlanId::new();
        ip.save("10.0.0.1", plan_id).await.unwrap();
        ip.save("10.0.0.2", plan_id).await.unwrap();
        eth.save("0xabc", plan_id).await.unwrap();

        ip.delete("10.0.0.1").await.unwrap();
        assert!(ip.find_by_address("10.0.0.1").await.is_err());
        assert!(ip.find_by_address("10.0.0.2").await.is_ok());

        ip.delete_all().await.unwrap();
        assert!(ip.find_by_address("10.0.0.2").await.is_err());
        // Other dimension untouched
        assert!(eth.find_by_address("0xabc").await.is_ok());
    }
}
