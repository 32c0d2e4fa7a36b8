//! Admission control for fee-paying relay operations.
//!
//! [`HbarLimitService`] decides, before an operation is dispatched, whether
//! the operator budget and the caller's spending plan can absorb it, and
//! charges the actual cost afterwards.
//!
//! Callers are resolved to a spending plan through their eth address first
//! and their IP address second. The first request from an unknown caller
//! lazily creates a BASIC plan linked to the preferred identity.

use hbarlimit_core::{
    non_empty, ExecutionMode, FeeSchedule, HbarLimitError, IdentityLinkRepository,
    LimiterConfig, RequestDetails, Result, SpendingPlan, SubscriptionTier, TierLimits,
};
use hbarlimit_storage::{BudgetStorage, LeaseLocks, StorageProfile};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::fee::{estimate_file_transactions_fee, FileTransactionsFeeEstimate};
use crate::ledger::BudgetLedger;
use crate::metrics::Metrics;

/// The budget admission controller.
///
/// Cheap to share behind an [`Arc`]; every method takes `&self`.
pub struct HbarLimitService {
    tier_limits: TierLimits,
    file_chunk_size: u64,
    fee_schedule: FeeSchedule,
    storage: BudgetStorage,
    ledger: Arc<BudgetLedger>,
    metrics: Metrics,
    /// Serializes lazy plan creation per identity, across every relay
    /// sharing the storage cache.
    creation_locks: LeaseLocks,
}

impl HbarLimitService {
    /// Assemble a service from existing parts.
    ///
    /// Returns `None` when `config.enabled` is false, in which case the
    /// dispatcher skips admission control entirely.
    pub fn new(
        config: &LimiterConfig,
        storage: BudgetStorage,
        ledger: Arc<BudgetLedger>,
        metrics: Metrics,
    ) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(Self {
            tier_limits: config.budget.tier_limits.clone(),
            file_chunk_size: config.budget.file_chunk_size,
            fee_schedule: config.fee_schedule.clone(),
            creation_locks: LeaseLocks::new(Arc::clone(&storage.cache)),
            storage,
            ledger,
            metrics,
        })
    }

    /// Validate `config`, build the storage it names and a fresh ledger.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or when the backing store cannot be
    /// reached.
    pub async fn from_config(config: &LimiterConfig, metrics: Metrics) -> Result<Option<Self>> {
        if !config.enabled {
            info!("HBAR limiter disabled");
            return Ok(None);
        }
        config.validate()?;

        let profile = StorageProfile::from_config(&config.storage)?;
        let storage = profile
            .build_with(config.budget.reset_interval(), &config.storage)
            .await?;
        let ledger = Arc::new(BudgetLedger::new(
            config.budget.total_budget_tinybars,
            config.budget.reset_interval(),
            metrics.clone(),
        ));
        info!(
            total_budget = config.budget.total_budget_tinybars,
            storage = %config.storage.profile,
            "HBAR limiter enabled"
        );
        Ok(Self::new(config, storage, ledger, metrics))
    }

    /// The operator budget ledger.
    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    /// The metrics this service updates.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Default chunk size for file transactions.
    pub fn file_chunk_size(&self) -> u64 {
        self.file_chunk_size
    }

    /// Daily limit for `tier`.
    pub fn daily_limit(&self, tier: SubscriptionTier) -> i64 {
        self.tier_limits.limit_for(tier)
    }

    // -- admission ---------------------------------------------------------

    /// Decide whether an operation must be rejected before execution.
    ///
    /// The operator budget is checked first; when it is exhausted the
    /// rejection is counted and no plan lookup is made. Otherwise the
    /// caller's plan is resolved (or created) and the call is limited iff
    /// `spent_today + estimated_fee` reaches the tier's daily limit.
    ///
    /// # Errors
    ///
    /// Propagates backing-store failures and [`HbarLimitError::PlanNotActive`].
    pub async fn should_limit(
        &self,
        mode: ExecutionMode,
        method_name: &str,
        eth_address: Option<&str>,
        request_details: &RequestDetails,
        estimated_fee: Option<i64>,
    ) -> Result<bool> {
        if self
            .is_daily_budget_exceeded(mode, method_name, request_details)
            .await
        {
            return Ok(true);
        }

        let eth_address = non_empty(eth_address);
        let ip_address = request_details.ip_address();
        if eth_address.is_none() && ip_address.is_none() {
            warn!(
                request_id = %request_details.request_id,
                connection_id = request_details.connection_id().unwrap_or_default(),
                method = method_name,
                "Cannot resolve a spending plan without an eth address or ip address"
            );
            return Ok(false);
        }

        let (plan, created) = self
            .get_or_create_spending_plan(eth_address, ip_address, request_details)
            .await?;
        if created {
            return Ok(false);
        }

        let limit = self.daily_limit(plan.subscription_tier);
        // A negative estimate never lowers the projected spend
        let estimated_fee = estimated_fee.unwrap_or(0).max(0);
        let projected = plan.spent_today.saturating_add(estimated_fee);
        let exceeded = projected >= limit;
        if exceeded {
            info!(
                request_id = %request_details.request_id,
                connection_id = request_details.connection_id().unwrap_or_default(),
                plan_id = %plan.id,
                tier = %plan.subscription_tier,
                spent_today = plan.spent_today,
                estimated_fee,
                limit,
                %mode,
                method = method_name,
                "Spending plan daily limit reached"
            );
        } else {
            debug!(
                request_id = %request_details.request_id,
                plan_id = %plan.id,
                spent_today = plan.spent_today,
                limit,
                "Spending plan within daily limit"
            );
        }
        Ok(exceeded)
    }

    /// Decide whether a chunked file upload must be rejected before any of
    /// its steps run.
    ///
    /// Only the operator budget is consulted. If the fee cannot be estimated
    /// the check is skipped and post-execution accounting is relied on.
    pub async fn should_preemptively_limit_file_transactions(
        &self,
        payload_size: u64,
        chunk_size: u64,
        exchange_rate_cents: f64,
        request_details: &RequestDetails,
    ) -> bool {
        let estimate =
            match self.estimate_file_transactions_fee(payload_size, chunk_size, exchange_rate_cents)
            {
                Ok(estimate) => estimate,
                Err(e) => {
                    warn!(
                        request_id = %request_details.request_id,
                        payload_size,
                        chunk_size,
                        exchange_rate_cents,
                        "Skipping preemptive file transaction check: {e}"
                    );
                    return false;
                }
            };

        let remaining = self.ledger.remaining_budget().await;
        let limited = estimate.total_estimated_fee_tinybars > remaining;
        if limited {
            warn!(
                request_id = %request_details.request_id,
                connection_id = request_details.connection_id().unwrap_or_default(),
                estimated_fee = estimate.total_estimated_fee_tinybars,
                remaining,
                steps = estimate.steps.len(),
                "Preemptively limiting file transactions: estimated fee exceeds remaining budget"
            );
        }
        limited
    }

    /// Estimate a chunked file upload with this service's fee schedule.
    pub fn estimate_file_transactions_fee(
        &self,
        payload_size: u64,
        chunk_size: u64,
        exchange_rate_cents: f64,
    ) -> Result<FileTransactionsFeeEstimate> {
        estimate_file_transactions_fee(
            payload_size,
            chunk_size,
            exchange_rate_cents,
            &self.fee_schedule,
        )
    }

    // -- accounting --------------------------------------------------------

    /// Charge `amount` tinybars to the caller's plan and the operator budget.
    ///
    /// # Errors
    ///
    /// Returns [`HbarLimitError::InvalidArguments`] when neither identity is
    /// present or `amount` is negative; nothing is mutated in that case.
    /// Repository failures are logged and propagated.
    pub async fn add_expense(
        &self,
        amount: i64,
        eth_address: Option<&str>,
        request_details: &RequestDetails,
    ) -> Result<()> {
        let eth_address = non_empty(eth_address);
        let ip_address = request_details.ip_address();
        if eth_address.is_none() && ip_address.is_none() {
            return Err(HbarLimitError::InvalidArguments(
                "Cannot add expense without an eth address or ip address".to_string(),
            ));
        }
        if amount < 0 {
            return Err(HbarLimitError::InvalidArguments(format!(
                "Cannot add a negative expense: {amount}"
            )));
        }

        let (plan, _) = self
            .get_or_create_spending_plan(eth_address, ip_address, request_details)
            .await?;

        let previous = self
            .storage
            .plans
            .add_expense(plan.id, amount)
            .await
            .inspect_err(|e| {
                error!(
                    request_id = %request_details.request_id,
                    connection_id = request_details.connection_id().unwrap_or_default(),
                    plan_id = %plan.id,
                    amount,
                    "Failed to add expense to spending plan: {e}"
                );
            })?;
        let first_of_day = previous == 0 && amount > 0;

        let remaining = self.ledger.decrement(amount).await;
        self.metrics
            .record_expense(plan.subscription_tier, amount, first_of_day);
        self.update_average_daily_usage(plan.subscription_tier).await;

        debug!(
            request_id = %request_details.request_id,
            plan_id = %plan.id,
            amount,
            spent_today = previous.saturating_add(amount),
            remaining,
            "Expense recorded"
        );
        Ok(())
    }

    /// Start a new budget period now: restore the operator budget and zero
    /// every plan's `spent_today`.
    ///
    /// # Errors
    ///
    /// Propagates backing-store failures; the operator budget is left
    /// untouched in that case.
    pub async fn reset_limiter(&self) -> Result<()> {
        self.storage
            .plans
            .reset_spent_today()
            .await
            .inspect_err(|e| error!("Failed to reset spending plan counters: {e}"))?;
        self.ledger.reset().await;
        Ok(())
    }

    // -- plan resolution ---------------------------------------------------

    /// Resolve the caller's plan: eth address first, then IP address.
    ///
    /// An identity without a link, or linked to a plan that has expired,
    /// resolves to `None`.
    ///
    /// # Errors
    ///
    /// Propagates [`HbarLimitError::PlanNotActive`] and backing-store
    /// failures.
    pub async fn get_spending_plan(
        &self,
        eth_address: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<Option<SpendingPlan>> {
        if let Some(eth_address) = non_empty(eth_address) {
            let plan = self
                .find_linked_plan(&*self.storage.eth_address_links, eth_address)
                .await?;
            if plan.is_some() {
                return Ok(plan);
            }
        }
        if let Some(ip_address) = non_empty(ip_address) {
            return self
                .find_linked_plan(&*self.storage.ip_address_links, ip_address)
                .await;
        }
        Ok(None)
    }

    /// Create a BASIC plan linked to every identity provided.
    ///
    /// # Errors
    ///
    /// Returns [`HbarLimitError::InvalidArguments`] when neither identity is
    /// present.
    pub async fn create_basic_spending_plan(
        &self,
        eth_address: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<SpendingPlan> {
        let mut links: Vec<(&dyn IdentityLinkRepository, &str)> = Vec::with_capacity(2);
        if let Some(eth_address) = non_empty(eth_address) {
            links.push((&*self.storage.eth_address_links, eth_address));
        }
        if let Some(ip_address) = non_empty(ip_address) {
            links.push((&*self.storage.ip_address_links, ip_address));
        }
        if links.is_empty() {
            return Err(HbarLimitError::InvalidArguments(
                "Cannot create a spending plan without an eth address or ip address".to_string(),
            ));
        }
        self.create_linked_plan(SubscriptionTier::Basic, &links).await
    }

    /// Resolve the caller's plan, creating a BASIC plan linked to the
    /// preferred identity when none exists. The flag is `true` when the plan
    /// was created by this call.
    async fn get_or_create_spending_plan(
        &self,
        eth_address: Option<&str>,
        ip_address: Option<&str>,
        request_details: &RequestDetails,
    ) -> Result<(SpendingPlan, bool)> {
        if let Some(plan) = self.get_spending_plan(eth_address, ip_address).await? {
            return Ok((plan, false));
        }

        let (repo, identity): (&dyn IdentityLinkRepository, &str) =
            match (non_empty(eth_address), non_empty(ip_address)) {
                (Some(eth_address), _) => (&*self.storage.eth_address_links, eth_address),
                (None, Some(ip_address)) => (&*self.storage.ip_address_links, ip_address),
                (None, None) => {
                    return Err(HbarLimitError::InvalidArguments(
                        "Cannot resolve a spending plan without an eth address or ip address"
                            .to_string(),
                    ))
                }
            };

        let guard = self
            .creation_locks
            .lock(&format!("{}:{identity}", repo.dimension()))
            .await?;
        let result = self
            .create_plan_unless_linked(eth_address, ip_address, repo, identity, request_details)
            .await;
        guard.release().await;
        result
    }

    /// Body of lazy creation, run while holding the identity's lease.
    async fn create_plan_unless_linked(
        &self,
        eth_address: Option<&str>,
        ip_address: Option<&str>,
        repo: &dyn IdentityLinkRepository,
        identity: &str,
        request_details: &RequestDetails,
    ) -> Result<(SpendingPlan, bool)> {
        // Another request may have created the plan while we waited
        if let Some(plan) = self.get_spending_plan(eth_address, ip_address).await? {
            return Ok((plan, false));
        }

        let plan = self
            .create_linked_plan(SubscriptionTier::Basic, &[(repo, identity)])
            .await?;
        info!(
            request_id = %request_details.request_id,
            connection_id = request_details.connection_id().unwrap_or_default(),
            plan_id = %plan.id,
            dimension = %repo.dimension(),
            "Created basic spending plan for new caller"
        );
        Ok((plan, true))
    }

    async fn create_linked_plan(
        &self,
        tier: SubscriptionTier,
        links: &[(&dyn IdentityLinkRepository, &str)],
    ) -> Result<SpendingPlan> {
        let plan = self.storage.plans.create(tier).await.inspect_err(|e| {
            error!(%tier, "Failed to create spending plan: {e}");
        })?;
        self.metrics.record_plan_created(tier);

        for (repo, identity) in links {
            repo.save(identity, plan.id).await.inspect_err(|e| {
                error!(
                    plan_id = %plan.id,
                    dimension = %repo.dimension(),
                    identity,
                    "Failed to link spending plan: {e}"
                );
            })?;
        }
        Ok(plan)
    }

    async fn find_linked_plan(
        &self,
        repo: &dyn IdentityLinkRepository,
        identity: &str,
    ) -> Result<Option<SpendingPlan>> {
        let dimension = repo.dimension();
        let link = match repo.find_by_address(identity).await {
            Ok(link) => link,
            Err(e) if e.is_not_found() => {
                warn!(%dimension, identity, "Failed to get spending plan: {e}");
                return Ok(None);
            }
            Err(e) => {
                error!(%dimension, identity, "Failed to look up identity link: {e}");
                return Err(e);
            }
        };

        match self.storage.plans.find_by_id_with_details(link.plan_id).await {
            Ok(plan) => Ok(Some(plan)),
            Err(e) if e.is_not_found() => {
                warn!(%dimension, identity, "Linked spending plan no longer exists: {e}");
                Ok(None)
            }
            Err(e @ HbarLimitError::PlanNotActive { .. }) => {
                warn!(%dimension, identity, "{e}");
                Err(e)
            }
            Err(e) => {
                error!(%dimension, identity, plan_id = %link.plan_id, "Failed to load spending plan: {e}");
                Err(e)
            }
        }
    }

    // -- budget & metrics --------------------------------------------------

    async fn is_daily_budget_exceeded(
        &self,
        mode: ExecutionMode,
        method_name: &str,
        request_details: &RequestDetails,
    ) -> bool {
        let remaining = self.ledger.remaining_budget().await;
        if remaining > 0 {
            return false;
        }
        self.metrics.record_rejection(mode, method_name);
        warn!(
            request_id = %request_details.request_id,
            connection_id = request_details.connection_id().unwrap_or_default(),
            %mode,
            method = method_name,
            remaining,
            total_budget = self.ledger.total_budget(),
            "HBAR rate limit exceeded: operator budget exhausted"
        );
        true
    }

    async fn update_average_daily_usage(&self, tier: SubscriptionTier) {
        match self
            .storage
            .plans
            .spent_today_by_subscription_tier(tier)
            .await
        {
            Ok(amounts) => {
                let average = if amounts.is_empty() {
                    0.0
                } else {
                    let total: i128 = amounts.iter().map(|&a| i128::from(a)).sum();
                    total as f64 / amounts.len() as f64
                };
                self.metrics.set_average_daily_usage(tier, average);
            }
            Err(e) => {
                warn!(%tier, "Failed to refresh average daily usage: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use hbarlimit_core::SpendingPlanId;
    use std::time::Duration;

    const METHOD: &str = "eth_sendRawTransaction";
    const MODE: ExecutionMode = ExecutionMode::Transaction;
    const ETH: &str = "0x123d9e3f0c8a4f6e9f5e1e2f3a4b5c6d7e8f9a0b";
    const IP: &str = "555.555.555.555";

    async fn service_with(config: LimiterConfig) -> HbarLimitService {
        let storage = StorageProfile::Memory.build().await.unwrap();
        let metrics = Metrics::new();
        let ledger = Arc::new(BudgetLedger::new(
            config.budget.total_budget_tinybars,
            Duration::from_secs(config.budget.reset_interval_secs),
            metrics.clone(),
        ));
        HbarLimitService::new(&config, storage, ledger, metrics).unwrap()
    }

    async fn service() -> HbarLimitService {
        service_with(LimiterConfig::default()).await
    }

    fn details() -> RequestDetails {
        RequestDetails::new("req-1")
    }

    fn details_with_ip() -> RequestDetails {
        RequestDetails::new("req-1").with_ip_address(IP)
    }

    /// Create a linked BASIC plan and charge `spent` to it.
    async fn plan_with_spend(service: &HbarLimitService, spent: i64) -> SpendingPlan {
        let plan = service
            .create_basic_spending_plan(Some(ETH), None)
            .await
            .unwrap();
        if spent > 0 {
            service
                .storage
                .plans
                .add_expense(plan.id, spent)
                .await
                .unwrap();
        }
        plan
    }

    #[tokio::test]
    async fn test_disabled_config_yields_no_service() {
        let config = LimiterConfig {
            enabled: false,
            ..LimiterConfig::default()
        };
        let storage = StorageProfile::Memory.build().await.unwrap();
        let metrics = Metrics::new();
        let ledger = Arc::new(BudgetLedger::new(1, Duration::from_secs(60), metrics.clone()));
        assert!(HbarLimitService::new(&config, storage, ledger, metrics.clone()).is_none());
        assert!(HbarLimitService::from_config(&config, metrics)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_from_config_memory_profile() {
        let service = HbarLimitService::from_config(&LimiterConfig::default(), Metrics::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            service.ledger().remaining_budget().await,
            800_000_000_000
        );
        assert_eq!(service.file_chunk_size(), 5_120);
    }

    #[tokio::test]
    async fn test_should_limit_when_budget_exhausted() {
        let service = service().await;
        let total = service.ledger().total_budget();
        service.ledger().decrement(total).await;

        let limited = service
            .should_limit(MODE, METHOD, Some(ETH), &details(), None)
            .await
            .unwrap();
        assert!(limited);
        assert_eq!(
            service
                .metrics()
                .rejections_total
                .with_label_values(&["Transaction", METHOD])
                .get(),
            1
        );
        // No plan lookup or creation on the exhausted path
        assert!(service.get_spending_plan(Some(ETH), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_should_limit_creates_basic_plan_for_new_caller() {
        let service = service().await;
        let limited = service
            .should_limit(MODE, METHOD, Some(ETH), &details(), None)
            .await
            .unwrap();
        assert!(!limited);

        let plan = service
            .get_spending_plan(Some(ETH), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plan.subscription_tier, SubscriptionTier::Basic);
        assert_eq!(plan.spent_today, 0);
        assert_eq!(
            service
                .metrics()
                .spending_plans_created_total
                .with_label_values(&["BASIC"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_should_limit_prefers_eth_address_for_new_plan_link() {
        let service = service().await;
        service
            .should_limit(MODE, METHOD, Some(ETH), &details_with_ip(), None)
            .await
            .unwrap();

        assert!(service.get_spending_plan(Some(ETH), None).await.unwrap().is_some());
        assert!(service.get_spending_plan(None, Some(IP)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_should_limit_falls_back_to_ip_address() {
        let service = service().await;
        service
            .should_limit(MODE, METHOD, None, &details_with_ip(), None)
            .await
            .unwrap();
        assert!(service.get_spending_plan(None, Some(IP)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_should_limit_without_identity_returns_false() {
        let service = service().await;
        for eth in [None, Some("")] {
            let limited = service
                .should_limit(MODE, METHOD, eth, &details(), None)
                .await
                .unwrap();
            assert!(!limited);
        }
        assert_eq!(
            service
                .metrics()
                .spending_plans_created_total
                .with_label_values(&["BASIC"])
                .get(),
            0
        );
    }

    #[tokio::test]
    async fn test_should_limit_boundary_is_inclusive() {
        let limit = TierLimits::default().basic;
        for (spent, expected) in [(limit - 1, false), (limit, true), (limit + 1, true)] {
            let service = service().await;
            plan_with_spend(&service, spent).await;
            let limited = service
                .should_limit(MODE, METHOD, Some(ETH), &details(), None)
                .await
                .unwrap();
            assert_eq!(limited, expected, "spent_today = {spent}");
        }
    }

    #[tokio::test]
    async fn test_should_limit_includes_estimated_fee() {
        let service = service().await;
        let limit = service.daily_limit(SubscriptionTier::Basic);
        plan_with_spend(&service, limit - 100).await;

        assert!(!service
            .should_limit(MODE, METHOD, Some(ETH), &details(), Some(99))
            .await
            .unwrap());
        assert!(service
            .should_limit(MODE, METHOD, Some(ETH), &details(), Some(100))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_should_limit_ignores_negative_estimated_fee() {
        let service = service().await;
        let limit = service.daily_limit(SubscriptionTier::Basic);
        plan_with_spend(&service, limit).await;

        assert!(service
            .should_limit(MODE, METHOD, Some(ETH), &details(), Some(-limit))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_should_limit_with_huge_estimated_fee() {
        let service = service().await;
        plan_with_spend(&service, 1).await;

        assert!(service
            .should_limit(MODE, METHOD, Some(ETH), &details(), Some(i64::MAX))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_should_preemptively_limit_file_transactions() {
        let service = service().await;
        let estimate = service
            .estimate_file_transactions_fee(12_000, 5_120, 12.0)
            .unwrap();
        let fee = estimate.total_estimated_fee_tinybars;
        let total = service.ledger().total_budget();

        // Remaining budget one tinybar below the estimate
        service.ledger().decrement(total - fee + 1).await;
        assert!(
            service
                .should_preemptively_limit_file_transactions(12_000, 5_120, 12.0, &details())
                .await
        );

        // Remaining budget one tinybar above the estimate
        service.reset_limiter().await.unwrap();
        service.ledger().decrement(total - fee - 1).await;
        assert!(
            !service
                .should_preemptively_limit_file_transactions(12_000, 5_120, 12.0, &details())
                .await
        );
    }

    #[tokio::test]
    async fn test_preemptive_check_skipped_when_estimate_impossible() {
        let service = service().await;
        let total = service.ledger().total_budget();
        service.ledger().decrement(total).await;

        assert!(
            !service
                .should_preemptively_limit_file_transactions(12_000, 0, 12.0, &details())
                .await
        );
        assert!(
            !service
                .should_preemptively_limit_file_transactions(12_000, 5_120, 0.0, &details())
                .await
        );
    }

    #[tokio::test]
    async fn test_add_expense_updates_plan_and_ledger() {
        let service = service().await;
        let plan = plan_with_spend(&service, 0).await;
        let before = service.ledger().remaining_budget().await;

        service
            .add_expense(100, Some(ETH), &details())
            .await
            .unwrap();

        let plan = service
            .storage
            .plans
            .find_by_id_with_details(plan.id)
            .await
            .unwrap();
        assert_eq!(plan.spent_today, 100);
        assert_eq!(plan.spending_history.len(), 1);
        assert_eq!(plan.spending_history[0].amount, 100);
        assert_eq!(service.ledger().remaining_budget().await, before - 100);
        assert_eq!(
            service.metrics().remaining_budget_tinybars.get(),
            before - 100
        );
    }

    #[tokio::test]
    async fn test_add_expense_without_identity_fails() {
        let service = service().await;
        let before = service.ledger().remaining_budget().await;

        let err = service
            .add_expense(100, Some(""), &details())
            .await
            .unwrap_err();
        assert!(matches!(err, HbarLimitError::InvalidArguments(_)));
        assert_eq!(
            err.to_string(),
            "Invalid arguments: Cannot add expense without an eth address or ip address"
        );

        // Nothing was written anywhere
        assert_eq!(service.ledger().remaining_budget().await, before);
        assert!(service.storage.cache.keys("hbar_limit:").await.unwrap().is_empty());
        assert_eq!(
            service
                .metrics()
                .spending_plans_created_total
                .with_label_values(&["BASIC"])
                .get(),
            0
        );
        assert_eq!(
            service
                .metrics()
                .expenses_tinybars_total
                .with_label_values(&["BASIC"])
                .get(),
            0
        );
    }

    #[tokio::test]
    async fn test_add_expense_rejects_negative_amount() {
        let service = service().await;
        let err = service
            .add_expense(-1, Some(ETH), &details())
            .await
            .unwrap_err();
        assert!(matches!(err, HbarLimitError::InvalidArguments(_)));
        assert!(service.get_spending_plan(Some(ETH), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_expense_creates_plan_for_ip_only_caller() {
        let service = service().await;
        service
            .add_expense(42, None, &details_with_ip())
            .await
            .unwrap();
        let plan = service
            .get_spending_plan(None, Some(IP))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plan.spent_today, 42);
    }

    #[tokio::test]
    async fn test_add_expense_updates_daily_metrics() {
        let service = service().await;
        service.add_expense(100, Some(ETH), &details()).await.unwrap();
        service.add_expense(50, Some(ETH), &details()).await.unwrap();
        service
            .add_expense(30, Some("0xother"), &details())
            .await
            .unwrap();

        let metrics = service.metrics();
        assert_eq!(
            metrics
                .daily_unique_spending_plans
                .with_label_values(&["BASIC"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .expenses_tinybars_total
                .with_label_values(&["BASIC"])
                .get(),
            180
        );
        assert_eq!(
            metrics
                .average_daily_spending_plan_usage_tinybars
                .with_label_values(&["BASIC"])
                .get(),
            90.0
        );
    }

    #[tokio::test]
    async fn test_reset_limiter_restores_budget() {
        let service = service().await;
        service
            .add_expense(1_000, Some(ETH), &details())
            .await
            .unwrap();
        service.reset_limiter().await.unwrap();

        assert_eq!(
            service.ledger().remaining_budget().await,
            service.ledger().total_budget()
        );
        assert_eq!(service.metrics().budget_resets_total.get(), 1);
        assert_eq!(
            service
                .metrics()
                .daily_unique_spending_plans
                .with_label_values(&["BASIC"])
                .get(),
            0
        );
    }

    #[tokio::test]
    async fn test_reset_limiter_zeroes_plan_spend() {
        let service = service().await;
        let limit = service.daily_limit(SubscriptionTier::Basic);
        service
            .add_expense(limit, Some(ETH), &details())
            .await
            .unwrap();
        assert!(service
            .should_limit(MODE, METHOD, Some(ETH), &details(), None)
            .await
            .unwrap());

        service.reset_limiter().await.unwrap();

        let plan = service
            .get_spending_plan(Some(ETH), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plan.spent_today, 0);
        assert_eq!(plan.spending_history.len(), 1);
        assert!(!service
            .should_limit(MODE, METHOD, Some(ETH), &details(), None)
            .await
            .unwrap());

        // The plan counts as active again for the new day
        service.add_expense(10, Some(ETH), &details()).await.unwrap();
        let metrics = service.metrics();
        assert_eq!(
            metrics
                .daily_unique_spending_plans
                .with_label_values(&["BASIC"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .average_daily_spending_plan_usage_tinybars
                .with_label_values(&["BASIC"])
                .get(),
            10.0
        );
    }

    #[tokio::test]
    async fn test_concurrent_first_expenses_count_plan_once() {
        let service = Arc::new(service().await);
        service
            .create_basic_spending_plan(Some(ETH), None)
            .await
            .unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..50 {
            let service = Arc::clone(&service);
            tasks.spawn(async move {
                service
                    .add_expense(5, Some(ETH), &RequestDetails::new("req"))
                    .await
                    .unwrap();
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }

        assert_eq!(
            service
                .metrics()
                .daily_unique_spending_plans
                .with_label_values(&["BASIC"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_zero_expense_does_not_count_plan_as_active() {
        let service = service().await;
        service.add_expense(0, Some(ETH), &details()).await.unwrap();
        assert_eq!(
            service
                .metrics()
                .daily_unique_spending_plans
                .with_label_values(&["BASIC"])
                .get(),
            0
        );

        service.add_expense(5, Some(ETH), &details()).await.unwrap();
        assert_eq!(
            service
                .metrics()
                .daily_unique_spending_plans
                .with_label_values(&["BASIC"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_get_spending_plan_without_identities() {
        let service = service().await;
        for eth in [None, Some("")] {
            for ip in [None, Some("")] {
                assert!(service.get_spending_plan(eth, ip).await.unwrap().is_none());
            }
        }
    }

    #[tokio::test]
    async fn test_get_spending_plan_eth_address_takes_precedence() {
        let service = service().await;
        let by_eth = service
            .create_basic_spending_plan(Some(ETH), None)
            .await
            .unwrap();
        let by_ip = service
            .create_basic_spending_plan(None, Some(IP))
            .await
            .unwrap();
        assert_ne!(by_eth.id, by_ip.id);

        let resolved = service
            .get_spending_plan(Some(ETH), Some(IP))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, by_eth.id);

        // Unknown eth address falls through to the ip link
        let resolved = service
            .get_spending_plan(Some("0xunknown"), Some(IP))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, by_ip.id);
    }

    #[tokio::test]
    async fn test_get_spending_plan_dangling_link_is_absent() {
        let service = service().await;
        service
            .storage
            .eth_address_links
            .save(ETH, SpendingPlanId::new())
            .await
            .unwrap();
        assert!(service.get_spending_plan(Some(ETH), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_spending_plan_inactive_plan_is_error() {
        let service = service().await;
        let plan = plan_with_spend(&service, 0).await;
        service.storage.plans.deactivate(plan.id).await.unwrap();

        let err = service
            .get_spending_plan(Some(ETH), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HbarLimitError::PlanNotActive { plan_id } if plan_id == plan.id));

        // Never downgraded to a fresh plan
        assert!(service
            .should_limit(MODE, METHOD, Some(ETH), &details(), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_create_basic_spending_plan_links_both_identities() {
        let service = service().await;
        let plan = service
            .create_basic_spending_plan(Some(ETH), Some(IP))
            .await
            .unwrap();
        assert_eq!(plan.subscription_tier, SubscriptionTier::Basic);

        let by_eth = service.get_spending_plan(Some(ETH), None).await.unwrap().unwrap();
        let by_ip = service.get_spending_plan(None, Some(IP)).await.unwrap().unwrap();
        assert_eq!(by_eth.id, plan.id);
        assert_eq!(by_ip.id, plan.id);
    }

    #[tokio::test]
    async fn test_create_basic_spending_plan_requires_identity() {
        let service = service().await;
        let err = service
            .create_basic_spending_plan(Some(""), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HbarLimitError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn test_tier_limits_follow_config() {
        let mut config = LimiterConfig::default();
        config.budget.tier_limits = TierLimits {
            basic: 10,
            extended: 20,
            privileged: 30,
        };
        let service = service_with(config).await;
        plan_with_spend(&service, 10).await;
        assert!(service
            .should_limit(MODE, METHOD, Some(ETH), &details(), None)
            .await
            .unwrap());
        assert_eq!(service.daily_limit(SubscriptionTier::Privileged), 30);
    }
}
