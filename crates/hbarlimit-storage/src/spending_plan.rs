//! Spending plan repository persisted through a [`CacheLayer`].
//!
//! Each plan is stored as three records:
//!
//! | Key                                         | Value                          |
//! |---------------------------------------------|--------------------------------|
//! | `hbar_limit:plan:{id}`                      | tier, creation time, status    |
//! | `hbar_limit:plan:{id}:spent_today`          | amount and the period it is for|
//! | `hbar_limit:plan:{id}:spending_history`     | every expense, oldest first    |
//!
//! `spent_today` carries the start of the budget period it was accumulated
//! in. A record from an earlier period reads as zero, which is how a plan's
//! daily spend resets without a sweep over every plan. The current period
//! starts at the later of the epoch-aligned boundary and the last forced
//! reset, which is kept under `hbar_limit:period_start`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hbarlimit_core::{
    period_start, CacheLayer, HbarLimitError, Result, SpendingHistoryEntry, SpendingPlan,
    SpendingPlanId, SpendingPlanRepository, SubscriptionTier,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::keyed_lock::LeaseLocks;

/// Key prefix shared by every spending plan record.
pub const PLAN_KEY_PREFIX: &str = "hbar_limit:plan:";

/// Key holding the instant of the last forced budget reset.
pub const PERIOD_START_KEY: &str = "hbar_limit:period_start";

fn plan_key(id: SpendingPlanId) -> String {
    format!("{PLAN_KEY_PREFIX}{id}")
}

fn spent_today_key(id: SpendingPlanId) -> String {
    format!("{PLAN_KEY_PREFIX}{id}:spent_today")
}

fn spending_history_key(id: SpendingPlanId) -> String {
    format!("{PLAN_KEY_PREFIX}{id}:spending_history")
}

fn lock_key(id: SpendingPlanId) -> String {
    format!("plan:{id}")
}

/// The immutable part of a plan plus its activation flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlanRecord {
    id: SpendingPlanId,
    subscription_tier: SubscriptionTier,
    created_at: DateTime<Utc>,
    active: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SpentTodayRecord {
    amount: i64,
    period_start: DateTime<Utc>,
}

/// [`SpendingPlanRepository`] over any [`CacheLayer`].
///
/// Mutations for one plan are serialized through a per-plan [`LeaseLocks`]
/// lease, so concurrent updates never lose spend, whether they come from
/// one process or from several relays sharing the cache.
pub struct CacheSpendingPlanRepository {
    cache: Arc<dyn CacheLayer>,
    locks: LeaseLocks,
    reset_interval: Duration,
    ttl: Duration,
}

impl CacheSpendingPlanRepository {
    /// Create a repository.
    ///
    /// `reset_interval` defines the budget period `spent_today` is counted
    /// over; `ttl` is the expiry applied to every record on write.
    pub fn new(cache: Arc<dyn CacheLayer>, reset_interval: Duration, ttl: Duration) -> Self {
        Self {
            locks: LeaseLocks::new(Arc::clone(&cache)),
            cache,
            reset_interval,
            ttl,
        }
    }

    async fn load_record(&self, id: SpendingPlanId) -> Result<PlanRecord> {
        match self.cache.get(&plan_key(id)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(HbarLimitError::PlanNotFound { plan_id: id }),
        }
    }

    async fn load_active_record(&self, id: SpendingPlanId) -> Result<PlanRecord> {
        let record = self.load_record(id).await?;
        if !record.active {
            return Err(HbarLimitError::PlanNotActive { plan_id: id });
        }
        Ok(record)
    }

    async fn store_record(&self, record: &PlanRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.cache.set(&plan_key(record.id), &bytes, self.ttl).await
    }

    /// Start of the budget period containing `now`.
    async fn current_period_start(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let aligned = period_start(now, self.reset_interval);
        let forced: Option<DateTime<Utc>> = match self.cache.get(PERIOD_START_KEY).await? {
            Some(bytes) => Some(serde_json::from_slice(&bytes)?),
            None => None,
        };
        Ok(forced.map_or(aligned, |forced| forced.max(aligned)))
    }

    /// `spent_today` for the period starting at `period`; older records read
    /// as 0.
    async fn load_spent_today(&self, id: SpendingPlanId, period: DateTime<Utc>) -> Result<i64> {
        match self.cache.get(&spent_today_key(id)).await? {
            Some(bytes) => {
                let record: SpentTodayRecord = serde_json::from_slice(&bytes)?;
                if record.period_start >= period {
                    Ok(record.amount)
                } else {
                    Ok(0)
                }
            }
            None => Ok(0),
        }
    }

    fn decode_history(bytes: Option<&[u8]>) -> Result<Vec<SpendingHistoryEntry>> {
        match bytes {
            Some(bytes) => Ok(serde_json::from_slice(bytes)?),
            None => Ok(Vec::new()),
        }
    }

    async fn load_history(&self, id: SpendingPlanId) -> Result<Vec<SpendingHistoryEntry>> {
        let bytes = self.cache.get(&spending_history_key(id)).await?;
        Self::decode_history(bytes.as_deref())
    }

    async fn with_details(
        &self,
        record: PlanRecord,
        period: DateTime<Utc>,
    ) -> Result<SpendingPlan> {
        let spent_today = self.load_spent_today(record.id, period).await?;
        let spending_history = self.load_history(record.id).await?;
        Ok(SpendingPlan {
            id: record.id,
            subscription_tier: record.subscription_tier,
            created_at: record.created_at,
            active: record.active,
            spent_today,
            spending_history,
        })
    }

    /// IDs of every stored plan, parsed from the cache keys.
    async fn all_plan_ids(&self) -> Result<Vec<SpendingPlanId>> {
        let keys = self.cache.keys(PLAN_KEY_PREFIX).await?;
        let ids = keys
            .iter()
            .filter_map(|key| key.strip_prefix(PLAN_KEY_PREFIX))
            .filter(|rest| !rest.contains(':'))
            .filter_map(|rest| rest.parse::<Uuid>().ok().map(SpendingPlanId))
            .collect();
        Ok(ids)
    }

    /// Active plan records of `tier`, skipping plans that expire mid-scan.
    async fn active_records_of_tier(&self, tier: SubscriptionTier) -> Result<Vec<PlanRecord>> {
        let mut records = Vec::new();
        for id in self.all_plan_ids().await? {
            let record = match self.load_record(id).await {
                Ok(record) => record,
                Err(HbarLimitError::PlanNotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            if record.active && record.subscription_tier == tier {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn write_spent_today(
        &self,
        id: SpendingPlanId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let period = self.current_period_start(now).await?;
        let previous = self.load_spent_today(id, period).await?;
        let record = SpentTodayRecord {
            amount: previous.saturating_add(amount),
            period_start: period,
        };
        let bytes = serde_json::to_vec(&record)?;
        self.cache.set(&spent_today_key(id), &bytes, self.ttl).await?;
        Ok(previous)
    }

    async fn apply_expense(&self, id: SpendingPlanId, amount: i64) -> Result<i64> {
        self.load_active_record(id).await?;

        let now = Utc::now();
        let period = self.current_period_start(now).await?;
        let previous = self.load_spent_today(id, period).await?;
        let history_key = spending_history_key(id);
        let old_history = self.cache.get(&history_key).await?;
        let mut history = Self::decode_history(old_history.as_deref())?;
        history.push(SpendingHistoryEntry {
            amount,
            timestamp: now,
        });

        // Encode both records before writing either
        let history_bytes = serde_json::to_vec(&history)?;
        let counter_bytes = serde_json::to_vec(&SpentTodayRecord {
            amount: previous.saturating_add(amount),
            period_start: period,
        })?;

        self.cache.set(&history_key, &history_bytes, self.ttl).await?;
        if let Err(e) = self
            .cache
            .set(&spent_today_key(id), &counter_bytes, self.ttl)
            .await
        {
            self.restore_history(id, old_history).await;
            return Err(e);
        }

        debug!(
            plan_id = %id,
            amount,
            spent_today = previous.saturating_add(amount),
            entries = history.len(),
            "Expense recorded on spending plan"
        );
        Ok(previous)
    }

    /// Put back the history as it was before a failed expense.
    async fn restore_history(&self, id: SpendingPlanId, previous: Option<Vec<u8>>) {
        let key = spending_history_key(id);
        let restored = match previous {
            Some(bytes) => self.cache.set(&key, &bytes, self.ttl).await,
            None => self.cache.invalidate(&key).await,
        };
        if let Err(e) = restored {
            error!(plan_id = %id, "Failed to roll back spending history: {e}");
        }
    }

    async fn append_history(&self, id: SpendingPlanId, amount: i64) -> Result<()> {
        self.load_active_record(id).await?;

        let mut history = self.load_history(id).await?;
        history.push(SpendingHistoryEntry {
            amount,
            timestamp: Utc::now(),
        });
        let bytes = serde_json::to_vec(&history)?;
        self.cache
            .set(&spending_history_key(id), &bytes, self.ttl)
            .await?;

        debug!(plan_id = %id, amount, entries = history.len(), "Spending history appended");
        Ok(())
    }
}

#[async_trait]
impl SpendingPlanRepository for CacheSpendingPlanRepository {
    async fn create(&self, tier: SubscriptionTier) -> Result<SpendingPlan> {
        let record = PlanRecord {
            id: SpendingPlanId::new(),
            subscription_tier: tier,
            created_at: Utc::now(),
            active: true,
        };
        self.store_record(&record).await?;
        debug!(plan_id = %record.id, %tier, "Created spending plan");

        Ok(SpendingPlan {
            id: record.id,
            subscription_tier: record.subscription_tier,
            created_at: record.created_at,
            active: true,
            spent_today: 0,
            spending_history: Vec::new(),
        })
    }

    async fn find_by_id_with_details(&self, id: SpendingPlanId) -> Result<SpendingPlan> {
        let record = self.load_active_record(id).await?;
        let period = self.current_period_start(Utc::now()).await?;
        self.with_details(record, period).await
    }

    async fn add_expense(&self, id: SpendingPlanId, amount: i64) -> Result<i64> {
        let guard = self.locks.lock(&lock_key(id)).await?;
        let result = self.apply_expense(id, amount).await;
        guard.release().await;
        result
    }

    async fn add_amount_to_spent_today(&self, id: SpendingPlanId, amount: i64) -> Result<()> {
        let guard = self.locks.lock(&lock_key(id)).await?;
        let result = match self.load_active_record(id).await {
            Ok(_) => self.write_spent_today(id, amount, Utc::now()).await,
            Err(e) => Err(e),
        };
        guard.release().await;

        let previous = result?;
        debug!(
            plan_id = %id,
            amount,
            spent_today = previous.saturating_add(amount),
            "Spent today updated"
        );
        Ok(())
    }

    async fn add_amount_to_spending_history(
        &self,
        id: SpendingPlanId,
        amount: i64,
    ) -> Result<()> {
        let guard = self.locks.lock(&lock_key(id)).await?;
        let result = self.append_history(id, amount).await;
        guard.release().await;
        result
    }

    async fn reset_spent_today(&self) -> Result<()> {
        let now = Utc::now();
        let bytes = serde_json::to_vec(&now)?;
        // The marker only matters until the next aligned boundary passes it
        self.cache
            .set(PERIOD_START_KEY, &bytes, self.reset_interval)
            .await?;
        info!(period_start = %now, "Spending plan daily counters reset");
        Ok(())
    }

    async fn find_all_active_by_subscription_tier(
        &self,
        tier: SubscriptionTier,
    ) -> Result<Vec<SpendingPlan>> {
        let period = self.current_period_start(Utc::now()).await?;
        let mut plans = Vec::new();
        for record in self.active_records_of_tier(tier).await? {
            plans.push(self.with_details(record, period).await?);
        }
        Ok(plans)
    }

    async fn spent_today_by_subscription_tier(
        &self,
        tier: SubscriptionTier,
    ) -> Result<Vec<i64>> {
        let period = self.current_period_start(Utc::now()).await?;
        let mut amounts = Vec::new();
        for record in self.active_records_of_tier(tier).await? {
            amounts.push(self.load_spent_today(record.id, period).await?);
        }
        Ok(amounts)
    }

    async fn deactivate(&self, id: SpendingPlanId) -> Result<()> {
        let guard = self.locks.lock(&lock_key(id)).await?;
        let result = match self.load_record(id).await {
            Ok(mut record) => {
                record.active = false;
                self.store_record(&record).await
            }
            Err(e) => Err(e),
        };
        guard.release().await;

        result?;
        debug!(plan_id = %id, "Deactivated spending plan");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
