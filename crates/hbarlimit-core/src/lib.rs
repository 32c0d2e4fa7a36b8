//! Core types, traits, and errors for hbarlimit
//!
//! This crate contains the foundational types shared by the storage and
//! service crates: spending plans and their tiers, identity links, request
//! details, limiter configuration, the error type, and the async
//! repository/cache interfaces the admission controller is written against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Unique identifier for a spending plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpendingPlanId(pub Uuid);

impl std::fmt::Display for SpendingPlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SpendingPlanId {
    /// Create a new random spending plan ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SpendingPlanId {
    fn default() -> Self {
        Self::new()
    }
}

/// One of the two axes a caller can be resolved through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityDimension {
    /// Caller's EVM address (`0x…`).
    EthAddress,
    /// Network origin the request arrived from.
    IpAddress,
}

impl IdentityDimension {
    /// Stable key segment used when encoding cache keys for this dimension.
    #[must_use]
    pub fn key_segment(&self) -> &'static str {
        match self {
            Self::EthAddress => "eth_address",
            Self::IpAddress => "ip_address",
        }
    }
}

impl std::fmt::Display for IdentityDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key_segment())
    }
}

/// Return the identity only if it is present and non-empty.
///
/// Empty strings coming off the transport layer are never linkable.
#[must_use]
pub fn non_empty(identity: Option<&str>) -> Option<&str> {
    identity.filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Spending plans
// ---------------------------------------------------------------------------

/// Quota class bounding a plan's daily spend. Ordered from least to most
/// privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionTier {
    /// Default tier for anonymous callers.
    Basic,
    /// Tier for known callers with a raised quota.
    Extended,
    /// Operator-trusted callers.
    Privileged,
}

impl SubscriptionTier {
    /// All tiers, in ascending order.
    pub const ALL: [SubscriptionTier; 3] = [Self::Basic, Self::Extended, Self::Privileged];

    /// Upper-case label used in logs and metric labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "BASIC",
            Self::Extended => "EXTENDED",
            Self::Privileged => "PRIVILEGED",
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single recorded expense.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingHistoryEntry {
    /// Amount in tinybars.
    pub amount: i64,
    /// When the expense was recorded.
    pub timestamp: DateTime<Utc>,
}

/// A budget account: a tier, the accumulated spend for the current budget
/// day, and the append-only history of expenses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingPlan {
    /// Immutable plan identifier.
    pub id: SpendingPlanId,
    /// Tier fixed at creation.
    pub subscription_tier: SubscriptionTier,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Inactive plans fail lookups with [`HbarLimitError::PlanNotActive`].
    pub active: bool,
    /// Tinybars spent in the current budget period.
    pub spent_today: i64,
    /// Every expense ever recorded against this plan, oldest first.
    pub spending_history: Vec<SpendingHistoryEntry>,
}

impl SpendingPlan {
    /// Sum of history entries recorded at or after `since`.
    #[must_use]
    pub fn history_total_since(&self, since: DateTime<Utc>) -> i64 {
        self.spending_history
            .iter()
            .filter(|e| e.timestamp >= since)
            .map(|e| e.amount)
            .sum()
    }
}

/// Maps an identity in one dimension to the plan it is billed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityLink {
    /// Case-sensitive identity string (address or origin).
    pub identity: String,
    /// The linked plan.
    pub plan_id: SpendingPlanId,
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

/// How the dispatcher is about to execute the fee-incurring call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Read-only query paid by the operator.
    Query,
    /// State-changing transaction.
    Transaction,
    /// Record lookup for an executed transaction.
    Record,
}

impl ExecutionMode {
    /// Label used for the `mode` metric label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "Query",
            Self::Transaction => "Transaction",
            Self::Record => "Record",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request context supplied by the transport layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDetails {
    /// Unique request identifier.
    pub request_id: String,
    /// Origin IP of the request, when known.
    #[serde(default)]
    pub ip_address: Option<String>,
    /// WebSocket connection identifier, when the call arrived over WS.
    #[serde(default)]
    pub connection_id: Option<String>,
}

impl RequestDetails {
    /// Create request details with only a request ID.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::default()
        }
    }

    /// Attach the origin IP address.
    #[must_use]
    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    /// Attach the WebSocket connection ID.
    #[must_use]
    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// The origin IP, or `None` if absent or empty.
    #[must_use]
    pub fn ip_address(&self) -> Option<&str> {
        non_empty(self.ip_address.as_deref())
    }

    /// The WebSocket connection ID, or `None` if absent or empty.
    #[must_use]
    pub fn connection_id(&self) -> Option<&str> {
        non_empty(self.connection_id.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Budget periods
// ---------------------------------------------------------------------------

/// Start of the epoch-aligned budget period containing `now`.
#[must_use]
pub fn period_start(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let secs = interval.as_secs().max(1) as i64;
    let start = now.timestamp().div_euclid(secs) * secs;
    DateTime::from_timestamp(start, 0).unwrap_or(now)
}

/// The first period boundary strictly after `now`.
#[must_use]
pub fn next_reset_after(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let secs = interval.as_secs().max(1) as i64;
    period_start(now, interval) + chrono::Duration::seconds(secs)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Daily limits per tier, in tinybars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Daily limit for [`SubscriptionTier::Basic`].
    #[serde(default = "default_basic_limit")]
    pub basic: i64,
    /// Daily limit for [`SubscriptionTier::Extended`].
    #[serde(default = "default_extended_limit")]
    pub extended: i64,
    /// Daily limit for [`SubscriptionTier::Privileged`].
    #[serde(default = "default_privileged_limit")]
    pub privileged: i64,
}

fn default_basic_limit() -> i64 {
    1_120_000_000
}

fn default_extended_limit() -> i64 {
    3_200_000_000
}

fn default_privileged_limit() -> i64 {
    8_000_000_000
}

impl TierLimits {
    /// Daily limit for `tier`.
    #[must_use]
    pub fn limit_for(&self, tier: SubscriptionTier) -> i64 {
        match tier {
            SubscriptionTier::Basic => self.basic,
            SubscriptionTier::Extended => self.extended,
            SubscriptionTier::Privileged => self.privileged,
        }
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            basic: default_basic_limit(),
            extended: default_extended_limit(),
            privileged: default_privileged_limit(),
        }
    }
}

/// Process-wide budget settings.
///
/// # Example (YAML)
///
/// ```yaml
/// budget:
///   total_budget_tinybars: 800000000000
///   reset_interval_secs: 86400
///   file_chunk_size: 5120
///   tier_limits:
///     basic: 1120000000
///     extended: 3200000000
///     privileged: 8000000000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Daily operator budget shared by all callers.
    #[serde(default = "default_total_budget")]
    pub total_budget_tinybars: i64,
    /// Length of a budget period in seconds.
    #[serde(default = "default_reset_interval_secs")]
    pub reset_interval_secs: u64,
    /// Maximum payload bytes carried by one file create/append step.
    #[serde(default = "default_file_chunk_size")]
    pub file_chunk_size: u64,
    /// Ordered tier → daily limit mapping.
    #[serde(default)]
    pub tier_limits: TierLimits,
}

fn default_total_budget() -> i64 {
    800_000_000_000
}

fn default_reset_interval_secs() -> u64 {
    86_400
}

fn default_file_chunk_size() -> u64 {
    5_120
}

impl BudgetConfig {
    /// Budget period length.
    #[must_use]
    pub fn reset_interval(&self) -> Duration {
        Duration::from_secs(self.reset_interval_secs)
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total_budget_tinybars: default_total_budget(),
            reset_interval_secs: default_reset_interval_secs(),
            file_chunk_size: default_file_chunk_size(),
            tier_limits: TierLimits::default(),
        }
    }
}

/// Network fee schedule used for pre-flight estimates, in USD cents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Fee of a file create step carrying up to one chunk.
    #[serde(default = "default_file_create_fee")]
    pub file_create_per_5kb_cents: f64,
    /// Fee of each file append step.
    #[serde(default = "default_file_append_fee")]
    pub file_append_per_5kb_cents: f64,
}

fn default_file_create_fee() -> f64 {
    9.51
}

fn default_file_append_fee() -> f64 {
    9.55
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            file_create_per_5kb_cents: default_file_create_fee(),
            file_append_per_5kb_cents: default_file_append_fee(),
        }
    }
}

/// Backing store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage profile: `"memory"` (in-process) or `"redis"` (shared).
    #[serde(default = "default_storage_profile")]
    pub profile: String,
    /// Redis connection URL (used by the `"redis"` profile).
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Expiry applied to spending plan records.
    #[serde(default = "default_plan_ttl_secs")]
    pub plan_ttl_secs: u64,
    /// Expiry applied to identity link records.
    #[serde(default = "default_identity_link_ttl_secs")]
    pub identity_link_ttl_secs: u64,
}

fn default_storage_profile() -> String {
    "memory".to_string()
}

fn default_plan_ttl_secs() -> u64 {
    // 30 days
    2_592_000
}

fn default_identity_link_ttl_secs() -> u64 {
    2_592_000
}

impl StorageConfig {
    /// Expiry for spending plan records.
    #[must_use]
    pub fn plan_ttl(&self) -> Duration {
        Duration::from_secs(self.plan_ttl_secs)
    }

    /// Expiry for identity link records.
    #[must_use]
    pub fn identity_link_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_link_ttl_secs)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            profile: default_storage_profile(),
            redis_url: None,
            plan_ttl_secs: default_plan_ttl_secs(),
            identity_link_ttl_secs: default_identity_link_ttl_secs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `text` (human-readable) or `json` (structured).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Top-level limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Enable admission control. When disabled every call is admitted.
    #[serde(default = "default_true_flag")]
    pub enabled: bool,
    /// Budget and tier limits.
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Fee schedule for pre-flight estimates.
    #[serde(default)]
    pub fee_schedule: FeeSchedule,
    /// Backing store.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_true_flag() -> bool {
    true
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            budget: BudgetConfig::default(),
            fee_schedule: FeeSchedule::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl LimiterConfig {
    /// Check the configuration for values the limiter cannot operate with.
    ///
    /// # Errors
    ///
    /// Returns [`HbarLimitError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let budget = &self.budget;
        if budget.total_budget_tinybars <= 0 {
            return Err(HbarLimitError::Config(format!(
                "total_budget_tinybars must be positive, got {}",
                budget.total_budget_tinybars
            )));
        }
        if budget.reset_interval_secs == 0 {
            return Err(HbarLimitError::Config(
                "reset_interval_secs must be greater than zero".to_string(),
            ));
        }
        if budget.file_chunk_size == 0 {
            return Err(HbarLimitError::Config(
                "file_chunk_size must be greater than zero".to_string(),
            ));
        }

        let mut previous: Option<(SubscriptionTier, i64)> = None;
        for tier in SubscriptionTier::ALL {
            let limit = budget.tier_limits.limit_for(tier);
            if limit < 0 {
                return Err(HbarLimitError::Config(format!(
                    "{tier} tier limit must not be negative, got {limit}"
                )));
            }
            if let Some((prev_tier, prev_limit)) = previous {
                if limit < prev_limit {
                    return Err(HbarLimitError::Config(format!(
                        "{tier} tier limit ({limit}) is lower than {prev_tier} ({prev_limit})"
                    )));
                }
            }
            previous = Some((tier, limit));
        }

        let fees = &self.fee_schedule;
        if fees.file_create_per_5kb_cents < 0.0 || fees.file_append_per_5kb_cents < 0.0 {
            return Err(HbarLimitError::Config(
                "fee schedule entries must not be negative".to_string(),
            ));
        }

        match self.storage.profile.as_str() {
            "memory" => {}
            "redis" => {
                if self.storage.redis_url.is_none() {
                    return Err(HbarLimitError::Config(
                        "redis profile requires storage.redis_url".to_string(),
                    ));
                }
            }
            other => {
                return Err(HbarLimitError::Config(format!(
                    "unknown storage profile: {other}"
                )));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error types.
#[derive(thiserror::Error, Debug)]
pub enum HbarLimitError {
    /// Backing store failure (timeout, connection, protocol).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization / deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No plan exists with the given ID.
    #[error("Spending plan with ID {plan_id} not found")]
    PlanNotFound {
        /// The missing plan.
        plan_id: SpendingPlanId,
    },

    /// The plan exists but has been deactivated.
    #[error("Spending plan with ID {plan_id} is not active")]
    PlanNotActive {
        /// The inactive plan.
        plan_id: SpendingPlanId,
    },

    /// No plan is linked to the identity in this dimension.
    #[error("No spending plan linked to {dimension} '{identity}'")]
    IdentityLinkNotFound {
        /// Dimension that was searched.
        dimension: IdentityDimension,
        /// The identity that had no link.
        identity: String,
    },

    /// The call did not carry what the operation requires.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HbarLimitError {
    /// `true` for the expected "nothing there" conditions that lazy plan
    /// creation recovers from.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::PlanNotFound { .. } | Self::IdentityLinkNotFound { .. }
        )
    }
}

/// Convenience alias for `std::result::Result<T, HbarLimitError>`.
pub type Result<T> = std::result::Result<T, HbarLimitError>;

// ---------------------------------------------------------------------------
// Storage traits
// ---------------------------------------------------------------------------

/// Generic expiring key-value store the repositories persist through.
///
/// Dev/Lite: In-memory `DashMap`. Production: Redis.
#[async_trait::async_trait]
pub trait CacheLayer: Send + Sync {
    /// Get a cached value by key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a cached value with a TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Invalidate (remove) a cached entry.
    async fn invalidate(&self, key: &str) -> Result<()>;

    /// List live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Store `value` under `key` only if the key is absent or expired.
    ///
    /// Returns `true` when the value was stored. Backends shared between
    /// processes must perform the check and the write as one operation.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Remove `key` only while it still holds `value`.
    ///
    /// Returns `true` when the entry was removed.
    async fn invalidate_if_eq(&self, key: &str, value: &[u8]) -> Result<bool>;

    /// Health check for the cache layer.
    async fn health_check(&self) -> Result<()>;
}

/// Create/read/update spending plans with their daily counters and history.
///
/// Implementations must apply each mutation as a single logical update per
/// plan ID so that concurrent callers never lose spend.
#[async_trait::async_trait]
pub trait SpendingPlanRepository: Send + Sync {
    /// Create a new active plan at `tier`.
    async fn create(&self, tier: SubscriptionTier) -> Result<SpendingPlan>;

    /// Load a plan together with its `spent_today` and history.
    ///
    /// Fails with [`HbarLimitError::PlanNotFound`] or
    /// [`HbarLimitError::PlanNotActive`].
    async fn find_by_id_with_details(&self, id: SpendingPlanId) -> Result<SpendingPlan>;

    /// Charge `amount` to the plan: add it to `spent_today` and append a
    /// history entry, as one update under the plan's lock and with one
    /// timestamp.
    ///
    /// Returns `spent_today` as it was before this expense. On failure
    /// neither record is changed.
    async fn add_expense(&self, id: SpendingPlanId, amount: i64) -> Result<i64>;

    /// Atomically add `amount` to the plan's `spent_today`.
    async fn add_amount_to_spent_today(&self, id: SpendingPlanId, amount: i64) -> Result<()>;

    /// Atomically append an entry of `amount` to the plan's history.
    async fn add_amount_to_spending_history(&self, id: SpendingPlanId, amount: i64)
        -> Result<()>;

    /// Start a new budget period now: every plan's `spent_today` reads as
    /// zero until it is charged again.
    async fn reset_spent_today(&self) -> Result<()>;

    /// All active plans of the given tier, with details.
    async fn find_all_active_by_subscription_tier(
        &self,
        tier: SubscriptionTier,
    ) -> Result<Vec<SpendingPlan>>;

    /// `spent_today` of every active plan of the given tier, without
    /// loading histories.
    async fn spent_today_by_subscription_tier(
        &self,
        tier: SubscriptionTier,
    ) -> Result<Vec<i64>>;

    /// Mark a plan inactive.
    async fn deactivate(&self, id: SpendingPlanId) -> Result<()>;
}

/// Maps identities in one [`IdentityDimension`] to spending plans.
///
/// Two instances exist side by side (address and origin); they are never
/// merged.
#[async_trait::async_trait]
pub trait IdentityLinkRepository: Send + Sync {
    /// The dimension this repository serves.
    fn dimension(&self) -> IdentityDimension;

    /// Look up the link for `identity`.
    ///
    /// Fails with [`HbarLimitError::IdentityLinkNotFound`] when absent.
    async fn find_by_address(&self, identity: &str) -> Result<IdentityLink>;

    /// Link `identity` to `plan_id`, replacing any existing link.
    async fn save(&self, identity: &str, plan_id: SpendingPlanId) -> Result<()>;

    /// Remove the link for `identity`, if any.
    async fn delete(&self, identity: &str) -> Result<()>;

    /// Remove every link in this dimension.
    async fn delete_all(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
