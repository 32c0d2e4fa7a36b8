//! Process-wide operator budget.
//!
//! The ledger tracks how many tinybars the operator may still spend in the
//! current budget period. It is reset to the configured total at each
//! epoch-aligned period boundary; the reset happens on the first access
//! after the boundary so it is never observed late.

use chrono::{DateTime, Utc};
use hbarlimit_core::next_reset_after;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::metrics::Metrics;

#[derive(Debug)]
struct LedgerState {
    remaining: i64,
    reset_at: DateTime<Utc>,
}

/// Remaining daily budget and its reset schedule.
///
/// Every read and write goes through one mutex so a reset and concurrent
/// decrements are linearizable: no decrement is applied to a stale period
/// and exactly one caller performs each reset.
pub struct BudgetLedger {
    total_budget: i64,
    reset_interval: Duration,
    state: Mutex<LedgerState>,
    metrics: Metrics,
}

impl BudgetLedger {
    /// Create a ledger with a full budget, resetting at the next period
    /// boundary.
    pub fn new(total_budget: i64, reset_interval: Duration, metrics: Metrics) -> Self {
        let reset_at = next_reset_after(Utc::now(), reset_interval);
        Self::with_reset_at(total_budget, reset_interval, reset_at, metrics)
    }

    /// Create a ledger with a full budget and an explicit first reset time.
    pub fn with_reset_at(
        total_budget: i64,
        reset_interval: Duration,
        reset_at: DateTime<Utc>,
        metrics: Metrics,
    ) -> Self {
        metrics.set_budget(total_budget, total_budget);
        Self {
            total_budget,
            reset_interval,
            state: Mutex::new(LedgerState {
                remaining: total_budget,
                reset_at,
            }),
            metrics,
        }
    }

    /// The configured budget per period.
    pub fn total_budget(&self) -> i64 {
        self.total_budget
    }

    /// Remaining budget in the current period.
    pub async fn remaining_budget(&self) -> i64 {
        let mut state = self.state.lock().await;
        self.reset_if_due(&mut state, Utc::now());
        state.remaining
    }

    /// `true` once the remaining budget has reached zero or below.
    pub async fn is_exhausted(&self) -> bool {
        self.remaining_budget().await <= 0
    }

    /// When the current period ends.
    pub async fn reset_at(&self) -> DateTime<Utc> {
        let mut state = self.state.lock().await;
        self.reset_if_due(&mut state, Utc::now());
        state.reset_at
    }

    /// Subtract `amount` from the remaining budget and return the new value.
    ///
    /// The result may go negative: expenses are accounted after execution.
    pub async fn decrement(&self, amount: i64) -> i64 {
        let mut state = self.state.lock().await;
        self.reset_if_due(&mut state, Utc::now());
        state.remaining = state.remaining.saturating_sub(amount);
        self.metrics.remaining_budget_tinybars.set(state.remaining);
        state.remaining
    }

    /// Restore the full budget now and schedule the next reset.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        self.apply_reset(&mut state, Utc::now());
    }

    fn reset_if_due(&self, state: &mut LedgerState, now: DateTime<Utc>) {
        if now >= state.reset_at {
            self.apply_reset(state, now);
        }
    }

    fn apply_reset(&self, state: &mut LedgerState, now: DateTime<Utc>) {
        let spent = self.total_budget.saturating_sub(state.remaining);
        state.remaining = self.total_budget;
        state.reset_at = next_reset_after(now, self.reset_interval);
        self.metrics.record_budget_reset(self.total_budget);
        info!(
            spent,
            total_budget = self.total_budget,
            next_reset = %state.reset_at,
            "HBAR budget reset"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
