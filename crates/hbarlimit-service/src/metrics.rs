//! Prometheus metrics for the HBAR limiter.
//!
//! Provides a [`Metrics`] struct holding every collector the admission
//! controller and budget ledger update. The surrounding relay exposes
//! [`Metrics::gather_text`] on its own scrape endpoint.

use hbarlimit_core::{ExecutionMode, SubscriptionTier};
use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Holds all Prometheus metric collectors for the limiter.
///
/// Cloning is cheap; clones share the same collectors.
#[derive(Clone)]
pub struct Metrics {
    /// Private Prometheus registry so tests see only their own samples.
    registry: Registry,

    /// Remaining operator budget for the current day.
    pub remaining_budget_tinybars: IntGauge,

    /// Configured daily operator budget.
    pub total_budget_tinybars: IntGauge,

    /// Requests rejected because the operator budget is exhausted,
    /// labelled by execution mode and method name.
    pub rejections_total: IntCounterVec,

    /// Spending plans created, labelled by tier.
    pub spending_plans_created_total: IntCounterVec,

    /// Plans that recorded their first expense of the current day.
    pub daily_unique_spending_plans: IntGaugeVec,

    /// Average `spent_today` across the active plans of a tier.
    pub average_daily_spending_plan_usage_tinybars: GaugeVec,

    /// Tinybars charged to plans, labelled by tier.
    pub expenses_tinybars_total: IntCounterVec,

    /// Number of operator budget resets.
    pub budget_resets_total: IntCounter,
}

impl Metrics {
    /// Create a new `Metrics` instance with all collectors registered.
    ///
    /// # Panics
    ///
    /// Panics if any metric fails to register. This happens once at
    /// startup and only on a programming error (duplicate metric name).
    pub fn new() -> Self {
        let registry = Registry::new();

        let remaining_budget_tinybars = IntGauge::new(
            "hbarlimit_remaining_budget_tinybars",
            "Remaining operator budget for the current day in tinybars",
        )
        .expect("metric: remaining_budget_tinybars");
        registry
            .register(Box::new(remaining_budget_tinybars.clone()))
            .expect("register remaining_budget_tinybars");

        let total_budget_tinybars = IntGauge::new(
            "hbarlimit_total_budget_tinybars",
            "Configured daily operator budget in tinybars",
        )
        .expect("metric: total_budget_tinybars");
        registry
            .register(Box::new(total_budget_tinybars.clone()))
            .expect("register total_budget_tinybars");

        let rejections_total = IntCounterVec::new(
            Opts::new(
                "hbarlimit_rejections_total",
                "Requests rejected because the operator budget is exhausted",
            ),
            &["mode", "method"],
        )
        .expect("metric: rejections_total");
        registry
            .register(Box::new(rejections_total.clone()))
            .expect("register rejections_total");

        let spending_plans_created_total = IntCounterVec::new(
            Opts::new(
                "hbarlimit_spending_plans_created_total",
                "Total spending plans created",
            ),
            &["tier"],
        )
        .expect("metric: spending_plans_created_total");
        registry
            .register(Box::new(spending_plans_created_total.clone()))
            .expect("register spending_plans_created_total");

        let daily_unique_spending_plans = IntGaugeVec::new(
            Opts::new(
                "hbarlimit_daily_unique_spending_plans",
                "Spending plans with at least one expense in the current day",
            ),
            &["tier"],
        )
        .expect("metric: daily_unique_spending_plans");
        registry
            .register(Box::new(daily_unique_spending_plans.clone()))
            .expect("register daily_unique_spending_plans");

        let average_daily_spending_plan_usage_tinybars = GaugeVec::new(
            Opts::new(
                "hbarlimit_average_daily_spending_plan_usage_tinybars",
                "Average daily spend of active spending plans in tinybars",
            ),
            &["tier"],
        )
        .expect("metric: average_daily_spending_plan_usage_tinybars");
        registry
            .register(Box::new(average_daily_spending_plan_usage_tinybars.clone()))
            .expect("register average_daily_spending_plan_usage_tinybars");

        let expenses_tinybars_total = IntCounterVec::new(
            Opts::new(
                "hbarlimit_expenses_tinybars_total",
                "Tinybars charged to spending plans",
            ),
            &["tier"],
        )
        .expect("metric: expenses_tinybars_total");
        registry
            .register(Box::new(expenses_tinybars_total.clone()))
            .expect("register expenses_tinybars_total");

        let budget_resets_total = IntCounter::new(
            "hbarlimit_budget_resets_total",
            "Total operator budget resets",
        )
        .expect("metric: budget_resets_total");
        registry
            .register(Box::new(budget_resets_total.clone()))
            .expect("register budget_resets_total");

        // Every tier is exported from startup
        for tier in SubscriptionTier::ALL {
            daily_unique_spending_plans
                .with_label_values(&[tier.as_str()])
                .set(0);
            average_daily_spending_plan_usage_tinybars
                .with_label_values(&[tier.as_str()])
                .set(0.0);
        }

        Self {
            registry,
            remaining_budget_tinybars,
            total_budget_tinybars,
            rejections_total,
            spending_plans_created_total,
            daily_unique_spending_plans,
            average_daily_spending_plan_usage_tinybars,
            expenses_tinybars_total,
            budget_resets_total,
        }
    }

    /// Render all registered metrics in Prometheus text exposition format.
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    // -- convenience helpers ------------------------------------------------

    /// Publish the ledger's budget figures.
    pub fn set_budget(&self, total: i64, remaining: i64) {
        self.total_budget_tinybars.set(total);
        self.remaining_budget_tinybars.set(remaining);
    }

    /// Record a rejection caused by an exhausted operator budget.
    pub fn record_rejection(&self, mode: ExecutionMode, method: &str) {
        self.rejections_total
            .with_label_values(&[mode.as_str(), method])
            .inc();
    }

    /// Record a newly created spending plan.
    pub fn record_plan_created(&self, tier: SubscriptionTier) {
        self.spending_plans_created_total
            .with_label_values(&[tier.as_str()])
            .inc();
    }

    /// Record an expense charged to a plan of `tier`.
    ///
    /// `first_of_day` marks the plan's first expense in the current period.
    pub fn record_expense(&self, tier: SubscriptionTier, amount: i64, first_of_day: bool) {
        if amount > 0 {
            self.expenses_tinybars_total
                .with_label_values(&[tier.as_str()])
                .inc_by(amount as u64);
        }
        if first_of_day {
            self.daily_unique_spending_plans
                .with_label_values(&[tier.as_str()])
                .inc();
        }
    }

    /// Update the average daily usage gauge for `tier`.
    pub fn set_average_daily_usage(&self, tier: SubscriptionTier, average: f64) {
        self.average_daily_spending_plan_usage_tinybars
            .with_label_values(&[tier.as_str()])
            .set(average);
    }

    /// Record a budget reset and zero the per-day gauges.
    pub fn record_budget_reset(&self, total: i64) {
        self.budget_resets_total.inc();
        self.set_budget(total, total);
        for tier in SubscriptionTier::ALL {
            self.daily_unique_spending_plans
                .with_label_values(&[tier.as_str()])
                .set(0);
            self.set_average_daily_usage(tier, 0.0);
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new_succeeds() {
        let m = Metrics::new();
        let text = m.gather_text().unwrap();
        assert!(text.contains("hbarlimit_remaining_budget_tinybars"));
        assert!(text.contains("hbarlimit_daily_unique_spending_plans{tier=\"BASIC\"} 0"));
    }

    #[test]
    fn test_record_rejection() {
        let m = Metrics::new();
        m.record_rejection(ExecutionMode::Transaction, "eth_sendRawTransaction");
        m.record_rejection(ExecutionMode::Transaction, "eth_sendRawTransaction");

        assert_eq!(
            m.rejections_total
                .with_label_values(&["Transaction", "eth_sendRawTransaction"])
                .get(),
            2
        );
        let text = m.gather_text().unwrap();
        assert!(text.contains("method=\"eth_sendRawTransaction\""));
    }

    #[test]
    fn test_record_expense() {
        let m = Metrics::new();
        m.record_expense(SubscriptionTier::Basic, 100, true);
        m.record_expense(SubscriptionTier::Basic, 50, false);

        assert_eq!(
            m.expenses_tinybars_total
                .with_label_values(&["BASIC"])
                .get(),
            150
        );
        assert_eq!(
            m.daily_unique_spending_plans
                .with_label_values(&["BASIC"])
                .get(),
            1
        );
    }

    #[test]
    fn test_budget_reset_zeroes_daily_gauges() {
        let m = Metrics::new();
        m.set_budget(1_000, 400);
        m.record_expense(SubscriptionTier::Extended, 600, true);
        m.set_average_daily_usage(SubscriptionTier::Extended, 600.0);

        m.record_budget_reset(1_000);

        assert_eq!(m.remaining_budget_tinybars.get(), 1_000);
        assert_eq!(m.budget_resets_total.get(), 1);
        assert_eq!(
            m.daily_unique_spending_plans
                .with_label_values(&["EXTENDED"])
                .get(),
            0
        );
        assert_eq!(
            m.average_daily_spending_plan_usage_tinybars
                .with_label_values(&["EXTENDED"])
                .get(),
            0.0
        );
        // Cumulative counters survive the reset
        assert_eq!(
            m.expenses_tinybars_total
                .with_label_values(&["EXTENDED"])
                .get(),
            600
        );
    }

    #[test]
    fn test_clones_share_collectors() {
        let m = Metrics::new();
        let clone = m.clone();
        clone.record_plan_created(SubscriptionTier::Privileged);
        assert_eq!(
            m.spending_plans_created_total
                .with_label_values(&["PRIVILEGED"])
                .get(),
            1
        );
    }
}
