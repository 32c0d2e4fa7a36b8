//! HBAR budget admission control for fee-paying JSON-RPC relays.
//!
//! The relay pays network fees from a shared operator account. This crate
//! enforces a daily operator budget subdivided into per-caller spending
//! plans:
//!
//! - [`HbarLimitService`] decides whether a fee-incurring call may proceed
//!   and charges its cost afterwards.
//! - [`BudgetLedger`] holds the process-wide remaining budget.
//! - [`fee`] estimates chunked file uploads before they run.
//! - [`Metrics`] exposes the budget and rejection counters to Prometheus.

pub mod config;
pub mod fee;
pub mod ledger;
pub mod metrics;
pub mod service;

pub use ledger::BudgetLedger;
pub use metrics::Metrics;
pub use service::HbarLimitService;
