//! Pre-flight fee estimation for chunked file transactions.
//!
//! A large payload is uploaded as one file create step carrying the first
//! chunk, followed by `ceil(payload_size / chunk_size) - 1` append steps.
//! Each step is billed at a fixed USD-cent price converted to tinybars with
//! the current exchange rate.

use hbarlimit_core::{FeeSchedule, HbarLimitError, Result};
use serde::Serialize;

/// Tinybars per HBAR.
pub const HBAR_TO_TINYBAR: i64 = 100_000_000;

/// The kind of transaction a step is executed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStepKind {
    /// Initial step creating the file with the first chunk.
    FileCreate,
    /// Subsequent step appending one chunk.
    FileAppend,
}

/// Estimated fee of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepFee {
    pub kind: FileStepKind,
    pub fee_tinybars: i64,
}

/// Per-step fees and their total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileTransactionsFeeEstimate {
    /// One entry per step, create first.
    pub steps: Vec<StepFee>,
    /// Sum of all step fees.
    pub total_estimated_fee_tinybars: i64,
}

impl FileTransactionsFeeEstimate {
    /// Number of append steps after the create step.
    #[must_use]
    pub fn append_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.kind == FileStepKind::FileAppend)
            .count()
    }
}

/// Convert a USD-cent price to tinybars at `exchange_rate_cents` per HBAR.
#[must_use]
pub fn cents_to_tinybars(cents: f64, exchange_rate_cents: f64) -> i64 {
    (cents / exchange_rate_cents * HBAR_TO_TINYBAR as f64).round() as i64
}

/// Estimate the total fee of uploading `payload_size` bytes in
/// `chunk_size`-byte steps.
///
/// A zero-size payload still costs one create step.
///
/// # Errors
///
/// Returns [`HbarLimitError::InvalidArguments`] when `chunk_size` is zero or
/// the exchange rate is not a positive finite number.
pub fn estimate_file_transactions_fee(
    payload_size: u64,
    chunk_size: u64,
    exchange_rate_cents: f64,
    schedule: &FeeSchedule,
) -> Result<FileTransactionsFeeEstimate> {
    if chunk_size == 0 {
        return Err(HbarLimitError::InvalidArguments(
            "chunk size must be greater than zero".to_string(),
        ));
    }
    if !exchange_rate_cents.is_finite() || exchange_rate_cents <= 0.0 {
        return Err(HbarLimitError::InvalidArguments(format!(
            "exchange rate must be a positive number of cents, got {exchange_rate_cents}"
        )));
    }

    let total_steps = payload_size.div_ceil(chunk_size).max(1);
    let create_fee = cents_to_tinybars(schedule.file_create_per_5kb_cents, exchange_rate_cents);
    let append_fee = cents_to_tinybars(schedule.file_append_per_5kb_cents, exchange_rate_cents);

    let mut steps = Vec::with_capacity(total_steps as usize);
    steps.push(StepFee {
        kind: FileStepKind::FileCreate,
        fee_tinybars: create_fee,
    });
    for _ in 1..total_steps {
        steps.push(StepFee {
            kind: FileStepKind::FileAppend,
            fee_tinybars: append_fee,
        });
    }
    let total_estimated_fee_tinybars = steps.iter().map(|s| s.fee_tinybars).sum();

    Ok(FileTransactionsFeeEstimate {
        steps,
        total_estimated_fee_tinybars,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
