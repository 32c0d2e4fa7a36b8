//! `hbarlimit` command-line tool.
//!
//! Offline helpers for operators: estimate the fee of a chunked file upload
//! and validate a limiter configuration file.
//!
//! Usage:
//!   hbarlimit estimate --payload-size 12000 --exchange-rate-cents 12
//!   hbarlimit check-config config/hbarlimit.yaml

use clap::{Parser, Subcommand};
use hbarlimit_core::{LimiterConfig, LoggingConfig, SubscriptionTier};
use hbarlimit_service::config::load_config;
use hbarlimit_service::fee::estimate_file_transactions_fee;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "hbarlimit", about = "HBAR spending limiter tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Estimate the fee of uploading a payload as chunked file transactions.
    Estimate {
        /// Payload size in bytes.
        #[arg(long)]
        payload_size: u64,

        /// Current exchange rate in US cents per HBAR.
        #[arg(long)]
        exchange_rate_cents: f64,

        /// Chunk size in bytes (defaults to the configured file chunk size).
        #[arg(long)]
        chunk_size: Option<u64>,

        /// Limiter configuration supplying the fee schedule.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Load and validate a limiter configuration file.
    CheckConfig {
        /// Path to the YAML configuration.
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Command::Estimate {
            config: Some(path), ..
        } => load_config(path)?,
        Command::CheckConfig { path } => load_config(path)?,
        Command::Estimate { config: None, .. } => LimiterConfig::default(),
    };
    init_logging(&config.logging);

    match cli.command {
        Command::Estimate {
            payload_size,
            exchange_rate_cents,
            chunk_size,
            ..
        } => {
            let chunk_size = chunk_size.unwrap_or(config.budget.file_chunk_size);
            let estimate = estimate_file_transactions_fee(
                payload_size,
                chunk_size,
                exchange_rate_cents,
                &config.fee_schedule,
            )?;
            info!(
                payload_size,
                chunk_size,
                total = estimate.total_estimated_fee_tinybars,
                "Estimated file transaction fees"
            );
            println!("{}", serde_json::to_string_pretty(&estimate)?);
        }
        Command::CheckConfig { path } => {
            println!("{}: OK", path.display());
            print_summary(&config);
        }
    }
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_summary(config: &LimiterConfig) {
    println!("  enabled:            {}", config.enabled);
    println!(
        "  total budget:       {} tinybars",
        config.budget.total_budget_tinybars
    );
    println!(
        "  reset interval:     {}s",
        config.budget.reset_interval_secs
    );
    println!("  file chunk size:    {} bytes", config.budget.file_chunk_size);
    for tier in SubscriptionTier::ALL {
        println!(
            "  {:<20}{} tinybars/day",
            format!("{tier} limit:"),
            config.budget.tier_limits.limit_for(tier)
        );
    }
    println!("  storage profile:    {}", config.storage.profile);
}
