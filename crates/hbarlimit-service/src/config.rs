//! YAML configuration loading for the limiter.
//!
//! Loads [`LimiterConfig`] from a YAML file on disk and validates it.

use hbarlimit_core::LimiterConfig;
use std::path::Path;

/// Load and validate a [`LimiterConfig`] from a YAML file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the YAML is invalid, or the
/// configuration fails validation.
pub fn load_config(path: &Path) -> anyhow::Result<LimiterConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
    let config: LimiterConfig = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?;
    Ok(config)
}
