//! CLI command implementations

pub mod hash;
pub mod info;

use anyhow::{Context, Result};
use duplex_core::{FailurePolicy, PipelineConfig};
use std::path::Path;

/// Command-line values that take precedence over file and environment
#[derive(Debug, Default)]
pub struct Overrides {
    pub buffer_size: Option<usize>,
    pub unit_payload: Option<usize>,
    pub on_device_error: Option<FailurePolicy>,
}

/// Resolve the effective configuration
///
/// Defaults, then the TOML file (if any), then `DUPLEX_*` variables, then
/// command-line flags.
pub fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let mut config = config
        .apply_env()
        .context("Invalid DUPLEX_* environment override")?;

    if let Some(size) = overrides.buffer_size {
        config.buffer_size = size;
    }
    if let Some(size) = overrides.unit_payload {
        config.unit_payload = size;
    }
    if let Some(policy) = overrides.on_device_error {
        config.on_device_error = policy;
    }

    config.validate().context("Invalid pipeline configuration")?;
    tracing::debug!(?config, "resolved configuration");
    Ok(config)
}
