//! Configuration for the offload pipeline
//!
//! Buffer geometry, the kernel to launch, and the fatal-error policy. Values
//! come from defaults, an optional TOML file, then `DUPLEX_*` environment
//! overrides, in that order.

use crate::error::{Error, Result};
use crate::layout::UnitLayout;
use crate::policy::FailurePolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default kernel entry point
pub const DEFAULT_KERNEL: &str = "device_kernel";

/// Environment override for `buffer_size`
pub const ENV_BUFFER_SIZE: &str = "DUPLEX_BUFFER_SIZE";
/// Environment override for `unit_payload`
pub const ENV_UNIT_PAYLOAD: &str = "DUPLEX_UNIT_PAYLOAD";
/// Environment override for `on_device_error`
pub const ENV_ON_DEVICE_ERROR: &str = "DUPLEX_ON_DEVICE_ERROR";

/// Configuration for the pipeline controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of each transfer buffer in bytes (default: 4MB)
    pub buffer_size: usize,

    /// Payload bytes carried by one unit (default: 64KB)
    pub unit_payload: usize,

    /// Kernel entry point submitted on every pass
    pub kernel: String,

    /// What the top-level caller does with fatal device errors
    pub on_device_error: FailurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4 * 1024 * 1024,
            unit_payload: 64 * 1024,
            kernel: DEFAULT_KERNEL.to_string(),
            on_device_error: FailurePolicy::Abort,
        }
    }
}

impl PipelineConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Small buffers for tests and constrained devices
    pub fn compact() -> Self {
        Self {
            buffer_size: 64 * 1024,
            unit_payload: 4 * 1024,
            ..Self::default()
        }
    }

    /// Set buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set per-unit payload size
    pub fn with_unit_payload(mut self, size: usize) -> Self {
        self.unit_payload = size;
        self
    }

    /// Set kernel entry point
    pub fn with_kernel(mut self, kernel: impl Into<String>) -> Self {
        self.kernel = kernel.into();
        self
    }

    /// Set fatal-error policy
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_device_error = policy;
        self
    }

    /// Slot layout implied by `unit_payload`
    pub fn layout(&self) -> UnitLayout {
        UnitLayout::new(self.unit_payload)
    }

    /// Units that fit in one buffer
    pub fn max_units(&self) -> usize {
        self.layout().max_units(self.buffer_size)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfig("buffer_size must be > 0".to_string()));
        }

        if self.unit_payload == 0 {
            return Err(Error::InvalidConfig("unit_payload must be > 0".to_string()));
        }

        if self.unit_payload > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "unit_payload must be <= {}",
                u32::MAX
            )));
        }

        if self.max_units() == 0 {
            return Err(Error::InvalidConfig(format!(
                "buffer_size {} cannot hold a single {}-byte slot",
                self.buffer_size,
                self.layout().slot_size()
            )));
        }

        if self.kernel.trim().is_empty() {
            return Err(Error::InvalidConfig("kernel must not be empty".to_string()));
        }

        Ok(())
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Apply `DUPLEX_*` environment overrides
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_BUFFER_SIZE) {
            self.buffer_size = parse_size(ENV_BUFFER_SIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_UNIT_PAYLOAD) {
            self.unit_payload = parse_size(ENV_UNIT_PAYLOAD, &value)?;
        }
        if let Some(value) = lookup(ENV_ON_DEVICE_ERROR) {
            self.on_device_error = value.parse()?;
        }
        Ok(self)
    }

    /// Memory held by both transfer buffers
    pub fn memory_requirement(&self) -> usize {
        2 * self.buffer_size
    }
}

fn parse_size(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{key}={value} is not a byte count")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.buffer_size, 4 * 1024 * 1024);
        assert_eq!(config.unit_payload, 64 * 1024);
        assert_eq!(config.kernel, DEFAULT_KERNEL);
        assert_eq!(config.on_device_error, FailurePolicy::Abort);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_units() {
        let config = PipelineConfig::new()
            .with_buffer_size(1000)
            .with_unit_payload(64);
        assert_eq!(config.max_units(), 10);
    }

    #[test]
    fn test_validation_zero_buffer() {
        assert!(PipelineConfig::new().with_buffer_size(0).validate().is_err());
    }

    #[test]
    fn test_validation_zero_payload() {
        assert!(PipelineConfig::new().with_unit_payload(0).validate().is_err());
    }

    #[test]
    fn test_validation_buffer_smaller_than_slot() {
        let config = PipelineConfig::new()
            .with_buffer_size(64)
            .with_unit_payload(64);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_empty_kernel() {
        assert!(PipelineConfig::new().with_kernel("  ").validate().is_err());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = PipelineConfig::from_toml_str(
            r#"
            buffer_size = 8192
            on_device_error = "propagate"
            "#,
        )
        .unwrap();
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.unit_payload, 64 * 1024);
        assert_eq!(config.on_device_error, FailurePolicy::Propagate);
    }

    #[test]
    fn test_from_toml_rejects_bad_policy() {
        let err = PipelineConfig::from_toml_str("on_device_error = \"retry\"").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "unit_payload = 512\nkernel = \"sha_kernel\"").unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.unit_payload, 512);
        assert_eq!(config.kernel, "sha_kernel");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_BUFFER_SIZE, "16384"),
            (ENV_ON_DEVICE_ERROR, "propagate"),
        ]
        .into_iter()
        .collect();

        let config = PipelineConfig::new()
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.buffer_size, 16384);
        assert_eq!(config.on_device_error, FailurePolicy::Propagate);
    }

    #[test]
    fn test_env_override_not_a_number() {
        let result = PipelineConfig::new().apply_overrides(|key| {
            (key == ENV_UNIT_PAYLOAD).then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_memory_requirement() {
        let config = PipelineConfig::compact();
        assert_eq!(config.memory_requirement(), 2 * 64 * 1024);
    }
}
