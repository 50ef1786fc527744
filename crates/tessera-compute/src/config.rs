//! TOML runtime configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::backend::ComputeError;

/// Per-process runtime resources.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuntimeConfig {
    /// Number of simulated accelerators. Default: 0.
    #[serde(default)]
    pub devices: usize,
    /// Memory pool of each accelerator in bytes. Default: 1 GiB.
    #[serde(default = "default_device_memory")]
    pub device_memory_bytes: usize,
    /// Receive timeout in milliseconds; 0 waits forever. Default: 60 s.
    #[serde(default = "default_comm_timeout_ms")]
    pub comm_timeout_ms: u64,
}

fn default_device_memory() -> usize {
    1 << 30
}

fn default_comm_timeout_ms() -> u64 {
    60_000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            devices: 0,
            device_memory_bytes: default_device_memory(),
            comm_timeout_ms: default_comm_timeout_ms(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ComputeError> {
        toml::from_str(content)
            .map_err(|e| ComputeError::Unavailable(format!("invalid runtime configuration: {e}")))
    }

    /// Load and parse a TOML runtime configuration file.
    pub fn load(path: &std::path::Path) -> Result<Self, ComputeError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ComputeError::Unavailable(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn comm_timeout(&self) -> Option<Duration> {
        (self.comm_timeout_ms > 0).then(|| Duration::from_millis(self.comm_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config = RuntimeConfig::from_toml_str("devices = 2").unwrap();
        assert_eq!(config.devices, 2);
        assert_eq!(config.device_memory_bytes, 1 << 30);
        assert_eq!(config.comm_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_zero_timeout_waits_forever() {
        let config = RuntimeConfig::from_toml_str(
            "devices = 1\ndevice_memory_bytes = 4096\ncomm_timeout_ms = 0\n",
        )
        .unwrap();
        assert_eq!(config.device_memory_bytes, 4096);
        assert_eq!(config.comm_timeout(), None);
    }

    #[test]
    fn test_malformed_config_is_rejected() {
        assert!(RuntimeConfig::from_toml_str("devices = \"many\"").is_err());
    }
}
