use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::measurement::DEFAULT_RETRY_INTERVAL;
use crate::programmer::DEFAULT_PROGRAMMER_TIMEOUT;
use crate::serial::{DEFAULT_BAUD, DEFAULT_TIMEOUT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid bench configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub device: String,
    pub baud: u32,
    pub timeout_ms: u64,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            baud: DEFAULT_BAUD,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl PortConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Bench-level settings shared by every test program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Serve all I/O from queued data instead of hardware.
    pub fifo: bool,
    pub retry_interval_ms: u64,
    pub programmer_timeout_s: u64,
    pub ports: HashMap<String, PortConfig>,
    pub results_path: Option<PathBuf>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            fifo: false,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            programmer_timeout_s: DEFAULT_PROGRAMMER_TIMEOUT.as_secs(),
            ports: HashMap::new(),
            results_path: None,
        }
    }
}

impl BenchConfig {
    pub fn fifo() -> Self {
        Self {
            fifo: true,
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn programmer_timeout(&self) -> Duration {
        Duration::from_secs(self.programmer_timeout_s)
    }

    /// Settings for a logical port; unknown names fall back to defaults
    /// with the name used as the device path.
    pub fn port(&self, name: &str) -> PortConfig {
        self.ports.get(name).cloned().unwrap_or_else(|| PortConfig {
            device: name.to_string(),
            ..PortConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = BenchConfig::from_json_str(r#"{"fifo": true, "ports": {"uut": {"device": "/dev/ttyUSB0"}}}"#).unwrap();
        assert!(config.fifo);
        assert_eq!(config.programmer_timeout(), Duration::from_secs(60));
        assert_eq!(config.retry_interval(), Duration::from_millis(200));
        let port = config.port("uut");
        assert_eq!(port.device, "/dev/ttyUSB0");
        assert_eq!(port.baud, 115_200);
    }

    #[test]
    fn test_unknown_port_uses_name() {
        let config = BenchConfig::default();
        assert_eq!(config.port("/dev/ttyS1").device, "/dev/ttyS1");
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(BenchConfig::from_json_str("{fifo"), Err(ConfigError::Parse(_))));
    }
}
