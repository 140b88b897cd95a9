//! Cache Parameters
//!
//! Configuration owned by one cache instance. Read on every operation, so a
//! change applies to operations that start after it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default low-memory threshold (256MB available)
pub const DEFAULT_LOW_MEMORY_SIZE_MB: u64 = 256;

/// Default critical memory load (90% of physical memory in use)
pub const DEFAULT_CRITICAL_MEMORY_LOAD_PERCENT: u8 = 90;

/// Default memory check interval (5 seconds)
pub const DEFAULT_CHECK_MEMORY_INTERVAL_MS: u64 = 5_000;

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheParams {
    /// Maximum entries per value type (0 = unbounded)
    pub capacity: usize,
    /// Directory for MemoryAndTempDir mirror files
    pub temp_dir: PathBuf,
    /// Directory for MemoryAndPersist / PersistOnly files
    pub persist_dir: PathBuf,
    /// Available memory below this triggers an eviction sweep
    pub low_memory_size_mb: u64,
    /// Memory load at or above this triggers an eviction sweep (0-100)
    pub critical_memory_load_percent: u8,
    /// Memory monitor polling interval
    pub check_memory_interval_ms: u64,
    /// Run the background memory monitor
    pub monitor_enabled: bool,
    /// LZ4-compress persisted blobs
    pub compress_files: bool,
    /// Share of eviction candidates dropped per memory sweep (1-100)
    pub eviction_batch_percent: u8,
}

impl Default for CacheParams {
    fn default() -> Self {
        let base = std::env::temp_dir().join("tiercache");
        Self {
            capacity: 0,
            temp_dir: base.join("temp"),
            persist_dir: base.join("persist"),
            low_memory_size_mb: DEFAULT_LOW_MEMORY_SIZE_MB,
            critical_memory_load_percent: DEFAULT_CRITICAL_MEMORY_LOAD_PERCENT,
            check_memory_interval_ms: DEFAULT_CHECK_MEMORY_INTERVAL_MS,
            monitor_enabled: true,
            compress_files: false,
            eviction_batch_percent: 25,
        }
    }
}

impl CacheParams {
    /// Parameters rooted under a single directory
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            temp_dir: root.join("temp"),
            persist_dir: root.join("persist"),
            ..Default::default()
        }
    }

    /// Parse parameters from YAML; missing fields keep their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let params: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// Load parameters from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.critical_memory_load_percent > 100 {
            return Err(Error::Config(format!(
                "critical_memory_load_percent must be 0-100, got {}",
                self.critical_memory_load_percent
            )));
        }
        if self.eviction_batch_percent == 0 || self.eviction_batch_percent > 100 {
            return Err(Error::Config(format!(
                "eviction_batch_percent must be 1-100, got {}",
                self.eviction_batch_percent
            )));
        }
        if self.temp_dir.as_os_str().is_empty() || self.persist_dir.as_os_str().is_empty() {
            return Err(Error::Config("temp_dir and persist_dir must be set".into()));
        }
        if self.monitor_enabled && self.check_memory_interval_ms == 0 {
            return Err(Error::Config(
                "check_memory_interval_ms must be positive when the monitor is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Memory check interval as a Duration
    pub fn check_memory_interval(&self) -> Duration {
        Duration::from_millis(self.check_memory_interval_ms)
    }

    /// Low-memory threshold in bytes
    pub fn low_memory_bytes(&self) -> u64 {
        self.low_memory_size_mb.saturating_mul(1024 * 1024)
    }

    /// Capacity as an optional ceiling
    pub fn capacity_limit(&self) -> Option<usize> {
        (self.capacity > 0).then_some(self.capacity)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_are_valid() {
        let params = CacheParams::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.capacity_limit(), None);
        assert_eq!(params.check_memory_interval(), Duration::from_secs(5));
        assert_eq!(params.low_memory_bytes(), 256 * 1024 * 1024);
    }

    #[test]
    fn test_with_root() {
        let params = CacheParams::with_root("/var/cache/app");
        assert_eq!(params.temp_dir, PathBuf::from("/var/cache/app/temp"));
        assert_eq!(params.persist_dir, PathBuf::from("/var/cache/app/persist"));
    }

    #[test]
    fn test_yaml_partial_override() {
        let params = CacheParams::from_yaml_str(
            "capacity: 100\ncritical_memory_load_percent: 75\npersist_dir: /data/cache\n",
        )
        .unwrap();
        assert_eq!(params.capacity_limit(), Some(100));
        assert_eq!(params.critical_memory_load_percent, 75);
        assert_eq!(params.persist_dir, PathBuf::from("/data/cache"));
        assert_eq!(params.low_memory_size_mb, DEFAULT_LOW_MEMORY_SIZE_MB);
    }

    #[test]
    fn test_invalid_percent_rejected() {
        let result = CacheParams::from_yaml_str("critical_memory_load_percent: 101\n");
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[test]
    fn test_zero_interval_rejected_when_monitoring() {
        let params = CacheParams {
            check_memory_interval_ms: 0,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        let params = CacheParams {
            check_memory_interval_ms: 0,
            monitor_enabled: false,
            ..Default::default()
        };
        assert!(params.validate().is_ok());
    }
}
