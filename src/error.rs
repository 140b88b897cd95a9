//! Error types for the object cache

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building, loading or clearing cache items
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Key Lock Errors
    // =========================================================================
    /// The calling context is already building this key
    #[error("Reentrant build of {type_name} [{key}]: the current context already owns this key")]
    Reentrance { type_name: String, key: String },

    /// Gave up waiting for another context's build of the same key
    #[error("Timed out after {timeout:?} waiting for build of {type_name} [{key}]")]
    LockTimeout {
        type_name: String,
        key: String,
        timeout: Duration,
    },

    // =========================================================================
    // Build Errors
    // =========================================================================
    /// Error raised by a cache item factory
    #[error("Cache item factory failed: {0}")]
    Factory(#[source] anyhow::Error),

    /// Empty or otherwise unusable key sequence
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Persisted file for a key does not exist (or belongs to another key)
    #[error("Persisted file missing: {}", path.display())]
    PersistedFileMissing { path: PathBuf },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Memory monitor thread could not be started
    #[error("Failed to start memory monitor: {0}")]
    MonitorSpawn(#[source] std::io::Error),
}

impl Error {
    /// Convert a factory failure into a cache error.
    ///
    /// Cache errors raised by nested `get_item` calls inside a factory keep
    /// their variant so the outer caller sees the original failure class.
    pub(crate) fn from_factory(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(cache_err) => cache_err,
            Err(other) => Error::Factory(other),
        }
    }

    /// True for lock-acquisition failures (reentrance or timeout)
    pub fn is_lock_error(&self) -> bool {
        matches!(self, Error::Reentrance { .. } | Error::LockTimeout { .. })
    }

    /// True when a persisted blob was not found on disk
    pub fn is_missing_file(&self) -> bool {
        matches!(self, Error::PersistedFileMissing { .. })
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
    fn test_factory_error_wrapped() {
        let err = Error::from_factory(anyhow::anyhow!("database offline"));
        assert_matches!(err, Error::Factory(_));
        assert!(err.to_string().contains("database offline"));
    }

    #[test]
    fn test_nested_cache_error_unwrapped() {
        let inner = Error::LockTimeout {
            type_name: "u32".into(),
            key: "2".into(),
            timeout: Duration::from_millis(50),
        };
        let err = Error::from_factory(anyhow::Error::new(inner));
        assert_matches!(err, Error::LockTimeout { .. });
        assert!(err.is_lock_error());
    }

    #[test]
    fn test_factory_error_downcast_preserved() {
        #[derive(Debug, thiserror::Error)]
        #[error("custom")]
        struct Custom;

        let err = Error::from_factory(anyhow::Error::new(Custom));
        match err {
            Error::Factory(inner) => assert!(inner.downcast_ref::<Custom>().is_some()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_display() {
        let err = Error::PersistedFileMissing {
            path: PathBuf::from("/tmp/x.cache"),
        };
        assert!(err.is_missing_file());
        assert_eq!(err.to_string(), "Persisted file missing: /tmp/x.cache");
    }
}
