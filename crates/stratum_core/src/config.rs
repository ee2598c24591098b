//! # Store Configuration
//!
//! Loaded once at startup, usually from a TOML file:
//!
//! ```toml
//! chunk_bytes = 16384
//! max_chunk_rows = 128
//! worker_threads = 4
//! access_checks = true
//! ```
//!
//! Missing keys fall back to [`StoreConfig::default`].

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Default chunk block size in bytes (16 KiB).
pub const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;

/// Default upper bound on rows per chunk.
pub const DEFAULT_MAX_CHUNK_ROWS: usize = 128;

/// Smallest accepted chunk block size.
pub const MIN_CHUNK_BYTES: usize = 64;

/// Configuration of a [`crate::World`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Fixed size of every chunk block in bytes.
    pub chunk_bytes: usize,
    /// Upper bound on rows per chunk, independent of row stride.
    pub max_chunk_rows: usize,
    /// Worker threads in the job pool. `0` uses the available parallelism.
    pub worker_threads: usize,
    /// Fail main-thread access that conflicts with an outstanding job. When
    /// off, main-thread access first waits for every outstanding job.
    pub access_checks: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            max_chunk_rows: DEFAULT_MAX_CHUNK_ROWS,
            worker_threads: 0,
            access_checks: true,
        }
    }
}

impl StoreConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] on malformed TOML, unknown keys
    /// or values rejected by [`StoreConfig::validate`].
    pub fn from_toml_str(source: &str) -> StoreResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Returns a copy with a different chunk block size.
    #[must_use]
    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes;
        self
    }

    /// Returns a copy with a different row cap.
    #[must_use]
    pub fn with_max_chunk_rows(mut self, max_chunk_rows: usize) -> Self {
        self.max_chunk_rows = max_chunk_rows;
        self
    }

    /// Returns a copy with a fixed worker count.
    #[must_use]
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Returns a copy with main-thread access checks switched on or off.
    #[must_use]
    pub fn with_access_checks(mut self, access_checks: bool) -> Self {
        self.access_checks = access_checks;
        self
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] when the chunk size is below
    /// [`MIN_CHUNK_BYTES`] or not a multiple of 8, or when the row cap is zero.
    pub fn validate(&self) -> StoreResult<()> {
        if self.chunk_bytes < MIN_CHUNK_BYTES {
            return Err(StoreError::InvalidConfig(format!(
                "chunk_bytes must be at least {MIN_CHUNK_BYTES}, got {}",
                self.chunk_bytes
            )));
        }
        if self.chunk_bytes % 8 != 0 {
            return Err(StoreError::InvalidConfig(format!(
                "chunk_bytes must be a multiple of 8, got {}",
                self.chunk_bytes
            )));
        }
        if self.max_chunk_rows == 0 {
            return Err(StoreError::InvalidConfig(
                "max_chunk_rows must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker count after resolving `0` to the machine's parallelism.
    #[must_use]
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_bytes, 16 * 1024);
        assert!(config.resolved_worker_threads() >= 1);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = StoreConfig::from_toml_str("worker_threads = 3\n").unwrap();
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.max_chunk_rows, DEFAULT_MAX_CHUNK_ROWS);
        assert!(config.access_checks);
    }

    #[test]
    fn test_rejects_tiny_chunks() {
        let err = StoreConfig::from_toml_str("chunk_bytes = 16\n").unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = StoreConfig::from_toml_str("chunk_size = 4096\n").unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfig(_)));
    }
}
