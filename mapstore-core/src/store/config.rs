//! Tunables for building and reading dataset files.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Records per block in every committed section.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Writes between flushes of cold buckets in the build-time collections.
pub const DEFAULT_FLUSH_EVERY: usize = 1000;

/// Pre-opened read handles per dataset file.
pub const DEFAULT_HANDLE_POOL_SIZE: usize = 8;

/// Configuration shared by the writer and the query engine.
///
/// Missing fields fall back to their defaults when deserialising.
///
/// # Examples
/// ```
/// use mapstore_core::StoreConfig;
///
/// let config = StoreConfig::default();
/// assert_eq!(config.block_size, 8192);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum records per section block.
    pub block_size: usize,
    /// Writes between flushes of every bucket except the one being written.
    pub flush_every: usize,
    /// Number of file handles a dataset keeps open for queries.
    pub handle_pool_size: usize,
    /// Keep the working directory after commit or rollback, for debugging.
    pub keep_work_dir: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            flush_every: DEFAULT_FLUSH_EVERY,
            handle_pool_size: DEFAULT_HANDLE_POOL_SIZE,
            keep_work_dir: false,
        }
    }
}

impl StoreConfig {
    /// Reject settings that would stall the writer or the handle pool.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("block_size", self.block_size)?;
        require_positive("flush_every", self.flush_every)?;
        require_positive("handle_pool_size", self.handle_pool_size)
    }
}

/// Invalid configuration values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A size that must be at least one was zero.
    #[error("{field} must be greater than zero")]
    Zero {
        /// Name of the offending setting.
        field: &'static str,
    },
}

/// Fail with [`ConfigError::Zero`] when `value` is zero.
pub fn require_positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { field })
    } else {
        Ok(())
    }
}
