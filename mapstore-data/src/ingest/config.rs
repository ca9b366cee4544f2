//! Tunables for an import run.

use mapstore_core::store::{ConfigError, StoreConfig, require_positive};
use serde::{Deserialize, Serialize};

/// Records per same-kind batch handed to storage.
pub const DEFAULT_BATCH_SIZE: usize = 50_000;

/// Batches per second before the throttle makes the pipeline wait.
pub const DEFAULT_MAX_BATCHES_PER_SEC: u32 = 10;

/// Safety cap on bounded-import passes.
pub const DEFAULT_MAX_PASSES: usize = 10_000;

/// Settings for the import pipelines and the storage they write to.
///
/// # Examples
/// ```
/// use mapstore_data::ImportConfig;
///
/// let config: ImportConfig = serde_json::from_str(r#"{"batch_size": 500}"#).unwrap();
/// assert_eq!(config.batch_size, 500);
/// assert_eq!(config.max_passes, 10_000);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Maximum records per batch.
    pub batch_size: usize,
    /// Batches allowed per second; zero disables throttling.
    pub max_batches_per_sec: u32,
    /// Passes a bounded import may run before giving up.
    pub max_passes: usize,
    /// Settings for the dataset being written.
    pub store: StoreConfig,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_batches_per_sec: DEFAULT_MAX_BATCHES_PER_SEC,
            max_passes: DEFAULT_MAX_PASSES,
            store: StoreConfig::default(),
        }
    }
}

impl ImportConfig {
    /// Reject zero batch sizes, zero pass caps and invalid store settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("batch_size", self.batch_size)?;
        require_positive("max_passes", self.max_passes)?;
        self.store.validate()
    }

    /// Unthrottled settings with the given batch size, convenient for tests
    /// and small extracts.
    #[must_use]
    pub fn unthrottled(batch_size: usize) -> Self {
        Self {
            batch_size,
            max_batches_per_sec: 0,
            ..Self::default()
        }
    }
}
