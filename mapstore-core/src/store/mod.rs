//! Read and write contracts for datasets, and the file-backed store.
//!
//! The import pipeline drives a [`FinalStorage`] and commits it into a
//! handle implementing [`DataSourceConn`]. The file-backed implementations
//! are [`FileStorage`] and [`FileDataSource`]; their on-disk layout lives in
//! the [`container`] and [`block`] modules.

use std::error::Error;

use crate::{
    bounds::Bounds,
    model::{DatasetInfo, OsmNode, OsmRelation, OsmWay},
    response::{InBoundsResult, TagFilter},
};

pub mod block;
pub mod collection;
mod config;
pub mod container;
mod error;
mod pool;
mod query;
mod writer;

pub use collection::{BucketedCollection, CollectionError};
pub use config::{
    ConfigError, DEFAULT_BLOCK_SIZE, DEFAULT_FLUSH_EVERY, DEFAULT_HANDLE_POOL_SIZE, StoreConfig,
    require_positive,
};
pub use container::{FORMAT_VERSION, Header, Section};
pub use error::StoreError;
pub use pool::{HandlePool, PooledHandle};
pub use query::FileDataSource;
pub use writer::{FileStorage, work_dir_for};

/// Read access to one committed dataset.
///
/// Implementations are shared across query threads.
///
/// # Examples
///
/// ```rust
/// use mapstore_core::{
///     Bounds, DataSourceConn, DatasetInfo, InBoundsResult, StoreError, TagFilter,
/// };
///
/// struct Empty;
///
/// impl DataSourceConn for Empty {
///     fn name(&self) -> &str {
///         "empty"
///     }
///
///     fn dataset_info(&self) -> Result<DatasetInfo, StoreError> {
///         Ok(DatasetInfo::default())
///     }
///
///     fn get_in_bounds(
///         &self,
///         _bounds: &Bounds,
///         _filter: &TagFilter,
///     ) -> Result<InBoundsResult, StoreError> {
///         Err(StoreError::NoDataForRegion)
///     }
/// }
///
/// assert_eq!(Empty.name(), "empty");
/// ```
pub trait DataSourceConn: Send + Sync {
    /// Human-readable source name.
    fn name(&self) -> &str;

    /// Provenance of the dataset.
    fn dataset_info(&self) -> Result<DatasetInfo, StoreError>;

    /// Objects carrying the filter's tags in the buckets covering `bounds`.
    ///
    /// Fails with [`StoreError::NoDataForRegion`] when `bounds` lies outside
    /// the dataset.
    fn get_in_bounds(
        &self,
        bounds: &Bounds,
        filter: &TagFilter,
    ) -> Result<InBoundsResult, StoreError>;
}

/// Write side of an import run.
///
/// Batches arrive in any kind order. `commit` is the only step that makes
/// data visible; `rollback` discards everything written so far.
pub trait FinalStorage {
    /// Read handle returned by a successful commit.
    type Handle;
    /// Failure raised by the backend.
    type Error: Error + Send + Sync + 'static;

    /// Record the provenance written into the dataset header.
    fn set_dataset_info(&mut self, info: DatasetInfo) -> Result<(), Self::Error>;

    /// Persist a batch of nodes.
    fn import_nodes(&mut self, nodes: &[OsmNode]) -> Result<(), Self::Error>;

    /// Persist a batch of ways whose points carry coordinates.
    fn import_ways(&mut self, ways: &[OsmWay]) -> Result<(), Self::Error>;

    /// Persist a batch of relations.
    fn import_relations(&mut self, relations: &[OsmRelation]) -> Result<(), Self::Error>;

    /// Finish the dataset and open it for reading.
    fn commit(self) -> Result<Self::Handle, Self::Error>;

    /// Abandon the run.
    fn rollback(self) -> Result<(), Self::Error>;
}
