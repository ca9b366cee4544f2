//! Core types and storage engine for the mapstore workspace.
//!
//! The crate defines the OpenStreetMap object model, the spatial tag index
//! that maps `(cell, kind, tag key)` to object ids, and the file-backed
//! dataset format. Datasets are built through the [`FinalStorage`] write
//! contract and queried by bounding box through [`DataSourceConn`].
//!
//! # Examples
//!
//! ```
//! use mapstore_core::{Bounds, ObjectKind, TagFilter, bucket_from_lat_or_lon};
//!
//! let bounds = Bounds::new(51.50, 51.52, -0.13, -0.11);
//! let (lats, _lons) = bounds.bucket_range();
//! assert_eq!(*lats.start(), bucket_from_lat_or_lon(51.50));
//!
//! let filter = TagFilter::new().with(ObjectKind::Way, "highway");
//! assert!(!filter.is_empty());
//! ```
#![forbid(unsafe_code)]

pub mod bounds;
pub mod conn_set;
pub mod model;
pub mod response;
pub mod store;
pub mod tag_index;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use bounds::Bounds;
pub use conn_set::{ConnSetError, DbConnSet, SourceResult};
pub use model::{
    DatasetInfo, DuplicateTagError, ObjectKind, OsmNode, OsmRelation, OsmWay, RelationMember,
    Tags, WayPoint,
};
pub use response::{
    InBoundsResult, MemberObject, RelationData, ResolvedMember, TagFilter, TagGroups,
};
pub use store::{DataSourceConn, FileDataSource, FileStorage, FinalStorage, StoreConfig, StoreError};
pub use tag_index::{TagIndexKey, TagIndexKeyError, bucket_from_lat_or_lon};
