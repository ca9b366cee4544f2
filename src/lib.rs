//! Facade crate for the mapstore geospatial dataset engine.
//!
//! This crate re-exports the object model, the dataset reader and writer
//! from `mapstore-core`, and the import pipeline from `mapstore-data`.
//! Test doubles are available behind the `test-support` feature.

#![forbid(unsafe_code)]

pub use mapstore_core::{
    Bounds, ConnSetError, DataSourceConn, DatasetInfo, DbConnSet, FileDataSource, FileStorage,
    FinalStorage, InBoundsResult, MemberObject, ObjectKind, OsmNode, OsmRelation, OsmWay,
    RelationData, RelationMember, ResolvedMember, SourceResult, StoreConfig, StoreError,
    TagFilter, TagGroups, Tags, WayPoint,
};
pub use mapstore_data::{
    ElementSource, ImportConfig, ImportReport, IngestError, MemorySource, OsmElement, PbfSource,
    RawWay, import, import_pbf_file,
};

#[cfg(feature = "test-support")]
pub use mapstore_core::test_support;
