//! Import pipeline turning OpenStreetMap extracts into mapstore datasets.
//!
//! Responsibilities:
//! - Stream elements from PBF files or in-memory fixtures.
//! - Batch same-kind elements and resolve way nodes before writing.
//! - Drive bounded imports to a fixed point over repeated scans.
//! - Commit on success and roll back on any failure.
//!
//! Boundaries:
//! - Storage formats live in `mapstore-core`; this crate only talks to the
//!   [`FinalStorage`](mapstore_core::FinalStorage) write contract.
//! - Imports are single-threaded; throttling is the only pacing control.
//!
//! Invariants:
//! - Every element source scan starts from the beginning of the input.
//! - No global mutable state.

pub mod ingest;

pub use ingest::{
    BatchThrottle, ElementSource, ImportConfig, ImportReport, IngestError, MemorySource,
    OsmElement, PbfSource, RawWay, import, import_pbf_file,
};
