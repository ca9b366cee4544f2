use std::{
    error::Error as StdError,
    path::{Path, PathBuf},
};

use camino::Utf8Path;
use log::{info, warn};
use mapstore_core::{
    Bounds, DuplicateTagError, FileDataSource, FileStorage, FinalStorage, ObjectKind,
    store::ConfigError,
};
use thiserror::Error;

mod bounded;
mod config;
mod convert;
mod report;
mod sink;
mod source;
mod throttle;
mod unbounded;

pub use config::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_BATCHES_PER_SEC, DEFAULT_MAX_PASSES, ImportConfig,
};
pub use report::ImportReport;
pub use source::{ElementSource, MemorySource, OsmElement, PbfSource, RawWay, Visit};
pub use throttle::BatchThrottle;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors returned while importing OSM data.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The PBF file could not be opened.
    #[error("failed to open OSM PBF file at {path:?}")]
    Open {
        #[source]
        source: osmpbf::Error,
        path: PathBuf,
    },
    /// The PBF file is malformed.
    #[error("failed to decode OSM PBF data at {path:?}")]
    Decode {
        #[source]
        source: osmpbf::Error,
        path: PathBuf,
    },
    /// An object repeats a tag key.
    #[error("{kind} {id} has a repeated tag key")]
    DuplicateTag {
        kind: ObjectKind,
        id: i64,
        #[source]
        source: DuplicateTagError,
    },
    /// A way batch references nodes the source does not contain.
    #[error("resolved only {resolved} of {wanted} nodes referenced by a way batch")]
    UnresolvedNodes { wanted: usize, resolved: usize },
    /// A bounded import kept discovering work.
    #[error("bounded import did not settle within {passes} passes")]
    PassLimit { passes: usize },
    /// The import settings are unusable.
    #[error("invalid import configuration")]
    Config(#[from] ConfigError),
    /// The storage backend rejected a batch or the commit.
    #[error("storage backend failed")]
    Storage(#[source] BoxError),
    /// The import failed and so did the rollback.
    #[error("rollback failed after import error: {cause}")]
    Rollback {
        cause: Box<IngestError>,
        #[source]
        source: BoxError,
    },
}

pub(crate) fn storage_error<E>(err: E) -> IngestError
where
    E: StdError + Send + Sync + 'static,
{
    IngestError::Storage(Box::new(err))
}

/// Import every element of `source` into `storage`, or only the part of it
/// inside `bounds`.
///
/// Storage is committed when the pipeline finishes and rolled back on any
/// failure, so an error never leaves a partial dataset visible.
///
/// # Examples
/// ```
/// use mapstore_core::{OsmNode, Tags, test_support::RecordingStorage};
/// use mapstore_data::{ImportConfig, MemorySource, OsmElement, import};
///
/// let source = MemorySource::new(vec![OsmElement::Node(OsmNode {
///     id: 1,
///     lat: 51.5,
///     lon: -0.12,
///     tags: Tags::from_pairs([("amenity", "bench")]).unwrap(),
/// })]);
/// let (recorded, report) =
///     import(&source, RecordingStorage::new(), None, &ImportConfig::unthrottled(100)).unwrap();
/// assert_eq!(recorded.node_ids(), [1]);
/// assert_eq!(report.nodes_imported, 1);
/// ```
pub fn import<S, F>(
    source: &S,
    mut storage: F,
    bounds: Option<Bounds>,
    config: &ImportConfig,
) -> Result<(F::Handle, ImportReport), IngestError>
where
    S: ElementSource + ?Sized,
    F: FinalStorage,
{
    let outcome = config
        .validate()
        .map_err(IngestError::from)
        .and_then(|()| match bounds {
            Some(bounds) => bounded::run(source, &mut storage, bounds, config),
            None => unbounded::run(source, &mut storage, config),
        });
    match outcome {
        Ok(report) => {
            let handle = storage.commit().map_err(storage_error)?;
            info!("Committed import after {} passes", report.passes);
            Ok((handle, report))
        }
        Err(err) => {
            warn!("Import failed, rolling back: {err}");
            match storage.rollback() {
                Ok(()) => Err(err),
                Err(source) => Err(IngestError::Rollback {
                    cause: Box::new(err),
                    source: Box::new(source),
                }),
            }
        }
    }
}

/// Import a PBF file into a dataset file at `output`.
///
/// # Examples
/// ```no_run
/// use std::path::Path;
/// use camino::Utf8Path;
/// use mapstore_core::{DataSourceConn, ObjectKind, TagFilter};
/// use mapstore_data::{ImportConfig, import_pbf_file};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let (dataset, report) = import_pbf_file(
///     Path::new("berlin.osm.pbf"),
///     Utf8Path::new("berlin.mapstore"),
///     None,
///     &ImportConfig::default(),
/// )?;
/// println!("{} ways imported", report.ways_imported);
/// let bounds = dataset.dataset_info()?.bounds;
/// let filter = TagFilter::new().with(ObjectKind::Way, "highway");
/// let roads = dataset.get_in_bounds(&bounds, &filter)?;
/// println!("{} roads", roads.object_count());
/// # Ok(())
/// # }
/// ```
pub fn import_pbf_file(
    path: &Path,
    output: &Utf8Path,
    bounds: Option<Bounds>,
    config: &ImportConfig,
) -> Result<(FileDataSource, ImportReport), IngestError> {
    let source = PbfSource::open(path)?;
    let storage = FileStorage::create(output, config.store.clone()).map_err(storage_error)?;
    import(&source, storage, bounds, config)
}
