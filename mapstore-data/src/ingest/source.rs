//! Element sources feeding the import pipelines.
//!
//! A source can be scanned any number of times. Each scan replays the input
//! from the start, which lets the same source act as the auxiliary reader
//! when way nodes need resolving.

use std::{
    cell::Cell,
    path::{Path, PathBuf},
};

use log::debug;
use mapstore_core::{Bounds, DatasetInfo, ObjectKind, OsmNode, OsmRelation, Tags};
use osmpbf::{Blob, BlobDecode, BlobReader, ElementReader};

use super::{IngestError, convert};

/// A way as read from the source, before its nodes are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawWay {
    /// Dataset-unique identifier.
    pub id: i64,
    /// Free-form tags.
    pub tags: Tags,
    /// Referenced node ids in path order.
    pub node_ids: Vec<i64>,
}

/// One element of an OSM stream.
#[derive(Debug, Clone, PartialEq)]
pub enum OsmElement {
    /// A node, dense or not.
    Node(OsmNode),
    /// A way with unresolved node references.
    Way(RawWay),
    /// A relation.
    Relation(OsmRelation),
}

impl OsmElement {
    /// Identifier of the wrapped object.
    #[must_use]
    pub const fn id(&self) -> i64 {
        match self {
            Self::Node(node) => node.id,
            Self::Way(way) => way.id,
            Self::Relation(relation) => relation.id,
        }
    }

    /// Kind of the wrapped object.
    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        match self {
            Self::Node(_) => ObjectKind::Node,
            Self::Way(_) => ObjectKind::Way,
            Self::Relation(_) => ObjectKind::Relation,
        }
    }
}

/// Callback receiving each element of a scan. Returning an error stops
/// processing and the scan reports that error.
pub type Visit<'a> = dyn FnMut(OsmElement) -> Result<(), IngestError> + 'a;

/// A replayable stream of OSM elements.
pub trait ElementSource {
    /// Provenance from the source header, when it carries any.
    fn dataset_info(&self) -> Result<Option<DatasetInfo>, IngestError>;

    /// Feed every element, in source order, to `visit`.
    fn scan(&self, visit: &mut Visit<'_>) -> Result<(), IngestError>;
}

/// Elements read from an `.osm.pbf` file.
#[derive(Debug, Clone)]
pub struct PbfSource {
    path: PathBuf,
}

impl PbfSource {
    /// Open `path`, failing early when the file cannot be read.
    ///
    /// # Examples
    /// ```no_run
    /// use std::path::Path;
    /// use mapstore_data::{ElementSource, PbfSource};
    ///
    /// # fn main() -> Result<(), mapstore_data::IngestError> {
    /// let source = PbfSource::open(Path::new("berlin.osm.pbf"))?;
    /// let mut ways = 0;
    /// source.scan(&mut |element| {
    ///     if matches!(element, mapstore_data::OsmElement::Way(_)) {
    ///         ways += 1;
    ///     }
    ///     Ok(())
    /// })?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn open(path: &Path) -> Result<Self, IngestError> {
        ElementReader::from_path(path).map_err(|source| IngestError::Open {
            source,
            path: path.to_path_buf(),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Location of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_error(&self, source: osmpbf::Error) -> IngestError {
        IngestError::Open {
            source,
            path: self.path.clone(),
        }
    }

    fn decode_error(&self, source: osmpbf::Error) -> IngestError {
        IngestError::Decode {
            source,
            path: self.path.clone(),
        }
    }

    /// Elements of one data blob, or `None` for header and unknown blobs.
    fn data_block(
        &self,
        blob: Result<Blob, osmpbf::Error>,
    ) -> Result<Option<Vec<OsmElement>>, IngestError> {
        let blob = blob.map_err(|source| self.decode_error(source))?;
        match blob.decode().map_err(|source| self.decode_error(source))? {
            BlobDecode::OsmData(block) => block
                .elements()
                .map(|element| convert::element(element, &self.path))
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            BlobDecode::OsmHeader(_) | BlobDecode::Unknown(_) => Ok(None),
        }
    }
}

impl ElementSource for PbfSource {
    fn dataset_info(&self) -> Result<Option<DatasetInfo>, IngestError> {
        let reader =
            BlobReader::from_path(&self.path).map_err(|source| self.open_error(source))?;
        for blob in reader {
            let blob = blob.map_err(|source| self.decode_error(source))?;
            match blob.decode().map_err(|source| self.decode_error(source))? {
                BlobDecode::OsmHeader(header) => {
                    let Some(bbox) = header.bbox() else {
                        debug!("{} has no header bounding box", self.path.display());
                        return Ok(None);
                    };
                    let seconds = header.osmosis_replication_timestamp().unwrap_or_default();
                    return Ok(Some(DatasetInfo {
                        bounds: Bounds::new(bbox.bottom, bbox.top, bbox.left, bbox.right),
                        replication_time_ms: seconds.saturating_mul(1000),
                    }));
                }
                BlobDecode::OsmData(_) => break,
                BlobDecode::Unknown(_) => {}
            }
        }
        Ok(None)
    }

    fn scan(&self, visit: &mut Visit<'_>) -> Result<(), IngestError> {
        let reader =
            BlobReader::from_path(&self.path).map_err(|source| self.open_error(source))?;
        let blocks = reader.filter_map(|blob| self.data_block(blob).transpose());
        visit_blocks(blocks, visit)
    }
}

/// Feed decoded blocks to `visit` in order.
///
/// Blocks are pulled lazily, so nothing after the first failure is decoded.
fn visit_blocks<I>(blocks: I, visit: &mut Visit<'_>) -> Result<(), IngestError>
where
    I: IntoIterator<Item = Result<Vec<OsmElement>, IngestError>>,
{
    for block in blocks {
        for element in block? {
            visit(element)?;
        }
    }
    Ok(())
}

/// Elements held in memory, mostly for tests and synthetic datasets.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    info: Option<DatasetInfo>,
    elements: Vec<OsmElement>,
    scans: Cell<usize>,
}

impl MemorySource {
    /// Replay `elements` in the given order.
    ///
    /// # Examples
    /// ```
    /// use mapstore_core::{OsmNode, Tags};
    /// use mapstore_data::{ElementSource, MemorySource, OsmElement};
    ///
    /// let source = MemorySource::new(vec![OsmElement::Node(OsmNode {
    ///     id: 1,
    ///     lat: 51.5,
    ///     lon: -0.12,
    ///     tags: Tags::new(),
    /// })]);
    /// let mut ids = Vec::new();
    /// source
    ///     .scan(&mut |element| {
    ///         ids.push(element.id());
    ///         Ok(())
    ///     })
    ///     .unwrap();
    /// assert_eq!(ids, [1]);
    /// assert_eq!(source.scans(), 1);
    /// ```
    #[must_use]
    pub fn new(elements: Vec<OsmElement>) -> Self {
        Self {
            info: None,
            elements,
            scans: Cell::new(0),
        }
    }

    /// Report `info` as the header provenance.
    #[must_use]
    pub fn with_info(mut self, info: DatasetInfo) -> Self {
        self.info = Some(info);
        self
    }

    /// Number of scans started so far.
    #[must_use]
    pub fn scans(&self) -> usize {
        self.scans.get()
    }
}

impl ElementSource for MemorySource {
    fn dataset_info(&self) -> Result<Option<DatasetInfo>, IngestError> {
        Ok(self.info)
    }

    fn scan(&self, visit: &mut Visit<'_>) -> Result<(), IngestError> {
        self.scans.set(self.scans.get() + 1);
        self.elements.iter().cloned().try_for_each(visit)
    }
}
