//! Errors raised while writing or reading dataset files.

use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

use super::{collection::CollectionError, config::ConfigError, container::Section};
use crate::tag_index::TagIndexKeyError;

/// Errors raised by the dataset writer and query engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing a dataset file failed.
    #[error("I/O failed for {path}")]
    Io {
        /// File being accessed.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A record or header could not be serialised.
    #[error("failed to encode {context}")]
    Encode {
        /// What was being encoded.
        context: String,
        /// Encoder failure from `bincode`.
        #[source]
        source: bincode::Error,
    },
    /// A record or header on disk is malformed.
    #[error("failed to decode {context}")]
    Decode {
        /// What was being decoded.
        context: String,
        /// Decoder failure from `bincode`.
        #[source]
        source: bincode::Error,
    },
    /// The serialised header does not fit its 32-bit length prefix.
    #[error("header of {len} bytes exceeds the 32-bit length prefix")]
    HeaderTooLarge {
        /// Serialised header length.
        len: usize,
    },
    /// The file was written by an incompatible format version.
    #[error("unsupported dataset format version {found}; expected {supported}")]
    UnsupportedVersion {
        /// Version recorded in the file.
        found: u32,
        /// Version this build reads.
        supported: u32,
    },
    /// Block keys in a section are not strictly ascending.
    #[error("{section} section is not sorted at block {block}")]
    UnsortedSection {
        /// Offending section.
        section: Section,
        /// Index of the first out-of-order block.
        block: usize,
    },
    /// Section blocks point past the end of the file.
    #[error("{section} section extends past the end of the file")]
    SectionOutOfRange {
        /// Offending section.
        section: Section,
    },
    /// A record referenced by the tag index is missing from its section.
    #[error("{section} record {id} referenced by the tag index is missing")]
    MissingRecord {
        /// Section that should hold the record.
        section: Section,
        /// Identifier of the missing record.
        id: i64,
    },
    /// The query box does not overlap the dataset's bounds.
    #[error("dataset has no data for the requested region")]
    NoDataForRegion,
    /// The read-handle pool can no longer hand out handles.
    #[error("file handle pool for {path} is closed")]
    HandlePool {
        /// Dataset the pool serves.
        path: Utf8PathBuf,
    },
    /// A build-time collection failed.
    #[error(transparent)]
    Collection(#[from] CollectionError),
    /// A stored tag-index key is malformed.
    #[error(transparent)]
    TagIndexKey(#[from] TagIndexKeyError),
    /// Store settings are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The working directory could not be created or removed.
    #[error("failed to manage working directory {path}")]
    WorkDir {
        /// Working directory path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}
