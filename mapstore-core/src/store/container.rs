//! Committed dataset file layout.
//!
//! ```text
//! [u32 LE header length][bincode Header][nodes][ways][relations][tag index]
//! ```
//!
//! Sections carry no markers. Each section starts where the previous one
//! ends, so readers derive section offsets from the header length and the
//! block metadata of the preceding sections.

use std::{
    fmt,
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
};

use bincode::{deserialize, serialize};
use camino::Utf8Path;
use log::info;
use serde::{Deserialize, Serialize};

use super::{block::SectionMetadata, error::StoreError};
use crate::model::DatasetInfo;

/// Version of the dataset file format written by this crate.
pub const FORMAT_VERSION: u32 = 1;

/// Width of the little-endian header length prefix.
const HEADER_LEN_PREFIX: u64 = 4;

/// The four record streams of a dataset, in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Section {
    /// Nodes keyed by identifier.
    Nodes,
    /// Ways keyed by identifier.
    Ways,
    /// Relations keyed by identifier.
    Relations,
    /// Spatial tag index keyed by cell, kind and tag key.
    TagIndex,
}

impl Section {
    /// Every section, in the order they appear in the file.
    pub const ALL: [Self; 4] = [Self::Nodes, Self::Ways, Self::Relations, Self::TagIndex];
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Nodes => "nodes",
            Self::Ways => "ways",
            Self::Relations => "relations",
            Self::TagIndex => "tag index",
        };
        f.write_str(name)
    }
}

/// Serialised preamble of a dataset file.
///
/// `version` must stay the first field: readers decode it on its own before
/// trusting the rest of the layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// File format version.
    pub version: u32,
    /// Provenance of the imported data.
    pub info: DatasetInfo,
    /// Node section blocks.
    pub nodes: SectionMetadata,
    /// Way section blocks.
    pub ways: SectionMetadata,
    /// Relation section blocks.
    pub relations: SectionMetadata,
    /// Tag index section blocks.
    pub tag_index: SectionMetadata,
}

impl Header {
    /// Header for the current format version.
    #[must_use]
    pub const fn new(
        info: DatasetInfo,
        nodes: SectionMetadata,
        ways: SectionMetadata,
        relations: SectionMetadata,
        tag_index: SectionMetadata,
    ) -> Self {
        Self {
            version: FORMAT_VERSION,
            info,
            nodes,
            ways,
            relations,
            tag_index,
        }
    }

    /// Block metadata of `section`.
    #[must_use]
    pub const fn section(&self, section: Section) -> &SectionMetadata {
        match section {
            Section::Nodes => &self.nodes,
            Section::Ways => &self.ways,
            Section::Relations => &self.relations,
            Section::TagIndex => &self.tag_index,
        }
    }
}

/// A header together with the absolute offset of every section.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerLayout {
    header: Header,
    starts: [u64; 4],
}

impl ContainerLayout {
    /// The decoded header.
    #[must_use]
    pub const fn header(&self) -> &Header {
        &self.header
    }

    /// Absolute file offset at which `section` begins.
    #[must_use]
    pub const fn section_start(&self, section: Section) -> u64 {
        match section {
            Section::Nodes => self.starts[0],
            Section::Ways => self.starts[1],
            Section::Relations => self.starts[2],
            Section::TagIndex => self.starts[3],
        }
    }

    fn from_header(header: Header, header_len: u64) -> Self {
        let mut starts = [0_u64; 4];
        let mut next = HEADER_LEN_PREFIX + header_len;
        for (start, section) in starts.iter_mut().zip(Section::ALL) {
            *start = next;
            next += header.section(section).total_len();
        }
        Self { header, starts }
    }

    fn end(&self) -> u64 {
        self.section_start(Section::TagIndex) + self.header.tag_index.total_len()
    }
}

/// Section files produced by the writer, one per [`Section`].
#[derive(Debug, Clone, Copy)]
pub struct SectionFiles<'a> {
    /// Node section file.
    pub nodes: &'a Utf8Path,
    /// Way section file.
    pub ways: &'a Utf8Path,
    /// Relation section file.
    pub relations: &'a Utf8Path,
    /// Tag index section file.
    pub tag_index: &'a Utf8Path,
}

impl SectionFiles<'_> {
    const fn get(&self, section: Section) -> &Utf8Path {
        match section {
            Section::Nodes => self.nodes,
            Section::Ways => self.ways,
            Section::Relations => self.relations,
            Section::TagIndex => self.tag_index,
        }
    }
}

/// Concatenate the header and the four section files into `path`.
///
/// Existing files are truncated. The output is synced before returning.
pub fn write_container(
    path: &Utf8Path,
    header: &Header,
    sections: SectionFiles<'_>,
) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let header_bytes = serialize(header).map_err(|source| StoreError::Encode {
        context: "dataset header".to_owned(),
        source,
    })?;
    let header_len = u32::try_from(header_bytes.len()).map_err(|_| StoreError::HeaderTooLarge {
        len: header_bytes.len(),
    })?;

    let file = File::create(path).map_err(io_error)?;
    let mut out = BufWriter::new(file);
    out.write_all(&header_len.to_le_bytes()).map_err(io_error)?;
    out.write_all(&header_bytes).map_err(io_error)?;
    for section in Section::ALL {
        let section_path = sections.get(section);
        let source = File::open(section_path).map_err(|source| StoreError::Io {
            path: section_path.to_path_buf(),
            source,
        })?;
        let copied = io::copy(&mut BufReader::new(source), &mut out).map_err(io_error)?;
        if copied != header.section(section).total_len() {
            return Err(StoreError::SectionOutOfRange { section });
        }
    }
    let file = out.into_inner().map_err(|err| StoreError::Io {
        path: path.to_path_buf(),
        source: err.into_error(),
    })?;
    file.sync_all().map_err(io_error)?;
    info!(
        "Wrote dataset {path}: {} node, {} way, {} relation and {} tag index blocks",
        header.nodes.block_count(),
        header.ways.block_count(),
        header.relations.block_count(),
        header.tag_index.block_count(),
    );
    Ok(())
}

/// Read and validate the header of an open dataset file.
///
/// Checks the format version, that each section's last keys ascend
/// strictly, and that every section fits within the file.
pub fn read_layout(file: &mut File, path: &Utf8Path) -> Result<ContainerLayout, StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file_len = file.metadata().map_err(io_error)?.len();
    let mut len_bytes = [0_u8; 4];
    file.read_exact(&mut len_bytes).map_err(io_error)?;
    let header_len = u32::from_le_bytes(len_bytes);
    if u64::from(header_len) + HEADER_LEN_PREFIX > file_len {
        return Err(StoreError::Io {
            path: path.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("header length {header_len} exceeds file length {file_len}"),
            ),
        });
    }

    let header_len_bytes = usize::try_from(header_len).map_err(|_| StoreError::HeaderTooLarge {
        len: usize::MAX,
    })?;
    let mut header_bytes = vec![0_u8; header_len_bytes];
    file.read_exact(&mut header_bytes).map_err(io_error)?;
    let version: u32 = deserialize(&header_bytes).map_err(|source| StoreError::Decode {
        context: format!("format version of {path}"),
        source,
    })?;
    if version != FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found: version,
            supported: FORMAT_VERSION,
        });
    }
    let header: Header = deserialize(&header_bytes).map_err(|source| StoreError::Decode {
        context: format!("header of {path}"),
        source,
    })?;

    for section in Section::ALL {
        if let Some(block) = header.section(section).first_unsorted_block() {
            return Err(StoreError::UnsortedSection { section, block });
        }
    }
    let layout = ContainerLayout::from_header(header, u64::from(header_len));
    if layout.end() > file_len {
        let section = Section::ALL
            .into_iter()
            .find(|section| {
                layout.section_start(*section) + layout.header.section(*section).total_len()
                    > file_len
            })
            .unwrap_or(Section::TagIndex);
        return Err(StoreError::SectionOutOfRange { section });
    }
    Ok(layout)
}
