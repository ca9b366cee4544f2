//! Block codec shared by the four dataset sections.
//!
//! A section is a run of blocks. Each block is an independently decodable
//! `bincode` vector of at most `block_size` records sorted by key. Block
//! boundaries are not marked in the byte stream; the header records each
//! block's offset, length and last key instead, and readers binary-search
//! those last keys to find the single block that can hold a key.

use std::{
    fs::File,
    io::{BufWriter, Read, Seek, SeekFrom, Write},
};

use bincode::{deserialize, serialize};
use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{
    collection::{BucketedCollection, Record},
    container::Section,
    error::StoreError,
};
use crate::{
    model::{OsmNode, OsmRelation, OsmWay},
    tag_index::{TagIndexRecord, encode_object_key},
};

/// Location and upper key bound of one block within its section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    /// Byte offset from the start of the section.
    pub offset: u64,
    /// Encoded block length in bytes.
    pub len: u64,
    /// Key of the last record in the block.
    pub last_key: Vec<u8>,
}

/// Ordered block index of one section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionMetadata {
    /// Blocks in file order, with strictly ascending last keys.
    pub blocks: Vec<BlockMetadata>,
}

impl SectionMetadata {
    /// Total encoded length of the section in bytes.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.blocks.last().map_or(0, |block| block.offset + block.len)
    }

    /// Number of blocks in the section.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Index of the only block that can contain `key`.
    ///
    /// Block `i` holds keys greater than block `i - 1`'s last key and no
    /// greater than its own. Keys beyond the final block have no home.
    #[must_use]
    pub fn block_index(&self, key: &[u8]) -> Option<usize> {
        let index = self
            .blocks
            .partition_point(|block| block.last_key.as_slice() < key);
        (index < self.blocks.len()).then_some(index)
    }

    /// Index of the first block whose last key does not exceed its
    /// predecessor's, or whose bytes overlap the previous block.
    #[must_use]
    pub fn first_unsorted_block(&self) -> Option<usize> {
        self.blocks
            .windows(2)
            .position(|pair| match pair {
                [previous, next] => {
                    next.last_key <= previous.last_key
                        || next.offset != previous.offset + previous.len
                }
                _ => false,
            })
            .map(|index| index + 1)
    }
}

/// A record that can live in a section: serialisable and keyed.
pub trait SectionItem: Serialize + DeserializeOwned {
    /// Order-preserving key the section is sorted by.
    fn item_key(&self) -> Vec<u8>;
}

impl SectionItem for OsmNode {
    fn item_key(&self) -> Vec<u8> {
        encode_object_key(self.id).to_vec()
    }
}

impl SectionItem for OsmWay {
    fn item_key(&self) -> Vec<u8> {
        encode_object_key(self.id).to_vec()
    }
}

impl SectionItem for OsmRelation {
    fn item_key(&self) -> Vec<u8> {
        encode_object_key(self.id).to_vec()
    }
}

impl SectionItem for TagIndexRecord {
    fn item_key(&self) -> Vec<u8> {
        self.key.clone()
    }
}

/// Streams sorted records into a section file, one block at a time.
#[derive(Debug)]
pub struct SectionWriter<T> {
    section: Section,
    path: Utf8PathBuf,
    out: BufWriter<File>,
    block_size: usize,
    pending: Vec<T>,
    last_key: Option<Vec<u8>>,
    offset: u64,
    metadata: SectionMetadata,
}

impl<T: SectionItem> SectionWriter<T> {
    /// Create (or truncate) the section file at `path`.
    pub fn create(
        section: Section,
        path: &Utf8Path,
        block_size: usize,
    ) -> Result<Self, StoreError> {
        let file = File::create(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            section,
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            block_size: block_size.max(1),
            pending: Vec::with_capacity(block_size.max(1)),
            last_key: None,
            offset: 0,
            metadata: SectionMetadata::default(),
        })
    }

    /// Append a record. Keys must be strictly ascending.
    pub fn push(&mut self, item: T) -> Result<(), StoreError> {
        let key = item.item_key();
        if self.last_key.as_ref().is_some_and(|last| key <= *last) {
            return Err(StoreError::UnsortedSection {
                section: self.section,
                block: self.metadata.blocks.len(),
            });
        }
        self.last_key = Some(key);
        self.pending.push(item);
        if self.pending.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Flush the partial final block and return the section's block index.
    pub fn finish(mut self) -> Result<SectionMetadata, StoreError> {
        self.flush_block()?;
        self.out.flush().map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(
            "Wrote {} section: {} blocks, {} bytes",
            self.section,
            self.metadata.blocks.len(),
            self.offset
        );
        Ok(self.metadata)
    }

    fn flush_block(&mut self) -> Result<(), StoreError> {
        let Some(last_key) = self.pending.last().map(SectionItem::item_key) else {
            return Ok(());
        };
        let bytes = serialize(&self.pending).map_err(|source| StoreError::Encode {
            context: format!("{} block {}", self.section, self.metadata.blocks.len()),
            source,
        })?;
        self.out.write_all(&bytes).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        let len = bytes.len() as u64;
        self.metadata.blocks.push(BlockMetadata {
            offset: self.offset,
            len,
            last_key,
        });
        self.offset += len;
        self.pending.clear();
        Ok(())
    }
}

/// Drain `collection` in bucket order into a section file at `path`.
///
/// `decode` turns each stored record into the section's item type; the
/// collection yields keys in ascending order, which the writer checks.
pub fn create_section_from_disk<T, F>(
    collection: &mut BucketedCollection,
    section: Section,
    path: &Utf8Path,
    block_size: usize,
    mut decode: F,
) -> Result<SectionMetadata, StoreError>
where
    T: SectionItem,
    F: FnMut(Record) -> Result<T, StoreError>,
{
    let mut writer = SectionWriter::create(section, path, block_size)?;
    for bucket in collection.iter()? {
        let (_, records) = bucket?;
        for record in records {
            writer.push(decode(record)?)?;
        }
    }
    writer.finish()
}

/// Decode a stored `bincode` value, naming `context` on failure.
pub fn decode_value<T, C>(bytes: &[u8], context: C) -> Result<T, StoreError>
where
    T: DeserializeOwned,
    C: FnOnce() -> String,
{
    deserialize(bytes).map_err(|source| StoreError::Decode {
        context: context(),
        source,
    })
}

/// Read and decode one block of a section.
pub fn read_block<T, R>(
    reader: &mut R,
    path: &Utf8Path,
    section: Section,
    section_start: u64,
    block: &BlockMetadata,
) -> Result<Vec<T>, StoreError>
where
    T: SectionItem,
    R: Read + Seek,
{
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    reader
        .seek(SeekFrom::Start(section_start + block.offset))
        .map_err(io_error)?;
    let len =
        usize::try_from(block.len).map_err(|_| StoreError::SectionOutOfRange { section })?;
    let mut bytes = vec![0_u8; len];
    reader.read_exact(&mut bytes).map_err(io_error)?;
    decode_value(&bytes, || format!("{section} block at offset {}", block.offset))
}

/// Binary-search a decoded block for the record stored under `key`.
#[must_use]
pub fn find_in_block<'a, T: SectionItem>(items: &'a [T], key: &[u8]) -> Option<&'a T> {
    items
        .binary_search_by(|item| item.item_key().as_slice().cmp(key))
        .ok()
        .and_then(|index| items.get(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::Tags,
        store::collection::{bytewise, hex_prefix},
    };
    use rstest::{fixture, rstest};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn node(id: i64) -> OsmNode {
        OsmNode {
            id,
            lat: 0.0,
            lon: 0.0,
            tags: Tags::new(),
        }
    }

    #[fixture]
    fn temp_dir() -> TempDir {
        TempDir::new().expect("create temp dir")
    }

    fn section_path(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join("nodes.section")).expect("utf-8 temp dir")
    }

    fn write_nodes(path: &Utf8Path, ids: &[i64], block_size: usize) -> SectionMetadata {
        let mut writer = SectionWriter::create(Section::Nodes, path, block_size).expect("writer");
        for id in ids {
            writer.push(node(*id)).expect("push node");
        }
        writer.finish().expect("finish section")
    }

    #[rstest]
    fn blocks_split_at_block_size(temp_dir: TempDir) {
        let path = section_path(&temp_dir);
        let metadata = write_nodes(&path, &[-5, 1, 2, 7, 9], 2);

        assert_eq!(metadata.block_count(), 3);
        let last_keys: Vec<_> = metadata.blocks.iter().map(|b| b.last_key.clone()).collect();
        assert_eq!(
            last_keys,
            [1, 7, 9].map(|id| encode_object_key(id).to_vec()).to_vec()
        );
        assert_eq!(metadata.first_unsorted_block(), None);
        let file_len = std::fs::metadata(&path).expect("section file").len();
        assert_eq!(metadata.total_len(), file_len);
    }

    #[rstest]
    fn lookup_finds_every_present_key(temp_dir: TempDir) {
        let path = section_path(&temp_dir);
        let ids = [-40, -3, 0, 4, 11, 12, 90];
        let metadata = write_nodes(&path, &ids, 3);
        let bytes = std::fs::read(&path).expect("read section");
        let mut reader = Cursor::new(bytes);

        for id in ids {
            let key = encode_object_key(id);
            let index = metadata.block_index(&key).expect("owning block");
            let block = metadata.blocks.get(index).expect("block metadata");
            let items: Vec<OsmNode> =
                read_block(&mut reader, &path, Section::Nodes, 0, block).expect("decode block");
            let found = find_in_block(&items, &key).expect("key in its block");
            assert_eq!(found.id, id);
        }
    }

    #[rstest]
    fn keys_past_the_last_block_have_no_home(temp_dir: TempDir) {
        let path = section_path(&temp_dir);
        let metadata = write_nodes(&path, &[1, 2], 8);
        assert_eq!(metadata.block_index(&encode_object_key(3)), None);
        assert_eq!(metadata.block_index(&encode_object_key(-3)), Some(0));
    }

    #[rstest]
    #[case::descending(&[2, 1])]
    #[case::duplicate(&[4, 4])]
    fn writer_rejects_out_of_order_keys(temp_dir: TempDir, #[case] ids: &[i64]) {
        let path = section_path(&temp_dir);
        let mut writer = SectionWriter::create(Section::Nodes, &path, 8).expect("writer");
        let (first, second) = match ids {
            [first, second] => (*first, *second),
            _ => panic!("cases hold two ids"),
        };
        writer.push(node(first)).expect("first push");
        let err = writer.push(node(second)).expect_err("must reject");
        assert!(matches!(
            err,
            StoreError::UnsortedSection {
                section: Section::Nodes,
                ..
            }
        ));
    }

    #[rstest]
    fn empty_section_has_no_blocks(temp_dir: TempDir) {
        let path = section_path(&temp_dir);
        let metadata = write_nodes(&path, &[], 8);
        assert_eq!(metadata, SectionMetadata::default());
        assert_eq!(metadata.total_len(), 0);
        assert_eq!(metadata.block_index(&encode_object_key(0)), None);
    }

    #[rstest]
    fn detects_descending_last_keys() {
        let block = |offset, key: i64| BlockMetadata {
            offset,
            len: 10,
            last_key: encode_object_key(key).to_vec(),
        };
        let metadata = SectionMetadata {
            blocks: vec![block(0, 1), block(10, 5), block(20, 3)],
        };
        assert_eq!(metadata.first_unsorted_block(), Some(2));
    }

    #[rstest]
    fn drains_collection_in_key_order(temp_dir: TempDir) {
        let work = Utf8PathBuf::from_path_buf(temp_dir.path().join("work")).expect("utf-8");
        let mut collection = BucketedCollection::create(
            &work,
            |key| hex_prefix(key, 7),
            bytewise,
            2,
        )
        .expect("collection");
        for id in [300_i64, -2, 70_000, 5] {
            let value = bincode::serialize(&node(id)).expect("encode node");
            collection
                .set(encode_object_key(id).to_vec(), value)
                .expect("store node");
        }

        let path = section_path(&temp_dir);
        let metadata =
            create_section_from_disk(&mut collection, Section::Nodes, &path, 3, |record| {
                decode_value::<OsmNode, _>(&record.value, || "node".to_owned())
            })
            .expect("section");

        assert_eq!(metadata.block_count(), 2);
        let bytes = std::fs::read(&path).expect("read section");
        let first = metadata.blocks.first().expect("first block");
        let items: Vec<OsmNode> =
            read_block(&mut Cursor::new(bytes), &path, Section::Nodes, 0, first).expect("decode");
        let ids: Vec<_> = items.iter().map(|n| n.id).collect();
        assert_eq!(ids, [-2, 5, 300]);
    }
}
