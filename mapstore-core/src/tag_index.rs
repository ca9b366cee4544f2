//! Spatial tag index keys and bucketing.
//!
//! The index maps `(lat bucket, lon bucket, kind, tag key)` to the objects
//! carrying that tag in that cell. Keys are encoded so that comparing the
//! raw bytes gives the same order as comparing the fields, which lets the
//! container format binary-search index blocks without decoding keys.
//!
//! Layout of an encoded key:
//!
//! | bytes | field                                  |
//! |-------|----------------------------------------|
//! | 0..4  | latitude bucket, sign bit flipped, BE  |
//! | 4..8  | longitude bucket, sign bit flipped, BE |
//! | 8     | object kind byte                       |
//! | 9..   | tag key, UTF-8                         |

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ObjectKind;

/// Cells per degree; one bucket is roughly 1.1 km wide at the equator.
pub const BUCKETS_PER_DEGREE: f64 = 100.0;

/// Length of the cell prefix (both bucket coordinates) of an encoded key.
pub const CELL_PREFIX_LEN: usize = 8;

const SIGN_FLIP_32: u32 = 1 << 31;
const SIGN_FLIP_64: u64 = 1 << 63;

/// Spatial bucket of a latitude or longitude: `floor(coord * 100)`.
///
/// # Examples
/// ```
/// use mapstore_core::bucket_from_lat_or_lon;
///
/// assert_eq!(bucket_from_lat_or_lon(0.005), 0);
/// assert_eq!(bucket_from_lat_or_lon(0.01), 1);
/// assert_eq!(bucket_from_lat_or_lon(-0.005), -1);
/// ```
#[must_use]
pub fn bucket_from_lat_or_lon(coord: f64) -> i32 {
    (coord * BUCKETS_PER_DEGREE).floor() as i32
}

/// Errors raised when decoding a tag-index key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TagIndexKeyError {
    /// The key is shorter than the fixed cell and kind prefix.
    #[error("tag index key of {len} bytes is shorter than the 9 byte prefix")]
    Truncated {
        /// Length of the rejected key.
        len: usize,
    },
    /// The kind byte does not name an object kind.
    #[error("tag index key has unknown object kind byte {0}")]
    UnknownKind(u8),
    /// The tag key is not valid UTF-8.
    #[error("tag index key holds a tag key that is not UTF-8")]
    InvalidUtf8,
}

/// Composite key of the spatial tag index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagIndexKey {
    /// Latitude bucket.
    pub lat_bucket: i32,
    /// Longitude bucket.
    pub lon_bucket: i32,
    /// Kind of the indexed objects.
    pub kind: ObjectKind,
    /// Tag key carried by the indexed objects. Case-sensitive.
    pub tag_key: String,
}

impl TagIndexKey {
    /// Key for `tag_key` on objects of `kind` in cell `(lat_bucket, lon_bucket)`.
    #[must_use]
    pub fn new(
        lat_bucket: i32,
        lon_bucket: i32,
        kind: ObjectKind,
        tag_key: impl Into<String>,
    ) -> Self {
        Self {
            lat_bucket,
            lon_bucket,
            kind,
            tag_key: tag_key.into(),
        }
    }

    /// Encode into order-preserving bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(CELL_PREFIX_LEN + 1 + self.tag_key.len());
        bytes.extend_from_slice(&encode_i32(self.lat_bucket));
        bytes.extend_from_slice(&encode_i32(self.lon_bucket));
        bytes.push(self.kind.as_byte());
        bytes.extend_from_slice(self.tag_key.as_bytes());
        bytes
    }

    /// Decode bytes produced by [`TagIndexKey::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, TagIndexKeyError> {
        let truncated = || TagIndexKeyError::Truncated { len: bytes.len() };
        let (lat, rest) = bytes.split_first_chunk::<4>().ok_or_else(truncated)?;
        let (lon, rest) = rest.split_first_chunk::<4>().ok_or_else(truncated)?;
        let (kind, tag_key) = rest.split_first().ok_or_else(truncated)?;
        let kind = ObjectKind::from_byte(*kind).ok_or(TagIndexKeyError::UnknownKind(*kind))?;
        let tag_key = std::str::from_utf8(tag_key)
            .map_err(|_| TagIndexKeyError::InvalidUtf8)?
            .to_owned();
        Ok(Self {
            lat_bucket: decode_i32(*lat),
            lon_bucket: decode_i32(*lon),
            kind,
            tag_key,
        })
    }
}

/// Value stored in the tag-index section: every object carrying the key's
/// tag within the key's cell, ascending and without duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagIndexRecord {
    /// Encoded [`TagIndexKey`].
    pub key: Vec<u8>,
    /// Matching object identifiers.
    pub ids: Vec<i64>,
}

/// Cells touched by a path of `(lat, lon)` points.
///
/// A single point yields its own cell. For each pair of consecutive points
/// every cell inside the rectangle spanned by the pair is included, so a
/// long way is discoverable from any cell along its route.
#[must_use]
pub fn buckets_for_path<I>(points: I) -> BTreeSet<(i32, i32)>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut cells = BTreeSet::new();
    let mut previous: Option<(i32, i32)> = None;
    for (lat, lon) in points {
        let cell = (bucket_from_lat_or_lon(lat), bucket_from_lat_or_lon(lon));
        match previous {
            Some(prev) => insert_span(&mut cells, prev, cell),
            None => {
                cells.insert(cell);
            }
        }
        previous = Some(cell);
    }
    cells
}

fn insert_span(cells: &mut BTreeSet<(i32, i32)>, from: (i32, i32), to: (i32, i32)) {
    for lat in from.0.min(to.0)..=from.0.max(to.0) {
        for lon in from.1.min(to.1)..=from.1.max(to.1) {
            cells.insert((lat, lon));
        }
    }
}

/// Order-preserving 8-byte key for a node, way or relation identifier.
#[must_use]
pub const fn encode_object_key(id: i64) -> [u8; 8] {
    (id.cast_unsigned() ^ SIGN_FLIP_64).to_be_bytes()
}

/// Identifier encoded by [`encode_object_key`].
#[must_use]
pub const fn decode_object_key(key: [u8; 8]) -> i64 {
    (u64::from_be_bytes(key) ^ SIGN_FLIP_64).cast_signed()
}

const fn encode_i32(value: i32) -> [u8; 4] {
    (value.cast_unsigned() ^ SIGN_FLIP_32).to_be_bytes()
}

const fn decode_i32(bytes: [u8; 4]) -> i32 {
    (u32::from_be_bytes(bytes) ^ SIGN_FLIP_32).cast_signed()
}
