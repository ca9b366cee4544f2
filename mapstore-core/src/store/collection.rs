//! Disk-backed key/value collection used while building a dataset.
//!
//! Keys are grouped into named buckets by a caller-supplied policy. Buckets
//! are cached in memory while they are being written; every `flush_every`
//! writes, every cached bucket except the one currently being written is
//! sorted, serialised to `<dir>/<bucket>.bucket` and evicted. Import traffic
//! arrives in bucket-local bursts, so the hot bucket rarely leaves memory.
//!
//! Bucket names must sort in the same order as the keys they hold: iteration
//! walks buckets by name, and the section writer relies on that to see keys
//! in ascending order.

use std::{
    cmp::Ordering,
    collections::{HashMap, hash_map::Entry},
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    vec,
};

use bincode::{deserialize_from, serialize_into};
use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BUCKET_EXTENSION: &str = "bucket";

/// Maps a raw key to the name of the bucket holding it.
pub type BucketPolicyFn = fn(&[u8]) -> String;

/// Total order over raw keys within a bucket.
pub type KeyOrderingFn = fn(&[u8], &[u8]) -> Ordering;

/// Errors raised by [`BucketedCollection`].
#[derive(Debug, Error)]
pub enum CollectionError {
    /// The collection directory could not be created.
    #[error("failed to create collection directory {path}")]
    CreateDirectory {
        /// Directory path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Reading or writing a bucket file failed.
    #[error("bucket I/O failed for {path}")]
    Io {
        /// Bucket file path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A bucket could not be serialised.
    #[error("failed to encode bucket {bucket}")]
    Encode {
        /// Bucket name.
        bucket: String,
        /// Encoder failure from `bincode`.
        #[source]
        source: bincode::Error,
    },
    /// A bucket file on disk is malformed.
    #[error("malformed bucket file {path}")]
    Decode {
        /// Bucket file path.
        path: Utf8PathBuf,
        /// Decoder failure from `bincode`.
        #[source]
        source: bincode::Error,
    },
}

/// A raw key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Raw key bytes.
    pub key: Vec<u8>,
    /// Raw value bytes.
    pub value: Vec<u8>,
}

#[derive(Debug, Default)]
struct CachedBucket {
    records: Vec<Record>,
    dirty: bool,
}

/// External-memory key/value store grouped into buckets.
pub struct BucketedCollection {
    dir: Utf8PathBuf,
    policy: BucketPolicyFn,
    ordering: KeyOrderingFn,
    flush_every: usize,
    writes_since_flush: usize,
    cache: HashMap<String, CachedBucket>,
}

impl std::fmt::Debug for BucketedCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketedCollection")
            .field("dir", &self.dir)
            .field("cached_buckets", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl BucketedCollection {
    /// Open a collection rooted at `dir`, creating the directory if needed.
    pub fn create(
        dir: &Utf8Path,
        policy: BucketPolicyFn,
        ordering: KeyOrderingFn,
        flush_every: usize,
    ) -> Result<Self, CollectionError> {
        mapstore_fs::ensure_dir(dir).map_err(|source| CollectionError::CreateDirectory {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            policy,
            ordering,
            flush_every: flush_every.max(1),
            writes_since_flush: 0,
            cache: HashMap::new(),
        })
    }

    /// Directory holding the bucket files.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Value stored under `key`, or `None` when the key is absent.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, CollectionError> {
        let ordering = self.ordering;
        let bucket = self.load_bucket((self.policy)(key))?;
        Ok(bucket
            .records
            .binary_search_by(|record| ordering(&record.key, key))
            .ok()
            .and_then(|index| bucket.records.get(index))
            .map(|record| record.value.clone()))
    }

    /// Insert `value` under `key`, replacing any previous value.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), CollectionError> {
        self.update(key, |slot| *slot = value)
    }

    /// Modify the value under `key` in place. Absent keys start out empty.
    pub fn update<F>(&mut self, key: Vec<u8>, modify: F) -> Result<(), CollectionError>
    where
        F: FnOnce(&mut Vec<u8>),
    {
        let ordering = self.ordering;
        let name = (self.policy)(&key);
        let bucket = self.load_bucket(name.clone())?;
        let index = match bucket
            .records
            .binary_search_by(|record| ordering(&record.key, &key))
        {
            Ok(index) => index,
            Err(index) => {
                bucket.records.insert(
                    index,
                    Record {
                        key,
                        value: Vec::new(),
                    },
                );
                index
            }
        };
        if let Some(record) = bucket.records.get_mut(index) {
            modify(&mut record.value);
        }
        bucket.dirty = true;

        self.writes_since_flush += 1;
        if self.writes_since_flush >= self.flush_every {
            self.flush_except(Some(&name))?;
            self.writes_since_flush = 0;
        }
        Ok(())
    }

    /// Write every dirty bucket to disk and empty the cache.
    pub fn flush(&mut self) -> Result<(), CollectionError> {
        self.flush_except(None)
    }

    /// Iterate over all buckets in name order, flushing the cache first.
    ///
    /// Each item holds a bucket name and its records in ascending key order.
    pub fn iter(&mut self) -> Result<BucketIter, CollectionError> {
        self.flush()?;
        let entries = std::fs::read_dir(&self.dir).map_err(|source| CollectionError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CollectionError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            let is_bucket = path
                .extension()
                .is_some_and(|extension| extension == BUCKET_EXTENSION);
            if let (true, Some(stem)) = (is_bucket, path.file_stem().and_then(|s| s.to_str())) {
                names.push(stem.to_owned());
            }
        }
        names.sort_unstable();
        Ok(BucketIter {
            dir: self.dir.clone(),
            names: names.into_iter(),
        })
    }

    fn load_bucket(&mut self, name: String) -> Result<&mut CachedBucket, CollectionError> {
        match self.cache.entry(name) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let records = read_bucket(&bucket_path(&self.dir, entry.key()))?;
                Ok(entry.insert(CachedBucket {
                    records: records.unwrap_or_default(),
                    dirty: false,
                }))
            }
        }
    }

    fn flush_except(&mut self, keep: Option<&str>) -> Result<(), CollectionError> {
        let evicted: Vec<String> = self
            .cache
            .keys()
            .filter(|name| Some(name.as_str()) != keep)
            .cloned()
            .collect();
        let mut written = 0_usize;
        for name in evicted {
            let Some(bucket) = self.cache.remove(&name) else {
                continue;
            };
            if bucket.dirty {
                write_bucket(&self.dir, &name, &bucket.records)?;
                written += 1;
            }
        }
        if written > 0 {
            debug!("Flushed {written} buckets under {}", self.dir);
        }
        Ok(())
    }
}

/// Iterator over the buckets of a [`BucketedCollection`], in name order.
#[derive(Debug)]
pub struct BucketIter {
    dir: Utf8PathBuf,
    names: vec::IntoIter<String>,
}

impl Iterator for BucketIter {
    type Item = Result<(String, Vec<Record>), CollectionError>;

    fn next(&mut self) -> Option<Self::Item> {
        let name = self.names.next()?;
        let path = bucket_path(&self.dir, &name);
        Some(read_bucket(&path).map(|records| (name, records.unwrap_or_default())))
    }
}

/// Bucket named by the lowercase hex of the first `len` key bytes.
///
/// Hex digits sort like the bytes they encode, so the names keep key order.
#[must_use]
pub fn hex_prefix(key: &[u8], len: usize) -> String {
    key.iter()
        .take(len)
        .fold(String::with_capacity(len * 2), |mut name, byte| {
            name.push_str(&format!("{byte:02x}"));
            name
        })
}

/// Plain byte-wise key order.
#[must_use]
pub fn bytewise(lhs: &[u8], rhs: &[u8]) -> Ordering {
    lhs.cmp(rhs)
}

fn bucket_path(dir: &Utf8Path, name: &str) -> Utf8PathBuf {
    dir.join(format!("{name}.{BUCKET_EXTENSION}"))
}

fn read_bucket(path: &Utf8Path) -> Result<Option<Vec<Record>>, CollectionError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CollectionError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    deserialize_from(BufReader::new(file))
        .map(Some)
        .map_err(|source| CollectionError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

fn write_bucket(dir: &Utf8Path, name: &str, records: &[Record]) -> Result<(), CollectionError> {
    let path = bucket_path(dir, name);
    let io_error = |source| CollectionError::Io {
        path: path.clone(),
        source,
    };
    let file = File::create(&path).map_err(io_error)?;
    let mut writer = BufWriter::new(file);
    serialize_into(&mut writer, records).map_err(|source| CollectionError::Encode {
        bucket: name.to_owned(),
        source,
    })?;
    writer.flush().map_err(io_error)
}
