//! OpenStreetMap object model shared by the import pipeline and the store.
//!
//! Objects are write-once: the pipeline builds them from the source, the
//! writer persists them, and the query engine hands copies back to callers.

use std::fmt;

use geo::Coord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bounds::Bounds;

/// The three OSM object kinds stored in a dataset.
///
/// The discriminant is the byte written into tag-index keys, so the
/// declaration order is part of the file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectKind {
    /// A single tagged coordinate.
    Node = 0,
    /// An ordered path of nodes.
    Way = 1,
    /// A group of nodes, ways and other relations.
    Relation = 2,
}

impl ObjectKind {
    /// Byte used to encode the kind inside tag-index keys.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Decode a kind from its tag-index byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Node),
            1 => Some(Self::Way),
            2 => Some(Self::Relation),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Node => "node",
            Self::Way => "way",
            Self::Relation => "relation",
        };
        f.write_str(name)
    }
}

/// Raised when an object carries the same tag key twice.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("duplicate tag key {key:?}")]
pub struct DuplicateTagError {
    /// The repeated key.
    pub key: String,
}

/// Ordered key/value tags with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tags(Vec<(String, String)>);

impl Tags {
    /// An empty tag list.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Build tags from ordered pairs, rejecting repeated keys.
    ///
    /// # Examples
    /// ```
    /// use mapstore_core::Tags;
    ///
    /// let tags = Tags::from_pairs([("amenity", "cafe"), ("name", "Kiosk")]).unwrap();
    /// assert_eq!(tags.get("name"), Some("Kiosk"));
    /// assert!(Tags::from_pairs([("name", "a"), ("name", "b")]).is_err());
    /// ```
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, DuplicateTagError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut tags = Self::new();
        for (key, value) in pairs {
            tags.insert(key.into(), value.into())?;
        }
        Ok(tags)
    }

    /// Append a tag, failing when the key is already present.
    pub fn insert(&mut self, key: String, value: String) -> Result<(), DuplicateTagError> {
        if self.get(&key).is_some() {
            return Err(DuplicateTagError { key });
        }
        self.0.push((key, value));
        Ok(())
    }

    /// Value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_str())
    }

    /// Iterate over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Iterate over the keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(key, _)| key.as_str())
    }

    /// Number of tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the object has no tags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A tagged point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsmNode {
    /// Dataset-unique identifier.
    pub id: i64,
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Free-form tags.
    pub tags: Tags,
}

impl OsmNode {
    /// Location as a `geo` coordinate (`x = longitude`, `y = latitude`).
    #[must_use]
    pub const fn coord(&self) -> Coord<f64> {
        Coord {
            x: self.lon,
            y: self.lat,
        }
    }
}

/// A way's reference to one of its nodes, carrying the node's location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WayPoint {
    /// Referenced node.
    pub node_id: i64,
    /// Latitude copied from the node.
    pub lat: f64,
    /// Longitude copied from the node.
    pub lon: f64,
}

/// An ordered path whose points are already resolved to coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsmWay {
    /// Dataset-unique identifier.
    pub id: i64,
    /// Free-form tags.
    pub tags: Tags,
    /// Way-points in path order.
    pub points: Vec<WayPoint>,
}

impl OsmWay {
    /// Bounding box of the way's points, or `None` when it has none.
    #[must_use]
    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::from_points(self.points.iter().map(|point| (point.lat, point.lon)))
    }
}

/// One entry of a relation's member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationMember {
    /// Identifier of the member object.
    pub object_id: i64,
    /// Kind of the member object.
    pub kind: ObjectKind,
    /// Role string, possibly empty.
    pub role: String,
}

/// A group of members. Members may reference other relations, cycles included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsmRelation {
    /// Dataset-unique identifier.
    pub id: i64,
    /// Free-form tags.
    pub tags: Tags,
    /// Members in source order.
    pub members: Vec<RelationMember>,
}

/// Provenance copied from the source PBF header.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DatasetInfo {
    /// Area covered by the dataset.
    pub bounds: Bounds,
    /// Replication timestamp in milliseconds since the Unix epoch.
    pub replication_time_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ObjectKind::Node)]
    #[case(ObjectKind::Way)]
    #[case(ObjectKind::Relation)]
    fn kind_byte_round_trips(#[case] kind: ObjectKind) {
        assert_eq!(ObjectKind::from_byte(kind.as_byte()), Some(kind));
    }

    #[rstest]
    fn unknown_kind_byte_is_rejected() {
        assert_eq!(ObjectKind::from_byte(7), None);
    }

    #[rstest]
    fn tags_reject_duplicate_keys() {
        let err = Tags::from_pairs([("highway", "primary"), ("highway", "secondary")])
            .expect_err("duplicate key must fail");
        assert_eq!(err.key, "highway");
    }

    #[rstest]
    fn tags_preserve_insertion_order() {
        let tags = Tags::from_pairs([("name", "Elm"), ("amenity", "bench"), ("age", "3")])
            .expect("unique keys");
        let keys: Vec<_> = tags.keys().collect();
        assert_eq!(keys, ["name", "amenity", "age"]);
        assert_eq!(tags.len(), 3);
    }

    #[rstest]
    fn way_bounds_cover_points() {
        let way = OsmWay {
            id: 1,
            tags: Tags::new(),
            points: vec![
                WayPoint { node_id: 1, lat: 1.0, lon: 5.0 },
                WayPoint { node_id: 2, lat: -2.0, lon: 7.5 },
            ],
        };
        let bounds = way.bounds().expect("points present");
        assert_eq!(bounds, Bounds::new(-2.0, 1.0, 5.0, 7.5));
    }
}
