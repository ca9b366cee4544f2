//! Query filters and the shape of bounding-box query results.

use std::{collections::BTreeMap, sync::Arc};

use crate::model::{ObjectKind, OsmNode, OsmWay, Tags};

/// The `(kind, tag key)` pairs a bounding-box query asks for.
///
/// # Examples
/// ```
/// use mapstore_core::{ObjectKind, TagFilter};
///
/// let filter = TagFilter::new()
///     .with(ObjectKind::Way, "highway")
///     .with(ObjectKind::Relation, "boundary");
/// assert_eq!(filter.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    entries: Vec<(ObjectKind, String)>,
}

impl TagFilter {
    /// An empty filter, matching nothing.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// This filter extended with `(kind, key)`. Repeated pairs are ignored.
    #[must_use]
    pub fn with(mut self, kind: ObjectKind, key: impl Into<String>) -> Self {
        self.push(kind, key);
        self
    }

    /// Add `(kind, key)` unless already present.
    pub fn push(&mut self, kind: ObjectKind, key: impl Into<String>) {
        let key = key.into();
        if !self.entries.iter().any(|(k, existing)| *k == kind && *existing == key) {
            self.entries.push((kind, key));
        }
    }

    /// Iterate over the requested pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectKind, &str)> {
        self.entries.iter().map(|(kind, key)| (*kind, key.as_str()))
    }

    /// Number of requested pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the filter requests nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(ObjectKind, K)> for TagFilter {
    fn from_iter<I: IntoIterator<Item = (ObjectKind, K)>>(iter: I) -> Self {
        let mut filter = Self::new();
        for (kind, key) in iter {
            filter.push(kind, key);
        }
        filter
    }
}

/// Objects grouped by requested tag key, then by that tag's value.
pub type TagGroups<T> = BTreeMap<String, BTreeMap<String, Vec<T>>>;

/// Everything a bounding-box query matched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InBoundsResult {
    /// Matching nodes.
    pub nodes: TagGroups<OsmNode>,
    /// Matching ways, with coordinates on every way-point.
    pub ways: TagGroups<OsmWay>,
    /// Matching relations with their members resolved.
    pub relations: TagGroups<RelationData>,
}

impl InBoundsResult {
    /// Whether nothing matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.ways.is_empty() && self.relations.is_empty()
    }

    /// Total number of matched objects across all groups.
    #[must_use]
    pub fn object_count(&self) -> usize {
        fn count<T>(groups: &TagGroups<T>) -> usize {
            groups.values().flat_map(BTreeMap::values).map(Vec::len).sum()
        }
        count(&self.nodes) + count(&self.ways) + count(&self.relations)
    }
}

/// A relation whose members are replaced by the objects they reference.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationData {
    /// Relation identifier.
    pub id: i64,
    /// Relation tags.
    pub tags: Tags,
    /// Resolved members in source order. Members missing from the dataset
    /// are omitted.
    pub members: Vec<ResolvedMember>,
}

/// A relation member together with the object it points at.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMember {
    /// Member role.
    pub role: String,
    /// The referenced object.
    pub object: MemberObject,
}

/// Object referenced by a relation member.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberObject {
    /// A node member.
    Node(OsmNode),
    /// A way member.
    Way(OsmWay),
    /// A nested relation, itself resolved. A relation reached along several
    /// member paths is expanded once and shared.
    Relation(Arc<RelationData>),
    /// A relation still being expanded higher up the member chain.
    Cycle {
        /// Identifier of the relation that closes the cycle.
        id: i64,
    },
}
