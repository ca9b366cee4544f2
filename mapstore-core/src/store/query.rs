//! Bounding-box queries over a committed dataset file.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fs::File,
    sync::Arc,
};

use camino::{Utf8Path, Utf8PathBuf};
use log::debug;

use super::{
    DataSourceConn,
    block::{SectionItem, find_in_block, read_block},
    config::StoreConfig,
    container::{ContainerLayout, Header, Section, read_layout},
    error::StoreError,
    pool::HandlePool,
};
use crate::{
    bounds::Bounds,
    model::{DatasetInfo, ObjectKind, OsmNode, OsmRelation, OsmWay},
    response::{InBoundsResult, MemberObject, RelationData, ResolvedMember, TagFilter, TagGroups},
    tag_index::{TagIndexKey, TagIndexRecord, encode_object_key},
};

/// Object ids matched per requested `(kind, tag key)`.
type TagMatches = BTreeMap<(ObjectKind, String), BTreeSet<i64>>;

/// Read handle on a committed dataset file.
#[derive(Debug)]
pub struct FileDataSource {
    name: String,
    path: Utf8PathBuf,
    layout: ContainerLayout,
    pool: HandlePool,
}

impl FileDataSource {
    /// Open and validate the dataset at `path`.
    ///
    /// The source is named after the file stem.
    pub fn open(path: &Utf8Path, config: &StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let mut file = File::open(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let layout = read_layout(&mut file, path)?;
        let pool = HandlePool::open(path, config.handle_pool_size)?;
        Ok(Self {
            name: path.file_stem().unwrap_or(path.as_str()).to_owned(),
            path: path.to_path_buf(),
            layout,
            pool,
        })
    }

    /// This source under a different name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The dataset header.
    #[must_use]
    pub const fn header(&self) -> &Header {
        self.layout.header()
    }

    /// Path of the dataset file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Fetch every record of `section` stored under one of `keys`.
    ///
    /// Keys are visited in ascending order so each block is decoded at most
    /// once. Keys with no record are skipped.
    fn fetch<T>(
        &self,
        file: &File,
        section: Section,
        keys: &BTreeSet<Vec<u8>>,
    ) -> Result<Vec<T>, StoreError>
    where
        T: SectionItem + Clone,
    {
        let metadata = self.layout.header().section(section);
        let start = self.layout.section_start(section);
        let mut reader = file;
        let mut loaded: Option<(usize, Vec<T>)> = None;
        let mut found = Vec::new();
        for key in keys {
            let Some(index) = metadata.block_index(key) else {
                continue;
            };
            let items = match &mut loaded {
                Some((current, items)) if *current == index => items,
                slot => {
                    let Some(block) = metadata.blocks.get(index) else {
                        continue;
                    };
                    let items = read_block(&mut reader, &self.path, section, start, block)?;
                    &mut slot.insert((index, items)).1
                }
            };
            if let Some(item) = find_in_block(items, key) {
                found.push(item.clone());
            }
        }
        Ok(found)
    }

    fn fetch_objects<T>(
        &self,
        file: &File,
        section: Section,
        ids: &BTreeSet<i64>,
        id_of: fn(&T) -> i64,
    ) -> Result<HashMap<i64, T>, StoreError>
    where
        T: SectionItem + Clone,
    {
        let keys = ids.iter().map(|id| encode_object_key(*id).to_vec()).collect();
        let items: Vec<T> = self.fetch(file, section, &keys)?;
        Ok(items.into_iter().map(|item| (id_of(&item), item)).collect())
    }

    fn query(&self, bounds: &Bounds, filter: &TagFilter) -> Result<InBoundsResult, StoreError> {
        let handle = self.pool.acquire()?;
        let file: &File = &handle;

        let matches = self.match_tags(file, bounds, filter)?;
        let direct = |kind: ObjectKind| -> BTreeSet<i64> {
            matches
                .iter()
                .filter(|((matched_kind, _), _)| *matched_kind == kind)
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect()
        };
        let direct_nodes = direct(ObjectKind::Node);
        let direct_ways = direct(ObjectKind::Way);
        let direct_relations = direct(ObjectKind::Relation);

        let (relations, member_ways, member_nodes) =
            self.resolve_relations(file, &direct_relations)?;

        let way_ids = direct_ways.union(&member_ways).copied().collect();
        let ways: HashMap<i64, OsmWay> =
            self.fetch_objects(file, Section::Ways, &way_ids, |way: &OsmWay| way.id)?;
        let node_ids = direct_nodes.union(&member_nodes).copied().collect();
        let nodes: HashMap<i64, OsmNode> =
            self.fetch_objects(file, Section::Nodes, &node_ids, |node: &OsmNode| node.id)?;

        require_all(&direct_relations, &relations, Section::Relations)?;
        require_all(&direct_ways, &ways, Section::Ways)?;
        require_all(&direct_nodes, &nodes, Section::Nodes)?;

        let objects = Objects {
            nodes,
            ways,
            relations,
        };
        Ok(objects.assemble(&matches))
    }

    /// Tag-index lookups for every filter pair in every covering bucket.
    ///
    /// Buckets are looked up one latitude row at a time, so only a single
    /// row of keys is held at once.
    fn match_tags(
        &self,
        file: &File,
        bounds: &Bounds,
        filter: &TagFilter,
    ) -> Result<TagMatches, StoreError> {
        let (lats, lons) = bounds.bucket_range();
        let mut matches = TagMatches::new();
        let mut wanted = 0_usize;
        let mut found = 0_usize;
        for lat in lats {
            let mut keys = BTreeSet::new();
            for lon in lons.clone() {
                for (kind, tag_key) in filter.iter() {
                    keys.insert(TagIndexKey::new(lat, lon, kind, tag_key).encode());
                }
            }
            let records: Vec<TagIndexRecord> = self.fetch(file, Section::TagIndex, &keys)?;
            wanted += keys.len();
            found += records.len();
            for record in records {
                let key = TagIndexKey::decode(&record.key)?;
                matches
                    .entry((key.kind, key.tag_key))
                    .or_default()
                    .extend(record.ids);
            }
        }
        debug!("{}: {found} of {wanted} tag index keys matched", self.name);
        Ok(matches)
    }

    /// Fetch `roots` and every relation reachable through their members.
    ///
    /// Each round fetches the pending relations and queues member relations
    /// not seen before; the loop ends when a round discovers nothing new.
    /// Returns the relations found plus the way and node members to fetch.
    fn resolve_relations(
        &self,
        file: &File,
        roots: &BTreeSet<i64>,
    ) -> Result<(HashMap<i64, OsmRelation>, BTreeSet<i64>, BTreeSet<i64>), StoreError> {
        let mut relations = HashMap::new();
        let mut seen = roots.clone();
        let mut pending = roots.clone();
        let mut ways = BTreeSet::new();
        let mut nodes = BTreeSet::new();
        let mut round = 0_usize;
        while !pending.is_empty() {
            round += 1;
            let fetched: HashMap<i64, OsmRelation> = self.fetch_objects(
                file,
                Section::Relations,
                &pending,
                |relation: &OsmRelation| relation.id,
            )?;
            let mut next = BTreeSet::new();
            for relation in fetched.values() {
                for member in &relation.members {
                    match member.kind {
                        ObjectKind::Node => {
                            nodes.insert(member.object_id);
                        }
                        ObjectKind::Way => {
                            ways.insert(member.object_id);
                        }
                        ObjectKind::Relation => {
                            if seen.insert(member.object_id) {
                                next.insert(member.object_id);
                            }
                        }
                    }
                }
            }
            debug!(
                "{}: relation round {round} fetched {} of {} relations, {} new",
                self.name,
                fetched.len(),
                pending.len(),
                next.len()
            );
            relations.extend(fetched);
            pending = next;
        }
        Ok((relations, ways, nodes))
    }
}

impl DataSourceConn for FileDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn dataset_info(&self) -> Result<DatasetInfo, StoreError> {
        Ok(self.layout.header().info)
    }

    fn get_in_bounds(
        &self,
        bounds: &Bounds,
        filter: &TagFilter,
    ) -> Result<InBoundsResult, StoreError> {
        if !self.layout.header().info.bounds.overlaps(bounds) {
            return Err(StoreError::NoDataForRegion);
        }
        if filter.is_empty() {
            return Ok(InBoundsResult::default());
        }
        self.query(bounds, filter)
    }
}

/// Objects matched directly by the tag index must exist in their section.
fn require_all<T>(
    ids: &BTreeSet<i64>,
    found: &HashMap<i64, T>,
    section: Section,
) -> Result<(), StoreError> {
    match ids.iter().find(|id| !found.contains_key(id)) {
        Some(id) => Err(StoreError::MissingRecord { section, id: *id }),
        None => Ok(()),
    }
}

/// Relations already expanded during one query, by id.
type Expanded = HashMap<i64, Arc<RelationData>>;

struct Objects {
    nodes: HashMap<i64, OsmNode>,
    ways: HashMap<i64, OsmWay>,
    relations: HashMap<i64, OsmRelation>,
}

/// A relation whose members are being resolved.
struct Frame<'a> {
    relation: &'a OsmRelation,
    role: String,
    next: usize,
    members: Vec<ResolvedMember>,
}

impl<'a> Frame<'a> {
    fn new(relation: &'a OsmRelation, role: String) -> Self {
        Self {
            relation,
            role,
            next: 0,
            members: Vec::with_capacity(relation.members.len()),
        }
    }
}

impl Objects {
    fn assemble(&self, matches: &TagMatches) -> InBoundsResult {
        let mut result = InBoundsResult::default();
        let mut expanded = Expanded::new();
        for ((kind, tag_key), ids) in matches {
            match kind {
                ObjectKind::Node => group(&mut result.nodes, tag_key, ids, |id| {
                    let node = self.nodes.get(&id)?;
                    Some((node.tags.get(tag_key)?.to_owned(), node.clone()))
                }),
                ObjectKind::Way => group(&mut result.ways, tag_key, ids, |id| {
                    let way = self.ways.get(&id)?;
                    Some((way.tags.get(tag_key)?.to_owned(), way.clone()))
                }),
                ObjectKind::Relation => group(&mut result.relations, tag_key, ids, |id| {
                    let relation = self.relations.get(&id)?;
                    let value = relation.tags.get(tag_key)?.to_owned();
                    let data = self.relation_data(relation, &mut expanded)?;
                    Some((value, RelationData::clone(&data)))
                }),
            }
        }
        result
    }

    /// Expand `root` and every relation below it, depth first, on an
    /// explicit stack.
    ///
    /// Each relation is expanded once per query and shared through
    /// `expanded`. A member naming a relation still on the stack yields
    /// [`MemberObject::Cycle`].
    fn relation_data(
        &self,
        root: &OsmRelation,
        expanded: &mut Expanded,
    ) -> Option<Arc<RelationData>> {
        if let Some(data) = expanded.get(&root.id) {
            return Some(Arc::clone(data));
        }
        let mut open = HashSet::from([root.id]);
        let mut stack = vec![Frame::new(root, String::new())];
        while let Some(frame) = stack.last_mut() {
            let relation = frame.relation;
            let Some(member) = relation.members.get(frame.next) else {
                let Some(done) = stack.pop() else { break };
                open.remove(&relation.id);
                let data = Arc::new(RelationData {
                    id: relation.id,
                    tags: relation.tags.clone(),
                    members: done.members,
                });
                expanded.insert(relation.id, Arc::clone(&data));
                if let Some(parent) = stack.last_mut() {
                    parent.members.push(ResolvedMember {
                        role: done.role,
                        object: MemberObject::Relation(data),
                    });
                }
                continue;
            };
            frame.next += 1;
            let object = match member.kind {
                ObjectKind::Node => self
                    .nodes
                    .get(&member.object_id)
                    .cloned()
                    .map(MemberObject::Node),
                ObjectKind::Way => self
                    .ways
                    .get(&member.object_id)
                    .cloned()
                    .map(MemberObject::Way),
                ObjectKind::Relation if open.contains(&member.object_id) => {
                    Some(MemberObject::Cycle {
                        id: member.object_id,
                    })
                }
                ObjectKind::Relation => match expanded.get(&member.object_id) {
                    Some(data) => Some(MemberObject::Relation(Arc::clone(data))),
                    None => {
                        if let Some(nested) = self.relations.get(&member.object_id) {
                            open.insert(nested.id);
                            stack.push(Frame::new(nested, member.role.clone()));
                            continue;
                        }
                        None
                    }
                },
            };
            match object {
                Some(object) => frame.members.push(ResolvedMember {
                    role: member.role.clone(),
                    object,
                }),
                None => debug!(
                    "relation {} member {} {} is not in the dataset",
                    relation.id, member.kind, member.object_id
                ),
            }
        }
        expanded.get(&root.id).cloned()
    }
}

fn group<T, F>(groups: &mut TagGroups<T>, tag_key: &str, ids: &BTreeSet<i64>, mut lookup: F)
where
    F: FnMut(i64) -> Option<(String, T)>,
{
    for id in ids {
        if let Some((value, object)) = lookup(*id) {
            groups
                .entry(tag_key.to_owned())
                .or_default()
                .entry(value)
                .or_default()
                .push(object);
        }
    }
}
