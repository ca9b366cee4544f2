//! File-backed [`FinalStorage`] that builds a dataset in a working directory.
//!
//! Objects are staged in four [`BucketedCollection`]s (nodes, ways,
//! relations, tag index). Commit drains each into a section file, writes the
//! container next to them and renames it over the target path, so readers
//! only ever see a complete dataset.

use std::collections::{BTreeSet, HashSet, VecDeque};

use bincode::serialize;
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, info, warn};
use serde::{Serialize, de::DeserializeOwned};

use super::{
    FinalStorage,
    block::{create_section_from_disk, decode_value},
    collection::{BucketedCollection, Record, bytewise, hex_prefix},
    config::StoreConfig,
    container::{Header, Section, SectionFiles, write_container},
    error::StoreError,
    query::FileDataSource,
};
use crate::{
    bounds::Bounds,
    model::{DatasetInfo, ObjectKind, OsmNode, OsmRelation, OsmWay, RelationMember, Tags},
    tag_index::{
        CELL_PREFIX_LEN, TagIndexKey, TagIndexRecord, bucket_from_lat_or_lon, buckets_for_path,
        encode_object_key,
    },
};

/// Leading object-key bytes naming a bucket: 65,536 consecutive ids each.
const OBJECT_BUCKET_PREFIX: usize = 6;

const ID_WIDTH: usize = 8;

fn object_bucket(key: &[u8]) -> String {
    hex_prefix(key, OBJECT_BUCKET_PREFIX)
}

fn cell_bucket(key: &[u8]) -> String {
    hex_prefix(key, CELL_PREFIX_LEN)
}

/// Working directory used for a dataset written to `output`.
#[must_use]
pub fn work_dir_for(output: &Utf8Path) -> Utf8PathBuf {
    let name = output.file_name().unwrap_or("dataset");
    output.with_file_name(format!("{name}.work"))
}

/// Builds a dataset file from imported batches.
#[derive(Debug)]
pub struct FileStorage {
    output: Utf8PathBuf,
    work_dir: Utf8PathBuf,
    config: StoreConfig,
    nodes: BucketedCollection,
    ways: BucketedCollection,
    relations: BucketedCollection,
    tag_index: BucketedCollection,
    info: Option<DatasetInfo>,
    observed: Option<Bounds>,
}

impl FileStorage {
    /// Start a dataset that will be committed to `output`.
    ///
    /// Staging files live in [`work_dir_for`]`(output)`, which is emptied
    /// first so a crashed run never leaks into a new one.
    pub fn create(output: &Utf8Path, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let work_dir = work_dir_for(output);
        remove_work_dir(&work_dir)?;
        let collection = |name: &str, policy: fn(&[u8]) -> String| {
            BucketedCollection::create(&work_dir.join(name), policy, bytewise, config.flush_every)
        };
        let nodes = collection("nodes", object_bucket)?;
        let ways = collection("ways", object_bucket)?;
        let relations = collection("relations", object_bucket)?;
        let tag_index = collection("tag_index", cell_bucket)?;
        info!("Building dataset {output} in {work_dir}");
        Ok(Self {
            output: output.to_path_buf(),
            work_dir,
            config,
            nodes,
            ways,
            relations,
            tag_index,
            info: None,
            observed: None,
        })
    }

    /// Path the dataset will be committed to.
    #[must_use]
    pub fn output(&self) -> &Utf8Path {
        &self.output
    }

    /// Staging directory for this run.
    #[must_use]
    pub fn work_dir(&self) -> &Utf8Path {
        &self.work_dir
    }

    fn index_tags(
        &mut self,
        cells: &BTreeSet<(i32, i32)>,
        kind: ObjectKind,
        tags: &Tags,
        id: i64,
    ) -> Result<(), StoreError> {
        for (lat, lon) in cells {
            for key in tags.keys() {
                let index_key = TagIndexKey::new(*lat, *lon, kind, key).encode();
                self.tag_index
                    .update(index_key, |ids| ids.extend_from_slice(&id.to_le_bytes()))?;
            }
        }
        Ok(())
    }

    /// Cells covered by the nodes and ways reachable from `relation`.
    ///
    /// Walks member relations breadth-first with a visited set so cyclic
    /// membership terminates. Members missing from the dataset are skipped.
    fn relation_cells(
        &mut self,
        relation: &OsmRelation,
    ) -> Result<BTreeSet<(i32, i32)>, StoreError> {
        let mut cells = BTreeSet::new();
        let mut visited = HashSet::from([relation.id]);
        let mut queue: VecDeque<RelationMember> = relation.members.iter().cloned().collect();
        while let Some(member) = queue.pop_front() {
            match member.kind {
                ObjectKind::Node => {
                    if let Some(node) =
                        load::<OsmNode>(&mut self.nodes, Section::Nodes, member.object_id)?
                    {
                        cells.insert((
                            bucket_from_lat_or_lon(node.lat),
                            bucket_from_lat_or_lon(node.lon),
                        ));
                    }
                }
                ObjectKind::Way => {
                    if let Some(way) =
                        load::<OsmWay>(&mut self.ways, Section::Ways, member.object_id)?
                    {
                        cells.extend(buckets_for_path(
                            way.points.iter().map(|point| (point.lat, point.lon)),
                        ));
                    }
                }
                ObjectKind::Relation => {
                    if !visited.insert(member.object_id) {
                        continue;
                    }
                    if let Some(nested) = load::<OsmRelation>(
                        &mut self.relations,
                        Section::Relations,
                        member.object_id,
                    )? {
                        queue.extend(nested.members);
                    }
                }
            }
        }
        Ok(cells)
    }

    /// Index every staged relation under the cells its members cover.
    ///
    /// Runs once all batches are staged, so members are found whatever
    /// order the source delivered them in.
    fn index_relations(&mut self) -> Result<(), StoreError> {
        let mut indexed = 0_usize;
        for bucket in self.relations.iter()? {
            let (_, records) = bucket?;
            for record in records {
                let relation = decode_record::<OsmRelation>(&record, Section::Relations)?;
                let cells = self.relation_cells(&relation)?;
                if cells.is_empty() && !relation.tags.is_empty() {
                    warn!(
                        "Relation {} reaches no stored node or way; it is not indexed",
                        relation.id
                    );
                }
                self.index_tags(&cells, ObjectKind::Relation, &relation.tags, relation.id)?;
                indexed += 1;
            }
        }
        debug!("Indexed {indexed} relations");
        Ok(())
    }

    fn write_dataset(&mut self) -> Result<(), StoreError> {
        self.index_relations()?;
        let block_size = self.config.block_size;
        let nodes_path = self.work_dir.join("nodes.section");
        let ways_path = self.work_dir.join("ways.section");
        let relations_path = self.work_dir.join("relations.section");
        let tag_index_path = self.work_dir.join("tag_index.section");

        let nodes = create_section_from_disk(
            &mut self.nodes,
            Section::Nodes,
            &nodes_path,
            block_size,
            |record| decode_record::<OsmNode>(&record, Section::Nodes),
        )?;
        let ways = create_section_from_disk(
            &mut self.ways,
            Section::Ways,
            &ways_path,
            block_size,
            |record| decode_record::<OsmWay>(&record, Section::Ways),
        )?;
        let relations = create_section_from_disk(
            &mut self.relations,
            Section::Relations,
            &relations_path,
            block_size,
            |record| decode_record::<OsmRelation>(&record, Section::Relations),
        )?;
        let tag_index = create_section_from_disk(
            &mut self.tag_index,
            Section::TagIndex,
            &tag_index_path,
            block_size,
            |record| Ok(tag_index_record(record)),
        )?;

        let info = self.info.unwrap_or_else(|| DatasetInfo {
            bounds: self.observed.unwrap_or_default(),
            replication_time_ms: 0,
        });
        let header = Header::new(info, nodes, ways, relations, tag_index);
        let staged = self.work_dir.join("dataset.tmp");
        write_container(
            &staged,
            &header,
            SectionFiles {
                nodes: &nodes_path,
                ways: &ways_path,
                relations: &relations_path,
                tag_index: &tag_index_path,
            },
        )?;
        mapstore_fs::rename_into_place(&staged, &self.output).map_err(|source| {
            StoreError::Io {
                path: self.output.clone(),
                source,
            }
        })
    }

    fn finish_work_dir(&self) -> Result<(), StoreError> {
        if self.config.keep_work_dir {
            info!("Keeping working directory {}", self.work_dir);
            return Ok(());
        }
        remove_work_dir(&self.work_dir)
    }
}

impl FinalStorage for FileStorage {
    type Handle = FileDataSource;
    type Error = StoreError;

    fn set_dataset_info(&mut self, info: DatasetInfo) -> Result<(), Self::Error> {
        self.info = Some(info);
        Ok(())
    }

    fn import_nodes(&mut self, nodes: &[OsmNode]) -> Result<(), Self::Error> {
        for node in nodes {
            store(&mut self.nodes, node.id, node)?;
            self.observed = Some(match self.observed {
                Some(bounds) => bounds.extended(node.lat, node.lon),
                None => Bounds::new(node.lat, node.lat, node.lon, node.lon),
            });
            let cell = (
                bucket_from_lat_or_lon(node.lat),
                bucket_from_lat_or_lon(node.lon),
            );
            self.index_tags(&BTreeSet::from([cell]), ObjectKind::Node, &node.tags, node.id)?;
        }
        debug!("Staged {} nodes", nodes.len());
        Ok(())
    }

    fn import_ways(&mut self, ways: &[OsmWay]) -> Result<(), Self::Error> {
        for way in ways {
            store(&mut self.ways, way.id, way)?;
            let cells = buckets_for_path(way.points.iter().map(|point| (point.lat, point.lon)));
            self.index_tags(&cells, ObjectKind::Way, &way.tags, way.id)?;
        }
        debug!("Staged {} ways", ways.len());
        Ok(())
    }

    /// Relations are only staged here. Their tag-index cells depend on
    /// members that may arrive in later batches, so they are indexed at
    /// commit.
    fn import_relations(&mut self, relations: &[OsmRelation]) -> Result<(), Self::Error> {
        for relation in relations {
            store(&mut self.relations, relation.id, relation)?;
        }
        debug!("Staged {} relations", relations.len());
        Ok(())
    }

    fn commit(mut self) -> Result<Self::Handle, Self::Error> {
        let written = self.write_dataset();
        let cleaned = self.finish_work_dir();
        if let Err(err) = written {
            if let Err(cleanup) = cleaned {
                warn!("Failed to clean up after a failed commit: {cleanup}");
            }
            return Err(err);
        }
        cleaned?;
        info!("Committed dataset {}", self.output);
        FileDataSource::open(&self.output, &self.config)
    }

    fn rollback(self) -> Result<(), Self::Error> {
        info!("Rolling back dataset {}", self.output);
        self.finish_work_dir()
    }
}

fn remove_work_dir(dir: &Utf8Path) -> Result<(), StoreError> {
    mapstore_fs::remove_dir_all(dir).map_err(|source| StoreError::WorkDir {
        path: dir.to_path_buf(),
        source,
    })
}

fn store<T: Serialize>(
    collection: &mut BucketedCollection,
    id: i64,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serialize(value).map_err(|source| StoreError::Encode {
        context: format!("object {id}"),
        source,
    })?;
    collection.set(encode_object_key(id).to_vec(), bytes)?;
    Ok(())
}

fn load<T: DeserializeOwned>(
    collection: &mut BucketedCollection,
    section: Section,
    id: i64,
) -> Result<Option<T>, StoreError> {
    collection
        .get(&encode_object_key(id))?
        .map(|bytes| decode_value(&bytes, || format!("staged {section} record {id}")))
        .transpose()
}

fn decode_record<T: DeserializeOwned>(record: &Record, section: Section) -> Result<T, StoreError> {
    decode_value(&record.value, || format!("staged {section} record"))
}

/// Tag-index values are appended little-endian ids; duplicates arise when an
/// object is re-imported or spans a cell twice.
fn tag_index_record(record: Record) -> TagIndexRecord {
    let mut ids: Vec<i64> = record
        .value
        .chunks_exact(ID_WIDTH)
        .filter_map(|chunk| chunk.try_into().ok().map(i64::from_le_bytes))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    TagIndexRecord {
        key: record.key,
        ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::WayPoint,
        response::{InBoundsResult, TagFilter},
        store::DataSourceConn,
    };
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    struct Workspace {
        _dir: TempDir,
        output: Utf8PathBuf,
    }

    #[fixture]
    fn workspace() -> Workspace {
        let dir = TempDir::new().expect("create temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp dir");
        Workspace {
            _dir: dir,
            output: root.join("out").join("city.mapstore"),
        }
    }

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        Tags::from_pairs(pairs.iter().copied()).expect("unique tag keys")
    }

    fn node(id: i64, lat: f64, lon: f64, pairs: &[(&str, &str)]) -> OsmNode {
        OsmNode {
            id,
            lat,
            lon,
            tags: tags(pairs),
        }
    }

    fn member(object_id: i64, kind: ObjectKind) -> RelationMember {
        RelationMember {
            object_id,
            kind,
            role: String::new(),
        }
    }

    fn path_way(id: i64, nodes: &[&OsmNode], pairs: &[(&str, &str)]) -> OsmWay {
        OsmWay {
            id,
            tags: tags(pairs),
            points: nodes
                .iter()
                .map(|node| WayPoint {
                    node_id: node.id,
                    lat: node.lat,
                    lon: node.lon,
                })
                .collect(),
        }
    }

    fn relation_ids(result: &InBoundsResult, key: &str, value: &str) -> Vec<i64> {
        result
            .relations
            .get(key)
            .and_then(|values| values.get(value))
            .map(|relations| relations.iter().map(|relation| relation.id).collect())
            .unwrap_or_default()
    }

    #[rstest]
    fn work_dir_sits_next_to_output() {
        assert_eq!(
            work_dir_for(Utf8Path::new("/data/city.mapstore")),
            Utf8Path::new("/data/city.mapstore.work")
        );
    }

    #[rstest]
    fn tag_index_values_are_sorted_and_unique() {
        let value: Vec<u8> = [9_i64, -1, 9, 4]
            .iter()
            .flat_map(|id| id.to_le_bytes())
            .collect();
        let record = tag_index_record(Record {
            key: vec![1],
            value,
        });
        assert_eq!(record.ids, [-1, 4, 9]);
    }

    #[rstest]
    fn rollback_removes_work_dir(workspace: Workspace) {
        let mut storage =
            FileStorage::create(&workspace.output, StoreConfig::default()).expect("storage");
        storage
            .import_nodes(&[node(1, 0.0, 0.0, &[("amenity", "bench")])])
            .expect("import");
        let work_dir = storage.work_dir().to_path_buf();
        assert!(work_dir.exists());

        storage.rollback().expect("rollback");
        assert!(!work_dir.exists());
        assert!(!workspace.output.exists());
    }

    #[rstest]
    fn keep_work_dir_survives_commit(workspace: Workspace) {
        let config = StoreConfig {
            keep_work_dir: true,
            ..StoreConfig::default()
        };
        let storage = FileStorage::create(&workspace.output, config).expect("storage");
        let work_dir = storage.work_dir().to_path_buf();
        storage.commit().expect("commit");
        assert!(work_dir.exists());
        assert!(workspace.output.exists());
    }

    #[rstest]
    fn commit_records_observed_bounds_without_header_info(workspace: Workspace) {
        let mut storage =
            FileStorage::create(&workspace.output, StoreConfig::default()).expect("storage");
        storage
            .import_nodes(&[
                node(1, 1.0, 2.0, &[]),
                node(2, -1.0, 5.0, &[("name", "b")]),
            ])
            .expect("import");
        let source = storage.commit().expect("commit");
        let info = source.dataset_info().expect("info");
        assert_eq!(info.bounds, Bounds::new(-1.0, 1.0, 2.0, 5.0));
        assert_eq!(info.replication_time_ms, 0);
    }

    #[rstest]
    fn relation_cycles_are_indexed(workspace: Workspace) {
        let mut storage =
            FileStorage::create(&workspace.output, StoreConfig::default()).expect("storage");
        storage
            .import_nodes(&[node(1, 0.005, 0.005, &[])])
            .expect("nodes");
        storage
            .import_ways(&[OsmWay {
                id: 10,
                tags: Tags::new(),
                points: vec![WayPoint {
                    node_id: 1,
                    lat: 0.005,
                    lon: 0.005,
                }],
            }])
            .expect("ways");
        let first = OsmRelation {
            id: 100,
            tags: tags(&[("type", "a")]),
            members: vec![member(101, ObjectKind::Relation)],
        };
        let second = OsmRelation {
            id: 101,
            tags: tags(&[("type", "b")]),
            members: vec![member(100, ObjectKind::Relation), member(10, ObjectKind::Way)],
        };
        storage
            .import_relations(&[first, second])
            .expect("relations");
        let source = storage.commit().expect("commit");

        let filter = TagFilter::new().with(ObjectKind::Relation, "type");
        let result = source
            .get_in_bounds(&Bounds::new(0.0, 0.009, 0.0, 0.009), &filter)
            .expect("query");
        let values: Vec<_> = result
            .relations
            .get("type")
            .map(|groups| groups.keys().cloned().collect())
            .unwrap_or_default();
        assert_eq!(values, ["a", "b"]);
    }

    #[rstest]
    fn super_relation_finds_child_from_a_later_batch(workspace: Workspace) {
        let mut storage =
            FileStorage::create(&workspace.output, StoreConfig::default()).expect("storage");
        let a = node(1, 0.005, 0.005, &[]);
        let b = node(2, 0.006, 0.006, &[]);
        storage.import_nodes(&[a.clone(), b.clone()]).expect("nodes");
        storage
            .import_ways(&[path_way(10, &[&a, &b], &[])])
            .expect("ways");
        storage
            .import_relations(&[OsmRelation {
                id: 100,
                tags: tags(&[("route_master", "bus")]),
                members: vec![member(200, ObjectKind::Relation)],
            }])
            .expect("first relation batch");
        storage
            .import_relations(&[OsmRelation {
                id: 200,
                tags: tags(&[("route", "bus")]),
                members: vec![member(10, ObjectKind::Way)],
            }])
            .expect("second relation batch");
        let source = storage.commit().expect("commit");

        let filter = TagFilter::new()
            .with(ObjectKind::Relation, "route_master")
            .with(ObjectKind::Relation, "route");
        let result = source
            .get_in_bounds(&Bounds::new(0.0, 0.009, 0.0, 0.009), &filter)
            .expect("query");
        assert_eq!(relation_ids(&result, "route_master", "bus"), [100]);
        assert_eq!(relation_ids(&result, "route", "bus"), [200]);
    }

    #[rstest]
    fn relations_staged_before_their_members_are_indexed(workspace: Workspace) {
        let mut storage =
            FileStorage::create(&workspace.output, StoreConfig::default()).expect("storage");
        let gate = node(1, 0.015, 0.015, &[]);
        let a = node(2, 0.005, 0.005, &[]);
        let b = node(3, 0.006, 0.006, &[]);
        storage
            .import_relations(&[OsmRelation {
                id: 100,
                tags: tags(&[("site", "park")]),
                members: vec![member(1, ObjectKind::Node), member(10, ObjectKind::Way)],
            }])
            .expect("relations");
        storage
            .import_ways(&[path_way(10, &[&a, &b], &[])])
            .expect("ways");
        storage.import_nodes(&[gate, a, b]).expect("nodes");
        let source = storage.commit().expect("commit");

        let filter = TagFilter::new().with(ObjectKind::Relation, "site");
        for cell in [
            Bounds::new(0.0, 0.009, 0.0, 0.009),
            Bounds::new(0.011, 0.019, 0.011, 0.019),
        ] {
            let result = source.get_in_bounds(&cell, &filter).expect("query");
            assert_eq!(relation_ids(&result, "site", "park"), [100], "cell {cell:?}");
        }
    }
}
