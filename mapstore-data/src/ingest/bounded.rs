//! Sub-region import driven to a fixed point.
//!
//! The first pass imports the nodes inside the bounds. Every later pass
//! rescans the whole source and decides each pending way and relation from
//! what earlier passes learnt about its dependencies. A dependency is
//! known (imported), absent (out of bounds or missing from the source) or
//! unknown. Objects with unknown dependencies wait, and the ids they need
//! are requested for the next pass. A pass that requests nothing new and
//! decides nothing is the fixed point.
//!
//! Ways are kept when at least one of their nodes is in bounds. Their
//! out-of-bounds nodes are pulled in so the way keeps its full path.
//! Relations are kept when at least one member was imported.

use std::{
    collections::{BTreeMap, HashSet},
    mem,
};

use log::{debug, info, warn};
use mapstore_core::{
    Bounds, DatasetInfo, FinalStorage, ObjectKind, OsmNode, OsmRelation, OsmWay, RelationMember,
};

use super::{
    ImportConfig, ImportReport, IngestError,
    sink::{Coords, Sink, resolve_way},
    source::{ElementSource, OsmElement, RawWay},
};

const KINDS: [ObjectKind; 3] = [ObjectKind::Node, ObjectKind::Way, ObjectKind::Relation];

/// One id set per object kind.
#[derive(Debug, Default)]
struct IdSets {
    nodes: HashSet<i64>,
    ways: HashSet<i64>,
    relations: HashSet<i64>,
}

impl IdSets {
    const fn get(&self, kind: ObjectKind) -> &HashSet<i64> {
        match kind {
            ObjectKind::Node => &self.nodes,
            ObjectKind::Way => &self.ways,
            ObjectKind::Relation => &self.relations,
        }
    }

    fn get_mut(&mut self, kind: ObjectKind) -> &mut HashSet<i64> {
        match kind {
            ObjectKind::Node => &mut self.nodes,
            ObjectKind::Way => &mut self.ways,
            ObjectKind::Relation => &mut self.relations,
        }
    }

    fn contains(&self, kind: ObjectKind, id: i64) -> bool {
        self.get(kind).contains(&id)
    }

    fn insert(&mut self, kind: ObjectKind, id: i64) -> bool {
        self.get_mut(kind).insert(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dependency {
    Known,
    Absent,
    Unknown,
}

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    requested: usize,
    decided: usize,
}

impl Progress {
    const fn is_fixed_point(self) -> bool {
        self.requested == 0 && self.decided == 0
    }
}

pub(super) fn run<S, F>(
    source: &S,
    storage: &mut F,
    bounds: Bounds,
    config: &ImportConfig,
) -> Result<ImportReport, IngestError>
where
    S: ElementSource + ?Sized,
    F: FinalStorage,
{
    let replication_time_ms = source
        .dataset_info()?
        .map_or(0, |info| info.replication_time_ms);
    let mut import = BoundedImport::new(Sink::new(storage, config), bounds, config.batch_size);
    import.sink.set_info(DatasetInfo {
        bounds,
        replication_time_ms,
    })?;

    import.first_pass(source)?;
    let mut passes = 1;
    loop {
        if passes >= config.max_passes {
            return Err(IngestError::PassLimit { passes });
        }
        let progress = import.next_pass(source)?;
        passes += 1;
        info!(
            "Bounded import pass {passes}: {} new requests, {} decisions",
            progress.requested, progress.decided
        );
        if progress.is_fixed_point() {
            break;
        }
    }
    import.sweep_cycles();
    import.flush_relations()?;

    let report = import.sink.finish();
    info!(
        "Bounded import kept {} nodes, {} ways, {} relations; dropped {} ways, {} relations",
        report.nodes_imported,
        report.ways_imported,
        report.relations_imported,
        report.ways_dropped,
        report.relations_dropped
    );
    Ok(report)
}

struct BoundedImport<'a, F> {
    sink: Sink<'a, F>,
    bounds: Bounds,
    batch_size: usize,
    in_bounds: HashSet<i64>,
    coords: Coords,
    imported: IdSets,
    dropped: IdSets,
    absent: IdSets,
    requested: IdSets,
    unconfirmed: IdSets,
    deferred: BTreeMap<i64, OsmRelation>,
    nodes: Vec<OsmNode>,
    ways: Vec<OsmWay>,
    relations: Vec<OsmRelation>,
}

impl<'a, F: FinalStorage> BoundedImport<'a, F> {
    fn new(sink: Sink<'a, F>, bounds: Bounds, batch_size: usize) -> Self {
        Self {
            sink,
            bounds,
            batch_size,
            in_bounds: HashSet::new(),
            coords: Coords::new(),
            imported: IdSets::default(),
            dropped: IdSets::default(),
            absent: IdSets::default(),
            requested: IdSets::default(),
            unconfirmed: IdSets::default(),
            deferred: BTreeMap::new(),
            nodes: Vec::new(),
            ways: Vec::new(),
            relations: Vec::new(),
        }
    }

    fn first_pass<S>(&mut self, source: &S) -> Result<(), IngestError>
    where
        S: ElementSource + ?Sized,
    {
        source.scan(&mut |element| {
            self.sink.report_mut().record_scanned(&element);
            match element {
                OsmElement::Node(node) if self.bounds.contains(node.lat, node.lon) => {
                    self.in_bounds.insert(node.id);
                    self.accept_node(node)
                }
                _ => Ok(()),
            }
        })?;
        self.sink.report_mut().passes += 1;
        info!(
            "Bounded import pass 1: {} nodes inside the bounds",
            self.in_bounds.len()
        );
        Ok(())
    }

    fn next_pass<S>(&mut self, source: &S) -> Result<Progress, IngestError>
    where
        S: ElementSource + ?Sized,
    {
        let checking = mem::take(&mut self.unconfirmed);
        let mut seen = IdSets::default();
        let mut progress = Progress::default();
        source.scan(&mut |element| {
            let (kind, id) = (element.kind(), element.id());
            if checking.contains(kind, id) {
                seen.insert(kind, id);
            }
            match element {
                OsmElement::Node(node) => {
                    if self.requested.nodes.contains(&node.id)
                        && !self.coords.contains_key(&node.id)
                    {
                        self.accept_node(node)?;
                        progress.decided += 1;
                    }
                    Ok(())
                }
                OsmElement::Way(way) if !self.is_decided(ObjectKind::Way, way.id) => {
                    self.decide_way(way, &mut progress)
                }
                OsmElement::Relation(relation)
                    if !self.is_decided(ObjectKind::Relation, relation.id) =>
                {
                    self.decide_relation(relation, &mut progress)
                }
                OsmElement::Way(_) | OsmElement::Relation(_) => Ok(()),
            }
        })?;
        self.sink.report_mut().passes += 1;

        for kind in KINDS {
            for &id in checking.get(kind) {
                if !seen.contains(kind, id) && self.absent.insert(kind, id) {
                    debug!("Requested {kind} {id} is not in the source");
                    progress.decided += 1;
                }
            }
        }
        Ok(progress)
    }

    fn is_decided(&self, kind: ObjectKind, id: i64) -> bool {
        self.imported.contains(kind, id)
            || self.dropped.contains(kind, id)
            || self.absent.contains(kind, id)
    }

    /// Ask for `id` in the next pass. Returns whether the request is new.
    fn request(&mut self, kind: ObjectKind, id: i64) -> bool {
        if self.requested.insert(kind, id) {
            self.unconfirmed.insert(kind, id);
            true
        } else {
            false
        }
    }

    fn decide_way(&mut self, way: RawWay, progress: &mut Progress) -> Result<(), IngestError> {
        if !way.node_ids.iter().any(|id| self.in_bounds.contains(id)) {
            self.dropped.ways.insert(way.id);
            self.sink.report_mut().ways_dropped += 1;
            progress.decided += 1;
            return Ok(());
        }
        let missing: Vec<i64> = way
            .node_ids
            .iter()
            .copied()
            .filter(|id| !self.coords.contains_key(id) && !self.absent.nodes.contains(id))
            .collect();
        if !missing.is_empty() {
            for id in missing {
                progress.requested += usize::from(self.request(ObjectKind::Node, id));
            }
            return Ok(());
        }

        let way = resolve_way(way, &self.coords);
        self.imported.ways.insert(way.id);
        progress.decided += 1;
        self.ways.push(way);
        if self.ways.len() >= self.batch_size {
            self.flush_ways()?;
        }
        Ok(())
    }

    fn decide_relation(
        &mut self,
        relation: OsmRelation,
        progress: &mut Progress,
    ) -> Result<(), IngestError> {
        let mut known = false;
        let mut unknown = Vec::new();
        for member in &relation.members {
            match self.member_state(relation.id, member) {
                Dependency::Known => known = true,
                Dependency::Absent => {}
                Dependency::Unknown => unknown.push((member.kind, member.object_id)),
            }
        }
        if !unknown.is_empty() {
            for (kind, id) in unknown {
                progress.requested += usize::from(self.request(kind, id));
            }
            self.deferred.insert(relation.id, relation);
            return Ok(());
        }

        self.deferred.remove(&relation.id);
        progress.decided += 1;
        if known {
            self.accept_relation(relation)
        } else {
            debug!("Dropping relation {}: no member is in bounds", relation.id);
            self.dropped.relations.insert(relation.id);
            self.sink.report_mut().relations_dropped += 1;
            Ok(())
        }
    }

    fn member_state(&self, owner: i64, member: &RelationMember) -> Dependency {
        let id = member.object_id;
        match member.kind {
            ObjectKind::Node if self.coords.contains_key(&id) => Dependency::Known,
            ObjectKind::Node
                if self.requested.nodes.contains(&id) && !self.absent.nodes.contains(&id) =>
            {
                Dependency::Unknown
            }
            ObjectKind::Node => Dependency::Absent,
            ObjectKind::Relation if id == owner => Dependency::Absent,
            kind if self.imported.contains(kind, id) => Dependency::Known,
            kind if self.dropped.contains(kind, id) || self.absent.contains(kind, id) => {
                Dependency::Absent
            }
            ObjectKind::Way | ObjectKind::Relation => Dependency::Unknown,
        }
    }

    /// Settle relations still waiting on each other once nothing else can
    /// change. A relation whose member graph reaches an imported node or
    /// way is imported, the rest are dropped.
    fn sweep_cycles(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let mut reaching = HashSet::new();
        loop {
            let before = reaching.len();
            for (&id, relation) in &self.deferred {
                if !reaching.contains(&id)
                    && relation
                        .members
                        .iter()
                        .any(|member| self.reaches_content(member, &reaching))
                {
                    reaching.insert(id);
                }
            }
            if reaching.len() == before {
                break;
            }
        }

        for (id, relation) in mem::take(&mut self.deferred) {
            if reaching.contains(&id) {
                self.imported.relations.insert(id);
                self.relations.push(relation);
            } else {
                warn!("Dropping relation {id}: its member cycle reaches no imported object");
                self.dropped.relations.insert(id);
                self.sink.report_mut().relations_dropped += 1;
            }
        }
    }

    fn reaches_content(&self, member: &RelationMember, reaching: &HashSet<i64>) -> bool {
        let id = member.object_id;
        match member.kind {
            ObjectKind::Node => self.coords.contains_key(&id),
            ObjectKind::Way => self.imported.ways.contains(&id),
            ObjectKind::Relation => {
                self.imported.relations.contains(&id) || reaching.contains(&id)
            }
        }
    }

    fn accept_node(&mut self, node: OsmNode) -> Result<(), IngestError> {
        self.coords.insert(node.id, (node.lat, node.lon));
        self.nodes.push(node);
        if self.nodes.len() >= self.batch_size {
            self.flush_nodes()?;
        }
        Ok(())
    }

    fn accept_relation(&mut self, relation: OsmRelation) -> Result<(), IngestError> {
        self.imported.relations.insert(relation.id);
        self.relations.push(relation);
        if self.relations.len() >= self.batch_size {
            self.flush_relations()?;
        }
        Ok(())
    }

    fn flush_nodes(&mut self) -> Result<(), IngestError> {
        let nodes = mem::take(&mut self.nodes);
        self.sink.nodes(&nodes)
    }

    fn flush_ways(&mut self) -> Result<(), IngestError> {
        self.flush_nodes()?;
        let ways = mem::take(&mut self.ways);
        self.sink.ways(&ways)
    }

    /// Relations are written after every node and way they may reference.
    fn flush_relations(&mut self) -> Result<(), IngestError> {
        self.flush_ways()?;
        let relations = mem::take(&mut self.relations);
        self.sink.relations(&relations)
    }
}
