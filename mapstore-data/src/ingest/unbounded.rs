//! Whole-file import.
//!
//! Elements are batched in source order; a change of kind or a full batch
//! closes the current batch. Way batches are resolved by an auxiliary scan
//! that collects the referenced node locations, and every reference must
//! resolve. Relations are stored as read; their members are resolved at
//! query time.

use std::{
    collections::{HashMap, HashSet},
    mem,
};

use log::info;
use mapstore_core::{FinalStorage, OsmNode, OsmRelation, OsmWay};

use super::{
    ImportConfig, ImportReport, IngestError,
    sink::{Coords, Sink, resolve_way},
    source::{ElementSource, OsmElement, RawWay},
};

#[derive(Debug, Default)]
enum Pending {
    #[default]
    Empty,
    Nodes(Vec<OsmNode>),
    Ways(Vec<RawWay>),
    Relations(Vec<OsmRelation>),
}

impl Pending {
    fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Nodes(nodes) => nodes.len(),
            Self::Ways(ways) => ways.len(),
            Self::Relations(relations) => relations.len(),
        }
    }

    fn accepts(&self, element: &OsmElement) -> bool {
        matches!(
            (self, element),
            (Self::Empty, _)
                | (Self::Nodes(_), OsmElement::Node(_))
                | (Self::Ways(_), OsmElement::Way(_))
                | (Self::Relations(_), OsmElement::Relation(_))
        )
    }

    fn push(&mut self, element: OsmElement) {
        match element {
            OsmElement::Node(node) => {
                if let Self::Nodes(nodes) = self {
                    nodes.push(node);
                } else {
                    *self = Self::Nodes(vec![node]);
                }
            }
            OsmElement::Way(way) => {
                if let Self::Ways(ways) = self {
                    ways.push(way);
                } else {
                    *self = Self::Ways(vec![way]);
                }
            }
            OsmElement::Relation(relation) => {
                if let Self::Relations(relations) = self {
                    relations.push(relation);
                } else {
                    *self = Self::Relations(vec![relation]);
                }
            }
        }
    }
}

pub(super) fn run<S, F>(
    source: &S,
    storage: &mut F,
    config: &ImportConfig,
) -> Result<ImportReport, IngestError>
where
    S: ElementSource + ?Sized,
    F: FinalStorage,
{
    let mut sink = Sink::new(storage, config);
    if let Some(info) = source.dataset_info()? {
        sink.set_info(info)?;
    }

    let mut pending = Pending::Empty;
    source.scan(&mut |element| {
        sink.report_mut().record_scanned(&element);
        if !pending.accepts(&element) || pending.len() >= config.batch_size {
            flush(source, &mut sink, mem::take(&mut pending))?;
        }
        pending.push(element);
        Ok(())
    })?;
    sink.report_mut().passes += 1;
    flush(source, &mut sink, pending)?;

    let report = sink.finish();
    info!(
        "Imported {} nodes, {} ways and {} relations in {} batches",
        report.nodes_imported, report.ways_imported, report.relations_imported, report.batches
    );
    Ok(report)
}

fn flush<S, F>(source: &S, sink: &mut Sink<'_, F>, pending: Pending) -> Result<(), IngestError>
where
    S: ElementSource + ?Sized,
    F: FinalStorage,
{
    match pending {
        Pending::Empty => Ok(()),
        Pending::Nodes(nodes) => sink.nodes(&nodes),
        Pending::Ways(ways) => {
            let resolved = resolve_ways(source, ways, sink.report_mut())?;
            sink.ways(&resolved)
        }
        Pending::Relations(relations) => sink.relations(&relations),
    }
}

/// Rescan the source for every node the batch references.
fn resolve_ways<S>(
    source: &S,
    ways: Vec<RawWay>,
    report: &mut ImportReport,
) -> Result<Vec<OsmWay>, IngestError>
where
    S: ElementSource + ?Sized,
{
    let wanted: HashSet<i64> = ways
        .iter()
        .flat_map(|way| way.node_ids.iter().copied())
        .collect();
    let mut coords: Coords = HashMap::with_capacity(wanted.len());
    if !wanted.is_empty() {
        source.scan(&mut |element| {
            match element {
                OsmElement::Node(node) if wanted.contains(&node.id) => {
                    coords.insert(node.id, (node.lat, node.lon));
                }
                _ => {}
            }
            Ok(())
        })?;
        report.passes += 1;
    }
    if coords.len() != wanted.len() {
        return Err(IngestError::UnresolvedNodes {
            wanted: wanted.len(),
            resolved: coords.len(),
        });
    }
    Ok(ways
        .into_iter()
        .map(|way| resolve_way(way, &coords))
        .collect())
}
