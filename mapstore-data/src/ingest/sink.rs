//! Batch hand-off to storage shared by both pipelines.

use std::collections::HashMap;

use log::info;
use mapstore_core::{DatasetInfo, FinalStorage, OsmNode, OsmRelation, OsmWay, WayPoint};

use super::{
    BatchThrottle, ImportConfig, ImportReport, IngestError, source::RawWay, storage_error,
};

/// Node locations keyed by node id.
pub(super) type Coords = HashMap<i64, (f64, f64)>;

/// Paces batches into storage and keeps the running report.
pub(super) struct Sink<'a, F> {
    storage: &'a mut F,
    throttle: BatchThrottle,
    report: ImportReport,
}

impl<'a, F: FinalStorage> Sink<'a, F> {
    pub(super) fn new(storage: &'a mut F, config: &ImportConfig) -> Self {
        Self {
            storage,
            throttle: BatchThrottle::new(config.max_batches_per_sec),
            report: ImportReport::default(),
        }
    }

    pub(super) fn set_info(&mut self, info: DatasetInfo) -> Result<(), IngestError> {
        self.storage.set_dataset_info(info).map_err(storage_error)
    }

    pub(super) fn report_mut(&mut self) -> &mut ImportReport {
        &mut self.report
    }

    pub(super) fn nodes(&mut self, nodes: &[OsmNode]) -> Result<(), IngestError> {
        if nodes.is_empty() {
            return Ok(());
        }
        self.throttle.wait();
        self.storage.import_nodes(nodes).map_err(storage_error)?;
        self.report.nodes_imported += len_u64(nodes);
        self.report.batches += 1;
        info!("Imported batch of {} nodes", nodes.len());
        Ok(())
    }

    pub(super) fn ways(&mut self, ways: &[OsmWay]) -> Result<(), IngestError> {
        if ways.is_empty() {
            return Ok(());
        }
        self.throttle.wait();
        self.storage.import_ways(ways).map_err(storage_error)?;
        self.report.ways_imported += len_u64(ways);
        self.report.batches += 1;
        info!("Imported batch of {} ways", ways.len());
        Ok(())
    }

    pub(super) fn relations(&mut self, relations: &[OsmRelation]) -> Result<(), IngestError> {
        if relations.is_empty() {
            return Ok(());
        }
        self.throttle.wait();
        self.storage
            .import_relations(relations)
            .map_err(storage_error)?;
        self.report.relations_imported += len_u64(relations);
        self.report.batches += 1;
        info!("Imported batch of {} relations", relations.len());
        Ok(())
    }

    pub(super) fn finish(self) -> ImportReport {
        self.report
    }
}

fn len_u64<T>(items: &[T]) -> u64 {
    u64::try_from(items.len()).unwrap_or(u64::MAX)
}

/// Copy node locations into the way's points. References without a known
/// location are skipped.
pub(super) fn resolve_way(way: RawWay, coords: &Coords) -> OsmWay {
    let points = way
        .node_ids
        .iter()
        .filter_map(|node_id| {
            coords.get(node_id).map(|&(lat, lon)| WayPoint {
                node_id: *node_id,
                lat,
                lon,
            })
        })
        .collect();
    OsmWay {
        id: way.id,
        tags: way.tags,
        points,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapstore_core::Tags;
    use rstest::rstest;

    #[rstest]
    fn resolve_way_keeps_path_order_and_skips_unknown_nodes() {
        let coords = Coords::from([(1, (0.1, 0.2)), (3, (0.3, 0.4))]);
        let way = RawWay {
            id: 9,
            tags: Tags::new(),
            node_ids: vec![3, 2, 1],
        };
        let resolved = resolve_way(way, &coords);
        let ids: Vec<_> = resolved.points.iter().map(|point| point.node_id).collect();
        assert_eq!(ids, [3, 1]);
        assert_eq!(
            resolved.points.first().map(|point| (point.lat, point.lon)),
            Some((0.3, 0.4))
        );
    }
}
