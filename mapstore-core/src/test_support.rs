//! In-memory [`FinalStorage`] used by unit and behaviour tests to observe
//! what an import pipeline decided to keep.

use std::convert::Infallible;

use crate::{
    model::{DatasetInfo, OsmNode, OsmRelation, OsmWay},
    store::FinalStorage,
};

/// Everything a [`RecordingStorage`] received, in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordedImport {
    /// Provenance passed to `set_dataset_info`, if any.
    pub info: Option<DatasetInfo>,
    /// Imported nodes.
    pub nodes: Vec<OsmNode>,
    /// Imported ways.
    pub ways: Vec<OsmWay>,
    /// Imported relations.
    pub relations: Vec<OsmRelation>,
    /// Size of every batch, tagged with its kind.
    pub batches: Vec<(&'static str, usize)>,
}

impl RecordedImport {
    /// Identifiers of the imported nodes.
    #[must_use]
    pub fn node_ids(&self) -> Vec<i64> {
        self.nodes.iter().map(|node| node.id).collect()
    }

    /// Identifiers of the imported ways.
    #[must_use]
    pub fn way_ids(&self) -> Vec<i64> {
        self.ways.iter().map(|way| way.id).collect()
    }

    /// Identifiers of the imported relations.
    #[must_use]
    pub fn relation_ids(&self) -> Vec<i64> {
        self.relations.iter().map(|relation| relation.id).collect()
    }
}

/// Storage that keeps every batch in memory and never fails.
#[derive(Debug, Default)]
pub struct RecordingStorage {
    recorded: RecordedImport,
}

impl RecordingStorage {
    /// An empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// What has been imported so far.
    #[must_use]
    pub const fn recorded(&self) -> &RecordedImport {
        &self.recorded
    }
}

impl FinalStorage for RecordingStorage {
    type Handle = RecordedImport;
    type Error = Infallible;

    fn set_dataset_info(&mut self, info: DatasetInfo) -> Result<(), Self::Error> {
        self.recorded.info = Some(info);
        Ok(())
    }

    fn import_nodes(&mut self, nodes: &[OsmNode]) -> Result<(), Self::Error> {
        self.recorded.batches.push(("nodes", nodes.len()));
        self.recorded.nodes.extend_from_slice(nodes);
        Ok(())
    }

    fn import_ways(&mut self, ways: &[OsmWay]) -> Result<(), Self::Error> {
        self.recorded.batches.push(("ways", ways.len()));
        self.recorded.ways.extend_from_slice(ways);
        Ok(())
    }

    fn import_relations(&mut self, relations: &[OsmRelation]) -> Result<(), Self::Error> {
        self.recorded.batches.push(("relations", relations.len()));
        self.recorded.relations.extend_from_slice(relations);
        Ok(())
    }

    fn commit(self) -> Result<Self::Handle, Self::Error> {
        Ok(self.recorded)
    }

    fn rollback(self) -> Result<(), Self::Error> {
        Ok(())
    }
}
