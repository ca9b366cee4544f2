use serde::Serialize;

use super::source::OsmElement;

/// Outcome of an import run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Nodes read during the first scan.
    pub nodes_scanned: u64,
    /// Ways read during the first scan.
    pub ways_scanned: u64,
    /// Relations read during the first scan.
    pub relations_scanned: u64,
    /// Nodes handed to storage.
    pub nodes_imported: u64,
    /// Ways handed to storage.
    pub ways_imported: u64,
    /// Relations handed to storage.
    pub relations_imported: u64,
    /// Ways left out because none of their nodes were in bounds.
    pub ways_dropped: u64,
    /// Relations left out because none of their members were imported.
    pub relations_dropped: u64,
    /// Full scans of the source, auxiliary node lookups included.
    pub passes: u64,
    /// Batches handed to storage.
    pub batches: u64,
}

impl ImportReport {
    pub(super) fn record_scanned(&mut self, element: &OsmElement) {
        match element {
            OsmElement::Node(_) => self.nodes_scanned += 1,
            OsmElement::Way(_) => self.ways_scanned += 1,
            OsmElement::Relation(_) => self.relations_scanned += 1,
        }
    }
}
