//! A shared, growable set of data sources queried together.
//!
//! Readers take the lock shared; adding a source after an import takes it
//! exclusively. Fan-out queries run one scoped thread per overlapping
//! source and gather results over a channel.

use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
    thread,
};

use crossbeam_channel::unbounded;
use log::{debug, warn};
use thiserror::Error;

use crate::{
    bounds::Bounds,
    response::{InBoundsResult, TagFilter},
    store::{DataSourceConn, StoreError},
};

/// Failures from a fan-out query.
#[derive(Debug, Error)]
pub enum ConnSetError {
    /// One or more sources failed for a reason other than lacking data.
    #[error("{} data source(s) failed: {}", .failures.len(), summary(.failures))]
    Aggregate {
        /// Source name and error for every failed source.
        failures: Vec<(String, StoreError)>,
    },
}

fn summary(failures: &[(String, StoreError)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// One source's contribution to a fan-out query.
#[derive(Debug)]
pub struct SourceResult {
    /// Name of the answering source.
    pub source: String,
    /// What it matched.
    pub result: InBoundsResult,
}

/// Data sources available for queries.
#[derive(Default)]
pub struct DbConnSet {
    conns: RwLock<Vec<Arc<dyn DataSourceConn>>>,
}

impl fmt::Debug for DbConnSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .conns()
            .iter()
            .map(|conn| conn.name().to_owned())
            .collect();
        f.debug_struct("DbConnSet").field("conns", &names).finish()
    }
}

impl DbConnSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `conn` available to subsequent queries.
    pub fn add(&self, conn: Arc<dyn DataSourceConn>) {
        debug!("Adding data source {}", conn.name());
        self.conns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
    }

    /// Snapshot of every source.
    #[must_use]
    pub fn conns(&self) -> Vec<Arc<dyn DataSourceConn>> {
        self.conns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sources whose dataset bounds overlap `bounds`.
    ///
    /// Sources that cannot report their bounds are skipped with a warning.
    #[must_use]
    pub fn conns_in_bounds(&self, bounds: &Bounds) -> Vec<Arc<dyn DataSourceConn>> {
        self.conns()
            .into_iter()
            .filter(|conn| match conn.dataset_info() {
                Ok(info) => info.bounds.overlaps(bounds),
                Err(err) => {
                    warn!("Skipping data source {}: {err}", conn.name());
                    false
                }
            })
            .collect()
    }

    /// Query every overlapping source concurrently.
    ///
    /// A source answering [`StoreError::NoDataForRegion`] contributes an
    /// empty result. Any other failure is collected, and if there is at
    /// least one the whole query fails with [`ConnSetError::Aggregate`].
    /// Results come back in the order the sources were added.
    pub fn get_in_bounds(
        &self,
        bounds: &Bounds,
        filter: &TagFilter,
    ) -> Result<Vec<SourceResult>, ConnSetError> {
        let conns = self.conns_in_bounds(bounds);
        let (sender, receiver) = unbounded();
        thread::scope(|scope| {
            for (position, conn) in conns.iter().enumerate() {
                let sender = sender.clone();
                scope.spawn(move || {
                    let outcome = conn.get_in_bounds(bounds, filter);
                    if sender
                        .send((position, conn.name().to_owned(), outcome))
                        .is_err()
                    {
                        warn!("Dropped the answer from data source {}", conn.name());
                    }
                });
            }
        });
        drop(sender);

        let mut answers: Vec<_> = receiver.into_iter().collect();
        answers.sort_by_key(|(position, _, _)| *position);
        let mut results = Vec::with_capacity(answers.len());
        let mut failures = Vec::new();
        for (_, source, outcome) in answers {
            match outcome {
                Ok(result) => results.push(SourceResult { source, result }),
                Err(StoreError::NoDataForRegion) => results.push(SourceResult {
                    source,
                    result: InBoundsResult::default(),
                }),
                Err(err) => failures.push((source, err)),
            }
        }
        if failures.is_empty() {
            Ok(results)
        } else {
            Err(ConnSetError::Aggregate { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DatasetInfo, ObjectKind, OsmNode, Tags};
    use rstest::rstest;

    struct Fake {
        name: &'static str,
        bounds: Bounds,
        outcome: fn() -> Result<InBoundsResult, StoreError>,
    }

    impl DataSourceConn for Fake {
        fn name(&self) -> &str {
            self.name
        }

        fn dataset_info(&self) -> Result<DatasetInfo, StoreError> {
            Ok(DatasetInfo {
                bounds: self.bounds,
                replication_time_ms: 0,
            })
        }

        fn get_in_bounds(
            &self,
            _bounds: &Bounds,
            _filter: &TagFilter,
        ) -> Result<InBoundsResult, StoreError> {
            (self.outcome)()
        }
    }

    fn one_node() -> Result<InBoundsResult, StoreError> {
        let node = OsmNode {
            id: 1,
            lat: 0.5,
            lon: 0.5,
            tags: Tags::from_pairs([("amenity", "bench")]).expect("unique keys"),
        };
        let mut result = InBoundsResult::default();
        result
            .nodes
            .entry("amenity".to_owned())
            .or_default()
            .entry("bench".to_owned())
            .or_default()
            .push(node);
        Ok(result)
    }

    fn no_data() -> Result<InBoundsResult, StoreError> {
        Err(StoreError::NoDataForRegion)
    }

    fn broken() -> Result<InBoundsResult, StoreError> {
        Err(StoreError::HeaderTooLarge { len: 1 })
    }

    fn fake(
        name: &'static str,
        bounds: Bounds,
        outcome: fn() -> Result<InBoundsResult, StoreError>,
    ) -> Arc<dyn DataSourceConn> {
        Arc::new(Fake {
            name,
            bounds,
            outcome,
        })
    }

    fn unit() -> Bounds {
        Bounds::new(0.0, 1.0, 0.0, 1.0)
    }

    fn filter() -> TagFilter {
        TagFilter::new().with(ObjectKind::Node, "amenity")
    }

    #[rstest]
    fn selects_overlapping_sources() {
        let set = DbConnSet::new();
        set.add(fake("near", unit(), one_node));
        set.add(fake("far", Bounds::new(40.0, 41.0, 40.0, 41.0), one_node));

        let names: Vec<_> = set
            .conns_in_bounds(&unit())
            .iter()
            .map(|conn| conn.name().to_owned())
            .collect();
        assert_eq!(names, ["near"]);
        assert_eq!(set.conns().len(), 2);
    }

    #[rstest]
    fn no_data_counts_as_empty_result() {
        let set = DbConnSet::new();
        set.add(fake("a", unit(), one_node));
        set.add(fake("b", unit(), no_data));

        let results = set.get_in_bounds(&unit(), &filter()).expect("fan-out");
        let summary: Vec<_> = results
            .iter()
            .map(|answer| (answer.source.as_str(), answer.result.object_count()))
            .collect();
        assert_eq!(summary, [("a", 1), ("b", 0)]);
    }

    #[rstest]
    fn other_failures_aggregate() {
        let set = DbConnSet::new();
        set.add(fake("ok", unit(), one_node));
        set.add(fake("bad", unit(), broken));
        set.add(fake("worse", unit(), broken));

        let err = set
            .get_in_bounds(&unit(), &filter())
            .expect_err("failures must surface");
        let ConnSetError::Aggregate { failures } = err;
        let names: Vec<_> = failures.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["bad", "worse"]);
    }

    #[rstest]
    fn empty_set_returns_no_results() {
        let set = DbConnSet::new();
        let results = set.get_in_bounds(&unit(), &filter()).expect("fan-out");
        assert!(results.is_empty());
    }
}
