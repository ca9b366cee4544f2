//! Behavioural tests for importing extracts into dataset files.

use camino::Utf8PathBuf;
use mapstore_core::{
    Bounds, DataSourceConn, FileDataSource, FileStorage, InBoundsResult, MemberObject,
    ObjectKind, OsmNode, OsmRelation, RelationMember, StoreConfig, StoreError, TagFilter, Tags,
    store::work_dir_for,
};
use mapstore_data::{
    ImportConfig, ImportReport, IngestError, MemorySource, OsmElement, RawWay, import,
    import_pbf_file,
};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use std::{cell::RefCell, fs, path::PathBuf};
use tempfile::TempDir;

struct Extract {
    _dir: TempDir,
    output: Utf8PathBuf,
    pbf: PathBuf,
    elements: Vec<OsmElement>,
}

type ImportOutcome = Result<(FileDataSource, ImportReport), IngestError>;
type QueryOutcome = Result<InBoundsResult, StoreError>;

#[fixture]
fn extract() -> RefCell<Option<Extract>> {
    RefCell::new(None)
}

#[fixture]
fn imported() -> RefCell<Option<ImportOutcome>> {
    RefCell::new(None)
}

#[fixture]
fn query_result() -> RefCell<Option<QueryOutcome>> {
    RefCell::new(None)
}

const OUTLINE: [(i64, f64, f64); 3] = [
    (1, 51.5001, -0.1279),
    (2, 51.5015, -0.1262),
    (3, 51.5008, -0.1271),
];

fn tags(pairs: &[(&str, &str)]) -> Tags {
    Tags::from_pairs(pairs.iter().copied()).expect("unique tag keys")
}

fn node(id: i64, lat: f64, lon: f64) -> OsmElement {
    OsmElement::Node(OsmNode {
        id,
        lat,
        lon,
        tags: Tags::new(),
    })
}

fn way(id: i64, highway: &str, node_ids: &[i64]) -> OsmElement {
    OsmElement::Way(RawWay {
        id,
        tags: tags(&[("highway", highway)]),
        node_ids: node_ids.to_vec(),
    })
}

fn town() -> Bounds {
    Bounds::new(51.49, 51.52, -0.14, -0.11)
}

fn city() -> Bounds {
    Bounds::new(48.85, 48.87, 2.28, 2.31)
}

fn new_extract(elements: Vec<OsmElement>) -> Extract {
    let dir = TempDir::new().expect("create temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp dir");
    Extract {
        output: root.join("extract.mapstore"),
        pbf: dir.path().join("missing.osm.pbf"),
        _dir: dir,
        elements,
    }
}

fn config() -> ImportConfig {
    ImportConfig {
        store: StoreConfig {
            block_size: 2,
            ..StoreConfig::default()
        },
        ..ImportConfig::unthrottled(2)
    }
}

fn run_import(
    extract: &RefCell<Option<Extract>>,
    imported: &RefCell<Option<ImportOutcome>>,
    bounds: Option<Bounds>,
) {
    let guard = extract.borrow();
    let extract = guard.as_ref().expect("extract prepared");
    let config = config();
    let storage = FileStorage::create(&extract.output, config.store.clone()).expect("storage");
    let source = MemorySource::new(extract.elements.clone());
    *imported.borrow_mut() = Some(import(&source, storage, bounds, &config));
}

fn with_dataset<T>(
    imported: &RefCell<Option<ImportOutcome>>,
    read: impl FnOnce(&FileDataSource, &ImportReport) -> T,
) -> T {
    let guard = imported.borrow();
    let (source, report) = guard
        .as_ref()
        .expect("import was attempted")
        .as_ref()
        .expect("expected a successful import");
    read(source, report)
}

#[given("an extract with a wood outlined by one way")]
fn wood_extract(#[from(extract)] extract: &RefCell<Option<Extract>>) {
    let mut elements: Vec<_> = OUTLINE
        .iter()
        .map(|&(id, lat, lon)| node(id, lat, lon))
        .collect();
    elements.push(OsmElement::Way(RawWay {
        id: 10,
        tags: tags(&[("barrier", "hedge")]),
        node_ids: OUTLINE.iter().map(|&(id, _, _)| id).collect(),
    }));
    elements.push(OsmElement::Relation(OsmRelation {
        id: 20,
        tags: tags(&[("natural", "wood"), ("type", "multipolygon")]),
        members: vec![RelationMember {
            object_id: 10,
            kind: ObjectKind::Way,
            role: "outer".to_owned(),
        }],
    }));
    *extract.borrow_mut() = Some(new_extract(elements));
}

#[given("an extract spanning a town and a distant city")]
fn town_and_city(#[from(extract)] extract: &RefCell<Option<Extract>>) {
    let elements = vec![
        node(1, 51.501, -0.128),
        node(2, 51.502, -0.127),
        node(3, 48.858, 2.294),
        node(4, 48.861, 2.297),
        way(10, "footway", &[1, 2]),
        way(11, "primary", &[3, 4]),
    ];
    *extract.borrow_mut() = Some(new_extract(elements));
}

#[given("an extract listing a route master ahead of its route and ways")]
fn route_master_first(#[from(extract)] extract: &RefCell<Option<Extract>>) {
    let mut elements = vec![
        OsmElement::Relation(OsmRelation {
            id: 40,
            tags: tags(&[("route_master", "bus")]),
            members: vec![RelationMember {
                object_id: 30,
                kind: ObjectKind::Relation,
                role: String::new(),
            }],
        }),
        way(10, "busway", &OUTLINE.map(|(id, _, _)| id)),
        OsmElement::Relation(OsmRelation {
            id: 30,
            tags: tags(&[("route", "bus")]),
            members: vec![RelationMember {
                object_id: 10,
                kind: ObjectKind::Way,
                role: "forward".to_owned(),
            }],
        }),
    ];
    elements.extend(OUTLINE.iter().map(|&(id, lat, lon)| node(id, lat, lon)));
    *extract.borrow_mut() = Some(new_extract(elements));
}

#[given("a path to an extract that does not exist")]
fn missing_extract(#[from(extract)] extract: &RefCell<Option<Extract>>) {
    *extract.borrow_mut() = Some(new_extract(Vec::new()));
}

#[when("I import the whole extract")]
fn import_whole(
    #[from(extract)] extract: &RefCell<Option<Extract>>,
    #[from(imported)] imported: &RefCell<Option<ImportOutcome>>,
) {
    run_import(extract, imported, None);
}

#[when("I import only the town")]
fn import_town(
    #[from(extract)] extract: &RefCell<Option<Extract>>,
    #[from(imported)] imported: &RefCell<Option<ImportOutcome>>,
) {
    run_import(extract, imported, Some(town()));
}

#[when("I import the extract from disk")]
fn import_from_disk(
    #[from(extract)] extract: &RefCell<Option<Extract>>,
    #[from(imported)] imported: &RefCell<Option<ImportOutcome>>,
) {
    let guard = extract.borrow();
    let extract = guard.as_ref().expect("extract prepared");
    let outcome = import_pbf_file(&extract.pbf, &extract.output, None, &config());
    *imported.borrow_mut() = Some(outcome);
}

fn query_outline_for(
    imported: &RefCell<Option<ImportOutcome>>,
    result: &RefCell<Option<QueryOutcome>>,
    key: &str,
) {
    let bounds = Bounds::from_points(OUTLINE.iter().map(|&(_, lat, lon)| (lat, lon)))
        .expect("outline has points");
    let filter = TagFilter::new().with(ObjectKind::Relation, key);
    let outcome = with_dataset(imported, |source, _| source.get_in_bounds(&bounds, &filter));
    *result.borrow_mut() = Some(outcome);
}

#[when("I query the outline bounding box for natural relations")]
fn query_outline(
    #[from(imported)] imported: &RefCell<Option<ImportOutcome>>,
    #[from(query_result)] result: &RefCell<Option<QueryOutcome>>,
) {
    query_outline_for(imported, result, "natural");
}

#[when("I query the outline bounding box for route masters")]
fn query_route_masters(
    #[from(imported)] imported: &RefCell<Option<ImportOutcome>>,
    #[from(query_result)] result: &RefCell<Option<QueryOutcome>>,
) {
    query_outline_for(imported, result, "route_master");
}

#[then("the wood resolves to its outline with every point located")]
fn wood_resolves(#[from(query_result)] result: &RefCell<Option<QueryOutcome>>) {
    let guard = result.borrow();
    let result = guard
        .as_ref()
        .expect("query was attempted")
        .as_ref()
        .expect("expected a successful query");
    let woods = result
        .relations
        .get("natural")
        .and_then(|values| values.get("wood"))
        .expect("wood relations");
    let [wood] = woods.as_slice() else {
        panic!("expected a single wood, got {woods:?}");
    };
    assert_eq!(wood.id, 20);
    let [outline] = wood.members.as_slice() else {
        panic!("expected a single member, got {:?}", wood.members);
    };
    assert_eq!(outline.role, "outer");
    let MemberObject::Way(way) = &outline.object else {
        panic!("expected the outline way, got {:?}", outline.object);
    };
    let points: Vec<_> = way
        .points
        .iter()
        .map(|point| (point.node_id, point.lat, point.lon))
        .collect();
    assert_eq!(points, OUTLINE);
}

#[then("the route master resolves through its route to the bus lane")]
fn route_master_resolves(#[from(query_result)] result: &RefCell<Option<QueryOutcome>>) {
    let guard = result.borrow();
    let result = guard
        .as_ref()
        .expect("query was attempted")
        .as_ref()
        .expect("expected a successful query");
    let masters = result
        .relations
        .get("route_master")
        .and_then(|values| values.get("bus"))
        .expect("bus route masters");
    let [master] = masters.as_slice() else {
        panic!("expected a single route master, got {masters:?}");
    };
    assert_eq!(master.id, 40);
    let [route] = master.members.as_slice() else {
        panic!("expected a single route, got {:?}", master.members);
    };
    let MemberObject::Relation(route) = &route.object else {
        panic!("expected the bus route, got {:?}", route.object);
    };
    assert_eq!(route.id, 30);
    let [lane] = route.members.as_slice() else {
        panic!("expected a single way, got {:?}", route.members);
    };
    assert_eq!(lane.role, "forward");
    let MemberObject::Way(way) = &lane.object else {
        panic!("expected the bus lane, got {:?}", lane.object);
    };
    assert_eq!(way.id, 10);
    assert_eq!(way.points.len(), OUTLINE.len());
}

#[then("the city road is reported as dropped")]
fn city_road_dropped(#[from(imported)] imported: &RefCell<Option<ImportOutcome>>) {
    with_dataset(imported, |_, report| {
        assert_eq!(report.ways_imported, 1);
        assert_eq!(report.ways_dropped, 1);
        assert_eq!(report.nodes_imported, 2);
    });
}

#[then("querying the city reports that there is no data for the region")]
fn city_has_no_data(#[from(imported)] imported: &RefCell<Option<ImportOutcome>>) {
    let filter = TagFilter::new().with(ObjectKind::Way, "highway");
    let outcome = with_dataset(imported, |source, _| source.get_in_bounds(&city(), &filter));
    assert!(
        matches!(outcome, Err(StoreError::NoDataForRegion)),
        "expected no data for the city, got {outcome:?}"
    );
}

#[then("the import fails to open the extract")]
fn fails_to_open(#[from(imported)] imported: &RefCell<Option<ImportOutcome>>) {
    let guard = imported.borrow();
    match guard.as_ref().expect("import was attempted") {
        Err(IngestError::Open { .. }) => {}
        Err(other) => panic!("expected an open error, got {other}"),
        Ok(_) => panic!("expected the import to fail"),
    }
}

#[then("no dataset file is left behind")]
fn nothing_left_behind(#[from(extract)] extract: &RefCell<Option<Extract>>) {
    let guard = extract.borrow();
    let extract = guard.as_ref().expect("extract prepared");
    assert!(!extract.output.exists());
    assert!(!work_dir_for(&extract.output).exists());
}

#[scenario(path = "tests/features/import_extracts.feature", index = 0)]
fn importing_whole_extract(
    extract: RefCell<Option<Extract>>,
    imported: RefCell<Option<ImportOutcome>>,
    query_result: RefCell<Option<QueryOutcome>>,
) {
    let _ = (extract, imported, query_result);
}

#[scenario(path = "tests/features/import_extracts.feature", index = 1)]
fn importing_sub_region(
    extract: RefCell<Option<Extract>>,
    imported: RefCell<Option<ImportOutcome>>,
    query_result: RefCell<Option<QueryOutcome>>,
) {
    let _ = (extract, imported, query_result);
}

#[scenario(path = "tests/features/import_extracts.feature", index = 2)]
fn reporting_missing_extract(
    extract: RefCell<Option<Extract>>,
    imported: RefCell<Option<ImportOutcome>>,
    query_result: RefCell<Option<QueryOutcome>>,
) {
    let _ = (extract, imported, query_result);
}

#[scenario(path = "tests/features/import_extracts.feature", index = 3)]
fn importing_relations_ahead_of_members(
    extract: RefCell<Option<Extract>>,
    imported: RefCell<Option<ImportOutcome>>,
    query_result: RefCell<Option<QueryOutcome>>,
) {
    let _ = (extract, imported, query_result);
}

#[test]
fn scenario_indices_follow_feature_order() {
    let feature =
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/features/import_extracts.feature");
    let contents = fs::read_to_string(&feature).unwrap_or_else(|err| {
        panic!("failed to read feature file {feature:?}: {err}");
    });
    let titles: Vec<&str> = contents
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Scenario: "))
        .collect();
    assert_eq!(
        titles,
        [
            "importing a whole extract and querying a relation",
            "importing a sub-region drops ways outside it",
            "reporting a missing extract",
            "importing an extract whose relations come before their members",
        ],
        "scenario order changed in feature file"
    );
}
