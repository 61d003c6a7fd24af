use spacewriter::SpaceWriter;
use spacewriter::config::WriterConfig;
use spacewriter::memory::MemoryStore;
use spacewriter::model::{Feature, ModificationRequest, Space};
use std::time::Duration;

const BUDGET: Duration = Duration::from_secs(60);

fn setup() -> (MemoryStore, SpaceWriter<MemoryStore>) {
    let store = MemoryStore::new();
    store.create_table("space");
    let writer = SpaceWriter::new(store.clone(), WriterConfig::default()).expect("writer");
    (store, writer)
}

fn versioned() -> ModificationRequest {
    ModificationRequest::new(Space::new("space")).versioned(true)
}

#[test]
fn rows_of_one_call_share_a_version_that_grows_across_calls() {
    let (store, writer) = setup();

    let first = writer
        .modify_features_within(
            versioned().insert(Feature::new("a")).insert(Feature::new("b")),
            BUDGET,
        )
        .expect("first");
    let v1 = first.version.expect("version");
    assert!(
        first
            .features
            .iter()
            .all(|f| f.namespace().version == Some(v1))
    );

    let second = writer
        .modify_features_within(
            versioned()
                .update(Feature::new("a").with_property("n", 2))
                .transactional(true),
            BUDGET,
        )
        .expect("second");
    let v2 = second.version.expect("version");
    assert!(v2 > v1);
    assert_eq!(store.current_version("space"), v2);

    let history = store.history("space");
    assert_eq!(history.len(), 3);
    assert_eq!(
        history.iter().filter(|h| h.version == v1).count(),
        2,
        "{history:?}"
    );
    assert!(history.iter().any(|h| h.id == "a" && h.version == v2));
}

#[test]
fn versioned_delete_soft_deletes_and_records_history() {
    let (store, writer) = setup();
    store.seed("space", &Feature::new("gone")).expect("seed");

    let result = writer
        .modify_features_within(versioned().delete("gone", None), BUDGET)
        .expect("delete");

    let version = result.version.expect("version");
    assert_eq!(result.deleted, vec!["gone"]);
    assert!(store.feature("space", "gone").is_none());
    let row = store.row("space", "gone").expect("tombstone row");
    assert!(row.is_deleted());
    assert_eq!(row.namespace.version, Some(version));

    let history = store.history("space");
    assert!(history.iter().any(|h| h.id == "gone" && h.deleted && h.version == version));
    assert_eq!(store.purge_soft_deleted("space"), 1);
}

#[test]
fn soft_deleted_rows_cannot_be_deleted_twice() {
    let (store, writer) = setup();
    store.seed("space", &Feature::new("gone")).expect("seed");
    writer
        .modify_features_within(versioned().delete("gone", None), BUDGET)
        .expect("delete");

    let again = writer
        .modify_features_within(versioned().delete("gone", None), BUDGET)
        .expect("second delete");
    assert!(again.deleted.is_empty());
    assert_eq!(again.failed.len(), 1);
}

#[test]
fn soft_deleted_id_can_be_inserted_again_in_one_request() {
    let (store, writer) = setup();
    store.seed("space", &Feature::new("a")).expect("seed");

    let result = writer
        .modify_features_within(
            versioned().delete("a", None).insert(Feature::new("a")),
            BUDGET,
        )
        .expect("modify");

    let version = result.version.expect("version");
    assert_eq!(result.deleted, vec!["a"]);
    assert_eq!(result.inserted, vec!["a"]);
    assert!(result.failed.is_empty());
    let row = store.row("space", "a").expect("row");
    assert!(!row.is_deleted());
    assert_eq!(row.namespace.version, Some(version));
    assert!(
        store
            .history("space")
            .iter()
            .any(|h| h.id == "a" && h.deleted && h.version == version)
    );
}

#[test]
fn unversioned_requests_leave_the_sequence_alone() {
    let (store, writer) = setup();
    let result = writer
        .modify_features_within(
            ModificationRequest::new(Space::new("space")).insert(Feature::new("a")),
            BUDGET,
        )
        .expect("insert");
    assert_eq!(result.version, None);
    assert_eq!(store.current_version("space"), 0);
    assert!(store.history("space").is_empty());
}
