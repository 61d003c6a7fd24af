use serde_json::json;
use spacewriter::SpaceWriter;
use spacewriter::config::WriterConfig;
use spacewriter::error::{ErrorClass, WriteError};
use spacewriter::memory::MemoryStore;
use spacewriter::model::{FailureMessage, Feature, Geometry, ModificationRequest, Space};
use std::time::Duration;

const BUDGET: Duration = Duration::from_secs(60);

fn writer(store: &MemoryStore) -> SpaceWriter<MemoryStore> {
    SpaceWriter::new(store.clone(), WriterConfig::default()).expect("writer")
}

fn space_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.create_table("space");
    store
}

fn request() -> ModificationRequest {
    ModificationRequest::new(Space::new("space"))
}

#[test]
fn insert_without_geometry_reports_inserted_id() {
    let store = space_store();
    let result = writer(&store)
        .modify_features_within(request().insert(Feature::new("f1")), BUDGET)
        .expect("modify");

    assert_eq!(result.inserted, vec!["f1"]);
    assert!(result.failed.is_empty());
    assert_eq!(result.version, None);
    assert_eq!(result.features.len(), 1);
    assert!(result.features[0].namespace().uuid.is_some());
    assert!(store.feature("space", "f1").is_some());
}

#[test]
fn stale_prior_uuid_fails_update() {
    let store = space_store();
    store.seed("space", &Feature::new("f1")).expect("seed");

    let result = writer(&store)
        .modify_features_within(
            request()
                .update(Feature::new("f1").with_puuid("OLD"))
                .handle_uuid(true),
            BUDGET,
        )
        .expect("modify");

    assert!(result.updated.is_empty());
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].id.as_deref(), Some("f1"));
    assert_eq!(result.failed[0].message, FailureMessage::UpdateUuid);
}

#[test]
fn current_prior_uuid_updates_and_chains_uuid() {
    let store = space_store();
    let seeded = store.seed("space", &Feature::new("f1")).expect("seed");
    let current = seeded.uuid.expect("uuid");

    let result = writer(&store)
        .modify_features_within(
            request()
                .update(
                    Feature::new("f1")
                        .with_puuid(current.clone())
                        .with_property("name", "moved"),
                )
                .handle_uuid(true),
            BUDGET,
        )
        .expect("modify");

    assert_eq!(result.updated, vec!["f1"]);
    let ns = result.features[0].namespace();
    assert_eq!(ns.puuid.as_deref(), Some(current.as_str()));
    assert_ne!(ns.uuid.as_deref(), Some(current.as_str()));
    let stored = store.feature("space", "f1").expect("stored");
    assert_eq!(stored.properties.values["name"], json!("moved"));
}

#[test]
fn delete_without_prior_uuid_removes_or_reports_missing() {
    let store = space_store();
    store.seed("space", &Feature::new("f1")).expect("seed");
    let writer = writer(&store);

    let removed = writer
        .modify_features_within(request().delete("f1", None).handle_uuid(true), BUDGET)
        .expect("first delete");
    assert_eq!(removed.deleted, vec!["f1"]);
    assert!(store.row("space", "f1").is_none());

    let missing = writer
        .modify_features_within(request().delete("f1", None).handle_uuid(true), BUDGET)
        .expect("second delete");
    assert!(missing.deleted.is_empty());
    assert_eq!(missing.failure_for("f1"), Some(FailureMessage::DeleteNotExists));
}

#[test]
fn checked_delete_with_wrong_uuid_keeps_row() {
    let store = space_store();
    store.seed("space", &Feature::new("f1")).expect("seed");

    let result = writer(&store)
        .modify_features_within(
            request().delete("f1", Some("stale")).handle_uuid(true),
            BUDGET,
        )
        .expect("modify");

    assert_eq!(result.failure_for("f1"), Some(FailureMessage::DeleteUuid));
    assert!(store.feature("space", "f1").is_some());
}

#[test]
fn partial_failures_commit_the_rest() {
    let store = space_store();
    for id in ["b", "c", "d"] {
        store.seed("space", &Feature::new(id)).expect("seed");
    }

    let result = writer(&store)
        .modify_features_within(
            request()
                .insert(Feature::new("a"))
                .insert(Feature::new("b"))
                .update(Feature::new("c").with_property("v", 2))
                .update(Feature::new("z"))
                .delete("d", None),
            BUDGET,
        )
        .expect("modify");

    assert_eq!(result.inserted, vec!["a"]);
    assert_eq!(result.updated, vec!["c"]);
    assert_eq!(result.deleted, vec!["d"]);
    assert_eq!(result.succeeded_count(), 3);
    assert_eq!(result.failed.len(), 2);
    assert_eq!(result.failure_for("b"), Some(FailureMessage::InsertGeneral));
    assert_eq!(result.failure_for("z"), Some(FailureMessage::UpdateNotExists));

    let mut ids = store.ids("space");
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[test]
fn deleted_id_can_be_inserted_again_in_one_request() {
    let store = space_store();
    store.seed("space", &Feature::new("a")).expect("seed");

    let result = writer(&store)
        .modify_features_within(
            request()
                .delete("a", None)
                .insert(Feature::new("a").with_property("v", 2)),
            BUDGET,
        )
        .expect("modify");

    assert_eq!(result.deleted, vec!["a"]);
    assert_eq!(result.inserted, vec!["a"]);
    assert!(result.failed.is_empty());
    let stored = store.feature("space", "a").expect("live again");
    assert_eq!(stored.properties.values["v"], json!(2));
}

#[test]
fn upserts_split_into_inserts_and_updates() {
    let store = space_store();
    store.seed("space", &Feature::new("u1")).expect("seed");

    let result = writer(&store)
        .modify_features_within(
            request()
                .upsert(Feature::new("u1").with_property("v", 1))
                .upsert(Feature::new("u2")),
            BUDGET,
        )
        .expect("modify");

    assert_eq!(result.updated, vec!["u1"]);
    assert_eq!(result.inserted, vec!["u2"]);
    let u1 = store.row("space", "u1").expect("u1");
    assert!(u1.namespace.puuid.is_some());
}

#[test]
fn updates_without_id_or_puuid_fail_with_fixed_messages() {
    let store = space_store();
    store.seed("space", &Feature::new("f1")).expect("seed");

    let result = writer(&store)
        .modify_features_within(
            request()
                .update(Feature::without_id())
                .update(Feature::new("f1"))
                .handle_uuid(true),
            BUDGET,
        )
        .expect("modify");

    assert_eq!(result.failed.len(), 2);
    assert_eq!(result.failed[0].id, None);
    assert_eq!(result.failed[0].message, FailureMessage::UpdateIdMissing);
    assert_eq!(result.failure_for("f1"), Some(FailureMessage::UpdatePuuidMissing));
    assert!(store.statements().is_empty());
}

#[test]
fn features_without_id_get_generated_ids() {
    let store = space_store();
    let result = writer(&store)
        .modify_features_within(
            request()
                .insert(Feature::without_id())
                .upsert(Feature::without_id()),
            BUDGET,
        )
        .expect("modify");

    assert_eq!(result.inserted.len(), 2);
    assert_ne!(result.inserted[0], result.inserted[1]);
    for id in &result.inserted {
        assert!(uuid::Uuid::parse_str(id).is_ok(), "{id}");
        assert!(store.feature("space", id).is_some());
    }
}

#[test]
fn nan_elevation_is_stored_as_zero_and_geometry_stays_out_of_json() {
    let store = space_store();
    writer(&store)
        .modify_features_within(
            request().insert(
                Feature::new("p").with_geometry(Geometry::Point(vec![8.5, 50.1, f64::NAN])),
            ),
            BUDGET,
        )
        .expect("modify");

    let row = store.row("space", "p").expect("row");
    assert_eq!(row.geometry, Some(Geometry::Point(vec![8.5, 50.1, 0.0])));
    assert!(row.jsondata.get("geometry").is_none());
}

#[test]
fn locked_rows_fail_fast_with_nowait() {
    let store = space_store();
    store.seed("space", &Feature::new("f1")).expect("seed");
    store.lock_row("space", "f1");
    let writer =
        SpaceWriter::new(store.clone(), WriterConfig::default().with_nowait(true)).expect("writer");

    let result = writer
        .modify_features_within(request().update(Feature::new("f1")), BUDGET)
        .expect("modify");

    assert_eq!(result.failure_for("f1"), Some(FailureMessage::UpdateNotExists));
    assert_eq!(store.primary_connections(), 1);
}

#[test]
fn old_states_come_back_when_requested() {
    let store = space_store();
    store
        .seed("space", &Feature::new("f1").with_property("name", "before"))
        .expect("seed");

    let result = writer(&store)
        .modify_features_within(
            request()
                .update(Feature::new("f1").with_property("name", "after"))
                .insert(Feature::new("f2"))
                .include_old_states(true),
            BUDGET,
        )
        .expect("modify");

    let old = result.old_features.expect("old states");
    assert_eq!(old.len(), 1);
    assert_eq!(old[0].properties.values["name"], json!("before"));
    let current = store.feature("space", "f1").expect("current");
    assert_eq!(current.properties.values["name"], json!("after"));
}

#[test]
fn ids_written_twice_are_illegal() {
    let store = space_store();
    let err = writer(&store)
        .modify_features_within(
            request()
                .insert(Feature::new("a"))
                .update(Feature::new("a")),
            BUDGET,
        )
        .expect_err("duplicate");

    assert!(matches!(err, WriteError::IllegalArgument(_)));
    assert_eq!(err.class(), ErrorClass::IllegalArgument);
    assert!(store.statements().is_empty());
}

#[test]
fn oversized_operations_are_rejected_before_any_read() {
    let store = space_store();
    let writer = SpaceWriter::new(
        store.clone(),
        WriterConfig::default().with_max_batch_rows(2),
    )
    .expect("writer");

    let err = writer
        .modify_features_within(
            request()
                .insert(Feature::new("a"))
                .insert(Feature::new("b"))
                .insert(Feature::new("c")),
            BUDGET,
        )
        .expect_err("too large");

    assert_eq!(err.class_str(), "PAYLOAD_TOO_LARGE");
    assert_eq!(store.primary_connections(), 0);
}

#[test]
fn empty_requests_touch_nothing() {
    let store = space_store();
    let result = writer(&store)
        .modify_features_within(request().versioned(true), BUDGET)
        .expect("modify");
    assert_eq!(result.succeeded_count(), 0);
    assert_eq!(store.primary_connections(), 0);
    assert_eq!(store.current_version("space"), 0);
}
