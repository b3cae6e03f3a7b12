// ABOUTME: Behavioral tests for the change-tracking synchronizer
// ABOUTME: Drives full runs against the in-memory backend in tests/common

mod common;

use common::*;
use std::time::Duration;
use table_replicator::sync::{
    ChangeTrackingSynchronizer, FailureKind, SqlValue, SyncJob, SyncOptions, SyncPhase,
    Synchronizer,
};

fn synchronizer(db: &MemoryDb) -> ChangeTrackingSynchronizer<MemoryConnector> {
    ChangeTrackingSynchronizer::new(db.connector())
}

#[tokio::test]
async fn test_first_insert_advances_checkpoint_to_its_version() {
    let db = items_setup();
    db.set_last_version(4);
    db.source_insert("items", item(1, "a"));

    let result = synchronizer(&db).synchronize(&items_job()).await;

    assert!(result.success, "unexpected failure: {:?}", result.error_message);
    assert_eq!(result.rows_inserted, 1);
    assert_eq!(result.rows_updated, 0);
    assert_eq!(result.rows_deleted, 0);
    assert_eq!(result.checkpoint, Some(5));
    assert_eq!(result.phase, SyncPhase::Done);
    assert_eq!(db.checkpoint("items"), Some(5));
    assert_eq!(db.dest_rows("mirror.items"), vec![item(1, "a")]);
}

#[tokio::test]
async fn test_update_applies_current_row_image() {
    let db = items_setup();
    db.source_insert("items", item(1, "a"));
    let sync = synchronizer(&db);
    assert!(sync.synchronize(&items_job()).await.success);

    db.source_update("items", item(1, "b"));
    let result = sync.synchronize(&items_job()).await;

    assert!(result.success);
    assert_eq!(result.rows_updated, 1);
    assert_eq!(result.rows_inserted, 0);
    assert_eq!(db.dest_rows("mirror.items"), vec![item(1, "b")]);
}

#[tokio::test]
async fn test_delete_removes_destination_row() {
    let db = items_setup();
    db.source_insert("items", item(1, "a"));
    db.source_insert("items", item(2, "b"));
    let sync = synchronizer(&db);
    assert!(sync.synchronize(&items_job()).await.success);
    let before = db.checkpoint("items").unwrap();

    let version = db.source_delete("items", vec![SqlValue::Int32(1)]);
    let result = sync.synchronize(&items_job()).await;

    assert!(result.success);
    assert_eq!(result.rows_deleted, 1);
    assert_eq!(db.dest_rows("mirror.items"), vec![item(2, "b")]);
    assert_eq!(db.checkpoint("items"), Some(version));
    assert!(version > before);
}

#[tokio::test]
async fn test_no_changes_succeeds_without_writes() {
    let db = items_setup();
    db.source_insert("items", item(1, "a"));
    let sync = synchronizer(&db);
    assert!(sync.synchronize(&items_job()).await.success);
    let checkpoint = db.checkpoint("items");
    let statements = db.data_statements();

    let result = sync.synchronize(&items_job()).await;

    assert!(result.success);
    assert_eq!(result.total_rows(), 0);
    assert_eq!(result.checkpoint, None);
    assert_eq!(db.checkpoint("items"), checkpoint);
    assert_eq!(db.data_statements(), statements);
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let db = items_setup();
    db.source_insert("items", item(1, "a"));
    db.source_insert("items", item(2, "b"));
    db.source_update("items", item(2, "c"));
    let sync = synchronizer(&db);

    assert!(sync.synchronize(&items_job()).await.success);
    let rows = db.dest_rows("mirror.items");
    let merges = db.merge_calls();

    let again = sync.synchronize(&items_job()).await;

    assert!(again.success);
    assert_eq!(again.total_rows(), 0);
    assert_eq!(db.merge_calls(), merges);
    assert_eq!(db.dest_rows("mirror.items"), rows);
}

#[tokio::test]
async fn test_checkpoint_never_moves_backwards() {
    let db = items_setup();
    let sync = synchronizer(&db);

    for i in 0..5 {
        db.source_insert("items", item(i, "x"));
        if i % 2 == 0 {
            db.source_update("items", item(i, "y"));
        }
        assert!(sync.synchronize(&items_job()).await.success);
    }

    let writes = db.checkpoint_writes();
    assert_eq!(writes.len(), 5);
    assert!(writes.windows(2).all(|w| w[0].1 < w[1].1));
    assert_eq!(db.checkpoint("items"), Some(writes[4].1));
}

#[tokio::test]
async fn test_insert_then_update_in_one_window_collapses() {
    let db = items_setup();
    db.source_insert("items", item(1, "a"));
    db.source_update("items", item(1, "b"));

    let result = synchronizer(&db).synchronize(&items_job()).await;

    assert!(result.success);
    assert_eq!(result.rows_inserted, 1);
    assert_eq!(result.rows_updated, 0);
    assert_eq!(result.rows_skipped, 1);
    assert_eq!(result.checkpoint, Some(2));
    assert_eq!(db.dest_rows("mirror.items"), vec![item(1, "b")]);
}

#[tokio::test]
async fn test_delete_then_reinsert_updates_existing_row() {
    let db = items_setup();
    db.source_insert("items", item(1, "a"));
    let sync = synchronizer(&db);
    assert!(sync.synchronize(&items_job()).await.success);

    db.source_delete("items", vec![SqlValue::Int32(1)]);
    db.source_insert("items", item(1, "again"));
    let result = sync.synchronize(&items_job()).await;

    assert!(result.success);
    assert_eq!(result.rows_updated, 1);
    assert_eq!(result.rows_deleted, 0);
    assert_eq!(db.dest_rows("mirror.items"), vec![item(1, "again")]);
}

#[tokio::test]
async fn test_missing_primary_key_fails_before_any_write() {
    let db = MemoryDb::new();
    db.create_source_table("items", ITEM_COLUMNS, &[]);
    db.enable_tracking("items");
    db.create_dest_table("mirror.items", ITEM_COLUMNS, &[]);
    db.source_insert("items", item(1, "a"));

    let result = synchronizer(&db).synchronize(&items_job()).await;

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Precondition));
    assert_eq!(result.phase, SyncPhase::ResolvingKeys);
    assert!(result.error_message.unwrap().contains("no primary key"));
    assert_eq!(db.data_statements(), 0);
    assert!(db.dest_rows("mirror.items").is_empty());
}

#[tokio::test]
async fn test_missing_destination_column_fails_schema_validation() {
    let db = MemoryDb::new();
    db.create_source_table("items", ITEM_COLUMNS, &["id"]);
    db.enable_tracking("items");
    db.create_dest_table("mirror.items", &[("id", "integer", false)], &["id"]);
    db.source_insert("items", item(1, "a"));

    let result = synchronizer(&db).synchronize(&items_job()).await;

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Precondition));
    assert_eq!(result.phase, SyncPhase::ValidatingSchema);
    let message = result.error_message.unwrap();
    assert!(message.contains("'val'"), "message was: {}", message);
    assert_eq!(db.merge_calls(), 0);
}

#[tokio::test]
async fn test_compatible_type_difference_is_only_a_warning() {
    let db = MemoryDb::new();
    db.create_source_table("items", ITEM_COLUMNS, &["id"]);
    db.enable_tracking("items");
    db.create_dest_table(
        "mirror.items",
        &[("id", "bigint", false), ("val", "text", true), ("note", "text", true)],
        &["id"],
    );
    db.source_insert("items", item(7, "a"));

    let result = synchronizer(&db).synchronize(&items_job()).await;

    assert!(result.success, "unexpected failure: {:?}", result.error_message);
    assert_eq!(
        db.dest_rows("mirror.items"),
        vec![vec![SqlValue::Int32(7), SqlValue::from("a"), SqlValue::Null]]
    );
}

#[tokio::test]
async fn test_tracking_disabled_is_a_precondition_failure() {
    let db = MemoryDb::new();
    db.create_source_table("items", ITEM_COLUMNS, &["id"]);
    db.create_dest_table("mirror.items", ITEM_COLUMNS, &["id"]);

    let result = synchronizer(&db).synchronize(&items_job()).await;

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Precondition));
    assert_eq!(result.phase, SyncPhase::CheckingChangeTracking);
    assert!(result.error_message.unwrap().contains("enable-tracking"));
    assert_eq!(db.open_connections(), 0);
}

#[tokio::test]
async fn test_empty_job_fields_fail_without_connecting() {
    let db = items_setup();
    let sync = synchronizer(&db);
    let cases = [
        SyncJob::new("items", "", TARGET_URL, "items", "mirror.items"),
        SyncJob::new("items", SOURCE_URL, " ", "items", "mirror.items"),
        SyncJob::new("items", SOURCE_URL, TARGET_URL, "", "mirror.items"),
        SyncJob::new("items", SOURCE_URL, TARGET_URL, "items", ""),
    ];

    for job in &cases {
        let result = sync.synchronize(job).await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Configuration));
        assert_eq!(result.phase, SyncPhase::Validating);
    }
    assert_eq!(db.connects(), 0);
}

#[tokio::test]
async fn test_same_table_in_same_database_is_rejected() {
    let db = items_setup();
    let job = SyncJob::new(
        "loop",
        "postgresql://app@db.internal:5432/sales",
        "postgresql://etl@DB.internal/sales",
        "items",
        "public.items",
    );

    let result = synchronizer(&db).synchronize(&job).await;

    assert_eq!(result.failure, Some(FailureKind::Configuration));
    assert!(result.error_message.unwrap().contains("same table"));
    assert_eq!(db.connects(), 0);
}

#[tokio::test]
async fn test_invalid_table_name_is_a_configuration_error() {
    let db = items_setup();
    let job = SyncJob::new("bad", SOURCE_URL, TARGET_URL, "items; drop table x", "mirror.items");

    let result = synchronizer(&db).synchronize(&job).await;

    assert_eq!(result.failure, Some(FailureKind::Configuration));
    assert_eq!(db.connects(), 0);
}

#[tokio::test]
async fn test_connection_failure_is_reported_not_raised() {
    let db = items_setup();
    db.fail_connect(true);

    let result = synchronizer(&db).synchronize(&items_job()).await;

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Infrastructure));
    assert_eq!(result.phase, SyncPhase::CheckingChangeTracking);
    assert!(result.error_message.unwrap().contains("connection refused"));
}

#[tokio::test]
async fn test_merge_failure_dead_letters_every_row_and_keeps_checkpoint() {
    let db = items_setup();
    db.source_insert("items", item(1, "a"));
    let sync = synchronizer(&db);
    assert!(sync.synchronize(&items_job()).await.success);
    let checkpoint = db.checkpoint("items");

    db.source_insert("items", item(2, "b"));
    db.source_insert("items", item(3, "c"));
    db.source_update("items", item(1, "z"));
    db.fail_merge(Some("duplicate key value violates unique constraint"));

    let result = sync.synchronize(&items_job()).await;

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Data));
    assert_eq!(result.phase, SyncPhase::Reconciling);
    assert_eq!(db.checkpoint("items"), checkpoint);

    let letters = db.dead_letters();
    assert_eq!(letters.len(), 3);
    assert!(letters.iter().all(|l| l.job_name == "items"));
    assert!(letters[0].error_message.contains("duplicate key value"));
    assert!(letters.iter().any(|l| l.record_data.contains("id=2|val=b")));
    assert_eq!(db.open_connections(), 0);
}

#[tokio::test]
async fn test_failed_batch_is_reread_on_next_run() {
    let db = items_setup();
    db.source_insert("items", item(1, "a"));
    db.source_insert("items", item(2, "b"));
    let sync = synchronizer(&db);

    db.fail_merge(Some("deadlock detected"));
    assert!(!sync.synchronize(&items_job()).await.success);
    assert_eq!(db.checkpoint("items"), None);

    db.fail_merge(None);
    let result = sync.synchronize(&items_job()).await;

    assert!(result.success);
    assert_eq!(result.rows_inserted, 2);
    assert_eq!(db.checkpoint("items"), Some(2));
    assert_eq!(db.dest_rows("mirror.items"), vec![item(1, "a"), item(2, "b")]);
}

#[tokio::test]
async fn test_dead_letter_store_failure_does_not_mask_merge_error() {
    let db = items_setup();
    db.source_insert("items", item(1, "a"));
    db.fail_merge(Some("value too long for type character varying(4)"));
    db.fail_dead_letters(true);

    let result = synchronizer(&db).synchronize(&items_job()).await;

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Data));
    assert!(result.error_message.unwrap().contains("value too long"));
    assert!(db.dead_letters().is_empty());
}

#[tokio::test]
async fn test_merge_timeout_is_a_data_failure() {
    let db = items_setup();
    db.source_insert("items", item(1, "a"));
    db.delay_merge(Some(Duration::from_millis(500)));
    let sync = ChangeTrackingSynchronizer::with_options(
        db.connector(),
        SyncOptions {
            operation_timeout: Duration::from_millis(50),
        },
    );

    let result = sync.synchronize(&items_job()).await;

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Data));
    assert!(result.error_message.unwrap().contains("timed out"));
    assert_eq!(db.dead_letters().len(), 1);
    assert_eq!(db.checkpoint("items"), None);
}

#[tokio::test]
async fn test_connections_released_on_every_path() {
    let db = items_setup();
    let sync = synchronizer(&db);

    db.source_insert("items", item(1, "a"));
    sync.synchronize(&items_job()).await;
    sync.synchronize(&items_job()).await;
    db.source_insert("items", item(2, "b"));
    db.fail_merge(Some("boom"));
    sync.synchronize(&items_job()).await;

    assert_eq!(db.connects(), 6);
    assert_eq!(db.open_connections(), 0);
}

#[tokio::test]
async fn test_late_commit_is_not_skipped_by_checkpoint() {
    let db = items_setup();
    db.source_insert("items", item(1, "a"));
    let sync = synchronizer(&db);
    assert!(sync.synchronize(&items_job()).await.success);
    assert_eq!(db.checkpoint("items"), Some(1));

    // Version 2 is taken by a transaction that commits after version 3.
    let slow = db.source_insert_uncommitted("items", item(2, "slow"));
    db.source_insert("items", item(3, "fast"));

    let held_back = sync.synchronize(&items_job()).await;
    assert!(held_back.success);
    assert_eq!(held_back.total_rows(), 0);
    assert_eq!(db.checkpoint("items"), Some(1));

    db.commit(slow);
    let result = sync.synchronize(&items_job()).await;

    assert!(result.success, "unexpected failure: {:?}", result.error_message);
    assert_eq!(result.rows_inserted, 2);
    assert_eq!(result.checkpoint, Some(3));
    assert_eq!(
        db.dest_rows("mirror.items"),
        vec![item(1, "a"), item(2, "slow"), item(3, "fast")]
    );
}

#[tokio::test]
async fn test_checkpoint_stops_below_open_transaction() {
    let db = items_setup();
    db.source_insert("items", item(1, "a"));
    let _open = db.source_insert_uncommitted("items", item(2, "pending"));
    db.source_insert("items", item(3, "c"));

    let result = synchronizer(&db).synchronize(&items_job()).await;

    assert!(result.success);
    assert_eq!(result.rows_inserted, 1);
    assert_eq!(result.checkpoint, Some(1));
    assert_eq!(db.dest_rows("mirror.items"), vec![item(1, "a")]);
}

#[tokio::test]
async fn test_superseded_changes_are_dead_lettered_too() {
    let db = items_setup();
    db.source_insert("items", item(1, "a"));
    db.source_update("items", item(1, "b"));
    db.source_insert("items", item(2, "c"));
    db.fail_merge(Some("could not serialize access"));

    let result = synchronizer(&db).synchronize(&items_job()).await;

    assert!(!result.success);
    let letters = db.dead_letters();
    assert_eq!(letters.len(), 3);
    assert!(letters[0]
        .record_data
        .starts_with("__sync_change_version=1|__sync_change_operation=I|id=1"));
    assert!(letters[1]
        .record_data
        .starts_with("__sync_change_version=2|__sync_change_operation=U|id=1"));
}
