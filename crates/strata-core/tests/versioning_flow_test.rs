//! End-to-end save and history flows against a file-backed database.
//!
//! Assertions go through an independent connection so the state the
//! engine committed is what gets checked.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strata_core::{
    EntityConfig, FieldMap, IdentityKey, Recordable, RetentionPolicy, RevisionEngine, SaveOutcome,
};
use tempfile::TempDir;

const SCHEMA: &str = "
    CREATE TABLE widgets (
        id INTEGER PRIMARY KEY,
        slug TEXT,
        name TEXT,
        qty INTEGER,
        weight REAL,
        note TEXT,
        tombstoned INTEGER NOT NULL DEFAULT 0,
        created_at TEXT,
        updated_at TEXT,
        deleted_at TEXT
    );
    CREATE TABLE widget_revisions (
        snapshot_id TEXT PRIMARY KEY,
        id INTEGER,
        slug TEXT,
        name TEXT,
        qty INTEGER,
        weight REAL,
        note TEXT,
        created_at TEXT
    );
";

fn map(value: Value) -> FieldMap {
    match value {
        Value::Object(m) => m,
        other => panic!("expected object, got {:?}", other),
    }
}

fn file_engine(dir: &TempDir) -> (RevisionEngine, Connection) {
    let path = dir.path().join("strata.db");
    let engine = RevisionEngine::new(&path).unwrap();
    engine.execute_batch(SCHEMA).unwrap();
    let conn = Connection::open(&path).unwrap();
    (engine, conn)
}

fn same_table_config(count: i64) -> EntityConfig {
    EntityConfig::builder("widget")
        .table("widgets")
        .retention(RetentionPolicy::keep(count))
        .key_columns(["slug"])
        .build()
        .unwrap()
}

fn alternate_config(count: i64) -> EntityConfig {
    EntityConfig::builder("widget")
        .table("widgets")
        .retention(RetentionPolicy::keep(count).in_table("widget_revisions"))
        .key_columns(["slug"])
        .build()
        .unwrap()
}

fn identity(config: &EntityConfig, slug: &str) -> IdentityKey {
    IdentityKey::resolve(config, &map(json!({ "slug": slug }))).unwrap()
}

fn count_where(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |row| row.get(0)).unwrap()
}

#[test]
fn test_three_saves_two_snapshots_one_current() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, conn) = file_engine(&dir);
    let config = same_table_config(2);

    let created = engine
        .save(&config, map(json!({"slug": "doc", "name": "A"})))
        .unwrap();
    let id = created.id().clone();
    for name in ["B", "C"] {
        engine
            .save(
                &config,
                map(json!({"id": id.clone(), "slug": "doc", "name": name})),
            )
            .unwrap();
    }

    // Two snapshots sit exactly at the bound, so pruning removes nothing.
    assert_eq!(engine.prune(&config, None).unwrap(), 0);

    let history = engine.history(&config, &identity(&config, "doc"), None).unwrap();
    let names: Vec<_> = history
        .iter()
        .map(|s| s.field("name").unwrap().clone())
        .collect();
    assert_eq!(names, [json!("B"), json!("A")]);

    // Exactly one current version survives, holding the latest state.
    assert_eq!(count_where(&conn, "SELECT COUNT(*) FROM widgets WHERE tombstoned = 0"), 1);
    let current: String = conn
        .query_row("SELECT name FROM widgets WHERE tombstoned = 0", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(current, "C");
}

#[test]
fn test_first_save_creates_no_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, conn) = file_engine(&dir);
    let config = same_table_config(5);

    let outcome = engine
        .save(&config, map(json!({"slug": "doc", "name": "A"})))
        .unwrap();
    assert!(matches!(outcome, SaveOutcome::Created { .. }));

    assert_eq!(count_where(&conn, "SELECT COUNT(*) FROM widgets"), 1);
    assert!(!engine
        .has_revisions(&config, &identity(&config, "doc"))
        .unwrap());
}

#[test]
fn test_alternate_table_keeps_entity_table_clean() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, conn) = file_engine(&dir);
    let config = alternate_config(5);

    let created = engine
        .save(&config, map(json!({"slug": "doc", "name": "v1"})))
        .unwrap();
    let id = created.id().clone();
    engine
        .save(
            &config,
            map(json!({"id": id.clone(), "slug": "doc", "name": "v2"})),
        )
        .unwrap();

    // The entity table holds only the current version.
    assert_eq!(count_where(&conn, "SELECT COUNT(*) FROM widgets"), 1);
    let current: String = conn
        .query_row("SELECT name FROM widgets", [], |row| row.get(0))
        .unwrap();
    assert_eq!(current, "v2");

    // The revision table holds the captured prior state, keyed by a
    // generated id and carrying the source key.
    assert_eq!(count_where(&conn, "SELECT COUNT(*) FROM widget_revisions"), 1);
    let (name, source_id): (String, i64) = conn
        .query_row("SELECT name, id FROM widget_revisions", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!(name, "v1");
    assert_eq!(json!(source_id), id);

    let history = engine.history(&config, &identity(&config, "doc"), None).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].field("name"), Some(&json!("v1")));
}

#[test]
fn test_captured_fields_round_trip_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _conn) = file_engine(&dir);
    let config = same_table_config(5);

    let first = map(json!({
        "slug": "doc",
        "name": "precise",
        "qty": 7,
        "weight": 1.5,
        "note": null
    }));
    let created = engine.save(&config, first.clone()).unwrap();
    let id = created.id().clone();
    engine
        .save(
            &config,
            map(json!({"id": id, "slug": "doc", "name": "changed", "qty": 8, "weight": 2.5, "note": "x"})),
        )
        .unwrap();

    let history = engine.history(&config, &identity(&config, "doc"), None).unwrap();
    assert_eq!(history.len(), 1);
    // Every non-excluded field reads back with its exact saved value.
    assert_eq!(history[0].fields, first);
}

#[test]
fn test_disabled_policy_accrues_no_history() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, conn) = file_engine(&dir);
    let config = EntityConfig::builder("widget")
        .table("widgets")
        .key_columns(["slug"])
        .build()
        .unwrap();

    let created = engine
        .save(&config, map(json!({"slug": "doc", "name": "v1"})))
        .unwrap();
    let id = created.id().clone();
    for name in ["v2", "v3"] {
        let outcome = engine
            .save(
                &config,
                map(json!({"id": id.clone(), "slug": "doc", "name": name})),
            )
            .unwrap();
        assert!(matches!(outcome, SaveOutcome::Overwritten { .. }));
    }

    assert_eq!(count_where(&conn, "SELECT COUNT(*) FROM widgets"), 1);
    assert_eq!(
        count_where(&conn, "SELECT COUNT(*) FROM widgets WHERE tombstoned = 1"),
        0
    );
}

#[test]
fn test_failed_snapshot_aborts_whole_save() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, conn) = file_engine(&dir);
    // The configured revision table does not exist.
    let config = EntityConfig::builder("widget")
        .table("widgets")
        .retention(RetentionPolicy::keep(5).in_table("missing_revisions"))
        .key_columns(["slug"])
        .build()
        .unwrap();

    let created = engine
        .save(&config, map(json!({"slug": "doc", "name": "first"})))
        .unwrap();
    let id = created.id().clone();

    let err = engine
        .save(
            &config,
            map(json!({"id": id, "slug": "doc", "name": "second"})),
        )
        .unwrap_err();
    assert!(err.is_retryable());

    // The aborted save left the current version untouched.
    let current: String = conn
        .query_row("SELECT name FROM widgets", [], |row| row.get(0))
        .unwrap();
    assert_eq!(current, "first");
    assert_eq!(count_where(&conn, "SELECT COUNT(*) FROM widgets"), 1);
}

#[test]
fn test_failed_promotion_rolls_back_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, conn) = file_engine(&dir);
    let config = same_table_config(5);

    let created = engine
        .save(&config, map(json!({"slug": "doc", "name": "first"})))
        .unwrap();
    let id = created.id().clone();

    // The snapshot write succeeds, then the overwrite hits an unknown
    // column; the transaction must unwind both.
    engine
        .save(
            &config,
            map(json!({"id": id, "slug": "doc", "name": "second", "bogus": 1})),
        )
        .unwrap_err();

    assert_eq!(
        count_where(&conn, "SELECT COUNT(*) FROM widgets WHERE tombstoned = 1"),
        0
    );
    let current: String = conn
        .query_row("SELECT name FROM widgets", [], |row| row.get(0))
        .unwrap();
    assert_eq!(current, "first");
}

#[test]
fn test_typed_records_version_like_maps() {
    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: Option<i64>,
        slug: String,
        name: String,
        qty: Option<i64>,
    }
    impl Recordable for Widget {
        fn entity() -> &'static str {
            "widget"
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let (engine, _conn) = file_engine(&dir);
    let config = same_table_config(5);

    let created = engine
        .save_record(
            &config,
            &Widget {
                id: None,
                slug: "doc".to_string(),
                name: "first".to_string(),
                qty: Some(1),
            },
        )
        .unwrap();
    let mut saved: Widget = created.record_as().unwrap();
    assert!(saved.id.is_some());

    saved.name = "second".to_string();
    let outcome = engine.save_record(&config, &saved).unwrap();
    assert!(matches!(outcome, SaveOutcome::Versioned { .. }));

    let history = engine
        .history_for(&config, outcome.record(), None)
        .unwrap();
    let prior: Widget = history[0].to_record().unwrap();
    assert_eq!(prior.name, "first");
    assert_eq!(prior.qty, Some(1));
    // Captured fields never include the primary key.
    assert_eq!(prior.id, None);
}
