//! Snapshot capture and persistence.
//!
//! A snapshot is the immutable image of a record's stored state taken
//! just before an overwrite. Same-table snapshots are extra rows in
//! the entity table marked by the tombstone column; alternate-table
//! snapshots live in a dedicated revision table keyed by a generated
//! snapshot id, carrying the source record's primary key alongside.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{
    EntityConfig, StorageMode, CREATED_AT_COLUMN, SNAPSHOT_ID_COLUMN, TOMBSTONE_COLUMN,
};
use crate::error::StrataResult;
use crate::identity::IdentityKey;
use crate::record::{from_field_map, FieldMap, Recordable};
use crate::store;

/// One preserved prior state of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Key of the snapshot row: the rowid in same-table mode, the
    /// generated snapshot id in alternate-table mode.
    pub id: Value,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
    /// Captured field values, excluded fields omitted.
    pub fields: FieldMap,
}

impl Snapshot {
    /// Captured value of one field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Rebuild a typed record from the captured fields. Excluded
    /// fields are absent, so the target type must tolerate them
    /// missing (`Option` fields do).
    pub fn to_record<R: Recordable>(&self) -> StrataResult<R> {
        from_field_map(&self.fields)
    }
}

/// Project the fields a snapshot preserves: everything except the
/// excluded set and the tombstone marker.
pub(crate) fn captured_fields(config: &EntityConfig, prior: &FieldMap) -> FieldMap {
    prior
        .iter()
        .filter(|(name, _)| !config.is_excluded(name) && name.as_str() != TOMBSTONE_COLUMN)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Persist captured fields as a snapshot row, returning its key.
///
/// The snapshot's `created_at` is the capture instant, not the source
/// row's original creation time.
pub(crate) fn write_snapshot(
    conn: &Connection,
    config: &EntityConfig,
    captured: &FieldMap,
    identity: &IdentityKey,
    now: DateTime<Utc>,
) -> StrataResult<Value> {
    let stamp = Value::String(now.to_rfc3339());

    match &config.retention().mode {
        StorageMode::SameTable => {
            let mut row = captured.clone();
            row.insert(TOMBSTONE_COLUMN.to_string(), Value::from(1));
            row.insert(CREATED_AT_COLUMN.to_string(), stamp);
            let rowid = store::insert_row(conn, config.table(), &row)?;
            Ok(Value::from(rowid))
        }
        StorageMode::AlternateTable(table) => {
            let snapshot_id = Uuid::new_v4().to_string();
            let mut row = captured.clone();
            row.insert(
                SNAPSHOT_ID_COLUMN.to_string(),
                Value::String(snapshot_id.clone()),
            );
            if let Some(pk) = identity.primary_key() {
                row.insert(config.primary_key().to_string(), pk.clone());
            }
            row.insert(CREATED_AT_COLUMN.to_string(), stamp);
            store::insert_row(conn, table, &row)?;
            Ok(Value::String(snapshot_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionPolicy;
    use serde_json::json;

    fn map(value: Value) -> FieldMap {
        match value {
            Value::Object(m) => m,
            other => panic!("expected object, got {:?}", other),
        }
    }

    fn widgets_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE widgets (
                id INTEGER PRIMARY KEY,
                slug TEXT,
                name TEXT,
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
                created_at TEXT
            );",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_captured_fields_filter_excluded() {
        let config = EntityConfig::builder("widget")
            .table("widgets")
            .retention(RetentionPolicy::keep(2))
            .key_columns(["slug"])
            .build()
            .unwrap();
        let prior = map(json!({
            "id": 1,
            "slug": "a",
            "name": "first",
            "tombstoned": 0,
            "created_at": "2026-01-01T00:00:00+00:00",
            "updated_at": null,
            "deleted_at": null
        }));

        let captured = captured_fields(&config, &prior);
        assert_eq!(captured, map(json!({"slug": "a", "name": "first"})));
    }

    #[test]
    fn test_same_table_snapshot_row() {
        let conn = widgets_conn();
        let config = EntityConfig::builder("widget")
            .table("widgets")
            .retention(RetentionPolicy::keep(2))
            .key_columns(["slug"])
            .build()
            .unwrap();

        conn.execute(
            "INSERT INTO widgets (id, slug, name) VALUES (1, 'a', 'first')",
            [],
        )
        .unwrap();
        let prior = store::read_row(&conn, "widgets", "id", &json!(1))
            .unwrap()
            .unwrap();
        let captured = captured_fields(&config, &prior);
        let identity = IdentityKey::resolve(&config, &prior).unwrap();

        let id = write_snapshot(&conn, &config, &captured, &identity, Utc::now()).unwrap();
        let snapshot_rowid = id.as_i64().unwrap();
        assert_ne!(snapshot_rowid, 1);

        let row = store::read_row(&conn, "widgets", "id", &id).unwrap().unwrap();
        assert_eq!(row.get("tombstoned"), Some(&json!(1)));
        assert_eq!(row.get("name"), Some(&json!("first")));
        assert!(row.get("created_at").unwrap().is_string());
    }

    #[test]
    fn test_alternate_table_snapshot_row() {
        let conn = widgets_conn();
        let config = EntityConfig::builder("widget")
            .table("widgets")
            .retention(RetentionPolicy::keep(2).in_table("widget_revisions"))
            .key_columns(["slug"])
            .build()
            .unwrap();

        let prior = map(json!({
            "id": 4,
            "slug": "a",
            "name": "first",
            "created_at": null,
            "updated_at": null,
            "deleted_at": null
        }));
        let captured = captured_fields(&config, &prior);
        let identity = IdentityKey::resolve(&config, &prior).unwrap();

        let id = write_snapshot(&conn, &config, &captured, &identity, Utc::now()).unwrap();
        let snapshot_id = id.as_str().unwrap().to_string();

        let row = store::read_row(&conn, "widget_revisions", "snapshot_id", &id)
            .unwrap()
            .unwrap();
        assert_eq!(row.get("id"), Some(&json!(4)));
        assert_eq!(row.get("name"), Some(&json!("first")));
        assert!(Uuid::parse_str(&snapshot_id).is_ok());
    }
}
