//! The revision engine: a SQLite handle behind the versioning facade.
//!
//! Every save runs inside one transaction, so the snapshot write and
//! the current-row overwrite land together or not at all. Reads take
//! the same connection but no transaction.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{
    EntityConfig, EntityRegistry, CREATED_AT_COLUMN, TOMBSTONE_COLUMN, UPDATED_AT_COLUMN,
};
use crate::error::{StrataError, StrataResult};
use crate::identity::IdentityKey;
use crate::interceptor::{self, SaveDisposition};
use crate::pruner;
use crate::record::{self, from_field_map, to_field_map, FieldMap, Recordable};
use crate::revisions;
use crate::snapshot::Snapshot;
use crate::store;

/// What a completed save did.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// First save of this record; the store assigned or adopted its key.
    Created { id: Value, record: FieldMap },
    /// Versioning did not apply; the row was overwritten in place.
    Overwritten { id: Value, record: FieldMap },
    /// Prior state captured as a snapshot, then the row promoted.
    Versioned {
        id: Value,
        snapshot_id: Value,
        record: FieldMap,
    },
}

impl SaveOutcome {
    /// Primary key of the saved record.
    pub fn id(&self) -> &Value {
        match self {
            Self::Created { id, .. } | Self::Overwritten { id, .. } | Self::Versioned { id, .. } => {
                id
            }
        }
    }

    /// The current row as stored after the save.
    pub fn record(&self) -> &FieldMap {
        match self {
            Self::Created { record, .. }
            | Self::Overwritten { record, .. }
            | Self::Versioned { record, .. } => record,
        }
    }

    /// Key of the snapshot a versioned save wrote.
    pub fn snapshot_id(&self) -> Option<&Value> {
        match self {
            Self::Versioned { snapshot_id, .. } => Some(snapshot_id),
            _ => None,
        }
    }

    /// Rebuild the stored row as a typed record.
    pub fn record_as<R: Recordable>(&self) -> StrataResult<R> {
        from_field_map(self.record())
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Overwritten { .. } => "overwritten",
            Self::Versioned { .. } => "versioned",
        }
    }
}

/// Versioning engine over one SQLite database.
pub struct RevisionEngine {
    conn: Mutex<Connection>,
}

impl RevisionEngine {
    /// Open or create the database at the given path.
    pub fn new(db_path: impl AsRef<Path>) -> StrataResult<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Engine over a private in-memory database. Useful for tests.
    pub fn in_memory() -> StrataResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run raw DDL on the underlying connection. Schema stays under
    /// the caller's control; the engine never creates tables.
    pub fn execute_batch(&self, sql: &str) -> StrataResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(sql)?;
        Ok(())
    }

    /// Save a record under the entity's versioning policy.
    ///
    /// When the payload carries the key of a stored row and the policy
    /// is enabled, the stored state is snapshotted and the row is
    /// promoted to the submitted state. Otherwise the payload passes
    /// through as a plain insert or in-place overwrite. Either way the
    /// whole save is one transaction.
    pub fn save(&self, config: &EntityConfig, payload: FieldMap) -> StrataResult<SaveOutcome> {
        record::ensure_scalar_fields(&payload)?;
        let now = Utc::now();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let outcome = match interceptor::evaluate(&tx, config, &payload, now)? {
            SaveDisposition::Proceed(fields) => write_through(&tx, config, &fields, now)?,
            SaveDisposition::Handled(receipt) => SaveOutcome::Versioned {
                id: receipt.id,
                snapshot_id: receipt.snapshot_id,
                record: receipt.record,
            },
        };
        tx.commit()?;

        debug!(
            entity = config.entity(),
            outcome = outcome.kind(),
            "save complete"
        );
        Ok(outcome)
    }

    /// Save a typed record. See [`RevisionEngine::save`].
    pub fn save_record<R: Recordable>(
        &self,
        config: &EntityConfig,
        record: &R,
    ) -> StrataResult<SaveOutcome> {
        self.save(config, to_field_map(record)?)
    }

    /// Snapshots for one identity, newest first. A bounded policy caps
    /// the result at its count. `columns` restricts which captured
    /// fields are loaded.
    pub fn history(
        &self,
        config: &EntityConfig,
        identity: &IdentityKey,
        columns: Option<&[&str]>,
    ) -> StrataResult<Vec<Snapshot>> {
        let conn = self.conn.lock().unwrap();
        revisions::history(&conn, config, identity, columns)
    }

    /// History for the record the given fields describe.
    pub fn history_for(
        &self,
        config: &EntityConfig,
        fields: &FieldMap,
        columns: Option<&[&str]>,
    ) -> StrataResult<Vec<Snapshot>> {
        let identity = IdentityKey::resolve(config, fields)?;
        self.history(config, &identity, columns)
    }

    /// The snapshot at a 1-indexed position from the most recent, or
    /// `None` when the position falls outside the history.
    pub fn revision_at(
        &self,
        config: &EntityConfig,
        identity: &IdentityKey,
        position: usize,
        columns: Option<&[&str]>,
    ) -> StrataResult<Option<Snapshot>> {
        let conn = self.conn.lock().unwrap();
        revisions::revision_at(&conn, config, identity, position, columns)
    }

    /// Whether any snapshot exists for the identity. Always false
    /// under a disabled policy.
    pub fn has_revisions(
        &self,
        config: &EntityConfig,
        identity: &IdentityKey,
    ) -> StrataResult<bool> {
        if !config.retention().is_enabled() {
            return Ok(false);
        }
        let conn = self.conn.lock().unwrap();
        Ok(revisions::revision_count(&conn, config, identity)? > 0)
    }

    /// Number of stored snapshots for the identity. Counts physical
    /// rows, past any bounded policy's cap, so it reports what pruning
    /// would see.
    pub fn revision_count(
        &self,
        config: &EntityConfig,
        identity: &IdentityKey,
    ) -> StrataResult<i64> {
        let conn = self.conn.lock().unwrap();
        revisions::revision_count(&conn, config, identity)
    }

    /// Delete snapshots past the retention bound, one transaction,
    /// returning how many rows went. The optional filter narrows
    /// pruning to snapshots matching every given column value.
    pub fn prune(
        &self,
        config: &EntityConfig,
        extra_filter: Option<&FieldMap>,
    ) -> StrataResult<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let deleted = pruner::prune(&tx, config, extra_filter)?;
        tx.commit()?;
        drop(conn);

        if deleted > 0 {
            info!(
                entity = config.entity(),
                deleted, "pruned snapshots past retention"
            );
        }
        Ok(deleted)
    }

    /// Resolve an entity by name and prune it. The trigger surface for
    /// schedulers and operational tooling.
    pub fn cleanup(&self, registry: &EntityRegistry, entity: &str) -> StrataResult<usize> {
        let config = registry.resolve(entity)?;
        self.prune(config, None)
    }
}

/// Plain write path for pass-through saves: insert when the payload
/// has no key or no row matches it, overwrite in place otherwise.
fn write_through(
    conn: &Connection,
    config: &EntityConfig,
    payload: &FieldMap,
    now: DateTime<Utc>,
) -> StrataResult<SaveOutcome> {
    let columns = store::table_columns(conn, config.table())?;
    let stamp = Value::String(now.to_rfc3339());

    // Data fields the payload contributes. The tombstone marker is
    // engine-owned and excluded fields are engine-stamped.
    let mut fields = FieldMap::new();
    for (name, value) in payload {
        if name.as_str() == config.primary_key()
            || config.is_excluded(name)
            || name.as_str() == TOMBSTONE_COLUMN
        {
            continue;
        }
        fields.insert(name.clone(), value.clone());
    }

    let pk = payload
        .get(config.primary_key())
        .filter(|v| !v.is_null())
        .cloned();

    if let Some(pk) = pk {
        let mut update = fields.clone();
        if config.is_excluded(UPDATED_AT_COLUMN) && columns.iter().any(|c| c == UPDATED_AT_COLUMN) {
            update.insert(UPDATED_AT_COLUMN.to_string(), stamp.clone());
        }
        let changed = store::update_row(conn, config.table(), config.primary_key(), &pk, &update)?;
        if changed > 0 {
            let record = store::read_row(conn, config.table(), config.primary_key(), &pk)?
                .ok_or_else(|| StrataError::storage("current row vanished during save"))?;
            return Ok(SaveOutcome::Overwritten { id: pk, record });
        }

        // Caller-assigned key with no stored row: adopt it.
        let mut insert = fields;
        insert.insert(config.primary_key().to_string(), pk.clone());
        stamp_new_row(&mut insert, config, &columns, &stamp);
        store::insert_row(conn, config.table(), &insert)?;
        let record = store::read_row(conn, config.table(), config.primary_key(), &pk)?
            .ok_or_else(|| StrataError::storage("inserted row not readable"))?;
        return Ok(SaveOutcome::Created { id: pk, record });
    }

    stamp_new_row(&mut fields, config, &columns, &stamp);
    let rowid = store::insert_row(conn, config.table(), &fields)?;
    let id = Value::from(rowid);
    let record = store::read_row(conn, config.table(), "rowid", &id)?
        .ok_or_else(|| StrataError::storage("inserted row not readable"))?;
    Ok(SaveOutcome::Created { id, record })
}

/// Stamp the timestamp columns a new row should carry, when they are
/// excluded from capture and the table has them.
fn stamp_new_row(fields: &mut FieldMap, config: &EntityConfig, columns: &[String], stamp: &Value) {
    for name in [CREATED_AT_COLUMN, UPDATED_AT_COLUMN] {
        if config.is_excluded(name) && columns.iter().any(|c| c == name) {
            fields.insert(name.to_string(), stamp.clone());
        }
    }
}
