//! Revision queries over stored snapshots.
//!
//! History is ordered newest first by capture time, with the rowid as
//! a tiebreaker so two snapshots taken within one clock tick still
//! order by insertion. A bounded policy caps how much history the
//! queries surface, ahead of the pruner physically enforcing it.

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::Value;

use crate::config::{EntityConfig, StorageMode, CREATED_AT_COLUMN, TOMBSTONE_COLUMN};
use crate::error::{StrataError, StrataResult};
use crate::identity::IdentityKey;
use crate::record::FieldMap;
use crate::snapshot::Snapshot;
use crate::store;

/// Snapshots for one identity, newest first, capped by a bounded
/// policy's count.
pub(crate) fn history(
    conn: &Connection,
    config: &EntityConfig,
    identity: &IdentityKey,
    columns: Option<&[&str]>,
) -> StrataResult<Vec<Snapshot>> {
    let policy = config.retention();
    let cap = policy.is_bounded().then_some(policy.count);
    let (sql, params) = build_select(config, identity, columns, cap, None)?;
    let rows = store::query_rows(conn, &sql, params)?;
    rows.into_iter()
        .map(|row| row_to_snapshot(config, row))
        .collect()
}

/// Positional access into history, 1-indexed from the most recent
/// snapshot. Positions outside the capped history are an absence, not
/// an error.
pub(crate) fn revision_at(
    conn: &Connection,
    config: &EntityConfig,
    identity: &IdentityKey,
    position: usize,
    columns: Option<&[&str]>,
) -> StrataResult<Option<Snapshot>> {
    if position == 0 {
        return Ok(None);
    }
    let policy = config.retention();
    if policy.is_bounded() && position as i64 > policy.count {
        return Ok(None);
    }
    let (sql, params) = build_select(config, identity, columns, Some(1), Some(position as i64 - 1))?;
    let rows = store::query_rows(conn, &sql, params)?;
    rows.into_iter()
        .next()
        .map(|row| row_to_snapshot(config, row))
        .transpose()
}

/// Number of stored snapshots for one identity, uncapped.
pub(crate) fn revision_count(
    conn: &Connection,
    config: &EntityConfig,
    identity: &IdentityKey,
) -> StrataResult<i64> {
    let mut params = Vec::new();
    let clauses = base_clauses(config, identity, &mut params)?;
    let mut sql = format!(
        "SELECT COUNT(*) FROM {}",
        store::quote_identifier(config.snapshot_table())
    );
    if !clauses.is_empty() {
        sql.push_str(&format!(" WHERE {}", clauses.join(" AND ")));
    }
    store::query_count(conn, &sql, params)
}

/// Filter clauses every snapshot query shares: the tombstone marker in
/// same-table mode plus identity key equality.
fn base_clauses(
    config: &EntityConfig,
    identity: &IdentityKey,
    params: &mut Vec<SqlValue>,
) -> StrataResult<Vec<String>> {
    let mut clauses = Vec::new();
    if config.retention().mode == StorageMode::SameTable {
        clauses.push(format!("{} = 1", store::quote_identifier(TOMBSTONE_COLUMN)));
    }
    for (column, value) in identity.keys() {
        clauses.push(store::eq_clause(column, value, params)?);
    }
    Ok(clauses)
}

fn build_select(
    config: &EntityConfig,
    identity: &IdentityKey,
    columns: Option<&[&str]>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> StrataResult<(String, Vec<SqlValue>)> {
    let key_column = config.snapshot_key_column();
    let mut params = Vec::new();
    let clauses = base_clauses(config, identity, &mut params)?;

    let select_list = match columns {
        None => "*".to_string(),
        Some(cols) => {
            // The key and timestamp always ride along so rows can be
            // materialized into snapshots.
            let mut list = vec![
                store::quote_identifier(key_column),
                store::quote_identifier(CREATED_AT_COLUMN),
            ];
            for col in cols {
                store::ensure_identifier(col)?;
                if *col == key_column || *col == CREATED_AT_COLUMN {
                    continue;
                }
                list.push(store::quote_identifier(col));
            }
            list.join(", ")
        }
    };

    let mut sql = format!(
        "SELECT {} FROM {}",
        select_list,
        store::quote_identifier(config.snapshot_table())
    );
    if !clauses.is_empty() {
        sql.push_str(&format!(" WHERE {}", clauses.join(" AND ")));
    }
    sql.push_str(&format!(
        " ORDER BY {} DESC, rowid DESC",
        store::quote_identifier(CREATED_AT_COLUMN)
    ));
    match (limit, offset) {
        (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
        (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
        (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
        (None, None) => {}
    }
    Ok((sql, params))
}

fn row_to_snapshot(config: &EntityConfig, mut row: FieldMap) -> StrataResult<Snapshot> {
    let key_column = config.snapshot_key_column();
    let id = row.remove(key_column).ok_or_else(|| {
        StrataError::storage(format!("snapshot row missing key column '{}'", key_column))
    })?;
    let created_at = match row.remove(CREATED_AT_COLUMN) {
        Some(Value::String(text)) => DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                StrataError::storage(format!("invalid snapshot timestamp '{}': {}", text, e))
            })?,
        _ => return Err(StrataError::storage("snapshot row missing created_at")),
    };

    row.remove(TOMBSTONE_COLUMN);
    for field in config.excluded_fields() {
        row.remove(field);
    }
    Ok(Snapshot {
        id,
        created_at,
        fields: row,
    })
}
