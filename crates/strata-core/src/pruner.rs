//! Retention pruning: delete the snapshots past each group's retained
//! window.
//!
//! Groups are formed from the configured key columns alone. Pruning
//! first finds groups holding more snapshots than the policy allows,
//! then collects the ids past each group's newest `count` snapshots,
//! and deletes them in one batch. Unbounded and disabled policies
//! prune nothing.

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::Value;

use crate::config::{EntityConfig, StorageMode, CREATED_AT_COLUMN, TOMBSTONE_COLUMN};
use crate::error::{StrataError, StrataResult};
use crate::record::FieldMap;
use crate::store;

/// Delete snapshots in excess of the policy, returning how many rows
/// were removed. The optional filter narrows pruning to snapshots
/// matching every given column value.
pub(crate) fn prune(
    conn: &Connection,
    config: &EntityConfig,
    extra_filter: Option<&FieldMap>,
) -> StrataResult<usize> {
    let policy = config.retention();
    if !policy.is_bounded() {
        return Ok(0);
    }
    let keep = policy.count;
    let table = config.snapshot_table();
    let key_column = config.snapshot_key_column();

    let mut doomed = Vec::new();
    if config.key_columns().is_empty() {
        // No key columns configured: all snapshots form one group.
        let mut params = Vec::new();
        let clauses = base_clauses(config, extra_filter, &mut params)?;
        doomed = excess_ids(conn, table, key_column, &clauses, params, keep)?;
    } else {
        for group in over_limit_groups(conn, config, extra_filter, keep)? {
            let mut params = Vec::new();
            let mut clauses = base_clauses(config, extra_filter, &mut params)?;
            for column in config.key_columns() {
                let value = group.get(column).cloned().unwrap_or(Value::Null);
                clauses.push(store::eq_clause(column, &value, &mut params)?);
            }
            doomed.extend(excess_ids(conn, table, key_column, &clauses, params, keep)?);
        }
    }

    if doomed.is_empty() {
        return Ok(0);
    }
    store::delete_rows(conn, table, key_column, &doomed)
}

/// Filter clauses shared by every pruning query: the tombstone marker
/// in same-table mode plus the caller's extra filter.
fn base_clauses(
    config: &EntityConfig,
    extra_filter: Option<&FieldMap>,
    params: &mut Vec<SqlValue>,
) -> StrataResult<Vec<String>> {
    let mut clauses = Vec::new();
    if config.retention().mode == StorageMode::SameTable {
        clauses.push(format!("{} = 1", store::quote_identifier(TOMBSTONE_COLUMN)));
    }
    if let Some(filter) = extra_filter {
        for (column, value) in filter {
            clauses.push(store::eq_clause(column, value, params)?);
        }
    }
    Ok(clauses)
}

/// Identity groups currently holding more snapshots than the policy
/// keeps, as key-column value maps.
fn over_limit_groups(
    conn: &Connection,
    config: &EntityConfig,
    extra_filter: Option<&FieldMap>,
    keep: i64,
) -> StrataResult<Vec<FieldMap>> {
    let mut params = Vec::new();
    let clauses = base_clauses(config, extra_filter, &mut params)?;
    let key_list = config
        .key_columns()
        .iter()
        .map(|c| store::quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!(
        "SELECT {} FROM {}",
        key_list,
        store::quote_identifier(config.snapshot_table())
    );
    if !clauses.is_empty() {
        sql.push_str(&format!(" WHERE {}", clauses.join(" AND ")));
    }
    params.push(SqlValue::Integer(keep));
    sql.push_str(&format!(
        " GROUP BY {} HAVING COUNT(*) > ?{}",
        key_list,
        params.len()
    ));
    store::query_rows(conn, &sql, params)
}

/// Snapshot keys past the newest `keep` within one group, oldest last.
fn excess_ids(
    conn: &Connection,
    table: &str,
    key_column: &str,
    clauses: &[String],
    params: Vec<SqlValue>,
    keep: i64,
) -> StrataResult<Vec<Value>> {
    let mut sql = format!(
        "SELECT {} FROM {}",
        store::quote_identifier(key_column),
        store::quote_identifier(table)
    );
    if !clauses.is_empty() {
        sql.push_str(&format!(" WHERE {}", clauses.join(" AND ")));
    }
    sql.push_str(&format!(
        " ORDER BY {} DESC, rowid DESC LIMIT -1 OFFSET {}",
        store::quote_identifier(CREATED_AT_COLUMN),
        keep
    ));

    let rows = store::query_rows(conn, &sql, params)?;
    rows.into_iter()
        .map(|mut row| {
            row.remove(key_column).ok_or_else(|| {
                StrataError::storage(format!("snapshot row missing key column '{}'", key_column))
            })
        })
        .collect()
}
