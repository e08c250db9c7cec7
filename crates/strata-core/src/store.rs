//! SQLite access layer for dynamically named tables and columns.
//!
//! Table and column names cannot travel as bound parameters, so every
//! identifier that reaches SQL text is validated against a strict
//! pattern and double-quoted here. Values always travel as bound
//! parameters.

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;

use crate::error::{StrataError, StrataResult};
use crate::record::FieldMap;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Rows deleted per statement when clearing snapshots in bulk.
const DELETE_CHUNK: usize = 500;

/// Validate a table or column name before it is spliced into SQL.
pub(crate) fn ensure_identifier(name: &str) -> StrataResult<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(StrataError::configuration(format!(
            "'{}' is not a valid identifier",
            name
        )))
    }
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name)
}

/// Map a JSON scalar to its SQLite storage value.
pub(crate) fn to_sql_value(value: &Value) -> StrataResult<SqlValue> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Integer(i))
            } else if let Some(f) = n.as_f64().filter(|_| n.is_f64()) {
                Ok(SqlValue::Real(f))
            } else {
                Err(StrataError::configuration(format!(
                    "integer value {} exceeds the signed 64-bit range",
                    n
                )))
            }
        }
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Bool(_) => Err(StrataError::configuration(
            "boolean values are not storable; use 0/1 integers",
        )),
        Value::Array(_) | Value::Object(_) => Err(StrataError::configuration(
            "nested values are not storable; column values must be scalars",
        )),
    }
}

/// Map a column value read from SQLite back to JSON.
pub(crate) fn from_sql_value(value: ValueRef<'_>) -> StrataResult<Value> {
    match value {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(i) => Ok(Value::from(i)),
        ValueRef::Real(f) => Ok(Value::from(f)),
        ValueRef::Text(t) => std::str::from_utf8(t)
            .map(|s| Value::String(s.to_string()))
            .map_err(|_| StrataError::storage("text column holds invalid UTF-8")),
        ValueRef::Blob(_) => Err(StrataError::storage("BLOB columns are not supported")),
    }
}

/// Render an equality clause for one column, appending the bound value.
///
/// Null values compare with `IS NULL` so that null key columns group
/// together instead of matching nothing.
pub(crate) fn eq_clause(
    column: &str,
    value: &Value,
    params: &mut Vec<SqlValue>,
) -> StrataResult<String> {
    ensure_identifier(column)?;
    if value.is_null() {
        Ok(format!("{} IS NULL", quote_identifier(column)))
    } else {
        params.push(to_sql_value(value)?);
        Ok(format!("{} = ?{}", quote_identifier(column), params.len()))
    }
}

fn numbered_params(count: usize) -> String {
    (1..=count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Column names of a table, in declaration order.
pub(crate) fn table_columns(conn: &Connection, table: &str) -> StrataResult<Vec<String>> {
    ensure_identifier(table)?;
    let sql = format!("SELECT * FROM {} LIMIT 0", quote_identifier(table));
    let stmt = conn.prepare(&sql)?;
    Ok(stmt.column_names().iter().map(|s| s.to_string()).collect())
}

/// Insert a row and return the rowid SQLite assigned.
pub(crate) fn insert_row(conn: &Connection, table: &str, fields: &FieldMap) -> StrataResult<i64> {
    ensure_identifier(table)?;
    let mut columns = Vec::with_capacity(fields.len());
    let mut params = Vec::with_capacity(fields.len());
    for (name, value) in fields {
        ensure_identifier(name)?;
        columns.push(quote_identifier(name));
        params.push(to_sql_value(value)?);
    }

    let sql = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", quote_identifier(table))
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(table),
            columns.join(", "),
            numbered_params(params.len())
        )
    };
    conn.execute(&sql, params_from_iter(params))?;
    Ok(conn.last_insert_rowid())
}

/// Read the row whose key column equals `key`. A null key matches
/// nothing.
pub(crate) fn read_row(
    conn: &Connection,
    table: &str,
    key_column: &str,
    key: &Value,
) -> StrataResult<Option<FieldMap>> {
    if key.is_null() {
        return Ok(None);
    }
    ensure_identifier(table)?;
    ensure_identifier(key_column)?;

    let sql = format!(
        "SELECT * FROM {} WHERE {} = ?1",
        quote_identifier(table),
        quote_identifier(key_column)
    );
    let mut stmt = conn.prepare(&sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = stmt.query(params_from_iter([to_sql_value(key)?]))?;

    match rows.next()? {
        Some(row) => {
            let mut map = FieldMap::new();
            for (i, name) in names.iter().enumerate() {
                map.insert(name.clone(), from_sql_value(row.get_ref(i)?)?);
            }
            Ok(Some(map))
        }
        None => Ok(None),
    }
}

/// Update the row whose key column equals `key`, returning how many
/// rows changed. An empty field set is a no-op.
pub(crate) fn update_row(
    conn: &Connection,
    table: &str,
    key_column: &str,
    key: &Value,
    fields: &FieldMap,
) -> StrataResult<usize> {
    if fields.is_empty() {
        return Ok(0);
    }
    ensure_identifier(table)?;
    ensure_identifier(key_column)?;

    let mut assignments = Vec::with_capacity(fields.len());
    let mut params = Vec::with_capacity(fields.len() + 1);
    for (name, value) in fields {
        ensure_identifier(name)?;
        params.push(to_sql_value(value)?);
        assignments.push(format!("{} = ?{}", quote_identifier(name), params.len()));
    }
    params.push(to_sql_value(key)?);

    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?{}",
        quote_identifier(table),
        assignments.join(", "),
        quote_identifier(key_column),
        params.len()
    );
    Ok(conn.execute(&sql, params_from_iter(params))?)
}

/// Delete the rows whose key column matches any of `keys`, in chunks,
/// returning the total number of rows removed.
pub(crate) fn delete_rows(
    conn: &Connection,
    table: &str,
    key_column: &str,
    keys: &[Value],
) -> StrataResult<usize> {
    if keys.is_empty() {
        return Ok(0);
    }
    ensure_identifier(table)?;
    ensure_identifier(key_column)?;

    let mut deleted = 0;
    for chunk in keys.chunks(DELETE_CHUNK) {
        let params = chunk
            .iter()
            .map(to_sql_value)
            .collect::<StrataResult<Vec<_>>>()?;
        let sql = format!(
            "DELETE FROM {} WHERE {} IN ({})",
            quote_identifier(table),
            quote_identifier(key_column),
            numbered_params(params.len())
        );
        deleted += conn.execute(&sql, params_from_iter(params))?;
    }
    Ok(deleted)
}

/// Run a prepared query and collect every row as a field map keyed by
/// the statement's column names.
pub(crate) fn query_rows(
    conn: &Connection,
    sql: &str,
    params: Vec<SqlValue>,
) -> StrataResult<Vec<FieldMap>> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = stmt.query(params_from_iter(params))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = FieldMap::new();
        for (i, name) in names.iter().enumerate() {
            map.insert(name.clone(), from_sql_value(row.get_ref(i)?)?);
        }
        out.push(map);
    }
    Ok(out)
}

/// Run a query whose first column is an integer count.
pub(crate) fn query_count(
    conn: &Connection,
    sql: &str,
    params: Vec<SqlValue>,
) -> StrataResult<i64> {
    let mut stmt = conn.prepare(sql)?;
    let count = stmt.query_row(params_from_iter(params), |row| row.get::<_, i64>(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE items (
                id INTEGER PRIMARY KEY,
                name TEXT,
                qty INTEGER,
                weight REAL,
                note TEXT
            )",
        )
        .unwrap();
        conn
    }

    fn map(value: Value) -> FieldMap {
        match value {
            Value::Object(m) => m,
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[test]
    fn test_identifier_validation() {
        assert!(ensure_identifier("snake_case_1").is_ok());
        assert!(ensure_identifier("_leading").is_ok());
        assert!(ensure_identifier("bad-name").is_err());
        assert!(ensure_identifier("1leading").is_err());
        assert!(ensure_identifier("with space").is_err());
        assert!(ensure_identifier("semi;colon").is_err());
        assert!(ensure_identifier("").is_err());
    }

    #[test]
    fn test_insert_and_read_round_trip() {
        let conn = scratch();
        let rowid = insert_row(
            &conn,
            "items",
            &map(json!({"name": "bolt", "qty": 12, "weight": 0.5, "note": null})),
        )
        .unwrap();

        let row = read_row(&conn, "items", "id", &json!(rowid))
            .unwrap()
            .unwrap();
        assert_eq!(row.get("name"), Some(&json!("bolt")));
        assert_eq!(row.get("qty"), Some(&json!(12)));
        assert_eq!(row.get("weight"), Some(&json!(0.5)));
        assert_eq!(row.get("note"), Some(&Value::Null));
    }

    #[test]
    fn test_read_absent_and_null_keys() {
        let conn = scratch();
        assert!(read_row(&conn, "items", "id", &json!(99)).unwrap().is_none());
        assert!(read_row(&conn, "items", "id", &Value::Null)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_update_row() {
        let conn = scratch();
        let rowid = insert_row(&conn, "items", &map(json!({"name": "bolt", "qty": 1}))).unwrap();

        let changed = update_row(
            &conn,
            "items",
            "id",
            &json!(rowid),
            &map(json!({"qty": 2})),
        )
        .unwrap();
        assert_eq!(changed, 1);

        let row = read_row(&conn, "items", "id", &json!(rowid))
            .unwrap()
            .unwrap();
        assert_eq!(row.get("qty"), Some(&json!(2)));
        assert_eq!(row.get("name"), Some(&json!("bolt")));
    }

    #[test]
    fn test_update_with_no_fields_is_noop() {
        let conn = scratch();
        let rowid = insert_row(&conn, "items", &map(json!({"name": "bolt"}))).unwrap();
        let changed = update_row(&conn, "items", "id", &json!(rowid), &FieldMap::new()).unwrap();
        assert_eq!(changed, 0);
    }

    #[test]
    fn test_delete_rows_subset() {
        let conn = scratch();
        let a = insert_row(&conn, "items", &map(json!({"name": "a"}))).unwrap();
        let b = insert_row(&conn, "items", &map(json!({"name": "b"}))).unwrap();
        let c = insert_row(&conn, "items", &map(json!({"name": "c"}))).unwrap();

        let deleted = delete_rows(&conn, "items", "id", &[json!(a), json!(c)]).unwrap();
        assert_eq!(deleted, 2);
        assert!(read_row(&conn, "items", "id", &json!(b)).unwrap().is_some());
        assert!(read_row(&conn, "items", "id", &json!(a)).unwrap().is_none());
    }

    #[test]
    fn test_eq_clause_null_uses_is_null() {
        let mut params = Vec::new();
        let clause = eq_clause("region", &Value::Null, &mut params).unwrap();
        assert_eq!(clause, "\"region\" IS NULL");
        assert!(params.is_empty());

        let clause = eq_clause("region", &json!("eu"), &mut params).unwrap();
        assert_eq!(clause, "\"region\" = ?1");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_to_sql_value_rejects_unstorable() {
        assert!(to_sql_value(&json!(u64::MAX)).is_err());
        assert!(to_sql_value(&json!(true)).is_err());
        assert!(to_sql_value(&json!([1, 2])).is_err());
        assert!(to_sql_value(&json!(i64::MAX)).is_ok());
        assert!(to_sql_value(&json!(1.5)).is_ok());
    }

    #[test]
    fn test_table_columns() {
        let conn = scratch();
        let columns = table_columns(&conn, "items").unwrap();
        assert_eq!(columns, ["id", "name", "qty", "weight", "note"]);
    }

    #[test]
    fn test_query_count() {
        let conn = scratch();
        insert_row(&conn, "items", &map(json!({"name": "a"}))).unwrap();
        insert_row(&conn, "items", &map(json!({"name": "b"}))).unwrap();
        let count = query_count(&conn, "SELECT COUNT(*) FROM items", Vec::new()).unwrap();
        assert_eq!(count, 2);
    }
}
