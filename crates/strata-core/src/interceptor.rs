//! Save interception: pass-through or snapshot-then-promote.
//!
//! Every save is classified before anything is written. A payload with
//! no primary key, a disabled policy, or a key that matches no stored
//! row passes through unchanged. Otherwise the stored state is
//! captured as a snapshot first and the current row is promoted to the
//! submitted state second, so a failure between the two steps leaves
//! the snapshot to be rolled back with the rest of the transaction.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;
use tracing::debug;

use crate::config::{EntityConfig, CREATED_AT_COLUMN, TOMBSTONE_COLUMN, UPDATED_AT_COLUMN};
use crate::error::{StrataError, StrataResult};
use crate::identity::IdentityKey;
use crate::record::FieldMap;
use crate::snapshot;
use crate::store;

/// How a save is to be completed.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveDisposition {
    /// No prior state to preserve; the caller writes the payload
    /// through the plain path.
    Proceed(FieldMap),
    /// The snapshot-then-promote sequence ran and the current row
    /// already holds the submitted state.
    Handled(SaveReceipt),
}

/// What a handled save wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReceipt {
    /// Primary key of the promoted row.
    pub id: Value,
    /// Key of the snapshot row preserving the prior state.
    pub snapshot_id: Value,
    /// The current row after promotion.
    pub record: FieldMap,
}

/// Classify a save and, when versioning applies, run the
/// snapshot-then-promote sequence.
pub(crate) fn evaluate(
    conn: &Connection,
    config: &EntityConfig,
    payload: &FieldMap,
    now: DateTime<Utc>,
) -> StrataResult<SaveDisposition> {
    let Some(pk) = payload
        .get(config.primary_key())
        .filter(|v| !v.is_null())
        .cloned()
    else {
        return Ok(SaveDisposition::Proceed(payload.clone()));
    };
    if !config.retention().is_enabled() {
        return Ok(SaveDisposition::Proceed(payload.clone()));
    }
    let Some(prior) = store::read_row(conn, config.table(), config.primary_key(), &pk)? else {
        // Caller-assigned key with no stored row yet.
        return Ok(SaveDisposition::Proceed(payload.clone()));
    };
    if prior
        .get(TOMBSTONE_COLUMN)
        .and_then(Value::as_i64)
        .unwrap_or(0)
        != 0
    {
        // Overwriting a snapshot row would rewrite history in place.
        return Err(StrataError::configuration(format!(
            "primary key {} addresses a snapshot row of '{}'",
            pk,
            config.entity()
        )));
    }

    let captured = snapshot::captured_fields(config, &prior);
    let identity = IdentityKey::resolve(config, &prior)?;
    let snapshot_id = snapshot::write_snapshot(conn, config, &captured, &identity, now)?;
    debug!(
        entity = config.entity(),
        snapshot = %snapshot_id,
        "captured prior state before overwrite"
    );

    let record = promote(conn, config, &prior, &pk, payload, now)?;
    Ok(SaveDisposition::Handled(SaveReceipt {
        id: pk,
        snapshot_id,
        record,
    }))
}

/// Overwrite the current row with the submitted state.
///
/// Data fields come from the payload. Excluded fields reset to fresh
/// defaults: timestamp columns to the save instant, everything else to
/// null. Only columns the table actually has are touched, and the
/// tombstone marker is never writable from a payload.
fn promote(
    conn: &Connection,
    config: &EntityConfig,
    prior: &FieldMap,
    pk: &Value,
    payload: &FieldMap,
    now: DateTime<Utc>,
) -> StrataResult<FieldMap> {
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

    let stamp = Value::String(now.to_rfc3339());
    for field in config.excluded_fields() {
        if field.as_str() == config.primary_key() || !prior.contains_key(field) {
            continue;
        }
        if field.as_str() == CREATED_AT_COLUMN || field.as_str() == UPDATED_AT_COLUMN {
            fields.insert(field.clone(), stamp.clone());
        } else {
            fields.insert(field.clone(), Value::Null);
        }
    }

    store::update_row(conn, config.table(), config.primary_key(), pk, &fields)?;
    store::read_row(conn, config.table(), config.primary_key(), pk)?
        .ok_or_else(|| StrataError::storage("current row vanished during promotion"))
}
