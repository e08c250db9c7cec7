//! Identity resolution: the values that tie a record to its history.
//!
//! An identity is the configured key-column values plus the primary
//! key when one is assigned. Key columns group a record with snapshots
//! of earlier states; the primary key alone does not, because a
//! snapshot in a dedicated table keys itself by snapshot id.

use serde_json::Value;

use crate::config::EntityConfig;
use crate::error::{StrataError, StrataResult};
use crate::record::FieldMap;

/// Resolved identity of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityKey {
    primary_key: Option<Value>,
    keys: Vec<(String, Value)>,
}

impl IdentityKey {
    /// Extract the identity from a record's fields.
    ///
    /// Resolution is pure. The only failure is a configured key column
    /// missing from the record entirely; an explicit null is a valid
    /// key value and matches other nulls.
    pub fn resolve(config: &EntityConfig, fields: &FieldMap) -> StrataResult<Self> {
        let primary_key = fields
            .get(config.primary_key())
            .filter(|v| !v.is_null())
            .cloned();

        let mut keys = Vec::with_capacity(config.key_columns().len());
        for column in config.key_columns() {
            match fields.get(column) {
                Some(value) => keys.push((column.clone(), value.clone())),
                None => {
                    return Err(StrataError::configuration(format!(
                        "key column '{}' missing from '{}' record",
                        column,
                        config.entity()
                    )))
                }
            }
        }

        Ok(Self { primary_key, keys })
    }

    /// Primary key value, if the record has one assigned.
    pub fn primary_key(&self) -> Option<&Value> {
        self.primary_key.as_ref()
    }

    /// Key column values in configured order.
    pub fn keys(&self) -> &[(String, Value)] {
        &self.keys
    }
}
