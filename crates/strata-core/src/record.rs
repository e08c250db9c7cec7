//! Record representation: flat field maps and the typed record capability.
//!
//! The engine moves rows around as [`FieldMap`]s, JSON objects whose
//! values are restricted to what SQLite can store losslessly: null,
//! integers, floats, and text. Typed structs opt in through
//! [`Recordable`], which round-trips them through serde.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{StrataError, StrataResult};

/// A row as a flat column-to-value map.
pub type FieldMap = Map<String, Value>;

/// Capability trait for structs that can be saved and versioned.
///
/// Any type that serializes to a flat JSON object qualifies. Field
/// values must be scalars; model boolean flags as integers (0/1) the
/// way the backing store does, since SQLite has no boolean storage
/// class and a stored flag would read back as an integer.
pub trait Recordable: Serialize + DeserializeOwned {
    /// Entity name this record type is registered under.
    fn entity() -> &'static str;

    /// Convert this record into its field map.
    fn to_fields(&self) -> StrataResult<FieldMap> {
        to_field_map(self)
    }

    /// Rebuild a record from a stored field map.
    fn from_fields(fields: &FieldMap) -> StrataResult<Self> {
        from_field_map(fields)
    }
}

/// Serialize any value into a scalar-only field map.
///
/// Fails with a configuration error if the value is not a JSON object
/// or if any field is a nested structure or a boolean.
pub fn to_field_map<T: Serialize>(record: &T) -> StrataResult<FieldMap> {
    match serde_json::to_value(record)? {
        Value::Object(map) => {
            ensure_scalar_fields(&map)?;
            Ok(map)
        }
        other => Err(StrataError::configuration(format!(
            "record must serialize to an object, got {}",
            json_type_name(&other)
        ))),
    }
}

/// Deserialize a stored field map back into a typed record.
pub fn from_field_map<T: DeserializeOwned>(fields: &FieldMap) -> StrataResult<T> {
    Ok(serde_json::from_value(Value::Object(fields.clone()))?)
}

/// Verify every field holds a storable scalar.
pub(crate) fn ensure_scalar_fields(fields: &FieldMap) -> StrataResult<()> {
    for (name, value) in fields {
        match value {
            Value::Null | Value::Number(_) | Value::String(_) => {}
            Value::Bool(_) => {
                return Err(StrataError::configuration(format!(
                    "field '{}' is a boolean; store flags as 0/1 integers",
                    name
                )))
            }
            Value::Array(_) | Value::Object(_) => {
                return Err(StrataError::configuration(format!(
                    "field '{}' is a {}; column values must be scalars",
                    name,
                    json_type_name(value)
                )))
            }
        }
    }
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
