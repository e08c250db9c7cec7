//! Entity configuration: retention policies, storage modes, and the
//! registry that maps entity names to their versioning rules.
//!
//! Configuration is immutable once built. Operations receive a
//! reference to an [`EntityConfig`] and never consult ambient state,
//! so two engines can version the same entity under different policies.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{StrataError, StrataResult};
use crate::store::ensure_identifier;

/// Column marking snapshot rows in same-table mode. Owned by the
/// engine; live rows carry 0, snapshots carry 1.
pub const TOMBSTONE_COLUMN: &str = "tombstoned";

/// Creation timestamp column, stored as RFC 3339 text.
pub const CREATED_AT_COLUMN: &str = "created_at";

/// Update timestamp column, stored as RFC 3339 text.
pub const UPDATED_AT_COLUMN: &str = "updated_at";

/// Primary key column of alternate-table snapshot rows.
pub const SNAPSHOT_ID_COLUMN: &str = "snapshot_id";

/// Fields excluded from capture unless the caller overrides the set.
pub const DEFAULT_EXCLUDED_FIELDS: [&str; 3] = ["created_at", "updated_at", "deleted_at"];

/// Where snapshot rows live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    /// Snapshots share the entity table, disambiguated by the
    /// tombstone column.
    SameTable,
    /// Snapshots live in a dedicated revision table.
    AlternateTable(String),
}

impl StorageMode {
    pub fn is_alternate(&self) -> bool {
        matches!(self, StorageMode::AlternateTable(_))
    }
}

/// How many snapshots are kept per identity, and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Negative keeps every snapshot, zero disables versioning,
    /// positive bounds each identity group.
    pub count: i64,
    pub mode: StorageMode,
}

impl RetentionPolicy {
    /// Versioning off: saves overwrite in place and no history accrues.
    pub fn disabled() -> Self {
        Self {
            count: 0,
            mode: StorageMode::SameTable,
        }
    }

    /// Keep every snapshot ever taken.
    pub fn unbounded() -> Self {
        Self {
            count: -1,
            mode: StorageMode::SameTable,
        }
    }

    /// Keep at most `count` snapshots per identity group.
    pub fn keep(count: i64) -> Self {
        Self {
            count,
            mode: StorageMode::SameTable,
        }
    }

    /// Store snapshots in a dedicated table instead of the entity table.
    pub fn in_table(mut self, table: impl Into<String>) -> Self {
        self.mode = StorageMode::AlternateTable(table.into());
        self
    }

    /// Snapshots are captured whenever the count is nonzero.
    pub fn is_enabled(&self) -> bool {
        self.count != 0
    }

    /// Whether pruning has a bound to enforce.
    pub fn is_bounded(&self) -> bool {
        self.count > 0
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Versioning rules for one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityConfig {
    entity: String,
    table: String,
    primary_key: String,
    retention: RetentionPolicy,
    key_columns: Vec<String>,
    excluded_fields: BTreeSet<String>,
}

impl EntityConfig {
    /// Start building a configuration for the named entity.
    pub fn builder(entity: impl Into<String>) -> EntityConfigBuilder {
        EntityConfigBuilder::new(entity)
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    pub fn excluded_fields(&self) -> &BTreeSet<String> {
        &self.excluded_fields
    }

    /// Whether a field is excluded from capture. The primary key
    /// always is.
    pub fn is_excluded(&self, field: &str) -> bool {
        self.excluded_fields.contains(field)
    }

    /// Table snapshot rows are written to.
    pub(crate) fn snapshot_table(&self) -> &str {
        match &self.retention.mode {
            StorageMode::SameTable => &self.table,
            StorageMode::AlternateTable(table) => table,
        }
    }

    /// Column that uniquely keys snapshot rows.
    pub(crate) fn snapshot_key_column(&self) -> &str {
        match &self.retention.mode {
            StorageMode::SameTable => &self.primary_key,
            StorageMode::AlternateTable(_) => SNAPSHOT_ID_COLUMN,
        }
    }
}

/// Builder for [`EntityConfig`].
#[derive(Debug, Clone)]
pub struct EntityConfigBuilder {
    entity: String,
    table: Option<String>,
    primary_key: String,
    retention: RetentionPolicy,
    key_columns: Vec<String>,
    excluded_fields: BTreeSet<String>,
}

impl EntityConfigBuilder {
    fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            table: None,
            primary_key: "id".to_string(),
            retention: RetentionPolicy::disabled(),
            key_columns: Vec::new(),
            excluded_fields: DEFAULT_EXCLUDED_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
        }
    }

    /// Backing table name. Defaults to the entity name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Primary key column. Defaults to `id`.
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn retention(mut self, policy: RetentionPolicy) -> Self {
        self.retention = policy;
        self
    }

    /// Columns that group a record with its snapshots.
    pub fn key_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Add a field to the excluded set.
    pub fn exclude(mut self, field: impl Into<String>) -> Self {
        self.excluded_fields.insert(field.into());
        self
    }

    /// Replace the excluded set entirely, discarding the defaults.
    pub fn excluded_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> StrataResult<EntityConfig> {
        if self.entity.trim().is_empty() {
            return Err(StrataError::configuration("entity name must not be empty"));
        }
        let table = self.table.unwrap_or_else(|| self.entity.clone());
        ensure_identifier(&table)?;
        ensure_identifier(&self.primary_key)?;
        for field in &self.excluded_fields {
            ensure_identifier(field)?;
        }
        if let StorageMode::AlternateTable(revision_table) = &self.retention.mode {
            ensure_identifier(revision_table)?;
            if revision_table == &table {
                return Err(StrataError::configuration(format!(
                    "revision table '{}' must differ from the entity table",
                    revision_table
                )));
            }
        }

        let mut excluded_fields = self.excluded_fields;
        // The primary key is never captured into a snapshot's fields.
        excluded_fields.insert(self.primary_key.clone());

        let mut seen = BTreeSet::new();
        for column in &self.key_columns {
            ensure_identifier(column)?;
            if !seen.insert(column.as_str()) {
                return Err(StrataError::configuration(format!(
                    "duplicate key column '{}'",
                    column
                )));
            }
            if column == TOMBSTONE_COLUMN {
                return Err(StrataError::configuration(format!(
                    "'{}' is reserved and cannot be a key column",
                    TOMBSTONE_COLUMN
                )));
            }
            if excluded_fields.contains(column) {
                return Err(StrataError::configuration(format!(
                    "key column '{}' is excluded from capture and cannot group revisions",
                    column
                )));
            }
        }

        Ok(EntityConfig {
            entity: self.entity,
            table,
            primary_key: self.primary_key,
            retention: self.retention,
            key_columns: self.key_columns,
            excluded_fields,
        })
    }
}

/// Registered versioned entities, resolvable by name.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<String, EntityConfig>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity configuration under its entity name.
    pub fn register(&mut self, config: EntityConfig) -> StrataResult<()> {
        let name = config.entity().to_string();
        if self.entities.contains_key(&name) {
            return Err(StrataError::configuration(format!(
                "entity '{}' is already registered",
                name
            )));
        }
        self.entities.insert(name, config);
        Ok(())
    }

    pub fn get(&self, entity: &str) -> Option<&EntityConfig> {
        self.entities.get(entity)
    }

    /// Look up an entity, failing with the known names when absent.
    pub fn resolve(&self, entity: &str) -> StrataResult<&EntityConfig> {
        self.entities.get(entity).ok_or_else(|| {
            let known: Vec<&str> = self.entities.keys().map(String::as_str).collect();
            if known.is_empty() {
                StrataError::configuration(format!(
                    "'{}' is not a registered versioned entity",
                    entity
                ))
            } else {
                StrataError::configuration(format!(
                    "'{}' is not a registered versioned entity (known: {})",
                    entity,
                    known.join(", ")
                ))
            }
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// On-disk configuration: database path plus per-entity policies.
///
/// Loadable from TOML, JSON, or YAML:
///
/// ```toml
/// database = "app.db"
///
/// [entities.widget]
/// table = "widgets"
/// retention_count = 5
/// revision_table = "widget_revisions"
/// key_columns = ["slug"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Path to the SQLite database file.
    pub database: Option<PathBuf>,
    /// Per-entity versioning policies, keyed by entity name.
    pub entities: BTreeMap<String, EntityPolicyConfig>,
}

/// One entity section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityPolicyConfig {
    /// Backing table; defaults to the entity name.
    pub table: Option<String>,
    /// Primary key column; defaults to `id`.
    pub primary_key: Option<String>,
    /// Snapshots kept per identity group. Zero disables, negative is
    /// unbounded.
    pub retention_count: i64,
    /// Dedicated snapshot table; same-table mode when omitted.
    pub revision_table: Option<String>,
    /// Columns grouping a record with its history.
    pub key_columns: Vec<String>,
    /// Replaces the default excluded set when present.
    pub excluded_fields: Option<Vec<String>>,
}

impl Default for EntityPolicyConfig {
    fn default() -> Self {
        Self {
            table: None,
            primary_key: None,
            retention_count: 0,
            revision_table: None,
            key_columns: Vec::new(),
            excluded_fields: None,
        }
    }
}

impl StrataConfig {
    /// Load configuration from a file. Format is detected from the
    /// extension: `.toml`, `.json`, `.yaml`/`.yml`.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> StrataResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| StrataError::Configuration(format!("Invalid TOML: {}", e))),
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| StrataError::Configuration(format!("Invalid JSON: {}", e))),
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| StrataError::Configuration(format!("Invalid YAML: {}", e))),
            _ => Err(StrataError::Configuration(
                "Unsupported config file format. Use .toml, .json, or .yaml".to_string(),
            )),
        }
    }

    /// Build the entity registry described by this configuration.
    pub fn registry(&self) -> StrataResult<EntityRegistry> {
        let mut registry = EntityRegistry::new();
        for (name, entity) in &self.entities {
            let mut policy = RetentionPolicy::keep(entity.retention_count);
            if let Some(revision_table) = &entity.revision_table {
                policy = policy.in_table(revision_table.clone());
            }

            let mut builder = EntityConfig::builder(name.clone())
                .retention(policy)
                .key_columns(entity.key_columns.clone());
            if let Some(table) = &entity.table {
                builder = builder.table(table.clone());
            }
            if let Some(primary_key) = &entity.primary_key {
                builder = builder.primary_key(primary_key.clone());
            }
            if let Some(excluded) = &entity.excluded_fields {
                builder = builder.excluded_fields(excluded.clone());
            }

            let config = builder.build().map_err(|e| {
                StrataError::configuration(format!("entity '{}': {}", name, e))
            })?;
            registry.register(config)?;
        }
        Ok(registry)
    }
}
