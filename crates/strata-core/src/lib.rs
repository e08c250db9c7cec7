//! strata-core - Core library for strata.
//!
//! This crate provides bounded revision history for SQLite-backed
//! records: saves over an existing row capture its prior state as a
//! snapshot before overwriting, snapshots are queryable newest first,
//! and a pruner enforces a per-identity retention bound.
//!
//! # Example
//!
//! ```ignore
//! use strata_core::{EntityConfig, IdentityKey, RetentionPolicy, RevisionEngine};
//!
//! let config = EntityConfig::builder("widget")
//!     .table("widgets")
//!     .retention(RetentionPolicy::keep(5))
//!     .key_columns(["slug"])
//!     .build()?;
//! let engine = RevisionEngine::new("app.db")?;
//!
//! // Save a record, then save an update over it
//! let created = engine.save(&config, first_draft)?;
//! let updated = engine.save(&config, revised_draft)?;
//!
//! // Walk its history, newest first
//! let identity = IdentityKey::resolve(&config, updated.record())?;
//! for snapshot in engine.history(&config, &identity, None)? {
//!     println!("{}: {:?}", snapshot.created_at, snapshot.fields);
//! }
//!
//! // Enforce the retention bound
//! let deleted = engine.prune(&config, None)?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod interceptor;
pub mod record;
pub mod snapshot;

mod pruner;
mod revisions;
mod store;

// Re-export commonly used types
pub use config::{
    EntityConfig, EntityConfigBuilder, EntityPolicyConfig, EntityRegistry, RetentionPolicy,
    StorageMode, StrataConfig,
};
pub use engine::{RevisionEngine, SaveOutcome};
pub use error::{StrataError, StrataResult};
pub use identity::IdentityKey;
pub use interceptor::{SaveDisposition, SaveReceipt};
pub use record::{from_field_map, to_field_map, FieldMap, Recordable};
pub use snapshot::Snapshot;
