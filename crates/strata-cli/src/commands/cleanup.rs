//! Retention cleanup command.
//!
//! Resolves an entity from the configuration file's registry and
//! prunes its snapshots past the retention bound. The database path
//! comes from `--db`, then the `STRATA_DB` environment variable, then
//! the configuration file.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use strata_core::{RevisionEngine, StrataConfig};
use tracing::info;

#[derive(Debug, Args)]
pub struct CleanupArgs {
    /// Registered entity to clean up
    pub entity: String,

    /// Path to the strata configuration file
    #[arg(long, default_value = "strata.toml")]
    pub config: PathBuf,

    /// Database path; overrides STRATA_DB and the configuration file
    #[arg(long)]
    pub db: Option<PathBuf>,
}

pub fn execute(args: CleanupArgs) -> Result<()> {
    let config = StrataConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let registry = config.registry()?;

    let db = args
        .db
        .clone()
        .or_else(|| std::env::var("STRATA_DB").ok().map(PathBuf::from))
        .or_else(|| config.database.clone())
        .ok_or_else(|| {
            anyhow!("no database path; pass --db, set STRATA_DB, or set `database` in the config file")
        })?;
    info!(db = %db.display(), entity = args.entity, "running cleanup");

    let engine = RevisionEngine::new(&db)?;
    let deleted = engine.cleanup(&registry, &args.entity)?;
    println!(
        "{}: deleted {} snapshot{}",
        args.entity,
        deleted,
        if deleted == 1 { "" } else { "s" }
    );
    Ok(())
}
