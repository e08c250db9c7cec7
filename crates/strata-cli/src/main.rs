//! strata CLI
//!
//! Maintenance commands for strata-versioned records. The first
//! surface is retention cleanup, meant to be driven by cron or an
//! operator.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Debug, Parser)]
#[command(name = "strata")]
#[command(about = "strata - bounded revision history for SQLite-backed records", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Delete snapshots in excess of an entity's retention policy
    Cleanup(commands::cleanup::CleanupArgs),
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Cleanup(args) => commands::cleanup::execute(args),
    }
}
