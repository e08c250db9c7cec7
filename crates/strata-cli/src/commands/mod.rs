//! CLI subcommands.

pub mod cleanup;
