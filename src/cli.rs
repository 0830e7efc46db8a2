use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Bulk-loads ICH E2B(R3) ICSR batches into a relational or audit schema.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Discover, extract, transform, and load ICSR batches.
    Run {
        /// Overrides `source_uri` from the config file/environment.
        source_uri: Option<String>,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        workers: Option<usize>,
        /// Validate each batch against the configured XSD before loading it.
        #[arg(long)]
        validate: bool,
    },

    /// Creates the target tables if they do not already exist.
    InitDb,

    /// Validates a batch file against an XSD schema without loading it.
    Validate {
        #[arg(long)]
        schema: PathBuf,
        source_uri: String,
    },

    /// Checks that the database schema matches what this crate expects.
    ValidateDbSchema,
}
