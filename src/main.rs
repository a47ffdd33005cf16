//! Comic Minder - keeps a comic library database in step with disk.
//!
//! Watches library directories for changes, batches them, decodes the
//! affected archives and applies the result to a SQLite catalogue. Run
//! `comic-minder run` for the daemon or use the one-shot commands.

pub mod batcher;
pub mod cli;
pub mod config;
pub mod cover;
pub mod db;
pub mod error;
pub mod importer;
pub mod metadata;
pub mod model;
pub mod scanner;
pub mod snapshot;
pub mod status;
pub mod tasks;
#[cfg(test)]
pub mod test_utils;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")))
        .init();

    cli::run_command(&args)
}
