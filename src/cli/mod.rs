//! Command-line interface for comic-minder.
//!
//! This module provides commands for managing libraries, running one-shot
//! syncs, inspecting the database, and running the sync daemon.

mod commands;

pub use commands::{Cli, Commands, run_command};
