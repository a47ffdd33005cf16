//! CLI command definitions and dispatch.
//!
//! Each group of subcommands lives in its own submodule:
//! - `library`: registering and configuring libraries
//! - `sync`: one-shot syncs and the long-running daemon
//! - `report`: comics, failed imports and phase status
//! - `settings`: showing and writing the config file

mod library;
mod report;
mod settings;
mod sync;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use tokio::runtime::Runtime;

use crate::config::{self, Config};
use crate::db;

pub use library::cmd_library;
pub use report::{cmd_failed, cmd_list, cmd_status};
pub use settings::cmd_config;
pub use sync::{cmd_run, cmd_sync};

/// Comic Minder CLI
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Database file (overrides the config file)
    #[arg(long, global = true, env = "COMIC_MINDER_DB")]
    pub db: Option<PathBuf>,

    /// Config file (defaults to the OS config directory)
    #[arg(long, global = true, env = "COMIC_MINDER_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Manage libraries
    Library {
        #[command(subcommand)]
        action: LibraryCommand,
    },
    /// Poll and import now, without the daemon
    Sync {
        /// Only this library (default: all)
        #[arg(short, long)]
        library: Option<i64>,
        /// Re-import every file, not just changed ones
        #[arg(long)]
        force: bool,
    },
    /// Run the sync daemon until Ctrl-C
    Run,
    /// List imported comics
    List {
        /// Only this library
        #[arg(short, long)]
        library: Option<i64>,
    },
    /// Show files that failed to import
    Failed {
        /// Only this library
        #[arg(short, long)]
        library: Option<i64>,
        /// Dismiss a failed import by id
        #[arg(long)]
        dismiss: Option<i64>,
    },
    /// Show progress of the sync phases
    Status,
    /// Show or write the config file
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Write the default configuration to the config file
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Library subcommands
#[derive(Subcommand)]
pub enum LibraryCommand {
    /// Register a directory as a library
    Add {
        path: PathBuf,
        /// Poll interval in seconds (default from config)
        #[arg(long)]
        poll_every: Option<u64>,
    },
    /// List libraries
    List,
    /// Remove a library and everything imported from it
    Remove { id: i64 },
    /// Change how a library is watched
    Set {
        id: i64,
        /// Subscribe to OS file events
        #[arg(long)]
        events: Option<bool>,
        /// Poll on a timer
        #[arg(long)]
        poll: Option<bool>,
        /// Poll interval in seconds
        #[arg(long)]
        poll_every: Option<u64>,
    },
}

/// Run the specified CLI command.
pub fn run_command(cli: &Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => config::load_from(path),
        None => config::load(),
    };
    // Config commands must work without a database
    if let Commands::Config { action } = &cli.command {
        return cmd_config(&config, cli.config.as_deref(), action);
    }
    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| config.database.resolved_path());
    let rt = Runtime::new()?;

    rt.block_on(async {
        let pool = open_pool(&db_path).await?;
        match &cli.command {
            Commands::Library { action } => cmd_library(&pool, &config, action).await,
            Commands::Sync { library, force } => cmd_sync(&pool, &config, *library, *force).await,
            Commands::Run => cmd_run(pool, &config).await,
            Commands::List { library } => cmd_list(&pool, *library).await,
            Commands::Failed { library, dismiss } => cmd_failed(&pool, *library, *dismiss).await,
            Commands::Status => cmd_status(&pool, &config).await,
            Commands::Config { action } => cmd_config(&config, cli.config.as_deref(), action),
        }
    })
}

// ============================================================================
// Shared helper functions
// ============================================================================

/// Open the database, creating its directory if needed.
pub(crate) async fn open_pool(path: &Path) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    db::init_db(&db::db_url(Some(path)))
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))
}

/// Poll interval for new libraries, never below the configured floor.
pub(crate) fn default_poll_every(config: &Config) -> u64 {
    config
        .sync
        .default_poll_every_secs
        .max(config.sync.poll_min_interval_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sync_flags() {
        let cli = Cli::try_parse_from(["comic-minder", "sync", "--library", "3", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Sync {
                library: Some(3),
                force: true
            }
        ));
    }

    #[test]
    fn test_parse_library_set() {
        let cli = Cli::try_parse_from([
            "comic-minder",
            "--db",
            "/tmp/x.db",
            "library",
            "set",
            "2",
            "--events",
            "false",
        ])
        .unwrap();
        assert_eq!(cli.db.as_deref(), Some(Path::new("/tmp/x.db")));
        match cli.command {
            Commands::Library {
                action:
                    LibraryCommand::Set {
                        id,
                        events,
                        poll,
                        poll_every,
                    },
            } => {
                assert_eq!(id, 2);
                assert_eq!(events, Some(false));
                assert_eq!(poll, None);
                assert_eq!(poll_every, None);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_default_poll_every_respects_floor() {
        let mut config = Config::default();
        config.sync.default_poll_every_secs = 5;
        config.sync.poll_min_interval_secs = 60;
        assert_eq!(default_poll_every(&config), 60);
    }

    #[tokio::test]
    async fn test_open_pool_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("comics.db");
        let pool = open_pool(&path).await.unwrap();
        assert!(db::get_libraries(&pool).await.unwrap().is_empty());
        assert!(path.exists());
    }
}
