//! Library management commands.

use sqlx::SqlitePool;

use super::{LibraryCommand, default_poll_every};
use crate::config::Config;
use crate::db;

/// Run a `library` subcommand.
pub async fn cmd_library(pool: &SqlitePool, config: &Config, action: &LibraryCommand) -> anyhow::Result<()> {
    match action {
        LibraryCommand::Add { path, poll_every } => {
            let every = poll_every.unwrap_or_else(|| default_poll_every(config));
            let id = db::add_library(pool, path, every).await?;
            println!("Added library {id}: {}", path.display());
            println!("Run `comic-minder sync --library {id}` to import it now.");
        }
        LibraryCommand::List => {
            let libraries = db::get_libraries(pool).await?;
            if libraries.is_empty() {
                println!("No libraries. Add one with `comic-minder library add <PATH>`.");
            }
            for library in libraries {
                println!(
                    "{:>4}  {}  [events: {}, poll: {} every {}s, last poll: {}{}]",
                    library.id,
                    library.path,
                    on_off(library.events),
                    on_off(library.poll),
                    library.poll_every_secs,
                    library.last_poll.as_deref().unwrap_or("never"),
                    if library.update_in_progress { ", updating" } else { "" },
                );
            }
        }
        LibraryCommand::Remove { id } => {
            if db::remove_library(pool, *id).await? {
                println!("Removed library {id}");
            } else {
                anyhow::bail!("No library with id {id}");
            }
        }
        LibraryCommand::Set {
            id,
            events,
            poll,
            poll_every,
        } => {
            let library = db::get_library(pool, *id).await?;
            let events = events.unwrap_or(library.events);
            let poll = poll.unwrap_or(library.poll);
            let every = poll_every.unwrap_or(library.poll_every_secs.max(0) as u64);
            db::update_library_settings(pool, *id, events, poll, every).await?;
            println!(
                "Library {id}: events {}, poll {} every {every}s",
                on_off(events),
                on_off(poll)
            );
            println!("A running daemon picks this up on its next restart or reload.");
        }
    }
    Ok(())
}

fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}
