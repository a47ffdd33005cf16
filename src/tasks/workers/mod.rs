//! The long-lived workers behind the dispatcher.
//!
//! Each worker owns one concern and handles its tasks sequentially:
//!
//! - [`SyncWorker`] applies batched diffs through the importer and fans
//!   the results out as cover, search and notification tasks
//! - [`CoverWorker`] fills and purges the cover cache
//! - [`SearchWorker`] keeps a [`SearchIndex`] in step with the comic table
//! - [`Notifier`] broadcasts [`Notification`]s to subscribers
//! - [`WatchManager`] owns the file watcher and the poller
//!
//! [`Notification`]: super::Notification

mod cover;
mod notify;
mod search;
mod sync;
mod watch;

pub use cover::CoverWorker;
pub use notify::Notifier;
pub use search::{LoggingIndex, SearchIndex, SearchWorker};
pub use sync::SyncWorker;
pub use watch::WatchManager;
