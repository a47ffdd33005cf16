//! Typed tasks and the workers that handle them.
//!
//! Every unit of background work is a [`Task`]. Producers (the batcher,
//! the poller, the sync worker itself) push tasks onto the dispatcher's
//! queue through a [`TaskSender`]; the [`dispatcher`] routes each variant
//! to the worker that owns it and never waits for the result.

pub mod dispatcher;
pub mod worker;
pub mod workers;

pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use worker::{Envelope, Worker, WorkerHandle, spawn_worker};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::snapshot::SnapshotDiff;
use crate::status::StatusKind;

/// Apply one batched diff to one library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    pub library_id: i64,
    pub diff: SnapshotDiff,
}

/// Poll libraries now, outside their schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollTask {
    /// Empty means every polled library
    pub library_ids: Vec<i64>,
    /// Report every surviving file as modified, forcing a re-import
    pub force: bool,
}

/// Cover cache work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoverTask {
    /// Store bytes someone else already extracted
    Store { path: PathBuf, bytes: Vec<u8> },
    /// Extract covers; `force` re-extracts cached ones
    Create { items: Vec<(PathBuf, bool)> },
    /// Drop cached covers of deleted or moved comics
    Purge { paths: Vec<PathBuf> },
}

/// Search index work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchTask {
    Update { comic_ids: Vec<i64> },
    Remove { comic_ids: Vec<i64> },
}

/// Published to notification subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    LibraryChanged { library_id: i64 },
    FailedImportsChanged { library_id: i64 },
    StatusChanged(StatusKind),
}

/// Watch-manager work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchTask {
    /// Reconcile watched roots and poll schedules with the library table
    Reload,
    Poll(PollTask),
}

/// Every task the dispatcher accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Task {
    Sync(SyncTask),
    Poll(PollTask),
    Cover(CoverTask),
    Search(SearchTask),
    Notify(Notification),
    Watch(WatchTask),
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Task::Sync(_) => "sync",
            Task::Poll(_) => "poll",
            Task::Cover(_) => "cover",
            Task::Search(_) => "search",
            Task::Notify(_) => "notify",
            Task::Watch(_) => "watch",
        }
    }
}

/// Producer side of the dispatcher queue.
#[derive(Debug, Clone)]
pub struct TaskSender {
    tx: UnboundedSender<Envelope<Task>>,
}

impl TaskSender {
    /// A new dispatcher queue.
    pub fn channel() -> (Self, UnboundedReceiver<Envelope<Task>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue a task without waiting. Returns false if the dispatcher is gone.
    pub fn send(&self, task: Task) -> bool {
        self.tx.send(Envelope::Work(task)).is_ok()
    }

    /// Ask the dispatcher to shut down after the tasks already queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Envelope::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_serializes_tagged() {
        let task = Task::Poll(PollTask {
            library_ids: vec![1, 2],
            force: true,
        });
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("Poll"));
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
        assert_eq!(back.kind(), "poll");
    }

    #[test]
    fn test_sender_reports_closed_queue() {
        let (tx, rx) = TaskSender::channel();
        drop(rx);
        assert!(!tx.send(Task::Notify(Notification::LibraryChanged { library_id: 1 })));
    }
}
