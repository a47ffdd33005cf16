//! Applies batched diffs and fans the results out.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Error;
use crate::importer::{ImportReport, Importer};
use crate::tasks::{CoverTask, Notification, SearchTask, SyncTask, Task, TaskSender, Worker};

/// Delay before a sync refused for a busy library is queued again.
pub const BUSY_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Runs the importer for each [`SyncTask`].
pub struct SyncWorker {
    importer: Importer,
    tasks: TaskSender,
    retry_delay: Duration,
}

impl SyncWorker {
    pub fn new(importer: Importer, tasks: TaskSender) -> Self {
        Self {
            importer,
            tasks,
            retry_delay: BUSY_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Queue `task` again once the delay has passed.
    fn requeue(&self, task: SyncTask) {
        let tasks = self.tasks.clone();
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let library_id = task.library_id;
            if !tasks.send(Task::Sync(task)) {
                tracing::warn!(target: "tasks::sync", library = library_id, "Dispatcher gone, dropping retried sync");
            }
        });
    }

    /// Tasks that follow from a finished import.
    pub fn follow_up(report: &ImportReport) -> Vec<Task> {
        let mut out = Vec::new();
        if report.is_noop() {
            return out;
        }
        if !report.purged.is_empty() {
            out.push(Task::Cover(CoverTask::Purge {
                paths: report.purged.clone(),
            }));
        }
        if !report.covers.is_empty() {
            out.push(Task::Cover(CoverTask::Create {
                items: report.covers.clone(),
            }));
        }
        if !report.removed.is_empty() {
            out.push(Task::Search(SearchTask::Remove {
                comic_ids: report.removed.clone(),
            }));
        }
        if !report.written.is_empty() {
            out.push(Task::Search(SearchTask::Update {
                comic_ids: report.written.clone(),
            }));
        }
        out.push(Task::Notify(Notification::LibraryChanged {
            library_id: report.library_id,
        }));
        if report.failed_imports_changed {
            out.push(Task::Notify(Notification::FailedImportsChanged {
                library_id: report.library_id,
            }));
        }
        out
    }
}

#[async_trait]
impl Worker for SyncWorker {
    type Task = SyncTask;
    const NAME: &'static str = "sync";

    async fn handle(&mut self, task: SyncTask) {
        let library_id = task.library_id;
        match self.importer.apply(library_id, task.diff.clone()).await {
            Ok(report) => {
                for next in Self::follow_up(&report) {
                    if !self.tasks.send(next) {
                        tracing::warn!(target: "tasks::sync", library = library_id, "Dispatcher gone, dropping follow-up tasks");
                        break;
                    }
                }
            }
            Err(Error::LibraryBusy(_)) => {
                tracing::info!(target: "tasks::sync", library = library_id, "Library busy, retrying later");
                self.requeue(task);
            }
            Err(Error::LibraryNotFound(_)) => {
                tracing::warn!(target: "tasks::sync", library = library_id, "Library removed, dropping sync");
            }
            Err(e) => {
                tracing::error!(target: "tasks::sync", library = library_id, error = %e, "Sync failed");
            }
        }
    }
}
