//! The worker abstraction shared by every long-lived worker.
//!
//! A worker owns its state, receives [`Envelope`]s on its own unbounded
//! queue and handles them one at a time. [`spawn_worker`] is the single
//! constructor: it creates the queue, spawns the loop on the tokio runtime
//! and returns a [`WorkerHandle`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// A queue item: work, or the shutdown sentinel.
#[derive(Debug, Clone)]
pub enum Envelope<T> {
    Work(T),
    Shutdown,
}

/// A long-lived, internally sequential worker.
#[async_trait]
pub trait Worker: Send + 'static {
    type Task: Send + 'static;

    /// Name used in logs.
    const NAME: &'static str;

    async fn handle(&mut self, task: Self::Task);

    /// Called once after the shutdown sentinel, before the loop exits.
    async fn shutdown(&mut self) {}
}

/// Handle to a running worker.
pub struct WorkerHandle<T> {
    name: &'static str,
    tx: UnboundedSender<Envelope<T>>,
    join: JoinHandle<()>,
}

impl<T: Send + 'static> WorkerHandle<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue work without waiting. Returns false if the worker is gone.
    pub fn send(&self, task: T) -> bool {
        self.tx.send(Envelope::Work(task)).is_ok()
    }

    /// Send the sentinel and wait for the worker to drain, aborting it
    /// after `timeout`.
    pub async fn stop(self, timeout: Duration) {
        let _ = self.tx.send(Envelope::Shutdown);
        let mut join = self.join;
        match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(())) => {
                tracing::debug!(target: "tasks::worker", worker = self.name, "Worker stopped");
            }
            Ok(Err(e)) => {
                tracing::error!(target: "tasks::worker", worker = self.name, error = %e, "Worker panicked");
            }
            Err(_) => {
                tracing::warn!(target: "tasks::worker", worker = self.name, "Worker did not drain in time, aborting");
                join.abort();
            }
        }
    }
}

/// Spawn `worker` on its own queue.
pub fn spawn_worker<W: Worker>(worker: W) -> WorkerHandle<W::Task> {
    let (tx, rx) = mpsc::unbounded_channel();
    let join = tokio::spawn(run(worker, rx));
    WorkerHandle {
        name: W::NAME,
        tx,
        join,
    }
}

async fn run<W: Worker>(mut worker: W, mut rx: UnboundedReceiver<Envelope<W::Task>>) {
    tracing::info!(target: "tasks::worker", worker = W::NAME, "Worker started");
    while let Some(envelope) = rx.recv().await {
        match envelope {
            Envelope::Work(task) => worker.handle(task).await,
            Envelope::Shutdown => break,
        }
    }
    worker.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        seen: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for Counter {
        type Task = usize;
        const NAME: &'static str = "counter";

        async fn handle(&mut self, task: usize) {
            self.seen.fetch_add(task, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Stuck;

    #[async_trait]
    impl Worker for Stuck {
        type Task = ();
        const NAME: &'static str = "stuck";

        async fn handle(&mut self, _task: ()) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    #[tokio::test]
    async fn test_worker_drains_before_sentinel() {
        let seen = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let handle = spawn_worker(Counter {
            seen: Arc::clone(&seen),
            closed: Arc::clone(&closed),
        });

        assert!(handle.send(1));
        assert!(handle.send(2));
        handle.stop(Duration::from_secs(1)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stuck_worker_is_aborted() {
        let handle = spawn_worker(Stuck);
        handle.send(());
        let started = std::time::Instant::now();
        handle.stop(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
