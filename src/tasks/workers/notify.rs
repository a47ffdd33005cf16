//! Notification fan-out.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::tasks::{Notification, Worker};

/// Capacity of the broadcast channel; slow subscribers lag past this.
pub const NOTIFY_CAPACITY: usize = 256;

/// Publishes notifications to every subscriber.
///
/// Having no subscribers is normal; notifications are then dropped.
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self { tx }
    }

    /// A sender that shares this notifier's channel, for subscribing.
    pub fn sender(&self) -> broadcast::Sender<Notification> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Worker for Notifier {
    type Task = Notification;
    const NAME: &'static str = "notify";

    async fn handle(&mut self, task: Notification) {
        tracing::debug!(target: "tasks::notify", notification = ?task, "Notify");
        if let Err(e) = self.tx.send(task) {
            tracing::debug!(target: "tasks::notify", notification = ?e.0, "No subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let mut notifier = Notifier::new();
        let mut rx = notifier.subscribe();

        notifier.handle(Notification::LibraryChanged { library_id: 1 }).await;
        notifier.handle(Notification::FailedImportsChanged { library_id: 1 }).await;

        assert_eq!(rx.recv().await.unwrap(), Notification::LibraryChanged { library_id: 1 });
        assert_eq!(rx.recv().await.unwrap(), Notification::FailedImportsChanged { library_id: 1 });
    }

    #[tokio::test]
    async fn test_no_subscribers_is_fine() {
        let mut notifier = Notifier::new();
        notifier.handle(Notification::LibraryChanged { library_id: 7 }).await;
    }
}
