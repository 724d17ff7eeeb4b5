//! Turns cache notifications into work queue keys

use std::marker::PhantomData;

use kube::Resource;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cache::Notification;
use crate::key::ObjectKey;
use crate::queue::WorkQueue;

/// Routes `Added` and `Deleted` notifications (and `Modified` when enabled)
/// to the work queue as identity keys.
pub struct EventRouter<K> {
    queue: WorkQueue<ObjectKey>,
    reconcile_updates: bool,
    _kind: PhantomData<fn(K)>,
}

impl<K: Resource> EventRouter<K> {
    pub fn new(queue: WorkQueue<ObjectKey>, reconcile_updates: bool) -> Self {
        Self {
            queue,
            reconcile_updates,
            _kind: PhantomData,
        }
    }

    /// Enqueue the key of `notification` if its type triggers reconciliation
    pub fn route(&self, notification: &Notification<K>) -> Option<ObjectKey> {
        let (event, key) = match notification {
            Notification::Added(_) => ("added", notification.key()),
            Notification::Deleted(_) => ("deleted", notification.key()),
            Notification::Modified(_) if self.reconcile_updates => ("modified", notification.key()),
            Notification::Modified(_) => return None,
        };
        debug!(%key, event, "Enqueueing");
        self.queue.add(key.clone());
        Some(key)
    }

    /// Drain `events` until the sending side goes away
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<Notification<K>>) {
        while let Some(notification) = events.recv().await {
            self.route(&notification);
        }
        info!("Event router stopped");
    }
}
