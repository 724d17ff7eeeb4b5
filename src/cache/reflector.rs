//! Keeps a [`Writer`] in step with the resource store
//!
//! The reflector lists, seeds the index, then watches from the list's resource
//! version. Each event updates the index and is forwarded as a
//! [`Notification`] over a channel, so a slow consumer never stalls the watch.
//! When the stream ends (disconnect, expired version, periodic resync) it
//! lists again; consumers only ever see that as redundant `Added`s.

use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::StreamExt;
use kube::Resource;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::{Notification, Writer};
use crate::api::{ObjectApi, WatchEvent};
use crate::error::{Error, Result};
use crate::metrics;

/// First pause before retrying a failed list or watch
const MIN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Longest pause between list/watch retries
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Why a watch loop returned
#[derive(Debug)]
enum WatchEnd {
    Shutdown,
    Resync,
    Closed,
    Failed(Error),
}

/// List/watch driver for one resource kind
pub struct Reflector<K> {
    api: Arc<dyn ObjectApi<K>>,
    writer: Writer<K>,
    events: mpsc::UnboundedSender<Notification<K>>,
    resync_period: Option<Duration>,
    kind: &'static str,
}

impl<K> Reflector<K>
where
    K: Resource + Send + Sync + 'static,
{
    /// Create a reflector; a zero `resync_period` disables periodic re-lists
    pub fn new(
        api: Arc<dyn ObjectApi<K>>,
        writer: Writer<K>,
        events: mpsc::UnboundedSender<Notification<K>>,
        resync_period: Duration,
        kind: &'static str,
    ) -> Self {
        Self {
            api,
            writer,
            events,
            resync_period: (!resync_period.is_zero()).then_some(resync_period),
            kind,
        }
    }

    /// Run until `shutdown` fires.
    ///
    /// Only a failure of the very first list is returned; later list and
    /// watch failures are retried with a growing pause.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut synced_once = false;
        let mut backoff = retry_backoff();

        loop {
            let listed = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                listed = self.relist() => listed,
            };

            let resource_version = match listed {
                Ok(resource_version) => resource_version,
                Err(e) if !synced_once => {
                    error!(kind = self.kind, error = %e, "Initial list failed");
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(MAX_RETRY_DELAY);
                    warn!(kind = self.kind, error = %e, delay = ?delay, "List failed, retrying");
                    if pause(&shutdown, delay).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            synced_once = true;
            backoff.reset();

            match self.watch(&resource_version, &shutdown).await {
                WatchEnd::Shutdown => return Ok(()),
                WatchEnd::Resync => {
                    debug!(kind = self.kind, "Periodic resync");
                }
                WatchEnd::Closed => {
                    info!(kind = self.kind, "Watch stream closed, relisting");
                    metrics::WATCH_RESTARTS.with_label_values(&[self.kind]).inc();
                }
                WatchEnd::Failed(e) if e.is_gone() => {
                    info!(kind = self.kind, error = %e, "Watch expired, relisting");
                    metrics::WATCH_RESTARTS.with_label_values(&[self.kind]).inc();
                }
                WatchEnd::Failed(e) => {
                    let delay = backoff.next_backoff().unwrap_or(MAX_RETRY_DELAY);
                    warn!(kind = self.kind, error = %e, delay = ?delay, "Watch failed, relisting");
                    metrics::WATCH_RESTARTS.with_label_values(&[self.kind]).inc();
                    if pause(&shutdown, delay).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Full list: replace the index, forward the resulting notifications, mark synced
    async fn relist(&mut self) -> Result<String> {
        let page = self.api.list().await?;
        let count = page.items.len();

        for notification in self.writer.replace(page.items) {
            self.forward(notification);
        }
        self.writer.mark_synced();
        metrics::CACHE_SYNCED.set(1.0);
        metrics::CACHED_OBJECTS
            .with_label_values(&[self.kind])
            .set(self.writer.len() as f64);

        debug!(
            kind = self.kind,
            objects = count,
            resource_version = %page.resource_version,
            "Listed"
        );
        Ok(page.resource_version)
    }

    async fn watch(&mut self, resource_version: &str, shutdown: &CancellationToken) -> WatchEnd {
        let mut stream = tokio::select! {
            _ = shutdown.cancelled() => return WatchEnd::Shutdown,
            stream = self.api.watch(resource_version) => match stream {
                Ok(stream) => stream,
                Err(e) => return WatchEnd::Failed(e),
            },
        };

        let period = self.resync_period;
        let resync = async move {
            match period {
                Some(period) => tokio::time::sleep(period).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(resync);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return WatchEnd::Shutdown,
                _ = &mut resync => return WatchEnd::Resync,
                event = stream.next() => match event {
                    None => return WatchEnd::Closed,
                    Some(Err(e)) => return WatchEnd::Failed(e),
                    Some(Ok(event)) => self.apply(event),
                },
            }
        }
    }

    fn apply(&mut self, event: WatchEvent<K>) {
        let notification = match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => self.writer.apply_upsert(obj),
            WatchEvent::Deleted(obj) => self.writer.apply_delete(obj),
        };
        metrics::CACHED_OBJECTS
            .with_label_values(&[self.kind])
            .set(self.writer.len() as f64);
        self.forward(notification);
    }

    fn forward(&self, notification: Notification<K>) {
        if self.events.send(notification).is_err() {
            debug!(kind = self.kind, "Event router has stopped, dropping notification");
        }
    }
}

/// Jittered exponential pause between list/watch retries, retrying forever
fn retry_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: MIN_RETRY_DELAY,
        initial_interval: MIN_RETRY_DELAY,
        max_interval: MAX_RETRY_DELAY,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Sleep for `delay`; returns true when interrupted by shutdown
async fn pause(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
