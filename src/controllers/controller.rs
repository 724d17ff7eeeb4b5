//! Controller run loop
//!
//! `Created -> CacheSyncing -> Running -> ShuttingDown -> Stopped`
//!
//! The reflector and the event router run as their own tasks and a fixed
//! pool of workers pulls keys from the work queue. Cancelling the shutdown
//! token stops the watch, shuts the queue down, and lets every worker finish
//! the key it holds before the loop reports `Stopped`.

use std::sync::Arc;
use std::time::Duration;

use kube::Resource;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::worker;
use crate::api::ObjectApi;
use crate::cache::{Reflector, Writer};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::key::ObjectKey;
use crate::metrics;
use crate::queue::{ExponentialRateLimiter, WorkQueue};
use crate::reconcilers::Reconcile;
use crate::router::EventRouter;

/// Lifecycle of a [`Controller`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    CacheSyncing,
    Running,
    ShuttingDown,
    Stopped,
}

/// Settings of the run loop
#[derive(Debug, Clone)]
pub struct Settings {
    pub workers: usize,
    pub max_retries: Option<u32>,
    pub cache_sync_timeout: Duration,
    pub resync_period: Duration,
    pub reconcile_updates: bool,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

impl From<&ControllerConfig> for Settings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            workers: config.workers,
            max_retries: config.max_retries,
            cache_sync_timeout: config.cache_sync_timeout(),
            resync_period: config.resync_period(),
            reconcile_updates: config.reconcile_updates,
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
        }
    }
}

/// Watches one resource kind and drives a reconciler over its keys
pub struct Controller<K> {
    kind: &'static str,
    api: Arc<dyn ObjectApi<K>>,
    writer: Writer<K>,
    reconciler: Arc<dyn Reconcile>,
    settings: Settings,
    queue: WorkQueue<ObjectKey>,
    state: watch::Sender<State>,
}

impl<K> Controller<K>
where
    K: Resource + Send + Sync + 'static,
{
    /// Create a controller; `writer` must be the write half of the store the
    /// reconciler reads from
    pub fn new(
        kind: &'static str,
        api: Arc<dyn ObjectApi<K>>,
        writer: Writer<K>,
        reconciler: Arc<dyn Reconcile>,
        settings: Settings,
    ) -> Self {
        let limiter = ExponentialRateLimiter::new(settings.backoff_base, settings.backoff_max);
        let (state, _) = watch::channel(State::Created);
        Self {
            kind,
            api,
            writer,
            reconciler,
            queue: WorkQueue::new(kind, limiter),
            settings,
            state,
        }
    }

    /// Observe lifecycle transitions
    pub fn state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Handle to the work queue, e.g. to enqueue keys by hand
    pub fn queue(&self) -> WorkQueue<ObjectKey> {
        self.queue.clone()
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Fails only when the initial list cannot be established.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Controller {
            kind,
            api,
            writer,
            reconciler,
            settings,
            queue,
            state,
        } = self;
        let transition = |next: State| {
            info!(kind, state = ?next, "Controller state");
            state.send_replace(next);
        };

        transition(State::CacheSyncing);
        let reader = writer.as_reader();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let watch_token = shutdown.child_token();

        let reflector = Reflector::new(api, writer, events_tx, settings.resync_period, kind);
        let mut reflector_task = tokio::spawn(reflector.run(watch_token.clone()));
        let router = EventRouter::<K>::new(queue.clone(), settings.reconcile_updates);
        let router_task = tokio::spawn(router.run(events_rx));

        let mut reflector_result = None;
        tokio::select! {
            synced = reader.wait_until_synced(settings.cache_sync_timeout) => {
                if synced {
                    info!(kind, objects = reader.len(), "Cache synced");
                } else {
                    warn!(
                        kind,
                        timeout = ?settings.cache_sync_timeout,
                        "Cache not synced in time, starting workers anyway"
                    );
                }
            }
            result = &mut reflector_task => {
                let result = result.map_err(Error::from).and_then(|r| r);
                if let Err(e) = result {
                    error!(kind, error = %e, "Could not establish the initial list");
                    metrics::CACHE_SYNCED.set(0.0);
                    queue.shut_down();
                    let _ = router_task.await;
                    transition(State::Stopped);
                    return Err(e);
                }
                // reflector stopped cleanly: shutdown arrived while syncing
                reflector_result = Some(Ok(()));
            }
        }

        let mut workers = JoinSet::new();
        for id in 0..settings.workers.max(1) {
            workers.spawn(worker::run(
                id,
                queue.clone(),
                reconciler.clone(),
                settings.max_retries,
            ));
        }
        transition(State::Running);

        if reflector_result.is_none() {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = &mut reflector_task => {
                    reflector_result = Some(result.map_err(Error::from).and_then(|r| r));
                }
            }
        }

        transition(State::ShuttingDown);
        watch_token.cancel();
        let reflector_result = match reflector_result {
            Some(result) => result,
            None => reflector_task.await.map_err(Error::from).and_then(|r| r),
        };
        // the router ends once the reflector has dropped its sender
        if let Err(e) = router_task.await {
            error!(kind, error = %e, "Event router task failed");
        }
        queue.shut_down();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(kind, error = %e, "Worker task failed");
            }
        }

        transition(State::Stopped);
        reflector_result
    }
}
