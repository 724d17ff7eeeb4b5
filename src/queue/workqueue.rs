//! Deduplicating, rate-limited work queue
//!
//! An item is in at most one of three places: `queue` (waiting), `processing`
//! (handed out by [`WorkQueue::get`]), or neither. `dirty` holds every item
//! that needs another run; an item that is re-added while processing stays
//! dirty and goes back into `queue` when its current run is done.

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use super::rate_limiter::ExponentialRateLimiter;
use crate::metrics;

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Shared<T> {
    name: &'static str,
    state: Mutex<State<T>>,
    limiter: Mutex<ExponentialRateLimiter<T>>,
    notify: Notify,
}

/// Cloneable handle to a shared work queue
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create a queue whose retries are delayed by `limiter`
    pub fn new(name: &'static str, limiter: ExponentialRateLimiter<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                limiter: Mutex::new(limiter),
                notify: Notify::new(),
            }),
        }
    }

    /// Mark `item` as needing processing.
    ///
    /// Never blocks. An item that is already waiting is not queued twice; an
    /// item that is being processed is queued again once it is done.
    pub fn add(&self, item: T) {
        let mut state = self.shared.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!(queue = self.shared.name, ?item, "Item in flight, deferring");
            return;
        }
        state.queue.push_back(item);
        self.set_depth(state.queue.len());
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Add `item` once `delay` has elapsed
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Add `item` after its back-off delay; returns the delay used
    pub fn add_rate_limited(&self, item: T) -> Duration {
        let delay = self.shared.limiter.lock().when(&item);
        metrics::RETRIES.with_label_values(&[self.shared.name]).inc();
        self.add_after(item, delay);
        delay
    }

    /// Clear the back-off history of `item`
    pub fn forget(&self, item: &T) {
        self.shared.limiter.lock().forget(item);
    }

    /// How many times `item` has been re-added through [`add_rate_limited`](Self::add_rate_limited)
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.shared.limiter.lock().num_requeues(item)
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue has been shut down and drained. The
    /// returned guard marks the item as done when dropped.
    pub async fn get(&self) -> Option<Processing<T>> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.processing.insert(item.clone());
                    state.dirty.remove(&item);
                    self.set_depth(state.queue.len());
                    return Some(Processing {
                        item,
                        queue: self.clone(),
                    });
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `item` as finished, queueing it again if it was re-added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.shared.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            self.set_depth(state.queue.len());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Stop accepting items and wake every waiting [`get`](Self::get)
    pub fn shut_down(&self) {
        self.shared.state.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    /// Number of items waiting to be handed out
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `item` is currently handed out to a worker
    pub fn is_processing(&self, item: &T) -> bool {
        self.shared.state.lock().processing.contains(item)
    }

    fn set_depth(&self, depth: usize) {
        metrics::QUEUE_DEPTH
            .with_label_values(&[self.shared.name])
            .set(depth as f64);
    }
}

/// An item handed out by [`WorkQueue::get`].
///
/// Dropping the guard marks the item as done, on every exit path.
pub struct Processing<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    item: T,
    queue: WorkQueue<T>,
}

impl<T> Deref for Processing<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T> Drop for Processing<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.queue.done(&self.item);
    }
}
