//! Per-item exponential failure back-off

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};

/// Default delay after the first failure
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default ceiling for the delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Back-off state of one failing item
#[derive(Debug)]
struct Failures {
    requeues: u32,
    backoff: ExponentialBackoff,
}

/// Delay doubles with every consecutive failure of the same item, starting at
/// `base` and never exceeding `max`. `forget` resets an item.
#[derive(Debug)]
pub struct ExponentialRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: HashMap<T, Failures>,
}

impl<T: Eq + Hash + Clone> Default for ExponentialRateLimiter<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<T: Eq + Hash + Clone> ExponentialRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Record a failure of `item` and return how long to wait before retrying it
    pub fn when(&mut self, item: &T) -> Duration {
        let (base, max) = (self.base, self.max);
        let failures = self.failures.entry(item.clone()).or_insert_with(|| Failures {
            requeues: 0,
            backoff: item_backoff(base, max),
        });
        failures.requeues = failures.requeues.saturating_add(1);
        failures
            .backoff
            .next_backoff()
            .map_or(max, |delay| delay.min(max))
    }

    /// Consecutive failures recorded for `item`
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item).map_or(0, |failures| failures.requeues)
    }

    /// Clear the failure history of `item`
    pub fn forget(&mut self, item: &T) {
        self.failures.remove(item);
    }
}

/// Deterministic doubling from `base` up to `max`, never giving up
fn item_backoff(base: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: base,
        initial_interval: base,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: max,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}
