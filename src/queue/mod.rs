//! Work queue between the event router and the reconciliation workers

mod rate_limiter;
mod workqueue;

pub use rate_limiter::{ExponentialRateLimiter, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
pub use workqueue::{Processing, WorkQueue};
