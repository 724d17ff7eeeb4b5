//! Prometheus metrics for the Deployment Service controller
//!
//! This module exposes metrics for monitoring controller health and performance.

mod prometheus;

pub use prometheus::*;
