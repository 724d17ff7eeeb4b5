//! Deployment Service controller
//!
//! Watches Deployments through a local cache, queues their identity keys and
//! makes sure each selected Deployment has a ClusterIP Service in front of it.
//! The pieces (cache, router, work queue, reconciler, run loop) are generic
//! enough to drive other single-kind controllers.

pub mod api;
pub mod cache;
pub mod config;
pub mod controllers;
pub mod error;
pub mod key;
pub mod manifests;
pub mod metrics;
pub mod queue;
pub mod reconcilers;
pub mod router;

pub use error::{Error, Result};
pub use key::ObjectKey;
