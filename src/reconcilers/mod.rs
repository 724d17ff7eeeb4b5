//! Reconcilers
//!
//! A reconciler takes an identity key, looks the object up in the local
//! cache and issues whatever mutation brings the cluster in line with it.
//! Reconcilers must be idempotent: the same key can be delivered again at any
//! time, including after a success.

pub mod service;

pub use service::{desired_service, ServiceReconciler, ServiceTemplate};

use async_trait::async_trait;
use kube::{Resource, ResourceExt};

use crate::error::Result;
use crate::key::ObjectKey;

/// Why a key was accepted without doing anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Object is no longer in the cache
    Gone,
    /// Object does not match the configured predicate
    Filtered,
}

/// Outcome of a reconciliation that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Cluster matches the desired state (mutation applied or already present)
    Success,
    /// Nothing to do for this key
    Skipped(SkipReason),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Skipped(SkipReason::Gone) => "skipped_gone",
            Outcome::Skipped(SkipReason::Filtered) => "skipped_filtered",
        }
    }
}

/// Reconciliation entry point driven by the controller workers.
///
/// An `Err` for which [`is_retryable`](crate::Error::is_retryable) holds is
/// retried with back-off; any other `Err` drops the key.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome>;
}

/// Selects which cached objects are eligible for reconciliation
pub trait Predicate<K>: Send + Sync {
    fn matches(&self, obj: &K) -> bool;
}

impl<K, F> Predicate<K> for F
where
    F: Fn(&K) -> bool + Send + Sync,
{
    fn matches(&self, obj: &K) -> bool {
        self(obj)
    }
}

/// Namespace filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceSelector {
    All,
    Only(String),
}

impl<K: Resource> Predicate<K> for NamespaceSelector {
    fn matches(&self, obj: &K) -> bool {
        match self {
            NamespaceSelector::All => true,
            NamespaceSelector::Only(namespace) => {
                obj.namespace().as_deref() == Some(namespace.as_str())
            }
        }
    }
}
