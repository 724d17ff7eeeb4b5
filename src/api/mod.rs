//! Access to the authoritative resource store
//!
//! The controller only talks to the API server through [`ObjectApi`], which
//! keeps the cache, the reconciler and the tests independent of the transport.

mod kube_api;
mod memory;

pub use kube_api::*;
pub use memory::*;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

/// Propagation policy for deletes
pub use kube::api::PropagationPolicy;

/// One page of a full list together with the resource version to watch from
#[derive(Debug, Clone)]
pub struct ObjectPage<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// A change notification from a watch stream
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

/// Endless stream of watch events, terminated by a disconnect or an error item
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// Query and mutate API of one resource kind
///
/// `create` fails with an error for which `is_already_exists()` holds, `get`
/// and `delete` with one for which `is_not_found()` holds, and `replace` with
/// one for which `is_conflict()` holds when the object carries a stale version.
#[async_trait]
pub trait ObjectApi<K>: Send + Sync {
    /// List all objects in scope
    async fn list(&self) -> Result<ObjectPage<K>>;

    /// Watch for changes after `resource_version`
    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>>;

    /// Fetch a single object
    async fn get(&self, namespace: &str, name: &str) -> Result<K>;

    /// Create a new object
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace an existing object
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Delete an object
    async fn delete(&self, namespace: &str, name: &str, policy: PropagationPolicy) -> Result<()>;
}
