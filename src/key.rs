//! Identity keys for watched objects
//!
//! An [`ObjectKey`] is the `(namespace, name)` pair the work queue deduplicates
//! on. Every event for the same object maps to the same key, whatever its type.

use std::fmt;

use kube::{Resource, ResourceExt};

/// `(namespace, name)` of one object within one resource kind.
///
/// Cluster-scoped objects carry an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Create a key from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derive the key of an object from its metadata
    pub fn from_object<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}
