//! In-memory index of watched objects

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kube::Resource;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::key::ObjectKey;

/// A change applied to the index, handed to the event router
#[derive(Debug, Clone)]
pub enum Notification<K> {
    Added(Arc<K>),
    Modified(Arc<K>),
    Deleted(Arc<K>),
}

impl<K: Resource> Notification<K> {
    /// Identity key of the object the notification is about
    pub fn key(&self) -> ObjectKey {
        match self {
            Notification::Added(obj) | Notification::Modified(obj) | Notification::Deleted(obj) => {
                ObjectKey::from_object(obj.as_ref())
            }
        }
    }
}

type Index<K> = Arc<RwLock<HashMap<ObjectKey, Arc<K>>>>;

/// Create a connected writer/reader pair
pub fn store<K>() -> (Store<K>, Writer<K>) {
    let index: Index<K> = Arc::default();
    let (synced_tx, synced_rx) = watch::channel(false);
    let writer = Writer {
        index: index.clone(),
        synced: synced_tx,
    };
    let reader = Store {
        index,
        synced: synced_rx,
    };
    (reader, writer)
}

/// Write half of the cache, owned by the reflector
pub struct Writer<K> {
    index: Index<K>,
    synced: watch::Sender<bool>,
}

impl<K: Resource> Writer<K> {
    /// Get a read handle
    pub fn as_reader(&self) -> Store<K> {
        Store {
            index: self.index.clone(),
            synced: self.synced.subscribe(),
        }
    }

    /// Store `obj` and report whether it was new
    pub fn apply_upsert(&mut self, obj: K) -> Notification<K> {
        let key = ObjectKey::from_object(&obj);
        let obj = Arc::new(obj);
        match self.index.write().insert(key, obj.clone()) {
            Some(_) => Notification::Modified(obj),
            None => Notification::Added(obj),
        }
    }

    /// Drop `obj` from the index
    pub fn apply_delete(&mut self, obj: K) -> Notification<K> {
        let key = ObjectKey::from_object(&obj);
        self.index.write().remove(&key);
        // carries the final state sent by the server, not the cached copy
        Notification::Deleted(Arc::new(obj))
    }

    /// Swap the whole index for a fresh list.
    ///
    /// Objects missing from `objects` come back as `Deleted`, every listed
    /// object comes back as `Added`, including ones already known.
    pub fn replace(&mut self, objects: Vec<K>) -> Vec<Notification<K>> {
        let fresh: HashMap<ObjectKey, Arc<K>> = objects
            .into_iter()
            .map(|obj| (ObjectKey::from_object(&obj), Arc::new(obj)))
            .collect();

        let mut index = self.index.write();
        let mut notifications: Vec<Notification<K>> = index
            .iter()
            .filter(|(key, _)| !fresh.contains_key(*key))
            .map(|(_, obj)| Notification::Deleted(obj.clone()))
            .collect();
        notifications.extend(fresh.values().cloned().map(Notification::Added));
        *index = fresh;
        notifications
    }

    /// Flip the synced flag
    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read half of the cache
///
/// Cloning produces another handle onto the same index.
pub struct Store<K> {
    index: Index<K>,
    synced: watch::Receiver<bool>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            index: self.index.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K> Store<K> {
    /// Cached object by namespace and name
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.get_key(&ObjectKey::new(namespace, name))
    }

    /// Cached object by key
    pub fn get_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.index.read().get(key).cloned()
    }

    /// Snapshot of every cached object
    pub fn list(&self) -> Vec<Arc<K>> {
        self.index.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the first full list has been applied.
    ///
    /// The flag flips once the list's `Added` notifications have been handed
    /// to the event channel, not once the router has drained them. Workers
    /// that start in between block in the work queue until the keys arrive.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the first full list has been applied or `timeout` passes.
    ///
    /// Returns whether the cache is synced.
    pub async fn wait_until_synced(&self, timeout: Duration) -> bool {
        let mut synced = self.synced.clone();
        let waited = tokio::time::timeout(timeout, synced.wait_for(|synced| *synced))
            .await
            .map(|changed| changed.is_ok());
        match waited {
            Ok(true) => true,
            // writer dropped or deadline passed
            _ => self.has_synced(),
        }
    }
}
