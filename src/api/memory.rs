//! In-process [`ObjectApi`]
//!
//! Behaves like a single-kind API server: every write bumps a global resource
//! version, watches replay history after the requested version and then stream
//! live changes. Failures can be injected into `create` and active watches can
//! be cut to exercise the retry and relist paths.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use kube::{api::PropagationPolicy, Resource, ResourceExt};
use parking_lot::Mutex;

use super::{ObjectApi, ObjectPage, WatchEvent, WatchStream};
use crate::error::{Error, Result};
use crate::key::ObjectKey;

/// A recorded mutating call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(ObjectKey),
    Replace(ObjectKey),
    Delete(ObjectKey),
}

struct State<K> {
    objects: BTreeMap<ObjectKey, K>,
    revision: u64,
    /// Events with the revision they were written at, oldest first
    history: Vec<(u64, WatchEvent<K>)>,
    /// Revisions at or below this value have been compacted away
    compacted: u64,
    watchers: Vec<mpsc::UnboundedSender<Result<WatchEvent<K>>>>,
    create_failures: VecDeque<Error>,
    list_failures: VecDeque<Error>,
    calls: Vec<Call>,
}

/// Shared in-memory resource store for one kind
pub struct MemoryApi<K> {
    state: Arc<Mutex<State<K>>>,
}

impl<K> Clone for MemoryApi<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<K> Default for MemoryApi<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> MemoryApi<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                objects: BTreeMap::new(),
                revision: 0,
                history: Vec::new(),
                compacted: 0,
                watchers: Vec::new(),
                create_failures: VecDeque::new(),
                list_failures: VecDeque::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// Insert or overwrite an object without recording a call
    pub fn upsert(&self, obj: K) -> K {
        let mut state = self.state.lock();
        let key = ObjectKey::from_object(&obj);
        let stored = Self::stamp(&mut state, obj);
        let event = if state.objects.insert(key, stored.clone()).is_some() {
            WatchEvent::Modified(stored.clone())
        } else {
            WatchEvent::Added(stored.clone())
        };
        Self::publish(&mut state, event);
        stored
    }

    /// Remove an object without recording a call
    pub fn remove(&self, namespace: &str, name: &str) -> Option<K> {
        let mut state = self.state.lock();
        Self::remove_locked(&mut state, &ObjectKey::new(namespace, name))
    }

    /// Current copy of an object
    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        self.state
            .lock()
            .objects
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutating calls made through the [`ObjectApi`] surface, oldest first
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Make the next `create` calls fail with the given errors, in order
    pub fn fail_creates(&self, errors: impl IntoIterator<Item = Error>) {
        self.state.lock().create_failures.extend(errors);
    }

    /// Make the next `list` calls fail with the given errors, in order
    pub fn fail_lists(&self, errors: impl IntoIterator<Item = Error>) {
        self.state.lock().list_failures.extend(errors);
    }

    /// End every open watch stream, as a dropped connection would
    pub fn disconnect_watches(&self) {
        self.state.lock().watchers.clear();
    }

    /// Forget history so watches from older versions fail with `Gone`
    pub fn compact(&self) {
        let mut state = self.state.lock();
        state.compacted = state.revision;
        state.history.clear();
        let message = format!("too old resource version, compacted at {}", state.compacted);
        for watcher in state.watchers.drain(..) {
            let _ = watcher.unbounded_send(Err(Error::Gone(message.clone())));
        }
    }

    fn stamp(state: &mut State<K>, mut obj: K) -> K {
        state.revision += 1;
        let revision = state.revision;
        let meta = obj.meta_mut();
        meta.resource_version = Some(revision.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", revision));
        }
        obj
    }

    fn publish(state: &mut State<K>, event: WatchEvent<K>) {
        let revision = state.revision;
        state
            .watchers
            .retain(|watcher| watcher.unbounded_send(Ok(event.clone())).is_ok());
        state.history.push((revision, event));
    }

    fn remove_locked(state: &mut State<K>, key: &ObjectKey) -> Option<K> {
        let removed = state.objects.remove(key)?;
        state.revision += 1;
        let mut tombstone = removed.clone();
        tombstone.meta_mut().resource_version = Some(state.revision.to_string());
        Self::publish(state, WatchEvent::Deleted(tombstone));
        Some(removed)
    }
}

#[async_trait]
impl<K> ObjectApi<K> for MemoryApi<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn list(&self) -> Result<ObjectPage<K>> {
        let mut state = self.state.lock();
        if let Some(err) = state.list_failures.pop_front() {
            return Err(err);
        }
        Ok(ObjectPage {
            items: state.objects.values().cloned().collect(),
            resource_version: state.revision.to_string(),
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>> {
        let from: u64 = resource_version
            .parse()
            .map_err(|_| Error::malformed(format!("invalid resource version {:?}", resource_version)))?;

        let mut state = self.state.lock();
        if from < state.compacted {
            return Err(Error::Gone(format!(
                "resource version {} is older than {}",
                from, state.compacted
            )));
        }

        let (tx, rx) = mpsc::unbounded();
        for (revision, event) in &state.history {
            if *revision > from {
                let _ = tx.unbounded_send(Ok(event.clone()));
            }
        }
        state.watchers.push(tx);
        Ok(rx.boxed())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<K> {
        let key = ObjectKey::new(namespace, name);
        self.state
            .lock()
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let mut state = self.state.lock();
        let key = ObjectKey::from_object(obj);
        state.calls.push(Call::Create(key.clone()));

        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }

        let stored = Self::stamp(&mut state, obj.clone());
        state.objects.insert(key, stored.clone());
        Self::publish(&mut state, WatchEvent::Added(stored.clone()));
        Ok(stored)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let mut state = self.state.lock();
        let key = ObjectKey::from_object(obj);
        state.calls.push(Call::Replace(key.clone()));

        let current = state
            .objects
            .get(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if let Some(expected) = obj.resource_version() {
            if current.resource_version().as_deref() != Some(expected.as_str()) {
                return Err(Error::Conflict(format!(
                    "{} has been modified since version {}",
                    key, expected
                )));
            }
        }

        let stored = Self::stamp(&mut state, obj.clone());
        state.objects.insert(key, stored.clone());
        Self::publish(&mut state, WatchEvent::Modified(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str, _policy: PropagationPolicy) -> Result<()> {
        let mut state = self.state.lock();
        let key = ObjectKey::new(namespace, name);
        state.calls.push(Call::Delete(key.clone()));
        Self::remove_locked(&mut state, &key)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }
}
