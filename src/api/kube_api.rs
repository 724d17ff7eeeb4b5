//! [`ObjectApi`] backed by a live API server

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{DeleteParams, ListParams, PostParams, PropagationPolicy, WatchParams},
    core::WatchEvent as KubeWatchEvent,
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};

use super::{ObjectApi, ObjectPage, WatchEvent, WatchStream};
use crate::error::{Error, Result};

/// Server-side timeout of a single watch request
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Namespaced resource kind served by the Kubernetes API
#[derive(Clone)]
pub struct KubeApi<K> {
    client: Client,
    /// List/watch scope; `None` watches every namespace
    namespace: Option<String>,
    request_timeout: Duration,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K> KubeApi<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    /// Create an API handle; list and watch are restricted to `namespace` when given
    pub fn new(client: Client, namespace: Option<String>, request_timeout: Duration) -> Self {
        Self {
            client,
            namespace,
            request_timeout,
            _kind: std::marker::PhantomData,
        }
    }

    fn scoped(&self) -> Api<K> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn namespaced(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = kube::Result<T>> + Send,
    {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout(self.request_timeout)),
        }
    }
}

#[async_trait]
impl<K> ObjectApi<K> for KubeApi<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    async fn list(&self) -> Result<ObjectPage<K>> {
        let api = self.scoped();
        let list = self.bounded(api.list(&ListParams::default())).await?;
        Ok(ObjectPage {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>> {
        let api = self.scoped();
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = self.bounded(api.watch(&params, resource_version)).await?;

        Ok(stream
            .map_err(Error::from)
            .try_filter_map(|event| async move {
                match event {
                    KubeWatchEvent::Added(obj) => Ok(Some(WatchEvent::Added(obj))),
                    KubeWatchEvent::Modified(obj) => Ok(Some(WatchEvent::Modified(obj))),
                    KubeWatchEvent::Deleted(obj) => Ok(Some(WatchEvent::Deleted(obj))),
                    KubeWatchEvent::Bookmark(_) => Ok(None),
                    KubeWatchEvent::Error(resp) if resp.code == 410 => Err(Error::Gone(resp.message)),
                    KubeWatchEvent::Error(resp) => Err(Error::Kube(kube::Error::Api(resp))),
                }
            })
            .boxed())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<K> {
        let api = self.namespaced(namespace);
        self.bounded(api.get(name)).await
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let namespace = obj
            .namespace()
            .ok_or_else(|| Error::malformed(format!("{} has no namespace", obj.name_any())))?;
        let api = self.namespaced(&namespace);
        self.bounded(api.create(&PostParams::default(), obj)).await
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let namespace = obj
            .namespace()
            .ok_or_else(|| Error::malformed(format!("{} has no namespace", obj.name_any())))?;
        let api = self.namespaced(&namespace);
        let name = obj.name_any();
        self.bounded(api.replace(&name, &PostParams::default(), obj)).await
    }

    async fn delete(&self, namespace: &str, name: &str, policy: PropagationPolicy) -> Result<()> {
        let api = self.namespaced(namespace);
        let params = DeleteParams {
            propagation_policy: Some(policy),
            ..DeleteParams::default()
        };
        self.bounded(api.delete(name, &params)).await?;
        Ok(())
    }
}
