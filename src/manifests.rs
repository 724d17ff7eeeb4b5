//! Create, list and delete cluster objects described by YAML manifests
//!
//! Supports the built-in kinds an application deployment usually ships with:
//! namespaces, secrets, deployments, services, storage classes, config maps,
//! persistent volumes and persistent volume claims.

use std::fmt::Debug;
use std::path::Path;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolume, PersistentVolumeClaim, Secret, Service,
};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{
    api::{DeleteParams, ListParams, PostParams, PropagationPolicy},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Object kinds understood by the manifest tooling
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ManifestKind {
    Namespace,
    Secret,
    Deployment,
    Service,
    StorageClass,
    ConfigMap,
    PersistentVolume,
    PersistentVolumeClaim,
}

impl ManifestKind {
    /// Map a manifest's `kind` field
    pub fn from_kind(kind: &str) -> Result<Self> {
        Ok(match kind {
            "Namespace" => ManifestKind::Namespace,
            "Secret" => ManifestKind::Secret,
            "Deployment" => ManifestKind::Deployment,
            "Service" => ManifestKind::Service,
            "StorageClass" => ManifestKind::StorageClass,
            "ConfigMap" => ManifestKind::ConfigMap,
            "PersistentVolume" => ManifestKind::PersistentVolume,
            "PersistentVolumeClaim" => ManifestKind::PersistentVolumeClaim,
            other => return Err(Error::manifest(format!("unsupported kind '{}'", other))),
        })
    }

    /// Whether objects of this kind live in a namespace
    pub fn is_namespaced(&self) -> bool {
        !matches!(
            self,
            ManifestKind::Namespace | ManifestKind::StorageClass | ManifestKind::PersistentVolume
        )
    }
}

/// What [`apply`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
}

/// A manifest read from disk, not yet bound to a type
#[derive(Debug, Clone)]
pub struct Manifest {
    pub kind: ManifestKind,
    pub name: String,
    pub namespace: Option<String>,
    value: serde_yaml::Value,
}

impl Manifest {
    /// Parse a single YAML document
    pub fn parse(yaml: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        let kind = value
            .get("kind")
            .and_then(|kind| kind.as_str())
            .ok_or_else(|| Error::manifest("manifest has no kind"))?;
        let kind = ManifestKind::from_kind(kind)?;

        let metadata = value.get("metadata");
        let name = metadata
            .and_then(|meta| meta.get("name"))
            .and_then(|name| name.as_str())
            .ok_or_else(|| Error::manifest("manifest has no metadata.name"))?
            .to_string();
        let namespace = metadata
            .and_then(|meta| meta.get("namespace"))
            .and_then(|ns| ns.as_str())
            .map(str::to_string);

        Ok(Self {
            kind,
            name,
            namespace,
            value,
        })
    }

    /// Read and parse a manifest file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)?;
        Self::parse(&yaml).map_err(|e| Error::manifest(format!("{}: {}", path.display(), e)))
    }

    /// Convert into the typed object
    pub fn into_object<K: DeserializeOwned>(self) -> Result<K> {
        Ok(serde_yaml::from_value(self.value)?)
    }
}

/// Create `obj`, or replace it when an object with its name already exists
pub async fn apply<K>(api: &Api<K>, mut obj: K) -> Result<Applied>
where
    K: Resource + Clone + Debug + DeserializeOwned + Serialize,
{
    let name = obj.name_any();
    match api.get_opt(&name).await? {
        None => {
            api.create(&PostParams::default(), &obj).await?;
            info!(%name, "Created");
            Ok(Applied::Created)
        }
        Some(live) => {
            // replace is guarded by the live resource version
            obj.meta_mut().resource_version = live.resource_version();
            api.replace(&name, &PostParams::default(), &obj).await?;
            info!(%name, "Updated");
            Ok(Applied::Updated)
        }
    }
}

/// Names of every object visible through `api`
pub async fn list_names<K>(api: &Api<K>) -> Result<Vec<String>>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    let list = api.list(&ListParams::default()).await?;
    Ok(list.items.iter().map(|obj| obj.name_any()).collect())
}

/// Delete an object by name
pub async fn delete<K>(api: &Api<K>, name: &str, policy: PropagationPolicy) -> Result<()>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    let params = DeleteParams {
        propagation_policy: Some(policy),
        ..DeleteParams::default()
    };
    api.delete(name, &params).await?;
    debug!(%name, "Delete accepted");
    Ok(())
}

/// Expands to a match over [`ManifestKind`] binding `$api` to an `Api` of the
/// matching type, scoped to `$ns` for namespaced kinds.
macro_rules! with_api {
    ($client:expr, $kind:expr, $ns:expr, |$api:ident| $body:expr) => {
        match $kind {
            ManifestKind::Namespace => {
                let $api: Api<Namespace> = Api::all($client);
                $body
            }
            ManifestKind::StorageClass => {
                let $api: Api<StorageClass> = Api::all($client);
                $body
            }
            ManifestKind::PersistentVolume => {
                let $api: Api<PersistentVolume> = Api::all($client);
                $body
            }
            ManifestKind::Secret => {
                let $api: Api<Secret> = Api::namespaced($client, $ns);
                $body
            }
            ManifestKind::Deployment => {
                let $api: Api<Deployment> = Api::namespaced($client, $ns);
                $body
            }
            ManifestKind::Service => {
                let $api: Api<Service> = Api::namespaced($client, $ns);
                $body
            }
            ManifestKind::ConfigMap => {
                let $api: Api<ConfigMap> = Api::namespaced($client, $ns);
                $body
            }
            ManifestKind::PersistentVolumeClaim => {
                let $api: Api<PersistentVolumeClaim> = Api::namespaced($client, $ns);
                $body
            }
        }
    };
}

/// Manifest operations against one cluster
pub struct Manifests {
    client: Client,
    default_namespace: String,
}

impl Manifests {
    /// `default_namespace` is used for namespaced manifests that do not name one
    pub fn new(client: Client, default_namespace: impl Into<String>) -> Self {
        Self {
            client,
            default_namespace: default_namespace.into(),
        }
    }

    /// Create or update the object in `manifest`
    pub async fn apply(&self, manifest: Manifest) -> Result<Applied> {
        let namespace = manifest
            .namespace
            .clone()
            .unwrap_or_else(|| self.default_namespace.clone());
        with_api!(self.client.clone(), manifest.kind, &namespace, |api| {
            apply(&api, manifest.into_object()?).await
        })
    }

    /// Names of every object of `kind` in the default namespace
    pub async fn list(&self, kind: ManifestKind) -> Result<Vec<String>> {
        with_api!(self.client.clone(), kind, &self.default_namespace, |api| {
            list_names(&api).await
        })
    }

    /// Delete an object of `kind` from the default namespace
    pub async fn delete(
        &self,
        kind: ManifestKind,
        name: &str,
        policy: PropagationPolicy,
    ) -> Result<()> {
        with_api!(self.client.clone(), kind, &self.default_namespace, |api| {
            delete(&api, name, policy).await
        })
    }
}
