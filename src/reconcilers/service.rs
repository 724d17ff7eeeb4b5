//! Deployment → Service reconciler
//!
//! For every eligible Deployment the controller makes sure a ClusterIP
//! Service of the same name exists in the same namespace, selecting the
//! Deployment's pods. Creation is the only mutation: an existing Service is
//! left alone, and removal is handled by the garbage collector through the
//! controller owner reference set on creation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::{NamespaceSelector, Outcome, Predicate, Reconcile, SkipReason};
use crate::api::ObjectApi;
use crate::cache::Store;
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::key::ObjectKey;

/// Label recording which controller created a Service
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY: &str = "deployment-service-controller";

/// Port layout of derived Services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTemplate {
    pub port: i32,
    pub port_name: String,
}

impl Default for ServiceTemplate {
    fn default() -> Self {
        Self {
            port: 8080,
            port_name: "http".to_string(),
        }
    }
}

impl From<&ControllerConfig> for ServiceTemplate {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            port: config.service_port,
            port_name: config.service_port_name.clone(),
        }
    }
}

/// Derive the Service a Deployment should have.
///
/// Fails with [`Error::Malformed`] when the Deployment has no pod template
/// labels, since an empty selector would match every pod in the namespace.
pub fn desired_service(deployment: &Deployment, template: &ServiceTemplate) -> Result<Service> {
    let name = deployment
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::malformed("Deployment has no name"))?;
    let namespace = deployment
        .namespace()
        .ok_or_else(|| Error::malformed(format!("Deployment {} has no namespace", name)))?;

    let selector: BTreeMap<String, String> = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.labels.clone())
        .unwrap_or_default();
    if selector.is_empty() {
        return Err(Error::malformed(format!(
            "Deployment {}/{} has no pod template labels",
            namespace, name
        )));
    }

    let labels = BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string())]);

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(labels),
            owner_references: deployment.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![ServicePort {
                name: Some(template.port_name.clone()),
                port: template.port,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(template.port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Creates the derived Service of every eligible cached Deployment
pub struct ServiceReconciler {
    deployments: Store<Deployment>,
    services: Arc<dyn ObjectApi<Service>>,
    predicate: Arc<dyn Predicate<Deployment>>,
    template: ServiceTemplate,
}

impl ServiceReconciler {
    pub fn new(
        deployments: Store<Deployment>,
        services: Arc<dyn ObjectApi<Service>>,
        predicate: Arc<dyn Predicate<Deployment>>,
        template: ServiceTemplate,
    ) -> Self {
        Self {
            deployments,
            services,
            predicate,
            template,
        }
    }

    /// Reconciler restricted to one namespace with the default Service template
    pub fn for_namespace(
        deployments: Store<Deployment>,
        services: Arc<dyn ObjectApi<Service>>,
        namespace: impl Into<String>,
    ) -> Self {
        Self::new(
            deployments,
            services,
            Arc::new(NamespaceSelector::Only(namespace.into())),
            ServiceTemplate::default(),
        )
    }
}

#[async_trait]
impl Reconcile for ServiceReconciler {
    #[instrument(skip(self), fields(namespace = %key.namespace, name = %key.name))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome> {
        let Some(deployment) = self.deployments.get_key(key) else {
            info!("Deployment no longer exists, nothing to do");
            return Ok(Outcome::Skipped(SkipReason::Gone));
        };

        if !self.predicate.matches(&deployment) {
            debug!("Deployment not selected, skipping");
            return Ok(Outcome::Skipped(SkipReason::Filtered));
        }

        let service = desired_service(&deployment, &self.template)?;

        match self.services.create(&service).await {
            Ok(_) => {
                info!(service = %service.name_any(), "Created Service");
                Ok(Outcome::Success)
            }
            Err(e) if e.is_already_exists() => {
                debug!(service = %service.name_any(), "Service already exists");
                Ok(Outcome::Success)
            }
            Err(e) => {
                warn!(error = %e, "Failed to create Service");
                Err(e)
            }
        }
    }
}
