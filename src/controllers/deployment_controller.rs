//! Deployment controller
//!
//! Watches Deployments and creates a matching Service for each one in the
//! watched namespace.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Controller, Settings};
use crate::api::{KubeApi, ObjectApi};
use crate::cache;
use crate::config::{ControllerConfig, ALL_NAMESPACES};
use crate::error::Result;
use crate::reconcilers::{ServiceReconciler, ServiceTemplate};

/// Kind label used in logs and metrics
pub const KIND: &str = "Deployment";

/// Assemble the controller from any Deployment source and Service sink
pub fn build(
    deployments: Arc<dyn ObjectApi<Deployment>>,
    services: Arc<dyn ObjectApi<Service>>,
    config: &ControllerConfig,
) -> Controller<Deployment> {
    let (reader, writer) = cache::store();
    let reconciler = ServiceReconciler::new(
        reader,
        services,
        Arc::new(config.namespace_selector()),
        ServiceTemplate::from(config),
    );
    Controller::new(
        KIND,
        deployments,
        writer,
        Arc::new(reconciler),
        Settings::from(config),
    )
}

/// Run the Deployment controller against the cluster until `shutdown` fires
pub async fn run(client: Client, config: &ControllerConfig, shutdown: CancellationToken) -> Result<()> {
    // only list/watch what the reconciler will act on
    let scope = (config.watched_namespace != ALL_NAMESPACES).then(|| config.watched_namespace.clone());
    let deployments = KubeApi::<Deployment>::new(client.clone(), scope, config.request_timeout());
    let services = KubeApi::<Service>::new(client, None, config.request_timeout());

    info!(
        namespace = %config.watched_namespace,
        workers = config.workers,
        "Starting Deployment controller"
    );

    build(Arc::new(deployments), Arc::new(services), config)
        .run(shutdown)
        .await
}
