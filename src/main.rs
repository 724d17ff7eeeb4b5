//! Deployment Service controller
//!
//! Main entry point. Loads configuration, connects to the Kubernetes API
//! server and runs the Deployment controller until a shutdown signal arrives.

use anyhow::Context;
use clap::Parser;
use kube::{config::KubeConfigOptions, Client, Config};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use deployment_service_controller::{config::ControllerConfig, controllers, metrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    let config = ControllerConfig::parse();
    config.validate()?;

    info!("Starting Deployment Service controller");

    // Create Kubernetes client
    let client = create_client(&config).await?;
    info!("Connected to Kubernetes API server");

    // Start metrics server
    let metrics_port = config.metrics_port;
    let metrics_handle = tokio::spawn(metrics::serve(metrics_port));
    info!("Metrics server starting on port {}", metrics_port);

    let shutdown = CancellationToken::new();
    let controller = controllers::run_deployment_controller(client, &config, shutdown.clone());
    tokio::pin!(controller);

    // Handle graceful shutdown
    let result = tokio::select! {
        result = &mut controller => result,
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
            shutdown.cancel();
            controller.await
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping controller");
            shutdown.cancel();
            controller.await
        }
    };

    result.context("controller failed")?;
    info!("Deployment Service controller stopped");
    Ok(())
}

/// Build a client from the configured kubeconfig, or the environment default
async fn create_client(config: &ControllerConfig) -> anyhow::Result<Client> {
    let Some(path) = &config.kubeconfig else {
        return Ok(Client::try_default().await?);
    };

    let kubeconfig = kube::config::Kubeconfig::read_from(path)
        .with_context(|| format!("reading kubeconfig {}", path.display()))?;
    let client_config =
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(client_config)?)
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
