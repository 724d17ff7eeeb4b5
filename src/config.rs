//! Controller configuration
//!
//! Every option can be given as a command line flag or through the
//! environment, so the same binary works from a shell and from a Pod spec.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};
use crate::reconcilers::NamespaceSelector;

/// Namespace value that disables the namespace filter
pub const ALL_NAMESPACES: &str = "*";

/// Runtime options for the controller process
#[derive(Parser, Debug, Clone)]
#[command(
    name = "deployment-service-controller",
    version,
    about = "Creates a ClusterIP Service for every Deployment in the watched namespace"
)]
pub struct ControllerConfig {
    /// Path to a kubeconfig file (defaults to in-cluster or ~/.kube/config)
    #[arg(long, env = "KUBECONFIG_PATH")]
    pub kubeconfig: Option<PathBuf>,

    /// Only Deployments in this namespace are reconciled ("*" for all)
    #[arg(long, env = "WATCHED_NAMESPACE", default_value = "csi")]
    pub watched_namespace: String,

    /// Seconds between periodic full re-lists of the watched Deployments
    #[arg(long, env = "RESYNC_PERIOD", default_value_t = 600)]
    pub resync_period: u64,

    /// Number of concurrent reconciliation workers
    #[arg(long, env = "WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Give up on a key after this many consecutive failures (unset retries forever)
    #[arg(long, env = "MAX_RETRIES")]
    pub max_retries: Option<u32>,

    /// Seconds to wait for the initial cache sync before starting workers anyway
    #[arg(long, env = "CACHE_SYNC_TIMEOUT", default_value_t = 30)]
    pub cache_sync_timeout: u64,

    /// Deadline in seconds for each call made against the API server while reconciling
    #[arg(long, env = "REQUEST_TIMEOUT", default_value_t = 10)]
    pub request_timeout: u64,

    /// First retry delay in milliseconds for a failing key
    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = 5)]
    pub backoff_base_ms: u64,

    /// Upper bound in seconds for the retry delay of a failing key
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value_t = 1000)]
    pub backoff_max_secs: u64,

    /// Reconcile on Deployment updates as well as on add/delete
    #[arg(long, env = "RECONCILE_UPDATES", default_value_t = false)]
    pub reconcile_updates: bool,

    /// Port exposed by the derived Service
    #[arg(long, env = "SERVICE_PORT", default_value_t = 8080)]
    pub service_port: i32,

    /// Name of the derived Service port
    #[arg(long, env = "SERVICE_PORT_NAME", default_value = "http")]
    pub service_port_name: String,

    /// Port of the metrics and health HTTP server
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            watched_namespace: "csi".to_string(),
            resync_period: 600,
            workers: 1,
            max_retries: None,
            cache_sync_timeout: 30,
            request_timeout: 10,
            backoff_base_ms: 5,
            backoff_max_secs: 1000,
            reconcile_updates: false,
            service_port: 8080,
            service_port_name: "http".to_string(),
            metrics_port: 8080,
        }
    }
}

impl ControllerConfig {
    /// Reject option combinations the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("at least one worker is required"));
        }
        if self.watched_namespace.is_empty() {
            return Err(Error::config("watched namespace must not be empty"));
        }
        if self.backoff_base() > self.backoff_max() {
            return Err(Error::config(format!(
                "backoff base {:?} exceeds backoff max {:?}",
                self.backoff_base(),
                self.backoff_max()
            )));
        }
        if !(1..=65535).contains(&self.service_port) {
            return Err(Error::config(format!(
                "invalid service port {}",
                self.service_port
            )));
        }
        Ok(())
    }

    /// Namespace filter applied by the reconciler
    pub fn namespace_selector(&self) -> NamespaceSelector {
        if self.watched_namespace == ALL_NAMESPACES {
            NamespaceSelector::All
        } else {
            NamespaceSelector::Only(self.watched_namespace.clone())
        }
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period)
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}
