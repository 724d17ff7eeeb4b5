//! Reconciliation worker loop

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::key::ObjectKey;
use crate::metrics;
use crate::queue::WorkQueue;
use crate::reconcilers::Reconcile;

/// What the worker did with a key after reconciling it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Finished; back-off history cleared
    Forgotten,
    /// Failed; scheduled again after back-off
    Requeued,
    /// Failed permanently or too often; back-off history cleared
    Dropped,
}

/// Pull keys until the queue is shut down and drained
pub async fn run(
    id: usize,
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<dyn Reconcile>,
    max_retries: Option<u32>,
) {
    debug!(worker = id, "Worker started");
    while let Some(key) = queue.get().await {
        process(&queue, reconciler.as_ref(), &key, max_retries).await;
        // dropping the guard marks the key done
    }
    debug!(worker = id, "Worker stopped");
}

/// Reconcile one key and settle it on the queue
pub async fn process(
    queue: &WorkQueue<ObjectKey>,
    reconciler: &dyn Reconcile,
    key: &ObjectKey,
    max_retries: Option<u32>,
) -> Disposition {
    let timer = metrics::RECONCILE_DURATION.start_timer();
    let result = reconciler.reconcile(key).await;
    timer.observe_duration();

    match result {
        Ok(outcome) => {
            metrics::RECONCILIATIONS
                .with_label_values(&[outcome.as_str()])
                .inc();
            queue.forget(key);
            Disposition::Forgotten
        }
        Err(e) if e.is_retryable() => {
            metrics::RECONCILIATION_ERRORS
                .with_label_values(&["retryable"])
                .inc();
            let attempts = queue.num_requeues(key);
            if max_retries.is_some_and(|max| attempts >= max) {
                error!(%key, error = %e, attempts, "Giving up on key after repeated failures");
                metrics::DROPPED.inc();
                queue.forget(key);
                return Disposition::Dropped;
            }
            let delay = queue.add_rate_limited(key.clone());
            warn!(%key, error = %e, ?delay, "Reconciliation failed, scheduling retry");
            Disposition::Requeued
        }
        Err(e) => {
            metrics::RECONCILIATION_ERRORS
                .with_label_values(&["terminal"])
                .inc();
            error!(%key, error = %e, "Reconciliation failed permanently, dropping key");
            metrics::DROPPED.inc();
            queue.forget(key);
            Disposition::Dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::queue::ExponentialRateLimiter;
    use crate::reconcilers::Outcome;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Returns scripted results, then success
    struct Scripted(Mutex<VecDeque<Result<Outcome>>>);

    #[async_trait]
    impl Reconcile for Scripted {
        async fn reconcile(&self, _key: &ObjectKey) -> Result<Outcome> {
            self.0.lock().pop_front().unwrap_or(Ok(Outcome::Success))
        }
    }

    fn scripted(results: Vec<Result<Outcome>>) -> Scripted {
        Scripted(Mutex::new(results.into()))
    }

    fn queue() -> WorkQueue<ObjectKey> {
        WorkQueue::new(
            "worker-test",
            ExponentialRateLimiter::new(Duration::from_millis(10), Duration::from_secs(1)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_forgets_backoff() {
        let queue = queue();
        let key = ObjectKey::new("target", "app");
        queue.add_rate_limited(key.clone());

        let reconciler = scripted(vec![]);
        let disposition = process(&queue, &reconciler, &key, None).await;

        assert_eq!(disposition, Disposition::Forgotten);
        assert_eq!(queue.num_requeues(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_requeues() {
        let queue = queue();
        let key = ObjectKey::new("target", "app");
        let reconciler = scripted(vec![Err(Error::transient("timeout"))]);

        let disposition = process(&queue, &reconciler, &key, None).await;

        assert_eq!(disposition, Disposition::Requeued);
        assert_eq!(queue.num_requeues(&key), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_drops() {
        let queue = queue();
        let key = ObjectKey::new("target", "app");
        let reconciler = scripted(vec![Err(Error::malformed("no labels"))]);

        let disposition = process(&queue, &reconciler, &key, None).await;

        assert_eq!(disposition, Disposition::Dropped);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_drops() {
        let queue = queue();
        let key = ObjectKey::new("target", "app");
        let reconciler = scripted(vec![
            Err(Error::transient("reset")),
            Err(Error::transient("reset")),
            Err(Error::transient("reset")),
        ]);

        assert_eq!(process(&queue, &reconciler, &key, Some(2)).await, Disposition::Requeued);
        assert_eq!(process(&queue, &reconciler, &key, Some(2)).await, Disposition::Requeued);
        assert_eq!(process(&queue, &reconciler, &key, Some(2)).await, Disposition::Dropped);
        assert_eq!(queue.num_requeues(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_create_is_requeued() {
        use crate::api::MemoryApi;
        use crate::cache::store;
        use crate::reconcilers::ServiceReconciler;
        use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
        use k8s_openapi::api::core::v1::PodTemplateSpec;
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
        use kube::core::ErrorResponse;
        use std::collections::BTreeMap;
        use std::sync::Arc;

        let (reader, mut writer) = store();
        writer.apply_upsert(Deployment {
            metadata: ObjectMeta {
                name: Some("app".to_string()),
                namespace: Some("target".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(BTreeMap::from([("app".to_string(), "app".to_string())])),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        });
        writer.mark_synced();
        let services = MemoryApi::new();
        services.fail_creates([Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "services is forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        }))]);
        let reconciler = ServiceReconciler::for_namespace(reader, Arc::new(services.clone()), "target");

        let queue = queue();
        let key = ObjectKey::new("target", "app");
        let disposition = process(&queue, &reconciler, &key, None).await;

        assert_eq!(disposition, Disposition::Requeued);
        assert_eq!(queue.num_requeues(&key), 1);
        assert!(services.is_empty());

        // once permissions land the retry creates the Service
        let retried = queue.get().await.unwrap();
        assert_eq!(process(&queue, &reconciler, &retried, None).await, Disposition::Forgotten);
        assert!(services.object("target", "app").is_some());
    }
}
