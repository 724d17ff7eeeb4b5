//! End-to-end tests of the controller pipeline against the in-memory
//! resource store: reflector -> router -> work queue -> workers -> reconciler.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::pending;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{PodTemplateSpec, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use deployment_service_controller::api::{
    Call, MemoryApi, ObjectApi, ObjectPage, PropagationPolicy, WatchStream,
};
use deployment_service_controller::cache;
use deployment_service_controller::config::ControllerConfig;
use deployment_service_controller::controllers::{
    build_deployment_controller, Controller, Settings, State,
};
use deployment_service_controller::reconcilers::{Outcome, Reconcile};
use deployment_service_controller::{Error, ObjectKey, Result};

// ============================================================================
// Test Helpers
// ============================================================================

fn deployment(namespace: &str, name: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn test_config() -> ControllerConfig {
    ControllerConfig {
        watched_namespace: "target".to_string(),
        workers: 2,
        cache_sync_timeout: 5,
        backoff_base_ms: 10,
        backoff_max_secs: 1,
        ..Default::default()
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

struct Running {
    shutdown: CancellationToken,
    state: tokio::sync::watch::Receiver<State>,
    handle: tokio::task::JoinHandle<Result<()>>,
}

impl Running {
    fn start<K>(controller: Controller<K>) -> Self
    where
        K: kube::Resource + Send + Sync + 'static,
    {
        let shutdown = CancellationToken::new();
        let state = controller.state();
        let handle = tokio::spawn(controller.run(shutdown.clone()));
        Self {
            shutdown,
            state,
            handle,
        }
    }

    async fn wait_for(&mut self, wanted: State) {
        tokio::time::timeout(Duration::from_secs(5), self.state.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached in time")
            .expect("controller dropped its state");
    }

    async fn stop(mut self) -> Result<()> {
        self.shutdown.cancel();
        let result = self.handle.await.expect("controller task panicked");
        assert_eq!(*self.state.borrow_and_update(), State::Stopped);
        result
    }
}

fn start_deployment_controller(
    deployments: &MemoryApi<Deployment>,
    services: &MemoryApi<Service>,
    config: &ControllerConfig,
) -> Running {
    Running::start(build_deployment_controller(
        Arc::new(deployments.clone()),
        Arc::new(services.clone()),
        config,
    ))
}

// ============================================================================
// Deployment -> Service scenarios
// ============================================================================

#[tokio::test]
async fn created_deployment_gets_a_service() {
    let deployments = MemoryApi::new();
    let services = MemoryApi::new();
    let mut running = start_deployment_controller(&deployments, &services, &test_config());
    running.wait_for(State::Running).await;

    deployments.upsert(deployment("target", "app"));

    eventually("service created", || services.object("target", "app").is_some()).await;
    let service = services.object("target", "app").unwrap();
    let spec = service.spec.unwrap();
    assert_eq!(
        spec.selector.unwrap(),
        BTreeMap::from([("app".to_string(), "app".to_string())])
    );
    assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));

    running.stop().await.unwrap();
}

#[tokio::test]
async fn deployments_present_before_start_are_reconciled() {
    let deployments = MemoryApi::new();
    deployments.upsert(deployment("target", "a"));
    deployments.upsert(deployment("target", "b"));
    let services = MemoryApi::new();

    let running = start_deployment_controller(&deployments, &services, &test_config());

    eventually("both services created", || services.len() == 2).await;
    running.stop().await.unwrap();
}

#[tokio::test]
async fn other_namespace_issues_no_mutation() {
    let deployments = MemoryApi::new();
    let services = MemoryApi::new();
    let mut running = start_deployment_controller(&deployments, &services, &test_config());
    running.wait_for(State::Running).await;

    deployments.upsert(deployment("other", "x"));
    // a selected deployment added afterwards proves the first key was processed
    deployments.upsert(deployment("target", "marker"));

    eventually("marker service", || services.object("target", "marker").is_some()).await;
    assert_eq!(
        services.calls(),
        vec![Call::Create(ObjectKey::new("target", "marker"))]
    );

    running.stop().await.unwrap();
}

#[tokio::test]
async fn existing_service_is_success_without_retry() {
    let deployments = MemoryApi::new();
    let services = MemoryApi::new();
    services.upsert(Service {
        metadata: ObjectMeta {
            name: Some("app".to_string()),
            namespace: Some("target".to_string()),
            ..Default::default()
        },
        ..Default::default()
    });
    let mut running = start_deployment_controller(&deployments, &services, &test_config());
    running.wait_for(State::Running).await;

    deployments.upsert(deployment("target", "app"));

    eventually("create attempted", || !services.calls().is_empty()).await;
    // longer than several back-off periods
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(services.calls().len(), 1);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let deployments = MemoryApi::new();
    let services = MemoryApi::new();
    services.fail_creates([
        Error::transient("connection reset by peer"),
        Error::transient("connection reset by peer"),
    ]);
    let mut running = start_deployment_controller(&deployments, &services, &test_config());
    running.wait_for(State::Running).await;

    deployments.upsert(deployment("target", "app"));

    eventually("service created after retries", || {
        services.object("target", "app").is_some()
    })
    .await;
    assert_eq!(services.calls().len(), 3);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn forbidden_create_is_retried() {
    let deployments = MemoryApi::new();
    let services = MemoryApi::new();
    services.fail_creates([Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "services is forbidden".to_string(),
        reason: "Forbidden".to_string(),
        code: 403,
    }))]);
    let mut running = start_deployment_controller(&deployments, &services, &test_config());
    running.wait_for(State::Running).await;

    deployments.upsert(deployment("target", "app"));

    eventually("service created after the forbidden create", || {
        services.object("target", "app").is_some()
    })
    .await;
    assert_eq!(services.calls().len(), 2);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn retry_ceiling_abandons_key() {
    let deployments = MemoryApi::new();
    let services = MemoryApi::new();
    services.fail_creates((0..10).map(|_| Error::transient("connection refused")));
    let config = ControllerConfig {
        max_retries: Some(2),
        ..test_config()
    };
    let mut running = start_deployment_controller(&deployments, &services, &config);
    running.wait_for(State::Running).await;

    deployments.upsert(deployment("target", "app"));

    eventually("three attempts", || services.calls().len() == 3).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(services.calls().len(), 3);
    assert!(services.is_empty());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn deleted_deployment_is_skipped() {
    let deployments = MemoryApi::new();
    let services = MemoryApi::new();
    let mut running = start_deployment_controller(&deployments, &services, &test_config());
    running.wait_for(State::Running).await;

    deployments.upsert(deployment("target", "app"));
    eventually("service created", || services.len() == 1).await;

    deployments.remove("target", "app");
    deployments.upsert(deployment("target", "marker"));
    eventually("marker service", || services.len() == 2).await;

    // the delete event did not lead to another create for the gone deployment
    let creates_for_app = services
        .calls()
        .iter()
        .filter(|call| **call == Call::Create(ObjectKey::new("target", "app")))
        .count();
    assert_eq!(creates_for_app, 1);

    running.stop().await.unwrap();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn initial_list_failure_is_fatal() {
    let deployments: MemoryApi<Deployment> = MemoryApi::new();
    deployments.fail_lists([Error::transient("connection refused")]);
    let services = MemoryApi::new();

    let running = start_deployment_controller(&deployments, &services, &test_config());
    let result = running.handle.await.unwrap();

    assert!(result.is_err());
    assert_eq!(*running.state.borrow(), State::Stopped);
}

/// Resource store whose list never answers
struct Unreachable;

#[async_trait]
impl ObjectApi<Deployment> for Unreachable {
    async fn list(&self) -> Result<ObjectPage<Deployment>> {
        pending().await
    }
    async fn watch(&self, _resource_version: &str) -> Result<WatchStream<Deployment>> {
        pending().await
    }
    async fn get(&self, namespace: &str, name: &str) -> Result<Deployment> {
        Err(Error::NotFound(format!("{}/{}", namespace, name)))
    }
    async fn create(&self, _obj: &Deployment) -> Result<Deployment> {
        Err(Error::transient("unreachable"))
    }
    async fn replace(&self, _obj: &Deployment) -> Result<Deployment> {
        Err(Error::transient("unreachable"))
    }
    async fn delete(&self, _namespace: &str, _name: &str, _policy: PropagationPolicy) -> Result<()> {
        Err(Error::transient("unreachable"))
    }
}

#[tokio::test]
async fn cache_sync_timeout_still_starts_workers() {
    let config = ControllerConfig {
        cache_sync_timeout: 0,
        ..test_config()
    };
    let services = MemoryApi::new();
    let controller = build_deployment_controller(
        Arc::new(Unreachable),
        Arc::new(services.clone()),
        &config,
    );
    let queue = controller.queue();
    let mut running = Running::start(controller);

    running.wait_for(State::Running).await;
    // a key whose object never reached the cache is accepted as gone
    queue.add(ObjectKey::new("target", "app"));
    eventually("queue drained", || queue.is_empty() && !queue.is_processing(&ObjectKey::new("target", "app"))).await;
    assert!(services.calls().is_empty());

    running.stop().await.unwrap();
}

// ============================================================================
// Work queue guarantees under real workers
// ============================================================================

/// Counts reconciliations and holds the first one until released
struct Gated {
    calls: AtomicUsize,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Reconcile for Gated {
    async fn reconcile(&self, _key: &ObjectKey) -> Result<Outcome> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(Outcome::Success)
    }
}

fn bare_controller(reconciler: Arc<dyn Reconcile>, workers: usize) -> Controller<Deployment> {
    let (_, writer) = cache::store();
    Controller::new(
        "Deployment",
        Arc::new(MemoryApi::<Deployment>::new()),
        writer,
        reconciler,
        Settings {
            workers,
            ..Settings::from(&test_config())
        },
    )
}

#[tokio::test]
async fn adds_during_processing_coalesce_into_one_rerun() {
    let reconciler = Arc::new(Gated {
        calls: AtomicUsize::new(0),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let controller = bare_controller(reconciler.clone(), 4);
    let queue = controller.queue();
    let mut running = Running::start(controller);
    running.wait_for(State::Running).await;

    let key = ObjectKey::new("target", "app");
    queue.add(key.clone());
    reconciler.entered.notified().await;

    for _ in 0..10 {
        queue.add(key.clone());
    }
    // other workers are idle but must not pick the key up while it is in flight
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reconciler.calls.load(Ordering::SeqCst), 1);

    reconciler.release.notify_one();
    eventually("rerun", || reconciler.calls.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reconciler.calls.load(Ordering::SeqCst), 2);

    running.stop().await.unwrap();
}

/// Fails the test if two workers ever hold the same key
struct Exclusive {
    in_flight: Mutex<HashSet<ObjectKey>>,
    completed: AtomicUsize,
    overlaps: AtomicUsize,
}

#[async_trait]
impl Reconcile for Exclusive {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome> {
        if !self.in_flight.lock().insert(key.clone()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.in_flight.lock().remove(key);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(Outcome::Success)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_key_is_never_processed_concurrently() {
    let reconciler = Arc::new(Exclusive {
        in_flight: Mutex::new(HashSet::new()),
        completed: AtomicUsize::new(0),
        overlaps: AtomicUsize::new(0),
    });
    let controller = bare_controller(reconciler.clone(), 8);
    let queue = controller.queue();
    let mut running = Running::start(controller);
    running.wait_for(State::Running).await;

    let keys: Vec<ObjectKey> = (0..3).map(|i| ObjectKey::new("target", format!("app-{}", i))).collect();
    for round in 0..200 {
        queue.add(keys[round % keys.len()].clone());
        if round % 10 == 0 {
            tokio::task::yield_now().await;
        }
    }

    eventually("queue drained", || {
        queue.is_empty() && keys.iter().all(|key| !queue.is_processing(key))
    })
    .await;
    assert!(reconciler.completed.load(Ordering::SeqCst) >= keys.len());
    assert_eq!(reconciler.overlaps.load(Ordering::SeqCst), 0);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_lets_in_flight_work_finish() {
    let reconciler = Arc::new(Gated {
        calls: AtomicUsize::new(0),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let controller = bare_controller(reconciler.clone(), 1);
    let queue = controller.queue();
    let mut running = Running::start(controller);
    running.wait_for(State::Running).await;

    queue.add(ObjectKey::new("target", "app"));
    reconciler.entered.notified().await;

    running.shutdown.cancel();
    running.wait_for(State::ShuttingDown).await;
    assert!(!running.handle.is_finished());

    reconciler.release.notify_one();
    running.stop().await.unwrap();
    assert_eq!(reconciler.calls.load(Ordering::SeqCst), 1);
}
