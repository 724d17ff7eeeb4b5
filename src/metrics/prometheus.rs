//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram, Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Completed reconciliations by outcome
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "deployment_service_controller_reconciliations_total",
        "Total number of completed reconciliations",
        &["outcome"]
    ).unwrap();

    /// Failed reconciliations by class
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "deployment_service_controller_reconciliation_errors_total",
        "Total number of failed reconciliations",
        &["class"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: Histogram = register_histogram!(
        "deployment_service_controller_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Keys given up on
    pub static ref DROPPED: Counter = register_counter!(
        "deployment_service_controller_dropped_keys_total",
        "Total number of keys dropped without a successful reconciliation"
    ).unwrap();

    /// Keys waiting in the work queue
    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "deployment_service_controller_queue_depth",
        "Number of keys waiting in the work queue",
        &["queue"]
    ).unwrap();

    /// Rate-limited re-adds
    pub static ref RETRIES: CounterVec = register_counter_vec!(
        "deployment_service_controller_queue_retries_total",
        "Total number of rate-limited re-adds",
        &["queue"]
    ).unwrap();

    /// Objects held by the local cache
    pub static ref CACHED_OBJECTS: GaugeVec = register_gauge_vec!(
        "deployment_service_controller_cached_objects",
        "Number of objects in the local cache by kind",
        &["kind"]
    ).unwrap();

    /// Watch streams that ended and were re-established
    pub static ref WATCH_RESTARTS: CounterVec = register_counter_vec!(
        "deployment_service_controller_watch_restarts_total",
        "Total number of watch restarts by kind",
        &["kind"]
    ).unwrap();

    /// Cache sync state (1 = synced, 0 = not synced)
    pub static ref CACHE_SYNCED: Gauge = register_gauge!(
        "deployment_service_controller_cache_synced",
        "Whether the local cache has completed its initial list"
    ).unwrap();
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path()))
}

fn route(path: &str) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => ready_response(),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// Generate metrics response
fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = encoder.format_type().parse::<hyper::header::HeaderValue>() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }
    response
}

/// Ready once the local cache has synced
fn ready_response() -> Response<Full<Bytes>> {
    if CACHE_SYNCED.get() >= 1.0 {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, "cache not synced")
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}
