use std::future::ready;
use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::health::HealthRegistry;

pub const MESSAGES_RECEIVED: &str = "event_receiver_messages_received_total";
pub const BLOB_CREATED_EVENTS: &str = "event_receiver_blob_created_events_total";
pub const RECORDS_SKIPPED: &str = "event_receiver_records_skipped_total";
pub const PARTITION_ERRORS: &str = "event_receiver_partition_errors_total";
pub const EVENT_LATENCY: &str = "event_receiver_event_latency_seconds";
pub const ASSIGNED_PARTITIONS: &str = "event_receiver_assigned_partitions";
pub const CONSUMER_QUEUE_DEPTH: &str = "event_receiver_kafka_callback_queue_depth";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

pub async fn index() -> &'static str {
    "event receiver"
}

/// Router exposing `/_liveness` backed by the registry, and `/metrics` when a
/// Prometheus recorder handle is provided.
pub fn router(liveness: HealthRegistry, recorder_handle: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));

    match recorder_handle {
        Some(handle) => router
            .route("/metrics", get(move || ready(handle.render())))
            .layer(axum::middleware::from_fn(track_metrics)),
        None => router,
    }
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const BUCKETS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 50.0, 100.0, 250.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
