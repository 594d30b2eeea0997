//! Prometheus metrics for SpanStore.
//!
//! Installs a global Prometheus recorder using
//! `metrics-exporter-prometheus`, defines metric name constants,
//! provides a Tower-compatible middleware for HTTP RED metrics, and
//! exposes the `/metrics` endpoint handler.

use axum::http::Request;
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, status.
pub const HTTP_REQUESTS_TOTAL: &str = "spanstore_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "spanstore_http_request_duration_seconds";

/// Total backend data operations (counter). Labels: operation, location.
pub const BACKEND_OPERATIONS_TOTAL: &str = "spanstore_backend_operations_total";

/// Total replica writes received on the backbeat surface (counter).
pub const REPLICA_WRITES_TOTAL: &str = "spanstore_replica_writes_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder.  Idempotent -- safe
/// to call multiple times (e.g. in tests).
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder.  Call once
/// after `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(
        BACKEND_OPERATIONS_TOTAL,
        "Total backend data operations by type and location"
    );
    describe_counter!(
        REPLICA_WRITES_TOTAL,
        "Total replica writes received on the backbeat surface"
    );
}

// -- Middleware ---------------------------------------------------------------

/// Tower middleware recording request counts and latency.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().as_str().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method)
        .record(start.elapsed().as_secs_f64());

    response
}

/// `GET /metrics` -- render the Prometheus exposition format.
pub async fn metrics_handler() -> impl IntoResponse {
    let handle = init_metrics();
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        let a = init_metrics() as *const PrometheusHandle;
        let b = init_metrics() as *const PrometheusHandle;
        assert_eq!(a, b);
        describe_metrics();
    }

    #[test]
    fn test_metric_names_are_prefixed() {
        for name in [
            HTTP_REQUESTS_TOTAL,
            HTTP_REQUEST_DURATION_SECONDS,
            BACKEND_OPERATIONS_TOTAL,
            REPLICA_WRITES_TOTAL,
        ] {
            assert!(name.starts_with("spanstore_"));
        }
    }
}
