//! Telemetry logic.
//! Support logging and Prometheus metrics.
use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::IntoResponse;
use metrics::Unit;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";

/// Install the global `tracing` subscriber.
/// `RUST_LOG` overrides the default filter.
pub fn setup_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Create recorder for Prometheus metrics.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    metrics::describe_counter!(
        "http_requests_total",
        Unit::Count,
        "Requests handled, by method, route group, path and status."
    );
    metrics::describe_histogram!(
        "http_requests_duration_seconds",
        Unit::Seconds,
        "Request latency, by method, route group, path and status."
    );
    metrics::describe_counter!(
        "http_requests_denied_total",
        Unit::Count,
        "Responses with status 401 or 403, by route group."
    );
    metrics::describe_counter!(
        "auth_rejections_total",
        Unit::Count,
        "Requests rejected by the auth gate, by reason."
    );

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("http_requests_duration_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )?
        .install_recorder()
}

/// Route group of a matched path, bounding label cardinality.
fn route_group(path: &str) -> &'static str {
    if path.starts_with("/api/auth/") {
        "auth"
    } else if path.starts_with("/api/") {
        "api"
    } else if path == "/status.json" || path == "/metrics" {
        "status"
    } else {
        "unmatched"
    }
}

/// Record count and latency of every request, by route group.
/// 401 and 403 responses are also counted as denials of their group.
pub async fn track(req: Request, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    // Unmatched paths share one series.
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned());
    let group = path.as_deref().map_or("unmatched", route_group);
    let method = req.method().to_string();

    let response = next.run(req).await;
    let status = response.status();

    let labels = [
        ("method", method),
        ("group", group.to_owned()),
        ("path", path.unwrap_or_else(|| "unmatched".to_owned())),
        ("status", status.as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        metrics::counter!("http_requests_denied_total", "group" => group)
            .increment(1);
    }

    response
}
