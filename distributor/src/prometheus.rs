use std::time::Instant;

use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use metrics::counter;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Install the prometheus recorder for this process and return the handle
/// the `/metrics` route renders from. Call once at startup.
pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("http_requests_duration_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Middleware tracking request counts and latency per route.
pub async fn track_metrics<B>(req: Request<B>, next: Next<B>) -> impl IntoResponse {
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

    metrics::increment_counter!("http_requests_total", &labels);
    metrics::histogram!("http_requests_duration_seconds", latency, &labels);

    response
}

/// Advance the shared per-tenant discard counters.
pub fn report_discarded_samples(reason: &'static str, tenant: &str, samples: usize, bytes: usize) {
    counter!(
        "discarded_samples_total",
        samples as u64,
        "reason" => reason,
        "tenant" => tenant.to_string()
    );
    counter!(
        "discarded_bytes_total",
        bytes as u64,
        "reason" => reason,
        "tenant" => tenant.to_string()
    );
}

/// Advance the shared per-tenant mutation counters (e.g. truncated lines).
pub fn report_mutated_samples(reason: &'static str, tenant: &str, samples: usize, bytes: usize) {
    counter!(
        "mutated_samples_total",
        samples as u64,
        "reason" => reason,
        "tenant" => tenant.to_string()
    );
    counter!(
        "mutated_bytes_total",
        bytes as u64,
        "reason" => reason,
        "tenant" => tenant.to_string()
    );
}
