//! Request counting and latency measurement.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::metrics::{EndpointLabels, RequestLabels};
use crate::AppState;

pub async fn middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let endpoint = endpoint_of(req.uri().path());
    let start = Instant::now();

    let response = next.run(req).await;

    let m = &state.metrics.metrics;
    m.http_requests
        .get_or_create(&RequestLabels {
            endpoint: endpoint.clone(),
            method,
            status: u32::from(response.status().as_u16()),
        })
        .inc();
    m.http_request_duration_seconds
        .get_or_create(&EndpointLabels { endpoint })
        .observe(start.elapsed().as_secs_f64());

    response
}

/// Collapse request paths into a bounded endpoint label set; owner/repo
/// values would otherwise blow up metric cardinality.
fn endpoint_of(path: &str) -> String {
    let p = path.trim_start_matches('/');
    if p == "health" {
        return "health".into();
    }
    if p == "metrics" {
        return "metrics".into();
    }
    if p.starts_with("api/") || p == "api" {
        return "api".into();
    }
    if p.starts_with("gist/") {
        return "gist".into();
    }
    if crate::dispatch::is_origin_url(p) {
        return "full-url".into();
    }
    if p.contains("/releases/download/") {
        return "release".into();
    }
    if p.contains("/raw/") {
        return "raw".into();
    }
    if p.contains("/archive/") {
        return "archive".into();
    }
    if p.contains("/info/refs") || p.ends_with("/git-upload-pack") || p.ends_with("/git-receive-pack")
    {
        return "git".into();
    }
    "other".into()
}
