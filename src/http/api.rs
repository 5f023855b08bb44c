//! REST API passthrough handler.
//!
//! Route: `ANY /api/{*path}`. The remainder plus the original query string is
//! forwarded to `https://api.github.com/`. Only GETs are cacheable, with a
//! TTL by sub-path family; every outbound request carries the v3 Accept
//! header and, when configured, the server-held token.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::Method;
use axum::response::Response;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument};

use super::serve::{self, passthrough_response};
use super::AppError;
use crate::cache::{tee, ArtifactKind, CacheKey, Lookup};
use crate::metrics::{CacheTier as MetricTier, TierLabels};
use crate::origin;
use crate::security::ssrf;
use crate::AppState;

/// API payloads are JSON; anything beyond this streams uncached.
pub const CACHE_CEILING: u64 = 5 * 1024 * 1024;

const ACCEPT: &str = "application/vnd.github.v3+json";

/// Headers forwarded from the client to the API origin.
const FORWARDED_REQUEST_HEADERS: &[&str] = &[
    "accept-encoding",
    "content-type",
    "if-none-match",
    "if-modified-since",
];

/// `ANY /api/{*path}`
#[instrument(skip(state, req), fields(%path))]
pub async fn handle(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    req: Request,
) -> Result<Response, AppError> {
    let query = req.uri().query().map(str::to_string);
    serve(&state, req, &path, query.as_deref()).await
}

/// Shared entry point used by both route families. `req` supplies the
/// method, headers and body; `path` is the API sub-path without the
/// `/api` prefix.
pub async fn serve(
    state: &Arc<AppState>,
    req: Request,
    path: &str,
    query: Option<&str>,
) -> Result<Response, AppError> {
    let path = path.trim_start_matches('/');
    let mut upstream_url = format!("https://{}/{path}", origin::API_HOST);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        upstream_url.push('?');
        upstream_url.push_str(query);
    }

    let method = req.method().clone();
    // Only GETs are cacheable. HEAD must not replay a GET-populated entry:
    // the cache key carries no method, and a hit would answer a HEAD with
    // the full stored body.
    let cacheable = method == Method::GET;
    let key = CacheKey::new(
        ArtifactKind::Api,
        "",
        "",
        "",
        path,
        query.unwrap_or_default(),
    );

    // ---------- cache probe (GET only) ----------
    if cacheable {
        if let Lookup::MemoryHit { data, headers, etag } = state.cache.lookup(&key).await {
            state
                .metrics
                .metrics
                .cache_hits
                .get_or_create(&TierLabels { tier: MetricTier::Memory })
                .inc();
            return Ok(hit(&headers, etag.as_deref(), Body::from(data)));
        }
        state.metrics.metrics.cache_misses.inc();
    }

    // ---------- destination policy ----------
    ssrf::validate_upstream_url(&upstream_url, &state.config.security)
        .await
        .map_err(|e| AppError::Policy(e.to_string()))?;

    // ---------- upstream request ----------
    debug!(url = %upstream_url, %method, "forwarding API request");
    state.metrics.metrics.upstream_requests.inc();

    let client_headers = req.headers().clone();
    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| AppError::BadRequest(format!("unsupported method: {method}")))?;

    let mut outbound = state
        .http_client
        .request(reqwest_method, &upstream_url)
        .header("User-Agent", serve::forwarded_user_agent(&client_headers))
        .header("Accept", ACCEPT);

    for name in FORWARDED_REQUEST_HEADERS {
        if let Some(value) = client_headers.get(*name).and_then(|v| v.to_str().ok()) {
            outbound = outbound.header(*name, value);
        }
    }

    if !state.config.auth.upstream_token.is_empty() {
        outbound = outbound.header(
            "Authorization",
            format!("token {}", state.config.auth.upstream_token),
        );
    }

    if method != Method::GET && method != Method::HEAD {
        let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());
        outbound = outbound.body(body);
    }

    let upstream = outbound.send().await.map_err(|e| {
        state.metrics.metrics.upstream_errors.inc();
        AppError::Upstream(e.into())
    })?;

    let status = upstream.status();
    if !cacheable || !status.is_success() {
        let mut response = passthrough_response(upstream);
        if status.is_success() {
            // This path never caches, so a 2xx is always a miss.
            response.headers_mut().insert(
                HeaderName::from_static("x-cache"),
                HeaderValue::from_static("MISS"),
            );
        }
        return Ok(response);
    }

    // ---------- stream with tee ----------
    let headers = serve::forwarded_headers(upstream.headers());
    let etag = serve::header_value(upstream.headers(), "etag");

    let eligible = state.cache.memory_enabled()
        && upstream.content_length().is_none_or(|len| len <= CACHE_CEILING);

    let body = if eligible {
        let rx = tee::tee_to_memory(
            upstream,
            Arc::clone(&state.cache),
            key,
            headers.clone(),
            etag.clone(),
            ttl_for_path(path),
            CACHE_CEILING,
        );
        Body::from_stream(ReceiverStream::new(rx))
    } else {
        Body::from_stream(upstream.bytes_stream())
    };

    let mut response = hit_with_marker(&headers, etag.as_deref(), "MISS", body);
    *response.status_mut() = axum::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
    Ok(response)
}

fn hit(headers: &[(String, String)], etag: Option<&str>, body: Body) -> Response {
    hit_with_marker(headers, etag, "HIT-MEMORY", body)
}

fn hit_with_marker(
    headers: &[(String, String)],
    etag: Option<&str>,
    marker: &str,
    body: Body,
) -> Response {
    let mut response = Response::new(body);
    let response_headers = response.headers_mut();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response_headers.insert(name, value);
        }
    }
    if let Some(etag) = etag {
        if let Ok(value) = HeaderValue::from_str(etag) {
            response_headers.insert(HeaderName::from_static("etag"), value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(marker) {
        response_headers.insert(HeaderName::from_static("x-cache"), value);
    }
    response
}

/// TTL by endpoint family. Commit data is immutable and checked first so
/// `/repos/o/r/commits/...` gets the long TTL.
fn ttl_for_path(path: &str) -> Duration {
    let minutes = |m: u64| Duration::from_secs(m * 60);
    if path.contains("/commits") || path.starts_with("commits") {
        Duration::from_secs(24 * 3600)
    } else if path.contains("/releases") || path.starts_with("releases") {
        minutes(60)
    } else if path.contains("issues") || path.contains("pulls") {
        minutes(5)
    } else if path.starts_with("repos") || path.starts_with("users") || path.contains("/users/") {
        minutes(30)
    } else {
        minutes(15)
    }
}
