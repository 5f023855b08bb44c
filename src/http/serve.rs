//! Shared serving logic for the cacheable content handlers.
//!
//! Every handler follows the same contract: probe the cache and answer with
//! `X-Cache: HIT-MEMORY` or `HIT-DISK`; on a miss, fetch upstream through the
//! configured transport, stream the 2xx body to the client with
//! `X-Cache: MISS` while teeing it into the eligible tier, and forward
//! non-2xx responses verbatim without caching.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::Response;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::AppError;
use crate::cache::{tee, CacheKey, Lookup};
use crate::metrics::{CacheTier as MetricTier, TierLabels};
use crate::outbound;
use crate::security::ssrf;
use crate::AppState;

// ---------------------------------------------------------------------------
// Fetch plan
// ---------------------------------------------------------------------------

/// Which tier a handler populates on a miss.
#[derive(Debug, Clone, Copy)]
pub enum Tier {
    /// Buffer in memory up to the ceiling.
    Memory { ceiling: u64 },
    /// Duplicate to a temporary file and commit to the disk store. Archives
    /// and release assets use this tier regardless of size.
    Disk,
}

pub struct FetchPlan {
    pub key: CacheKey,
    pub upstream_url: String,
    pub ttl: Duration,
    pub tier: Tier,
    /// Extra `Accept` header for the outbound request.
    pub accept: Option<&'static str>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Serve a cacheable GET: cache probe, upstream fetch, tee population.
pub async fn serve_cacheable(
    state: &Arc<AppState>,
    client_headers: &HeaderMap,
    plan: FetchPlan,
) -> Result<Response, AppError> {
    // ---------- cache probe ----------
    match state.cache.lookup(&plan.key).await {
        Lookup::MemoryHit { data, headers, etag } => {
            state
                .metrics
                .metrics
                .cache_hits
                .get_or_create(&TierLabels { tier: MetricTier::Memory })
                .inc();
            return Ok(hit_response(&headers, etag.as_deref(), "HIT-MEMORY", Body::from(data)));
        }
        Lookup::DiskHit { path, meta } => {
            state
                .metrics
                .metrics
                .cache_hits
                .get_or_create(&TierLabels { tier: MetricTier::Disk })
                .inc();
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("open cached file: {}", path.display()))?;
            let body = Body::from_stream(ReaderStream::new(file));
            return Ok(hit_response(&meta.headers, meta.etag.as_deref(), "HIT-DISK", body));
        }
        Lookup::Miss => {}
    }
    state.metrics.metrics.cache_misses.inc();

    // ---------- destination policy ----------
    ssrf::validate_upstream_url(&plan.upstream_url, &state.config.security)
        .await
        .map_err(|e| AppError::Policy(e.to_string()))?;

    // ---------- upstream fetch ----------
    debug!(url = %plan.upstream_url, "fetching from origin");
    state.metrics.metrics.upstream_requests.inc();

    let mut request = state
        .http_client
        .get(&plan.upstream_url)
        .header("User-Agent", forwarded_user_agent(client_headers));
    if let Some(accept) = plan.accept {
        request = request.header("Accept", accept);
    }

    let upstream = request.send().await.map_err(|e| {
        state.metrics.metrics.upstream_errors.inc();
        AppError::Upstream(e.into())
    })?;

    let status = upstream.status();
    if !status.is_success() {
        return Ok(passthrough_response(upstream));
    }

    // ---------- stream with tee ----------
    let headers = forwarded_headers(upstream.headers());
    let etag = header_value(upstream.headers(), "etag");
    let content_length = upstream.content_length();

    let eligible = match plan.tier {
        Tier::Memory { ceiling } => {
            state.cache.memory_enabled() && content_length.is_none_or(|len| len <= ceiling)
        }
        Tier::Disk => state.cache.disk_enabled(),
    };

    let body = if eligible {
        let rx = match plan.tier {
            Tier::Memory { ceiling } => tee::tee_to_memory(
                upstream,
                Arc::clone(&state.cache),
                plan.key,
                headers.clone(),
                etag.clone(),
                plan.ttl,
                ceiling,
            ),
            Tier::Disk => tee::tee_to_disk(
                upstream,
                Arc::clone(&state.cache),
                plan.key,
                headers.clone(),
                etag.clone(),
                plan.ttl,
            ),
        };
        Body::from_stream(ReceiverStream::new(rx))
    } else {
        Body::from_stream(upstream.bytes_stream())
    };

    Ok(miss_response(status_of(status), &headers, etag.as_deref(), body))
}

// ---------------------------------------------------------------------------
// Response builders
// ---------------------------------------------------------------------------

fn hit_response(
    headers: &[(String, String)],
    etag: Option<&str>,
    x_cache: &str,
    body: Body,
) -> Response {
    build_response(StatusCode::OK, headers, etag, x_cache, body)
}

fn miss_response(
    status: StatusCode,
    headers: &[(String, String)],
    etag: Option<&str>,
    body: Body,
) -> Response {
    build_response(status, headers, etag, "MISS", body)
}

fn build_response(
    status: StatusCode,
    headers: &[(String, String)],
    etag: Option<&str>,
    x_cache: &str,
    body: Body,
) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
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
    if let Ok(value) = HeaderValue::from_str(x_cache) {
        response_headers.insert(HeaderName::from_static("x-cache"), value);
    }
    response
}

/// Forward a non-2xx origin response verbatim: status, headers, body.
pub fn passthrough_response(upstream: reqwest::Response) -> Response {
    let status = status_of(upstream.status());
    let headers = forwarded_headers(upstream.headers());
    let body = Body::from_stream(upstream.bytes_stream());

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let response_headers = response.headers_mut();
    for (name, value) in &headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response_headers.insert(name, value);
        }
    }
    response
}

fn status_of(status: reqwest::StatusCode) -> StatusCode {
    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}

// ---------------------------------------------------------------------------
// Header plumbing
// ---------------------------------------------------------------------------

/// Hop-by-hop headers never copied between legs.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Capture origin response headers for forwarding and for the cache record.
pub fn forwarded_headers(headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

pub fn header_value(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// The client's User-Agent when supplied, otherwise the fixed identifier.
pub fn forwarded_user_agent(headers: &HeaderMap) -> String {
    headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| outbound::USER_AGENT.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
