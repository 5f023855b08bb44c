//! Per-client admission gate.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use super::ClientIp;
use crate::config::RateLimitStrategy;
use crate::ratelimit::BucketKey;
use crate::AppState;

pub async fn middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if !state.rate_limiter.enabled() {
        return next.run(req).await;
    }

    let ip = req
        .extensions()
        .get::<ClientIp>()
        .map(|c| c.0)
        .unwrap_or(std::net::IpAddr::from([0, 0, 0, 0]));

    let strategy = state.config.ratelimit.strategy;
    let mut allowed = true;

    if matches!(strategy, RateLimitStrategy::Ip | RateLimitStrategy::Both) {
        allowed &= state.rate_limiter.allow(BucketKey::Ip(ip));
    }

    if matches!(strategy, RateLimitStrategy::Token | RateLimitStrategy::Both) {
        // Token-keyed buckets use the salted hash so raw credentials never
        // become map keys. Requests without credentials fall back to the IP
        // bucket under the pure token strategy.
        let token_key = req
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| crate::auth::Credentials::from_header(v).ok())
            .map(|c| state.auth_cache.cache_key(&c.username, &c.secret));
        match token_key {
            Some(hash) => allowed &= state.rate_limiter.allow(BucketKey::Token(hash)),
            None if strategy == RateLimitStrategy::Token => {
                allowed &= state.rate_limiter.allow(BucketKey::Ip(ip));
            }
            None => {}
        }
    }

    if !allowed {
        state.metrics.metrics.rate_limited.inc();
        warn!(client_ip = %ip, "rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Too Many Requests",
                "message": "Rate limit exceeded. Please try again later.",
            })),
        )
            .into_response();
    }

    next.run(req).await
}
