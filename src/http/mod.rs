//! HTTP layer: router assembly, error mapping and the content handlers.
//!
//! Two route families coexist: the path-style routes registered below and the
//! embedded full-URL form handled by the router fallback. `/health` and the
//! metrics endpoint live at the root regardless of `server.base_path`.

pub mod api;
pub mod archive;
pub mod gist;
pub mod git;
pub mod raw;
pub mod release;
pub mod serve;
pub mod url;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::middleware::from_fn;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{error, warn};

use crate::middleware as mw;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all routes, the middleware chain and shared
/// state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let proxy_routes = Router::new()
        // Release asset downloads
        .route(
            "/{owner}/{repo}/releases/download/{tag}/{*filename}",
            get(release::handle),
        )
        // Raw content; the ref/path split happens in the handler so that
        // refs/heads/... and refs/tags/... stay intact.
        .route("/{owner}/{repo}/raw/{*rest}", get(raw::handle))
        // Repository archives
        .route("/{owner}/{repo}/archive/{*rest}", get(archive::handle))
        // Git smart HTTP; {repo} matches `name.git` as one segment
        .route("/{owner}/{repo}/info/refs", get(git::handle_info_refs))
        .route(
            "/{owner}/{repo}/git-upload-pack",
            post(git::handle_upload_pack),
        )
        .route(
            "/{owner}/{repo}/git-receive-pack",
            post(git::handle_receive_pack),
        )
        // Gist raw files
        .route("/gist/{user}/{gist_id}/raw/{file}", get(gist::handle))
        // REST API passthrough
        .route("/api/{*path}", any(api::handle));

    let base_path = normalized_base_path(&state.config.server.base_path);
    let mut app = match base_path.as_deref() {
        Some(base) => {
            // Health answers under the prefix too, but the root copy below
            // stays authoritative for load balancers.
            let nested = proxy_routes.route("/health", get(handle_health));
            Router::new().nest(base, nested)
        }
        None => proxy_routes,
    };

    // Root-level health and metrics, outside both route families.
    app = app.route("/health", get(handle_health));
    if state.config.metrics.enabled {
        app = app.route(state.config.metrics.path.as_str(), get(handle_metrics));
    }

    // Embedded-full-URL family: everything unmatched lands here.
    app = app.fallback(url::handle);

    app.layer(
        ServiceBuilder::new()
            .layer(CatchPanicLayer::custom(mw::recovery::handle_panic))
            .layer(from_fn(mw::logging::middleware))
            .layer(from_fn_with_state(
                Arc::clone(&state),
                mw::metrics::middleware,
            ))
            .layer(from_fn(mw::realip::middleware))
            .layer(from_fn_with_state(
                Arc::clone(&state),
                mw::security_headers::middleware,
            ))
            .layer(from_fn_with_state(
                Arc::clone(&state),
                mw::ratelimit::middleware,
            ))
            .layer(from_fn_with_state(Arc::clone(&state), mw::auth::middleware)),
    )
    .with_state(state)
}

/// Normalize `server.base_path`: ensure one leading slash, no trailing slash,
/// `None` when effectively empty.
fn normalized_base_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "/" {
        return None;
    }
    if trimmed.starts_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("/{trimmed}"))
    }
}

// ---------------------------------------------------------------------------
// Health & metrics
// ---------------------------------------------------------------------------

/// `GET /health`
async fn handle_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "time": chrono::Utc::now().timestamp(),
    }))
}

/// `GET /metrics` (path configurable)
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error that maps cleanly onto HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Malformed client input: missing parameters, bad names, bad paths.
    BadRequest(String),
    /// Destination policy violation (SSRF allow-list, private address).
    Policy(String),
    /// No route or unknown URL form.
    NotFound,
    /// Upstream transport failure (dial, TLS, read) or proxy failure.
    Upstream(anyhow::Error),
    /// Everything else.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Bad Request", "message": message})),
            )
                .into_response(),
            AppError::Policy(message) => {
                warn!(%message, "destination policy violation");
                (
                    StatusCode::FORBIDDEN,
                    Json(json!({"error": "Forbidden", "message": message})),
                )
                    .into_response()
            }
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Not Found"})),
            )
                .into_response(),
            AppError::Upstream(err) => {
                warn!(error = %err, "upstream fetch failed");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({"error": "Bad Gateway", "message": err.to_string()})),
                )
                    .into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "Internal Server Error"})),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::Config;

    #[test]
    fn base_path_normalization() {
        assert_eq!(normalized_base_path(""), None);
        assert_eq!(normalized_base_path("/"), None);
        assert_eq!(normalized_base_path("/ghproxy"), Some("/ghproxy".into()));
        assert_eq!(normalized_base_path("ghproxy"), Some("/ghproxy".into()));
        assert_eq!(normalized_base_path("/ghproxy/"), Some("/ghproxy".into()));
    }

    async fn router_with_base(base: &str) -> Router {
        let mut config = Config::default();
        config.server.base_path = base.to_string();
        let state = Arc::new(crate::test_state(config).await);
        create_router(state)
    }

    #[tokio::test]
    async fn health_at_root() {
        let app = router_with_base("").await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert!(body["time"].is_i64());
    }

    #[tokio::test]
    async fn base_path_scopes_proxy_routes() {
        let app = router_with_base("/ghproxy").await;

        // Health at both root and under the prefix.
        for uri in ["/health", "/ghproxy/health"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }

        // A path-style route without the prefix is not a proxy route and not
        // a full URL, so it falls through to 404.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/owner/repo/raw/main/x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_format() {
        let app = router_with_base("").await;
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();
        assert!(content_type.contains("openmetrics"));
    }

    #[tokio::test]
    async fn security_headers_are_applied_everywhere() {
        let app = router_with_base("").await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn unknown_route_is_404_json() {
        let app = router_with_base("").await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/definitely/not/a/route/anywhere")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_owner_is_400_without_upstream_contact() {
        let app = router_with_base("").await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/-bad-owner-/repo/raw/main/file")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn full_url_with_disallowed_host_is_rejected() {
        // Scenario S5: localhost target must be rejected before any
        // outbound connection.
        let app = router_with_base("").await;
        for uri in [
            "/https://127.0.0.1/owner/repo/raw/main/f",
            "/https://localhost/owner/repo/raw/main/f",
            "/https://internal.corp/owner/repo/raw/main/f",
        ] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            // Unknown hosts are not origin URLs at all (404); allow-listed
            // shapes resolving privately yield 403. Either way nothing is
            // fetched.
            assert!(
                response.status() == StatusCode::NOT_FOUND
                    || response.status() == StatusCode::FORBIDDEN,
                "{uri} -> {}",
                response.status()
            );
        }
    }
}
