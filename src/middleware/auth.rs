//! Optional authentication gate.
//!
//! When enabled, credentials are validated through the verdict cache and the
//! upstream user endpoint. Requests without an `Authorization` header pass
//! only when anonymous access is allowed and the path is not on the
//! `require_auth` list. Static tokens from configuration are accepted
//! without an upstream round-trip, either as `Bearer` values or via the
//! configured token header.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::auth::{validator, AuthError, Credentials};
use crate::origin;
use crate::AppState;

pub async fn middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let config = &state.config.auth;
    if !config.enabled {
        return next.run(req).await;
    }

    // Static token in the dedicated header short-circuits everything else.
    if !config.tokens.is_empty() {
        if let Some(value) = req
            .headers()
            .get(config.token_header.as_str())
            .and_then(|v| v.to_str().ok())
        {
            if config.tokens.iter().any(|t| t == value) {
                return next.run(req).await;
            }
        }
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let Some(auth_header) = auth_header else {
        let path = req.uri().path();
        let requires_auth = config.require_auth.iter().any(|p| path.starts_with(p));
        if config.allow_anonymous && !requires_auth {
            return next.run(req).await;
        }
        state.metrics.metrics.auth_failures.inc();
        return unauthorized("Authorization header required");
    };

    let creds = match Credentials::from_header(&auth_header) {
        Ok(creds) => creds,
        Err(_) => {
            state.metrics.metrics.auth_failures.inc();
            return unauthorized("Invalid Authorization header format");
        }
    };

    // Static tokens are also honoured as Bearer credentials.
    if config.tokens.iter().any(|t| t == &creds.secret) {
        return next.run(req).await;
    }

    let cached = state.auth_cache.get(&creds.username, &creds.secret).is_some();
    if cached {
        state.metrics.metrics.auth_cache_hits.inc();
    } else {
        state.metrics.metrics.auth_cache_misses.inc();
    }

    match validator::validate(
        &state.http_client,
        &state.auth_cache,
        origin::API_USER_URL,
        &creds,
    )
    .await
    {
        Ok(_verdict) => next.run(req).await,
        Err(AuthError::Malformed) | Err(AuthError::Invalid) => {
            state.metrics.metrics.auth_failures.inc();
            unauthorized("Invalid credentials")
        }
        Err(AuthError::Forbidden) => {
            state.metrics.metrics.auth_failures.inc();
            (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": "Forbidden",
                    "message": "Credentials are forbidden or expired",
                })),
            )
                .into_response()
        }
        Err(AuthError::Transient(e)) => {
            warn!(error = %e, "credential validation unavailable");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": "Bad Gateway",
                    "message": "Unable to validate credentials with upstream",
                })),
            )
                .into_response()
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "Unauthorized",
            "message": message,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    use crate::config::Config;

    async fn app(mutate: impl FnOnce(&mut Config)) -> Router {
        let mut config = Config::default();
        config.auth.enabled = true;
        mutate(&mut config);
        let state = Arc::new(crate::test_state(config).await);
        Router::new()
            .route("/", get(|| async { "ok" }))
            .route("/private/data", get(|| async { "secret" }))
            .layer(axum::middleware::from_fn_with_state(state, middleware))
    }

    #[tokio::test]
    async fn anonymous_allowed_passes_without_header() {
        let app = app(|c| c.auth.allow_anonymous = true).await;
        let response = app
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn anonymous_disallowed_is_401() {
        let app = app(|c| c.auth.allow_anonymous = false).await;
        let response = app
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn require_auth_paths_override_anonymous() {
        let app = app(|c| {
            c.auth.allow_anonymous = true;
            c.auth.require_auth = vec!["/private".to_string()];
        })
        .await;
        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/private/data")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn garbage_header_is_401() {
        let app = app(|c| c.auth.allow_anonymous = true).await;
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header("authorization", "Negotiate blob")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn static_bearer_token_is_accepted_locally() {
        let app = app(|c| {
            c.auth.allow_anonymous = false;
            c.auth.tokens = vec!["local-token".to_string()];
        })
        .await;
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header("authorization", "Bearer local-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn static_token_header_is_accepted() {
        let app = app(|c| {
            c.auth.allow_anonymous = false;
            c.auth.tokens = vec!["local-token".to_string()];
        })
        .await;
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header("x-auth-token", "local-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn disabled_auth_ignores_everything() {
        let app = app(|c| {
            c.auth.enabled = false;
            c.auth.allow_anonymous = false;
        })
        .await;
        let response = app
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
