//! Fixed security headers on every response.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;

use crate::AppState;

const HEADERS: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
    ("content-security-policy", "default-src 'self'"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    (
        "permissions-policy",
        "geolocation=(), microphone=(), camera=()",
    ),
];

pub async fn middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    for (name, value) in HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    if state.config.security.enable_hsts {
        if let Ok(value) = HeaderValue::from_str(&format!(
            "max-age={}; includeSubDomains",
            state.config.security.hsts_max_age
        )) {
            headers.insert(HeaderName::from_static("strict-transport-security"), value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    use crate::config::Config;

    async fn run(hsts: bool) -> Response {
        let mut config = Config::default();
        config.security.enable_hsts = hsts;
        let state = Arc::new(crate::test_state(config).await);
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                Arc::clone(&state),
                middleware,
            ));
        app.oneshot(
            axum::http::Request::builder()
                .uri("/")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn all_fixed_headers_are_present() {
        let response = run(false).await;
        for (name, value) in HEADERS {
            assert_eq!(
                response.headers().get(*name).unwrap().to_str().unwrap(),
                *value,
                "header {name}"
            );
        }
        assert!(response.headers().get("strict-transport-security").is_none());
    }

    #[tokio::test]
    async fn hsts_is_added_when_enabled() {
        let response = run(true).await;
        let hsts = response
            .headers()
            .get("strict-transport-security")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(hsts.starts_with("max-age="));
    }
}
