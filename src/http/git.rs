//! Git smart-HTTP passthrough.
//!
//! Routes:
//! - `GET  /{owner}/{repo}.git/info/refs?service=git-upload-pack|git-receive-pack`
//! - `POST /{owner}/{repo}.git/git-upload-pack`
//! - `POST /{owner}/{repo}.git/git-receive-pack`
//!
//! The proxy is content-agnostic for Git bytes: request and response bodies
//! stream through unchanged and nothing is ever cached. The `.git` suffix is
//! stripped before the upstream URL is built.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::serve;
use super::AppError;
use crate::origin;
use crate::security::{ssrf, validation};
use crate::AppState;

/// Headers forwarded in both directions for the pack protocol.
const GIT_HEADERS: &[&str] = &[
    "content-type",
    "content-encoding",
    "accept",
    "accept-encoding",
    "git-protocol",
];

#[derive(Debug, Deserialize)]
pub struct InfoRefsQuery {
    service: Option<String>,
}

/// `GET /{owner}/{repo}.git/info/refs`
#[instrument(skip(state, headers), fields(%owner, %repo))]
pub async fn handle_info_refs(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    serve_info_refs(&state, &headers, &owner, &repo, query.service.as_deref()).await
}

/// Shared info/refs entry point used by both route families.
pub async fn serve_info_refs(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    owner: &str,
    repo: &str,
    service: Option<&str>,
) -> Result<Response, AppError> {
    let repo = normalize_repo(owner, repo)?;
    let service =
        service.ok_or_else(|| AppError::BadRequest("missing service parameter".to_string()))?;
    if service != "git-upload-pack" && service != "git-receive-pack" {
        return Err(AppError::BadRequest(format!("invalid service: {service}")));
    }

    let upstream_url = format!(
        "https://{}/{owner}/{repo}.git/info/refs?service={service}",
        origin::MAIN_HOST
    );
    forward(state, headers, reqwest::Method::GET, upstream_url, None).await
}

/// `POST /{owner}/{repo}.git/git-upload-pack`
#[instrument(skip(state, req), fields(%owner, %repo))]
pub async fn handle_upload_pack(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    req: Request,
) -> Result<Response, AppError> {
    serve_pack(&state, req, &owner, &repo, "git-upload-pack").await
}

/// `POST /{owner}/{repo}.git/git-receive-pack`
#[instrument(skip(state, req), fields(%owner, %repo))]
pub async fn handle_receive_pack(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    req: Request,
) -> Result<Response, AppError> {
    serve_pack(&state, req, &owner, &repo, "git-receive-pack").await
}

/// Shared pack-transfer entry point: POST the client body upstream unchanged.
pub async fn serve_pack(
    state: &Arc<AppState>,
    req: Request,
    owner: &str,
    repo: &str,
    service: &str,
) -> Result<Response, AppError> {
    let repo = normalize_repo(owner, repo)?;
    let upstream_url = format!("https://{}/{owner}/{repo}.git/{service}", origin::MAIN_HOST);
    let headers = req.headers().clone();
    let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());
    forward(state, &headers, reqwest::Method::POST, upstream_url, Some(body)).await
}

/// Strip `.git` and validate both halves.
fn normalize_repo(owner: &str, repo: &str) -> Result<String, AppError> {
    let repo = repo.trim_end_matches(".git").to_string();
    validation::validate_owner(owner).map_err(|e| AppError::BadRequest(e.to_string()))?;
    validation::validate_repo(&repo).map_err(|e| AppError::BadRequest(e.to_string()))?;
    Ok(repo)
}

/// Forward a pack-protocol request upstream and stream the answer back.
async fn forward(
    state: &Arc<AppState>,
    client_headers: &HeaderMap,
    method: reqwest::Method,
    upstream_url: String,
    body: Option<reqwest::Body>,
) -> Result<Response, AppError> {
    ssrf::validate_upstream_url(&upstream_url, &state.config.security)
        .await
        .map_err(|e| AppError::Policy(e.to_string()))?;

    debug!(url = %upstream_url, "proxying git smart-HTTP request");
    state.metrics.metrics.upstream_requests.inc();

    let mut outbound = state
        .http_client
        .request(method, &upstream_url)
        .header("User-Agent", serve::forwarded_user_agent(client_headers));
    for name in GIT_HEADERS {
        if let Some(value) = client_headers.get(*name).and_then(|v| v.to_str().ok()) {
            outbound = outbound.header(*name, value);
        }
    }
    if let Some(body) = body {
        outbound = outbound.body(body);
    }

    let upstream = outbound.send().await.map_err(|e| {
        state.metrics.metrics.upstream_errors.inc();
        AppError::Upstream(e.into())
    })?;

    let status = upstream.status();
    let mut response = serve::passthrough_response(upstream);
    if status.is_success() {
        // Pack exchanges are never cached, so a 2xx is always a miss.
        response.headers_mut().insert(
            HeaderName::from_static("x-cache"),
            HeaderValue::from_static("MISS"),
        );
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_git_suffix_is_stripped() {
        assert_eq!(normalize_repo("octocat", "Hello-World.git").unwrap(), "Hello-World");
        assert_eq!(normalize_repo("octocat", "Hello-World").unwrap(), "Hello-World");
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(normalize_repo("-bad-", "repo").is_err());
        assert!(normalize_repo("owner", ".git").is_err());
        assert!(normalize_repo("owner", "bad name.git").is_err());
    }
}
