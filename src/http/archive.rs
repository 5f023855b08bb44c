//! Repository archive handler.
//!
//! Route: `GET /{owner}/{repo}/archive/{*rest}` where `rest` is
//! `<ref>.zip` or `<ref>.tar.gz` (the ref itself may be `refs/heads/...`).
//! Upstream: `https://github.com/<owner>/<repo>/archive/<ref>.<fmt>`, which
//! redirects to the codeload host. Archives are large, so they bypass the
//! memory tier entirely and populate disk only.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use tracing::instrument;

use super::serve::{serve_cacheable, FetchPlan, Tier};
use super::AppError;
use crate::cache::{ArtifactKind, CacheKey};
use crate::origin;
use crate::security::validation;
use crate::AppState;

/// `GET /{owner}/{repo}/archive/{*rest}`
#[instrument(skip(state, headers), fields(%owner, %repo, %rest))]
pub async fn handle(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, rest)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    serve(&state, &headers, &owner, &repo, &rest).await
}

/// Shared entry point used by both route families. `rest` carries the ref
/// with its flavor suffix still attached.
pub async fn serve(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    owner: &str,
    repo: &str,
    rest: &str,
) -> Result<Response, AppError> {
    validation::validate_owner(owner).map_err(|e| AppError::BadRequest(e.to_string()))?;
    validation::validate_repo(repo).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let (reference, format) = split_ref_and_format(rest)
        .ok_or_else(|| AppError::BadRequest(format!("unsupported archive format: {rest:?}")))?;
    validation::validate_archive_format(&format).map_err(|e| AppError::BadRequest(e.to_string()))?;
    validation::validate_ref(&reference).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let upstream_url = format!(
        "https://{}/{owner}/{repo}/archive/{reference}.{format}",
        origin::MAIN_HOST
    );
    let key = CacheKey::new(ArtifactKind::Archive, owner, repo, &reference, "", &format);

    serve_cacheable(
        state,
        headers,
        FetchPlan {
            key,
            upstream_url,
            ttl: state.config.cache.ttl,
            tier: Tier::Disk,
            accept: Some("application/octet-stream"),
        },
    )
    .await
}

/// Split `main.tar.gz` into `("main", "tar.gz")`. Longer suffix first so
/// `.tar.gz` never parses as a ref ending in `.tar`.
fn split_ref_and_format(rest: &str) -> Option<(String, String)> {
    for format in ["tar.gz", "zip"] {
        if let Some(reference) = rest.strip_suffix(&format!(".{format}")) {
            if !reference.is_empty() {
                return Some((reference.to_string(), format.to_string()));
            }
        }
    }
    None
}
