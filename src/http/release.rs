//! Release asset handler.
//!
//! Route: `GET /{owner}/{repo}/releases/download/{tag}/{*filename}`.
//! Upstream: `https://github.com/<owner>/<repo>/releases/download/<tag>/<file>`,
//! which redirects to the origin's object store; redirects are followed by
//! the outbound client. Assets go to the disk tier.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use tracing::instrument;

use super::serve::{serve_cacheable, FetchPlan, Tier};
use super::AppError;
use crate::cache::{ArtifactKind, CacheKey};
use crate::origin;
use crate::security::{path as path_rules, validation};
use crate::AppState;

/// An asset is pinned to its (tag, filename) pair, so replays are safe for a
/// long time.
const TTL: Duration = Duration::from_secs(24 * 3600);

/// `GET /{owner}/{repo}/releases/download/{tag}/{*filename}`
#[instrument(skip(state, headers), fields(%owner, %repo, %tag))]
pub async fn handle(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, tag, filename)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    serve(&state, &headers, &owner, &repo, &tag, &filename).await
}

/// Shared entry point used by both route families.
pub async fn serve(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    owner: &str,
    repo: &str,
    tag: &str,
    filename: &str,
) -> Result<Response, AppError> {
    validation::validate_owner(owner).map_err(|e| AppError::BadRequest(e.to_string()))?;
    validation::validate_repo(repo).map_err(|e| AppError::BadRequest(e.to_string()))?;
    validation::validate_release_tag(tag).map_err(|e| AppError::BadRequest(e.to_string()))?;
    if filename.is_empty() {
        return Err(AppError::BadRequest("missing asset filename".to_string()));
    }
    path_rules::validate_path(filename).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let upstream_url = format!(
        "https://{}/{owner}/{repo}/releases/download/{tag}/{filename}",
        origin::MAIN_HOST
    );
    let key = CacheKey::new(ArtifactKind::Release, owner, repo, tag, filename, "");

    serve_cacheable(
        state,
        headers,
        FetchPlan {
            key,
            upstream_url,
            ttl: TTL,
            tier: Tier::Disk,
            accept: Some("application/octet-stream"),
        },
    )
    .await
}
