//! Raw file handler.
//!
//! Route: `GET /{owner}/{repo}/raw/{*rest}` where `rest` is `<ref>/<path>`
//! with an optionally fully-qualified ref (`refs/heads/...`, `refs/tags/...`).
//! Upstream: `https://raw.githubusercontent.com/<owner>/<repo>/<ref><path>`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use tracing::instrument;

use super::serve::{serve_cacheable, FetchPlan, Tier};
use super::AppError;
use crate::cache::{ArtifactKind, CacheKey};
use crate::dispatch;
use crate::origin;
use crate::security::{path as path_rules, validation};
use crate::AppState;

/// Bodies beyond this size are streamed without caching.
pub const CACHE_CEILING: u64 = 100 * 1024 * 1024;

/// `GET /{owner}/{repo}/raw/{*rest}`
#[instrument(skip(state, headers), fields(%owner, %repo))]
pub async fn handle(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, rest)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    let (reference, file_path) = dispatch::split_ref_and_path(&segments)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    serve(&state, &headers, &owner, &repo, &reference, &file_path).await
}

/// Shared entry point used by both route families.
pub async fn serve(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    owner: &str,
    repo: &str,
    reference: &str,
    file_path: &str,
) -> Result<Response, AppError> {
    validation::validate_owner(owner).map_err(|e| AppError::BadRequest(e.to_string()))?;
    validation::validate_repo(repo).map_err(|e| AppError::BadRequest(e.to_string()))?;
    validation::validate_ref(reference).map_err(|e| AppError::BadRequest(e.to_string()))?;
    if file_path.is_empty() {
        return Err(AppError::BadRequest("missing file path".to_string()));
    }
    path_rules::validate_path(file_path.trim_start_matches('/'))
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let upstream_url = format!(
        "https://{}/{owner}/{repo}/{reference}{file_path}",
        origin::RAW_HOST
    );
    let key = CacheKey::new(ArtifactKind::Raw, owner, repo, reference, file_path, "");

    serve_cacheable(
        state,
        headers,
        FetchPlan {
            key,
            upstream_url,
            ttl: ttl_for_ref(reference),
            tier: Tier::Memory { ceiling: CACHE_CEILING },
            accept: None,
        },
    )
    .await
}

/// Branch content moves, commit and tag content does not; TTL follows.
fn ttl_for_ref(reference: &str) -> Duration {
    if validation::is_immutable_ref(reference) {
        Duration::from_secs(24 * 3600)
    } else if reference.starts_with("refs/heads/") {
        Duration::from_secs(5 * 60)
    } else {
        Duration::from_secs(3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_tiers() {
        assert_eq!(
            ttl_for_ref("da39a3ee5e6b4b0d3255bfef95601890afd80709"),
            Duration::from_secs(24 * 3600)
        );
        assert_eq!(ttl_for_ref("refs/tags/v1.0.0"), Duration::from_secs(24 * 3600));
        assert_eq!(ttl_for_ref("refs/heads/main"), Duration::from_secs(300));
        assert_eq!(ttl_for_ref("main"), Duration::from_secs(3600));
        assert_eq!(ttl_for_ref("v1.0.0"), Duration::from_secs(3600));
    }
}
