//! Gist raw-file handler.
//!
//! Route: `GET /gist/{user}/{gist_id}/raw/{file}`.
//! Upstream: `https://gist.githubusercontent.com/<user>/<gist_id>/raw/<file>`.

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

/// Gists are small; anything beyond this streams uncached.
pub const CACHE_CEILING: u64 = 10 * 1024 * 1024;

const TTL: Duration = Duration::from_secs(30 * 60);

/// `GET /gist/{user}/{gist_id}/raw/{file}`
#[instrument(skip(state, headers), fields(%user, %gist_id))]
pub async fn handle(
    State(state): State<Arc<AppState>>,
    Path((user, gist_id, file)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    serve(&state, &headers, &user, &gist_id, &file).await
}

/// Shared entry point used by both route families.
pub async fn serve(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    user: &str,
    gist_id: &str,
    file: &str,
) -> Result<Response, AppError> {
    validation::validate_owner(user).map_err(|e| AppError::BadRequest(e.to_string()))?;
    validation::validate_gist_id(gist_id).map_err(|e| AppError::BadRequest(e.to_string()))?;
    if file.is_empty() {
        return Err(AppError::BadRequest("missing gist file name".to_string()));
    }
    path_rules::validate_path(file).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let upstream_url = format!(
        "https://{}/{user}/{gist_id}/raw/{file}",
        origin::GIST_RAW_HOST
    );
    let key = CacheKey::new(ArtifactKind::Gist, user, gist_id, "", file, "");

    serve_cacheable(
        state,
        headers,
        FetchPlan {
            key,
            upstream_url,
            ttl: TTL,
            tier: Tier::Memory { ceiling: CACHE_CEILING },
            accept: None,
        },
    )
    .await
}
