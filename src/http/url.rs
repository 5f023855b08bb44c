//! Embedded full-URL route family.
//!
//! The router fallback lands here: when the request path (minus any base
//! path) is itself an origin URL, it is parsed into the handler tuple and
//! delegated to the matching content handler. Anything else is a 404.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::Method;
use axum::response::Response;
use tracing::instrument;

use super::{api, archive, git, gist, raw, release, AppError};
use crate::dispatch::{self, ParsedRequest, RequestKind};
use crate::AppState;

/// Router fallback for both route families' leftovers.
#[instrument(skip_all, fields(path = %req.uri().path()))]
pub async fn handle(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Response, AppError> {
    let full_path = req.uri().path().to_string();

    // The proxy group may be nested under a base path; the embedded form
    // carries it too.
    let base = state.config.server.base_path.trim_end_matches('/');
    let path = if !base.is_empty() && base != "/" {
        let base = if base.starts_with('/') {
            base.to_string()
        } else {
            format!("/{base}")
        };
        match full_path.strip_prefix(&base) {
            Some(rest) => rest.to_string(),
            None => return Err(AppError::NotFound),
        }
    } else {
        full_path
    };

    if !dispatch::is_origin_url(&path) {
        return Err(AppError::NotFound);
    }

    let parsed = dispatch::parse_origin_url(&path)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    dispatch_parsed(&state, req, parsed).await
}

/// Route a [`ParsedRequest`] onto the concrete handler.
async fn dispatch_parsed(
    state: &Arc<AppState>,
    req: Request,
    parsed: ParsedRequest,
) -> Result<Response, AppError> {
    let headers = req.headers().clone();
    match parsed.kind {
        RequestKind::Raw => {
            raw::serve(
                state,
                &headers,
                &parsed.owner,
                &parsed.repo,
                &parsed.reference,
                &parsed.path,
            )
            .await
        }
        RequestKind::Archive => {
            archive::serve(state, &headers, &parsed.owner, &parsed.repo, &parsed.reference).await
        }
        RequestKind::Release => {
            release::serve(
                state,
                &headers,
                &parsed.owner,
                &parsed.repo,
                &parsed.reference,
                &parsed.path,
            )
            .await
        }
        RequestKind::Gist => {
            gist::serve(state, &headers, &parsed.owner, &parsed.repo, &parsed.path).await
        }
        RequestKind::Api => {
            let query = req.uri().query().map(str::to_string);
            api::serve(state, req, &parsed.api_path, query.as_deref()).await
        }
        RequestKind::Git => {
            // Sub-endpoint is carried in the parsed path.
            match (req.method().clone(), parsed.path.as_str()) {
                (Method::GET, "info/refs") => {
                    let service = req
                        .uri()
                        .query()
                        .and_then(|q| {
                            q.split('&')
                                .find_map(|kv| kv.strip_prefix("service=").map(str::to_string))
                        });
                    git::serve_info_refs(
                        state,
                        &headers,
                        &parsed.owner,
                        &parsed.repo,
                        service.as_deref(),
                    )
                    .await
                }
                (Method::POST, "git-upload-pack") => {
                    git::serve_pack(state, req, &parsed.owner, &parsed.repo, "git-upload-pack")
                        .await
                }
                (Method::POST, "git-receive-pack") => {
                    git::serve_pack(state, req, &parsed.owner, &parsed.repo, "git-receive-pack")
                        .await
                }
                (method, sub) => Err(AppError::BadRequest(format!(
                    "unsupported git operation: {method} {sub:?}"
                ))),
            }
        }
    }
}
