//! Credential parsing and upstream validation.
//!
//! Credentials arrive as `Basic base64(user:cred)` or `Bearer <cred>`; the
//! credential is treated as a personal access token and checked with a
//! `GET /user` round-trip carrying `Authorization: token <cred>`. Upstream
//! 200 validates, 401 means invalid, 403 means forbidden or expired, and
//! anything else is a transient failure that is never cached.

use base64::Engine as _;
use serde::Deserialize;
use tracing::{debug, warn};

use super::cache::{AuthCache, UpstreamRateLimit, Verdict};

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum AuthError {
    /// Header present but unparsable.
    Malformed,
    /// Upstream rejected the credential (401).
    Invalid,
    /// Upstream reported the credential forbidden or expired (403).
    Forbidden,
    /// Upstream unreachable or returned an unexpected status; not cached.
    Transient(anyhow::Error),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Malformed => write!(f, "malformed Authorization header"),
            AuthError::Invalid => write!(f, "invalid credentials"),
            AuthError::Forbidden => write!(f, "credentials forbidden or expired"),
            AuthError::Transient(e) => write!(f, "credential validation unavailable: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

// ---------------------------------------------------------------------------
// Credential parsing
// ---------------------------------------------------------------------------

/// Parsed client credentials. For Bearer tokens the username is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    /// Parse an `Authorization` header value.
    pub fn from_header(value: &str) -> Result<Credentials, AuthError> {
        if let Some(encoded) = value.strip_prefix("Basic ") {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|_| AuthError::Malformed)?;
            let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
            let (username, secret) = decoded.split_once(':').ok_or(AuthError::Malformed)?;
            if secret.is_empty() {
                return Err(AuthError::Malformed);
            }
            Ok(Credentials {
                username: username.to_string(),
                secret: secret.to_string(),
            })
        } else if let Some(token) = value.strip_prefix("Bearer ") {
            let token = token.trim();
            if token.is_empty() {
                return Err(AuthError::Malformed);
            }
            Ok(Credentials {
                username: String::new(),
                secret: token.to_string(),
            })
        } else {
            Err(AuthError::Malformed)
        }
    }
}

// ---------------------------------------------------------------------------
// Upstream validation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UpstreamUser {
    login: String,
}

/// Validate credentials, consulting the verdict cache first.
///
/// `user_url` is the origin's user endpoint; tests point it at a local
/// server.
pub async fn validate(
    client: &reqwest::Client,
    cache: &AuthCache,
    user_url: &str,
    creds: &Credentials,
) -> Result<Verdict, AuthError> {
    if let Some(verdict) = cache.get(&creds.username, &creds.secret) {
        return Ok(verdict);
    }

    debug!("auth cache miss, validating against upstream");

    let response = client
        .get(user_url)
        .header("Authorization", format!("token {}", creds.secret))
        .header("Accept", "application/vnd.github.v3+json")
        .send()
        .await
        .map_err(|e| AuthError::Transient(e.into()))?;

    let status = response.status();
    match status.as_u16() {
        200 => {}
        401 => return Err(AuthError::Invalid),
        403 => return Err(AuthError::Forbidden),
        other => {
            warn!(status = other, "unexpected status validating credentials");
            return Err(AuthError::Transient(anyhow::anyhow!(
                "upstream user endpoint returned {other}"
            )));
        }
    }

    let rate_limit = rate_limit_from_headers(response.headers());
    let scopes = scopes_from_headers(response.headers());

    let user: UpstreamUser = response
        .json()
        .await
        .map_err(|e| AuthError::Transient(e.into()))?;

    let verdict = Verdict::new(user.login, scopes, rate_limit, cache.verdict_ttl());
    cache.insert(&creds.username, &creds.secret, verdict.clone());
    Ok(verdict)
}

fn scopes_from_headers(headers: &reqwest::header::HeaderMap) -> Vec<String> {
    headers
        .get("x-oauth-scopes")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn rate_limit_from_headers(headers: &reqwest::header::HeaderMap) -> UpstreamRateLimit {
    fn parse<T: std::str::FromStr>(headers: &reqwest::header::HeaderMap, name: &str) -> Option<T> {
        headers.get(name)?.to_str().ok()?.parse().ok()
    }
    UpstreamRateLimit {
        limit: parse(headers, "x-ratelimit-limit"),
        remaining: parse(headers, "x-ratelimit-remaining"),
        reset: parse(headers, "x-ratelimit-reset"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
