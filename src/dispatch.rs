//! URL dispatch for the embedded full-URL route family.
//!
//! Clients may hand the proxy an entire origin URL as the request path
//! (`/https://github.com/owner/repo/raw/main/file.md`, with or without the
//! scheme). The dispatcher detects that form by its leading host segment,
//! parses the host-specific layout and produces the same tuple the
//! path-style routes feed to the handlers.

use anyhow::{bail, Result};

use crate::origin;

// ---------------------------------------------------------------------------
// Parsed request tuple
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Raw,
    Archive,
    Release,
    Gist,
    Git,
    Api,
}

/// The six fields handlers consume. Gists reuse `owner` for the gist user and
/// `repo` for the gist id; releases carry the tag in `reference` and the
/// asset name in `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub kind: RequestKind,
    pub owner: String,
    pub repo: String,
    pub reference: String,
    pub path: String,
    pub api_path: String,
}

impl ParsedRequest {
    fn new(kind: RequestKind) -> Self {
        ParsedRequest {
            kind,
            owner: String::new(),
            repo: String::new(),
            reference: String::new(),
            path: String::new(),
            api_path: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

const ORIGIN_HOSTS: &[&str] = &[
    origin::MAIN_HOST,
    origin::RAW_HOST,
    origin::API_HOST,
    origin::GIST_HOST,
];

/// True when the leading path segment names one of the origin hosts, with or
/// without an `http://` / `https://` prefix.
pub fn is_origin_url(path: &str) -> bool {
    let path = path.trim_start_matches('/');
    for host in ORIGIN_HOSTS {
        for prefix in [
            format!("{host}/"),
            format!("https://{host}/"),
            format!("http://{host}/"),
        ] {
            if path.starts_with(&prefix) {
                return true;
            }
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse an embedded full URL into a [`ParsedRequest`].
///
/// The input is the request path with any base-path prefix already removed.
pub fn parse_origin_url(path: &str) -> Result<ParsedRequest> {
    let trimmed = path.trim_start_matches('/');
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);

    let (host, rest) = match without_scheme.split_once('/') {
        Some((host, rest)) => (host, rest),
        None => (without_scheme, ""),
    };

    match host {
        origin::RAW_HOST => parse_raw_host(rest),
        origin::API_HOST => Ok({
            let mut parsed = ParsedRequest::new(RequestKind::Api);
            parsed.api_path = format!("/{rest}");
            parsed
        }),
        origin::GIST_HOST => parse_gist_host(rest),
        origin::MAIN_HOST => parse_main_host(rest),
        other => bail!("unsupported origin host: {other:?}"),
    }
}

/// `raw.githubusercontent.com/<owner>/<repo>/<ref>/<path>`, where `<ref>` may
/// itself be a `refs/heads/...` or `refs/tags/...` triple.
fn parse_raw_host(rest: &str) -> Result<ParsedRequest> {
    let parts: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() < 3 {
        bail!("raw URL is missing owner, repo or ref");
    }
    let mut parsed = ParsedRequest::new(RequestKind::Raw);
    parsed.owner = parts[0].to_string();
    parsed.repo = parts[1].to_string();
    let (reference, file_path) = split_ref_and_path(&parts[2..])?;
    parsed.reference = reference;
    parsed.path = file_path;
    Ok(parsed)
}

/// `gist.github.com/<user>/<gist_id>/raw/<file>`; the file is whatever
/// follows the literal `raw` segment.
fn parse_gist_host(rest: &str) -> Result<ParsedRequest> {
    let parts: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() < 2 {
        bail!("gist URL is missing user or gist id");
    }
    let mut parsed = ParsedRequest::new(RequestKind::Gist);
    parsed.owner = parts[0].to_string();
    parsed.repo = parts[1].to_string();
    if let Some(raw_pos) = parts.iter().position(|p| *p == "raw") {
        if let Some(file) = parts.get(raw_pos + 1) {
            parsed.path = (*file).to_string();
        }
    }
    Ok(parsed)
}

/// `github.com/<owner>/<repo>/...` layouts: releases, raw, blob/tree
/// (rewritten to raw), archive, and the smart-HTTP git endpoints.
fn parse_main_host(rest: &str) -> Result<ParsedRequest> {
    let parts: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() < 2 {
        bail!("origin URL is missing owner or repo");
    }

    let owner = parts[0].to_string();
    let repo_raw = parts[1];
    let repo = repo_raw.trim_end_matches(".git").to_string();

    let git_suffix = repo_raw.ends_with(".git")
        || rest.contains("/info/refs")
        || rest.contains("/git-upload-pack")
        || rest.contains("/git-receive-pack");

    if parts.len() == 2 {
        if git_suffix {
            let mut parsed = ParsedRequest::new(RequestKind::Git);
            parsed.owner = owner;
            parsed.repo = repo;
            return Ok(parsed);
        }
        bail!("origin URL has no operation segment");
    }

    match parts[2] {
        "releases" => {
            // /owner/repo/releases/download/<tag>/<filename>
            if parts.len() >= 5 && parts[3] == "download" {
                let mut parsed = ParsedRequest::new(RequestKind::Release);
                parsed.owner = owner;
                parsed.repo = repo;
                parsed.reference = parts[4].to_string();
                if parts.len() > 5 {
                    parsed.path = parts[5..].join("/");
                }
                Ok(parsed)
            } else {
                bail!("unsupported releases URL form");
            }
        }
        "raw" | "blob" | "tree" => {
            // blob and tree pages carry the same layout as raw and are
            // served as raw content.
            if parts.len() < 4 {
                bail!("raw URL is missing a ref");
            }
            let mut parsed = ParsedRequest::new(RequestKind::Raw);
            parsed.owner = owner;
            parsed.repo = repo;
            let (reference, file_path) = split_ref_and_path(&parts[3..])?;
            parsed.reference = reference;
            parsed.path = file_path;
            Ok(parsed)
        }
        "archive" => {
            // The flavor suffix (.zip / .tar.gz) stays attached to the ref;
            // the archive handler splits it.
            if parts.len() < 4 {
                bail!("archive URL is missing a ref");
            }
            let mut parsed = ParsedRequest::new(RequestKind::Archive);
            parsed.owner = owner;
            parsed.repo = repo;
            parsed.reference = parts[3..].join("/");
            Ok(parsed)
        }
        _ if git_suffix => {
            let mut parsed = ParsedRequest::new(RequestKind::Git);
            parsed.owner = owner;
            parsed.repo = repo;
            parsed.path = parts[2..].join("/");
            Ok(parsed)
        }
        other => bail!("unsupported origin URL operation: {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Ref splitting
// ---------------------------------------------------------------------------

/// Split trailing segments into `(ref, /path)`.
///
/// A plain ref takes one segment. A fully qualified `refs/heads/<name>` or
/// `refs/tags/<name>` takes three, so the branch name lands in the ref and
/// not in the file path. Either way the reconstructed upstream URL is the
/// same concatenation.
pub fn split_ref_and_path(segments: &[&str]) -> Result<(String, String)> {
    if segments.is_empty() {
        bail!("missing ref");
    }
    let (ref_len, reference) =
        if segments[0] == "refs" && segments.len() >= 3 && matches!(segments[1], "heads" | "tags") {
            (3, segments[..3].join("/"))
        } else {
            (1, segments[0].to_string())
        };

    let path = if segments.len() > ref_len {
        format!("/{}", segments[ref_len..].join("/"))
    } else {
        String::new()
    };
    Ok((reference, path))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_origin_urls() {
        assert!(is_origin_url("/https://github.com/o/r/raw/main/f"));
        assert!(is_origin_url("/http://github.com/o/r"));
        assert!(is_origin_url("/github.com/o/r"));
        assert!(is_origin_url("/raw.githubusercontent.com/o/r/main/f"));
        assert!(is_origin_url("/https://api.github.com/repos/o/r"));
        assert!(is_origin_url("/gist.github.com/u/id/raw/f"));

        assert!(!is_origin_url("/o/r/raw/main/f"));
        assert!(!is_origin_url("/health"));
        assert!(!is_origin_url("/evilgithub.com/o/r"));
        assert!(!is_origin_url("/https://example.com/o/r"));
    }

    #[test]
    fn parses_main_host_raw() {
        let parsed = parse_origin_url("/https://github.com/octocat/Hello-World/raw/master/README").unwrap();
        assert_eq!(parsed.kind, RequestKind::Raw);
        assert_eq!(parsed.owner, "octocat");
        assert_eq!(parsed.repo, "Hello-World");
        assert_eq!(parsed.reference, "master");
        assert_eq!(parsed.path, "/README");
    }

    #[test]
    fn parses_refs_heads_with_semantic_split() {
        let parsed = parse_origin_url(
            "/https://github.com/ZhiShengYuan/inningbo-go/raw/refs/heads/main/ARCHITECTURE_REFACTORING.md",
        )
        .unwrap();
        assert_eq!(parsed.kind, RequestKind::Raw);
        assert_eq!(parsed.owner, "ZhiShengYuan");
        assert_eq!(parsed.repo, "inningbo-go");
        assert_eq!(parsed.reference, "refs/heads/main");
        assert_eq!(parsed.path, "/ARCHITECTURE_REFACTORING.md");

        // The reconstructed upstream URL is what actually matters.
        let upstream = format!(
            "https://raw.githubusercontent.com/{}/{}/{}{}",
            parsed.owner, parsed.repo, parsed.reference, parsed.path
        );
        assert_eq!(
            upstream,
            "https://raw.githubusercontent.com/ZhiShengYuan/inningbo-go/refs/heads/main/ARCHITECTURE_REFACTORING.md"
        );
    }

    #[test]
    fn blob_and_tree_dispatch_as_raw() {
        let blob = parse_origin_url("/https://github.com/o/r/blob/main/src/lib.rs").unwrap();
        let raw = parse_origin_url("/https://github.com/o/r/raw/main/src/lib.rs").unwrap();
        assert_eq!(blob, raw);
        assert_eq!(blob.kind, RequestKind::Raw);
        assert_eq!(blob.path, "/src/lib.rs");

        let tree = parse_origin_url("/github.com/o/r/tree/main/src/lib.rs").unwrap();
        assert_eq!(tree, raw);
    }

    #[test]
    fn parses_raw_host() {
        let parsed =
            parse_origin_url("/https://raw.githubusercontent.com/o/r/main/docs/x.md").unwrap();
        assert_eq!(parsed.kind, RequestKind::Raw);
        assert_eq!(parsed.owner, "o");
        assert_eq!(parsed.repo, "r");
        assert_eq!(parsed.reference, "main");
        assert_eq!(parsed.path, "/docs/x.md");
    }

    #[test]
    fn raw_host_with_refs_heads() {
        let parsed =
            parse_origin_url("/raw.githubusercontent.com/o/r/refs/heads/dev/f.txt").unwrap();
        assert_eq!(parsed.reference, "refs/heads/dev");
        assert_eq!(parsed.path, "/f.txt");
    }

    #[test]
    fn parses_releases() {
        let parsed = parse_origin_url(
            "/https://github.com/o/r/releases/download/v1.2.3/tool-linux-amd64.tar.gz",
        )
        .unwrap();
        assert_eq!(parsed.kind, RequestKind::Release);
        assert_eq!(parsed.reference, "v1.2.3");
        assert_eq!(parsed.path, "tool-linux-amd64.tar.gz");
    }

    #[test]
    fn parses_archive() {
        let parsed = parse_origin_url("/github.com/o/r/archive/main.tar.gz").unwrap();
        assert_eq!(parsed.kind, RequestKind::Archive);
        assert_eq!(parsed.reference, "main.tar.gz");

        let parsed = parse_origin_url("/github.com/o/r/archive/refs/heads/main.zip").unwrap();
        assert_eq!(parsed.reference, "refs/heads/main.zip");
    }

    #[test]
    fn parses_api_host() {
        let parsed =
            parse_origin_url("/https://api.github.com/repos/octocat/Hello-World/commits").unwrap();
        assert_eq!(parsed.kind, RequestKind::Api);
        assert_eq!(parsed.api_path, "/repos/octocat/Hello-World/commits");
    }

    #[test]
    fn parses_gist_host() {
        let parsed =
            parse_origin_url("/gist.github.com/u/aa5a315d61ae9438b18d1baf46a0c1b1/raw/snippet.rs")
                .unwrap();
        assert_eq!(parsed.kind, RequestKind::Gist);
        assert_eq!(parsed.owner, "u");
        assert_eq!(parsed.repo, "aa5a315d61ae9438b18d1baf46a0c1b1");
        assert_eq!(parsed.path, "snippet.rs");
    }

    #[test]
    fn parses_git_urls() {
        let parsed = parse_origin_url("/https://github.com/o/r.git/info/refs").unwrap();
        assert_eq!(parsed.kind, RequestKind::Git);
        assert_eq!(parsed.repo, "r");

        let parsed = parse_origin_url("/github.com/o/r.git").unwrap();
        assert_eq!(parsed.kind, RequestKind::Git);

        let parsed = parse_origin_url("/github.com/o/r/git-upload-pack").unwrap();
        assert_eq!(parsed.kind, RequestKind::Git);
    }

    #[test]
    fn rejects_unknown_shapes() {
        assert!(parse_origin_url("/https://example.com/o/r").is_err());
        assert!(parse_origin_url("/github.com/only-owner").is_err());
        assert!(parse_origin_url("/github.com/o/r/wiki/Home").is_err());
        assert!(parse_origin_url("/github.com/o/r/releases/tag/v1").is_err());
    }

    #[test]
    fn split_ref_and_path_shapes() {
        let (r, p) = split_ref_and_path(&["main", "a", "b.txt"]).unwrap();
        assert_eq!((r.as_str(), p.as_str()), ("main", "/a/b.txt"));

        let (r, p) = split_ref_and_path(&["refs", "heads", "main", "f"]).unwrap();
        assert_eq!((r.as_str(), p.as_str()), ("refs/heads/main", "/f"));

        let (r, p) = split_ref_and_path(&["refs", "tags", "v1.0"]).unwrap();
        assert_eq!((r.as_str(), p.as_str()), ("refs/tags/v1.0", ""));

        // `refs` followed by something that is not heads/tags is a plain ref.
        let (r, p) = split_ref_and_path(&["refs", "x"]).unwrap();
        assert_eq!((r.as_str(), p.as_str()), ("refs", "/x"));

        assert!(split_ref_and_path(&[]).is_err());
    }

    /// Full-URL dispatch is the inverse of path-style dispatch on the shared
    /// domain: both produce the same tuple.
    #[test]
    fn full_url_and_path_style_agree() {
        let full = parse_origin_url("/https://github.com/owner/repo/raw/ref/p").unwrap();
        // Path-style raw routes hand `ref/p` to the same splitter.
        let (reference, path) = split_ref_and_path(&["ref", "p"]).unwrap();
        assert_eq!(full.reference, reference);
        assert_eq!(full.path, path);
        assert_eq!(full.owner, "owner");
        assert_eq!(full.repo, "repo");
    }
}
