//! Shape validation for route parameters.
//!
//! The rules mirror GitHub's published constraints: owners are 1-39
//! alphanumeric-or-hyphen characters with no edge hyphens, repositories add
//! dots and underscores, refs allow slashes but never `..` or `//`, gist ids
//! are 32 hex digits.

use std::sync::LazyLock;

use anyhow::{bail, Result};
use regex::Regex;

static OWNER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,37}[a-zA-Z0-9])?$").expect("owner regex")
});

static REPO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]{1,100}$").expect("repo regex"));

static REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._/-]{1,255}$").expect("ref regex"));

static SHA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-fA-F0-9]{40}$").expect("sha regex"));

static GIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-fA-F0-9]{32}$").expect("gist regex"));

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._/+-]{1,255}$").expect("tag regex"));

/// Validate a GitHub owner (user or organisation) name.
pub fn validate_owner(owner: &str) -> Result<()> {
    if owner.is_empty() {
        bail!("owner cannot be empty");
    }
    if owner.len() > 39 {
        bail!("owner name too long (max 39 characters)");
    }
    if !OWNER_RE.is_match(owner) {
        bail!("invalid owner name: {owner:?}");
    }
    Ok(())
}

/// Validate a repository name.
pub fn validate_repo(repo: &str) -> Result<()> {
    if repo.is_empty() {
        bail!("repository name cannot be empty");
    }
    if !REPO_RE.is_match(repo) {
        bail!("invalid repository name: {repo:?}");
    }
    if repo.starts_with('.') || repo.ends_with('.') {
        bail!("repository name cannot start or end with a dot");
    }
    Ok(())
}

/// Validate a Git reference: a branch or tag name, a `refs/...` path, or a
/// full 40-hex commit id.
pub fn validate_ref(reference: &str) -> Result<()> {
    if reference.is_empty() {
        bail!("reference cannot be empty");
    }
    if SHA_RE.is_match(reference) {
        return Ok(());
    }
    if !REF_RE.is_match(reference) {
        bail!("invalid reference: {reference:?}");
    }
    if reference.contains("..") {
        bail!("reference cannot contain '..'");
    }
    if reference.starts_with('/') || reference.ends_with('/') {
        bail!("reference cannot start or end with a slash");
    }
    if reference.contains("//") {
        bail!("reference cannot contain consecutive slashes");
    }
    Ok(())
}

/// Validate a Gist id (32 hex digits).
pub fn validate_gist_id(gist_id: &str) -> Result<()> {
    if !GIST_RE.is_match(gist_id) {
        bail!("invalid gist id: {gist_id:?}");
    }
    Ok(())
}

/// Validate a release tag. Tags are looser than refs: GitHub accepts `+` in
/// semver build metadata.
pub fn validate_release_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        bail!("release tag cannot be empty");
    }
    if !TAG_RE.is_match(tag) {
        bail!("invalid release tag: {tag:?}");
    }
    Ok(())
}

/// Recognised archive flavors.
pub fn validate_archive_format(format: &str) -> Result<()> {
    match format {
        "zip" | "tar.gz" => Ok(()),
        other => bail!("unsupported archive format: {other:?}"),
    }
}

/// True when the ref is effectively immutable: a full commit id or a
/// `refs/tags/...` path. Used by handlers to pick longer TTLs.
pub fn is_immutable_ref(reference: &str) -> bool {
    SHA_RE.is_match(reference) || reference.starts_with("refs/tags/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_shapes() {
        assert!(validate_owner("octocat").is_ok());
        assert!(validate_owner("a").is_ok());
        assert!(validate_owner("ZhiShengYuan").is_ok());
        assert!(validate_owner("my-org-42").is_ok());

        assert!(validate_owner("").is_err());
        assert!(validate_owner("-leading").is_err());
        assert!(validate_owner("trailing-").is_err());
        assert!(validate_owner("has_underscore").is_err());
        assert!(validate_owner(&"a".repeat(40)).is_err());
    }

    #[test]
    fn repo_shapes() {
        assert!(validate_repo("Hello-World").is_ok());
        assert!(validate_repo("inningbo-go").is_ok());
        assert!(validate_repo("my.repo_v2").is_ok());

        assert!(validate_repo("").is_err());
        assert!(validate_repo(".hidden").is_err());
        assert!(validate_repo("ends.").is_err());
        assert!(validate_repo("has space").is_err());
        assert!(validate_repo(&"r".repeat(101)).is_err());
    }

    #[test]
    fn ref_shapes() {
        assert!(validate_ref("main").is_ok());
        assert!(validate_ref("refs/heads/main").is_ok());
        assert!(validate_ref("refs/tags/v1.0.0").is_ok());
        assert!(validate_ref("feature/nested/branch").is_ok());
        assert!(validate_ref(&"a".repeat(40)).is_ok());
        assert!(validate_ref("da39a3ee5e6b4b0d3255bfef95601890afd80709").is_ok());

        assert!(validate_ref("").is_err());
        assert!(validate_ref("bad..ref").is_err());
        assert!(validate_ref("/leading").is_err());
        assert!(validate_ref("trailing/").is_err());
        assert!(validate_ref("double//slash").is_err());
        assert!(validate_ref("has space").is_err());
    }

    #[test]
    fn gist_shapes() {
        assert!(validate_gist_id("aa5a315d61ae9438b18d1baf46a0c1b1").is_ok());
        assert!(validate_gist_id("short").is_err());
        assert!(validate_gist_id("zz5a315d61ae9438b18d1baf46a0c1b1").is_err());
    }

    #[test]
    fn tag_shapes() {
        assert!(validate_release_tag("v1.2.3").is_ok());
        assert!(validate_release_tag("release/2024-01").is_ok());
        assert!(validate_release_tag("1.0.0+build.5").is_ok());
        assert!(validate_release_tag("").is_err());
        assert!(validate_release_tag("bad tag").is_err());
    }

    #[test]
    fn archive_formats() {
        assert!(validate_archive_format("zip").is_ok());
        assert!(validate_archive_format("tar.gz").is_ok());
        assert!(validate_archive_format("rar").is_err());
        assert!(validate_archive_format("tar.bz2").is_err());
    }

    #[test]
    fn immutable_refs() {
        assert!(is_immutable_ref("da39a3ee5e6b4b0d3255bfef95601890afd80709"));
        assert!(is_immutable_ref("refs/tags/v1.0.0"));
        assert!(!is_immutable_ref("main"));
        assert!(!is_immutable_ref("refs/heads/main"));
    }
}
