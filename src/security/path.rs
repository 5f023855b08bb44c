//! Request-path validation.
//!
//! File paths taken from route parameters are never used to address the
//! local filesystem, but they do flow into upstream URLs, so traversal
//! sequences and control bytes are rejected up front.

use anyhow::{bail, Result};

/// Validate a relative file path extracted from a request.
///
/// Rejects empty input, `..` components, absolute prefixes, embedded NUL,
/// consecutive slashes and leading/trailing slashes.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        bail!("path cannot be empty");
    }
    if path.contains('\0') {
        bail!("path contains null byte");
    }
    if path.starts_with('/') || path.starts_with('\\') {
        bail!("absolute paths are not allowed");
    }
    if path.ends_with('/') {
        bail!("path cannot end with a slash");
    }
    if path.contains("//") {
        bail!("path cannot contain consecutive slashes");
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        bail!("path traversal detected");
    }
    Ok(())
}
