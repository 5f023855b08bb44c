//! Fingerprint-addressed cache keys.
//!
//! A key is a SHA-256 digest over the canonicalized request tuple, so
//! distinct tuples collide only with cryptographic improbability and the hex
//! form is safe as a filename.

use sha2::{Digest, Sha256};

/// Content kind, the first component of every fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Raw,
    Archive,
    Release,
    Gist,
    Api,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Raw => "raw",
            ArtifactKind::Archive => "archive",
            ArtifactKind::Release => "release",
            ArtifactKind::Gist => "gist",
            ArtifactKind::Api => "api",
        }
    }
}

/// Structured cache key. Construction canonicalizes the tuple; `as_hex`
/// yields the address used by both tiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Fingerprint (kind, owner, repo, ref, path-or-filename, flavor).
    ///
    /// Components are joined with a byte that cannot appear in any of them
    /// (`\n`), so `("a", "bc")` and `("ab", "c")` hash differently.
    pub fn new(
        kind: ArtifactKind,
        owner: &str,
        repo: &str,
        reference: &str,
        path: &str,
        flavor: &str,
    ) -> Self {
        let mut hasher = Sha256::new();
        for (i, part) in [kind.as_str(), owner, repo, reference, path, flavor]
            .into_iter()
            .enumerate()
        {
            if i > 0 {
                hasher.update([b'\n']);
            }
            hasher.update(part.as_bytes());
        }
        CacheKey(hex::encode(hasher.finalize()))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Two-character shard prefix for the disk layout, keeping directory
    /// fan-out bounded.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_tuple_same_key() {
        let a = CacheKey::new(ArtifactKind::Raw, "octocat", "Hello-World", "master", "/README", "");
        let b = CacheKey::new(ArtifactKind::Raw, "octocat", "Hello-World", "master", "/README", "");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_tuples_distinct_keys() {
        let base = CacheKey::new(ArtifactKind::Raw, "o", "r", "main", "/f", "");
        let others = [
            CacheKey::new(ArtifactKind::Gist, "o", "r", "main", "/f", ""),
            CacheKey::new(ArtifactKind::Raw, "o2", "r", "main", "/f", ""),
            CacheKey::new(ArtifactKind::Raw, "o", "r2", "main", "/f", ""),
            CacheKey::new(ArtifactKind::Raw, "o", "r", "dev", "/f", ""),
            CacheKey::new(ArtifactKind::Raw, "o", "r", "main", "/g", ""),
            CacheKey::new(ArtifactKind::Raw, "o", "r", "main", "/f", "zip"),
        ];
        for other in others {
            assert_ne!(base, other);
        }
    }

    #[test]
    fn boundary_shifts_change_the_key() {
        let a = CacheKey::new(ArtifactKind::Raw, "ab", "c", "", "", "");
        let b = CacheKey::new(ArtifactKind::Raw, "a", "bc", "", "", "");
        assert_ne!(a, b);
    }

    #[test]
    fn hex_form_is_filename_safe() {
        let key = CacheKey::new(ArtifactKind::Archive, "o", "r", "refs/heads/main", "", "tar.gz");
        assert_eq!(key.as_hex().len(), 64);
        assert!(key.as_hex().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key.shard().len(), 2);
    }
}
