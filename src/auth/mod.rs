//! Credential validation against the upstream user endpoint, with a salted
//! verdict cache.
//!
//! The raw credential never appears as a lookup key: cache entries are keyed
//! by a SHA-256 over a per-process salt and `user:credential`. A cached
//! verdict that has not expired is returned verbatim without re-contacting
//! upstream; an expired one is dropped and the next request re-validates.

pub mod cache;
pub mod validator;

pub use cache::{AuthCache, UpstreamRateLimit, Verdict};
pub use validator::{AuthError, Credentials};
