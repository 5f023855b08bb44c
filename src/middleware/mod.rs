//! Request pipeline middleware.
//!
//! Applied outermost-first: recovery, logging, metrics, real-IP resolution,
//! security headers, rate limiting, then the optional auth gate. Handlers
//! therefore always observe a resolved [`ClientIp`] extension and run behind
//! the gates.

pub mod auth;
pub mod logging;
pub mod metrics;
pub mod ratelimit;
pub mod realip;
pub mod recovery;
pub mod security_headers;

use std::net::IpAddr;

/// Resolved client address, inserted into request extensions by
/// [`realip::middleware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);
