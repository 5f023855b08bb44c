//! Upstream destination policy.
//!
//! An upstream URL is fetchable only when its scheme is HTTP(S), its host is
//! in the suffix-matched allow-list, and no address it resolves to falls in a
//! private range. Resolution uses the platform resolver, so a poisoned DNS
//! answer pointing at an internal address is caught here too.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::warn;

use crate::config::SecurityConfig;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum PolicyError {
    /// Scheme is not `http` or `https`.
    SchemeNotHttp(String),
    /// Host is absent or not covered by the allow-list.
    HostNotAllowed(String),
    /// At least one resolved address is private, loopback or link-local.
    ResolvesPrivate(String, IpAddr),
    /// Host appears in the configured block list.
    HostBlocked(String, IpAddr),
    /// Resolution failed.
    Dns(String),
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::SchemeNotHttp(s) => {
                write!(f, "invalid URL scheme {s:?} (only http and https are allowed)")
            }
            PolicyError::HostNotAllowed(h) => {
                write!(f, "host {h:?} is not an allowed upstream domain")
            }
            PolicyError::ResolvesPrivate(h, ip) => {
                write!(f, "host {h:?} resolves to private address {ip}")
            }
            PolicyError::HostBlocked(h, ip) => {
                write!(f, "host {h:?} resolves to blocked address {ip}")
            }
            PolicyError::Dns(h) => write!(f, "failed to resolve host {h:?}"),
        }
    }
}

impl std::error::Error for PolicyError {}

// ---------------------------------------------------------------------------
// Validation entry point
// ---------------------------------------------------------------------------

/// Validate an upstream URL against the destination policy.
///
/// Returns `Ok(())` when the URL may be fetched. Resolution is skipped when
/// `block_private_ips` is disabled; the allow-list check always runs while
/// SSRF protection is enabled.
pub async fn validate_upstream_url(url: &str, config: &SecurityConfig) -> Result<(), PolicyError> {
    if !config.enable_ssrf_protection {
        return Ok(());
    }

    let (scheme, rest) = match url.split_once("://") {
        Some((s, r)) => (s, r),
        None => return Err(PolicyError::SchemeNotHttp(String::new())),
    };
    if scheme != "http" && scheme != "https" {
        return Err(PolicyError::SchemeNotHttp(scheme.to_string()));
    }

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = strip_port(authority);
    if host.is_empty() {
        return Err(PolicyError::HostNotAllowed(String::new()));
    }

    if !host_allowed(host, &config.allowed_domains) {
        return Err(PolicyError::HostNotAllowed(host.to_string()));
    }

    // A host that is itself an IP literal bypasses DNS, so check it directly.
    if let Ok(ip) = host.parse::<IpAddr>() {
        return check_ip(host, ip, config);
    }

    if !config.block_private_ips && config.blocked_ips.is_empty() {
        return Ok(());
    }

    let addrs = tokio::net::lookup_host((host, 443))
        .await
        .map_err(|e| {
            warn!(host, error = %e, "destination resolution failed");
            PolicyError::Dns(host.to_string())
        })?
        .collect::<Vec<_>>();

    if addrs.is_empty() {
        return Err(PolicyError::Dns(host.to_string()));
    }

    for addr in addrs {
        check_ip(host, addr.ip(), config)?;
    }

    Ok(())
}

fn check_ip(host: &str, ip: IpAddr, config: &SecurityConfig) -> Result<(), PolicyError> {
    if config
        .blocked_ips
        .iter()
        .any(|blocked| blocked.parse::<IpAddr>().is_ok_and(|b| b == ip))
    {
        return Err(PolicyError::HostBlocked(host.to_string(), ip));
    }
    if config.block_private_ips && is_private_ip(ip) {
        return Err(PolicyError::ResolvesPrivate(host.to_string(), ip));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A hostname matches the allow-list when it equals an entry or is a
/// subdomain of one.
pub fn host_allowed(host: &str, allowed: &[String]) -> bool {
    let host = host.to_ascii_lowercase();
    allowed.iter().any(|domain| {
        let domain = domain.to_ascii_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    })
}

/// Strip a trailing `:port` from an authority, leaving IPv6 literals intact.
fn strip_port(authority: &str) -> &str {
    if let Some(stripped) = authority.strip_prefix('[') {
        return stripped.split(']').next().unwrap_or_default();
    }
    authority.split(':').next().unwrap_or_default()
}

/// Loopback, link-local, unique-local and RFC1918/ULA ranges.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_v4(v4);
            }
            is_private_v6(v6)
        }
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()              // 127.0.0.0/8
        || ip.is_private()        // 10/8, 172.16/12, 192.168/16
        || ip.is_link_local()     // 169.254.0.0/16
        || ip.is_unspecified()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    ip.is_loopback()
        || ip.is_unspecified()
        || (ip.segments()[0] & 0xfe00) == 0xfc00 // fc00::/7 unique-local
        || (ip.segments()[0] & 0xffc0) == 0xfe80 // fe80::/10 link-local
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;

    fn config() -> SecurityConfig {
        SecurityConfig::default()
    }

    #[test]
    fn allowed_hosts_match_suffixes() {
        let allowed = config().allowed_domains;
        assert!(host_allowed("github.com", &allowed));
        assert!(host_allowed("api.github.com", &allowed));
        assert!(host_allowed("codeload.github.com", &allowed));
        assert!(host_allowed("gist.githubusercontent.com", &allowed));
        assert!(!host_allowed("example.com", &allowed));
        assert!(!host_allowed("notgithub.com", &allowed));
        assert!(!host_allowed("github.com.evil.net", &allowed));
    }

    #[test]
    fn private_ranges_are_detected() {
        for ip in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.9",
            "192.168.1.1",
            "169.254.10.10",
            "::1",
            "fc00::1",
            "fe80::1",
        ] {
            assert!(is_private_ip(ip.parse().unwrap()), "{ip} should be private");
        }
        for ip in ["140.82.112.3", "2606:50c0:8000::153", "8.8.8.8"] {
            assert!(!is_private_ip(ip.parse().unwrap()), "{ip} should be public");
        }
    }

    #[tokio::test]
    async fn rejects_bad_scheme() {
        let err = validate_upstream_url("ftp://github.com/x", &config())
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::SchemeNotHttp(_)));
    }

    #[tokio::test]
    async fn rejects_missing_scheme() {
        let err = validate_upstream_url("github.com/x", &config())
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::SchemeNotHttp(_)));
    }

    #[tokio::test]
    async fn rejects_unlisted_host_before_resolution() {
        let err = validate_upstream_url("https://internal.service.local/x", &config())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PolicyError::HostNotAllowed("internal.service.local".to_string())
        );
    }

    #[tokio::test]
    async fn rejects_loopback_literal_even_when_allow_listed() {
        let mut cfg = config();
        cfg.allowed_domains.push("127.0.0.1".to_string());
        let err = validate_upstream_url("https://127.0.0.1/x", &cfg)
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::ResolvesPrivate(_, _)));
    }

    #[tokio::test]
    async fn disabled_protection_allows_anything() {
        let mut cfg = config();
        cfg.enable_ssrf_protection = false;
        validate_upstream_url("https://127.0.0.1/x", &cfg)
            .await
            .unwrap();
    }

    #[test]
    fn strip_port_handles_forms() {
        assert_eq!(strip_port("github.com"), "github.com");
        assert_eq!(strip_port("github.com:443"), "github.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
    }
}
