//! Real client IP resolution.
//!
//! Proxied deployments put the caller's address in a forwarding header;
//! direct deployments only have the peer address. Precedence: `X-Real-IP`,
//! first hop of `X-Forwarded-For`, `CF-Connecting-IP`, `True-Client-IP`,
//! then the TCP peer.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use super::ClientIp;

pub async fn middleware(mut req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());
    let ip = resolve(req.headers(), peer);
    req.extensions_mut().insert(ClientIp(ip));
    next.run(req).await
}

/// Resolve the client IP from forwarding headers, falling back to the peer
/// address and finally to the unspecified address.
pub fn resolve(headers: &HeaderMap, peer: Option<IpAddr>) -> IpAddr {
    for name in ["x-real-ip", "x-forwarded-for", "cf-connecting-ip", "true-client-ip"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let candidate = if name == "x-forwarded-for" {
                value.split(',').next().unwrap_or_default()
            } else {
                value
            };
            if let Some(ip) = parse_ip(candidate) {
                return ip;
            }
        }
    }
    peer.unwrap_or(IpAddr::from([0, 0, 0, 0]))
}

/// Parse an IP from a header value, tolerating a `:port` suffix and IPv6
/// brackets.
fn parse_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    raw.trim_matches(['[', ']']).parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn x_real_ip_wins() {
        let h = headers(&[
            ("x-real-ip", "203.0.113.7"),
            ("x-forwarded-for", "198.51.100.1"),
        ]);
        assert_eq!(resolve(&h, None), "203.0.113.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn forwarded_for_takes_first_hop() {
        let h = headers(&[("x-forwarded-for", "198.51.100.1, 10.0.0.1, 172.16.0.1")]);
        assert_eq!(resolve(&h, None), "198.51.100.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn cdn_headers_are_consulted() {
        let h = headers(&[("cf-connecting-ip", "203.0.113.9")]);
        assert_eq!(resolve(&h, None), "203.0.113.9".parse::<IpAddr>().unwrap());
        let h = headers(&[("true-client-ip", "203.0.113.10")]);
        assert_eq!(resolve(&h, None), "203.0.113.10".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn invalid_header_falls_through_to_peer() {
        let h = headers(&[("x-real-ip", "not-an-ip")]);
        let peer: IpAddr = "192.0.2.4".parse().unwrap();
        assert_eq!(resolve(&h, Some(peer)), peer);
    }

    #[test]
    fn port_and_brackets_are_tolerated() {
        let h = headers(&[("x-real-ip", "203.0.113.7:4711")]);
        assert_eq!(resolve(&h, None), "203.0.113.7".parse::<IpAddr>().unwrap());
        let h = headers(&[("x-real-ip", "[2001:db8::1]:443")]);
        assert_eq!(resolve(&h, None), "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn no_headers_no_peer_is_unspecified() {
        assert_eq!(resolve(&HeaderMap::new(), None), IpAddr::from([0, 0, 0, 0]));
    }
}
