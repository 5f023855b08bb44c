//! Outbound HTTP client construction.
//!
//! One long-lived `reqwest::Client` is built at startup; its transport is
//! fixed by configuration to direct, SOCKS5 or HTTP CONNECT and never changes
//! afterwards. Timeouts and pool sizes have no per-request overrides, and
//! errors from dial/handshake/read are surfaced to callers unchanged.

use anyhow::{Context, Result};
use reqwest::redirect::Policy;

use crate::config::{ProxyConfig, ProxyType};

/// Hard cap on followed redirects, matching the upstream CDN hop count we
/// ever expect (release assets and archives redirect once or twice).
const MAX_REDIRECTS: usize = 10;

/// Fixed outbound identifier used when the client supplies no User-Agent.
pub const USER_AGENT: &str = concat!("hubproxy/", env!("CARGO_PKG_VERSION"));

/// Build the shared outbound client from the proxy configuration.
pub fn build_client(config: &ProxyConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(Policy::limited(MAX_REDIRECTS))
        .timeout(config.timeout)
        .connect_timeout(config.dial_timeout)
        .tcp_keepalive(config.keep_alive)
        .pool_idle_timeout(config.idle_conn_timeout)
        .pool_max_idle_per_host(config.max_idle_conns_per_host);

    let transport = if config.enabled {
        config.r#type
    } else {
        ProxyType::None
    };

    builder = match transport {
        ProxyType::None => builder.no_proxy(),
        ProxyType::Socks5 => {
            let proxy = reqwest::Proxy::all(proxy_url("socks5", config)?)
                .context("invalid SOCKS5 proxy address")?;
            builder.proxy(apply_proxy_auth(proxy, config))
        }
        ProxyType::Http => {
            let proxy = reqwest::Proxy::all(proxy_url("http", config)?)
                .context("invalid HTTP proxy address")?;
            builder.proxy(apply_proxy_auth(proxy, config))
        }
    };

    builder.build().context("failed to build outbound client")
}

fn proxy_url(scheme: &str, config: &ProxyConfig) -> Result<String> {
    anyhow::ensure!(
        !config.address.is_empty(),
        "proxy.address is required for type {scheme}"
    );
    // Addresses are given as host:port; accept a full URL too.
    if config.address.contains("://") {
        Ok(config.address.clone())
    } else {
        Ok(format!("{scheme}://{}", config.address))
    }
}

fn apply_proxy_auth(proxy: reqwest::Proxy, config: &ProxyConfig) -> reqwest::Proxy {
    if config.username.is_empty() {
        proxy
    } else {
        proxy.basic_auth(&config.username, &config.password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    fn base_config() -> ProxyConfig {
        ProxyConfig::default()
    }

    #[test]
    fn direct_client_builds() {
        build_client(&base_config()).unwrap();
    }

    #[test]
    fn disabled_proxy_ignores_type() {
        let mut config = base_config();
        config.r#type = crate::config::ProxyType::Socks5;
        config.enabled = false;
        // No address needed because the transport falls back to direct.
        build_client(&config).unwrap();
    }

    #[test]
    fn socks5_client_builds() {
        let mut config = base_config();
        config.enabled = true;
        config.r#type = crate::config::ProxyType::Socks5;
        config.address = "127.0.0.1:1080".to_string();
        config.username = "user".to_string();
        config.password = "pass".to_string();
        build_client(&config).unwrap();
    }

    #[test]
    fn http_connect_client_builds() {
        let mut config = base_config();
        config.enabled = true;
        config.r#type = crate::config::ProxyType::Http;
        config.address = "proxy.corp.example:3128".to_string();
        build_client(&config).unwrap();
    }

    #[test]
    fn enabled_proxy_without_address_fails() {
        let mut config = base_config();
        config.enabled = true;
        config.r#type = crate::config::ProxyType::Http;
        assert!(build_client(&config).is_err());
    }

    #[test]
    fn full_url_address_is_kept() {
        let url = proxy_url("http", &{
            let mut c = base_config();
            c.address = "http://proxy:8080".to_string();
            c
        })
        .unwrap();
        assert_eq!(url, "http://proxy:8080");
    }
}
