use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub ssh: SshConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP listener.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Optional path prefix for all proxy routes (e.g. `/ghproxy`).
    /// `/health` and `/metrics` are always registered at the root as well.
    #[serde(default)]
    pub base_path: String,
    #[serde(default = "default_read_timeout", with = "secs")]
    pub read_timeout: Duration,
    #[serde(default = "default_write_timeout", with = "secs")]
    pub write_timeout: Duration,
    #[serde(default = "default_idle_timeout", with = "secs")]
    pub idle_timeout: Duration,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    #[serde(default = "default_shutdown_timeout", with = "secs")]
    pub shutdown_timeout: Duration,
    /// TLS key material. Parsed and validated so deployment configs can carry
    /// them; termination happens in front of the binary.
    #[serde(default)]
    pub tls_cert_file: String,
    #[serde(default)]
    pub tls_key_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty server config")
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_max_header_bytes() -> usize {
    1 << 20
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

// ---------------------------------------------------------------------------
// Outbound proxy transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Transport for upstream connections.
    #[serde(default)]
    pub r#type: ProxyType,
    /// Proxy server address (`host:port`).
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Overall per-request timeout.
    #[serde(default = "default_proxy_timeout", with = "secs")]
    pub timeout: Duration,
    #[serde(default = "default_dial_timeout", with = "secs")]
    pub dial_timeout: Duration,
    #[serde(default = "default_keep_alive", with = "secs")]
    pub keep_alive: Duration,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,
    #[serde(default = "default_max_idle_conns_per_host")]
    pub max_idle_conns_per_host: usize,
    #[serde(default = "default_idle_conn_timeout", with = "secs")]
    pub idle_conn_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty proxy config")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Socks5,
    Http,
    #[default]
    None,
}

fn default_proxy_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_max_idle_conns() -> usize {
    100
}

fn default_max_idle_conns_per_host() -> usize {
    10
}

fn default_idle_conn_timeout() -> Duration {
    Duration::from_secs(90)
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub r#type: CacheType,
    /// Ceiling for the memory tier in bytes.
    #[serde(default = "default_max_memory_size")]
    pub max_memory_size: u64,
    /// Ceiling for the memory tier in entries. 0 derives a bound from
    /// `max_memory_size`.
    #[serde(default)]
    pub max_memory_entries: usize,
    #[serde(default = "default_max_disk_size")]
    pub max_disk_size: u64,
    #[serde(default = "default_disk_path")]
    pub disk_path: String,
    /// Default TTL for entries whose handler does not pick a sharper one.
    #[serde(default = "default_cache_ttl", with = "secs")]
    pub ttl: Duration,
    #[serde(default = "default_cleanup_interval", with = "secs")]
    pub cleanup_interval: Duration,
    /// Accepted for config compatibility; bodies are stored in wire form so
    /// cached replays stay byte-identical.
    #[serde(default)]
    pub enable_compression: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty cache config")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Memory,
    Disk,
    #[default]
    Hybrid,
}

fn bool_true() -> bool {
    true
}

fn default_max_memory_size() -> u64 {
    100 * 1024 * 1024
}

fn default_max_disk_size() -> u64 {
    1024 * 1024 * 1024
}

fn default_disk_path() -> String {
    "./cache".to_string()
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(300)
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default)]
    pub strategy: RateLimitStrategy,
    #[serde(default = "default_rl_cleanup_interval", with = "secs")]
    pub cleanup_interval: Duration,
    /// Buckets idle for longer than this are evicted by the sweeper.
    #[serde(default = "default_idle_eviction", with = "secs")]
    pub idle_eviction: Duration,
    #[serde(default = "default_ban_duration", with = "secs")]
    pub ban_duration: Duration,
    #[serde(default = "default_ban_threshold")]
    pub ban_threshold: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty ratelimit config")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitStrategy {
    #[default]
    Ip,
    Token,
    Both,
}

fn default_requests_per_second() -> u32 {
    100
}

fn default_burst() -> u32 {
    200
}

fn default_rl_cleanup_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_idle_eviction() -> Duration {
    Duration::from_secs(1800)
}

fn default_ban_duration() -> Duration {
    Duration::from_secs(3600)
}

fn default_ban_threshold() -> u32 {
    1000
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub r#type: AuthType,
    /// Static tokens accepted without an upstream round-trip.
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default = "default_token_header")]
    pub token_header: String,
    #[serde(default = "bool_true")]
    pub allow_anonymous: bool,
    /// Path prefixes that always require credentials, even when anonymous
    /// access is otherwise allowed.
    #[serde(default)]
    pub require_auth: Vec<String>,
    /// Lifetime of a cached validation verdict.
    #[serde(default = "default_verdict_ttl", with = "secs")]
    pub verdict_ttl: Duration,
    #[serde(default = "default_auth_cleanup_interval", with = "secs")]
    pub cleanup_interval: Duration,
    /// Server-held token attached to outbound API requests as
    /// `Authorization: token <t>`. Raises the origin's rate budget.
    #[serde(default)]
    pub upstream_token: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty auth config")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    Token,
    Basic,
    Both,
}

fn default_token_header() -> String {
    "X-Auth-Token".to_string()
}

fn default_verdict_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_auth_cleanup_interval() -> Duration {
    Duration::from_secs(600)
}

// ---------------------------------------------------------------------------
// Security
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "bool_true")]
    pub enable_ssrf_protection: bool,
    /// Suffix-matched allow-list for upstream hosts. A hostname matches when
    /// it equals an entry or is a subdomain of one.
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub blocked_ips: Vec<String>,
    #[serde(default = "bool_true")]
    pub block_private_ips: bool,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: u64,
    #[serde(default)]
    pub enable_cors: bool,
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
    #[serde(default)]
    pub enable_hsts: bool,
    #[serde(default = "default_hsts_max_age")]
    pub hsts_max_age: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty security config")
    }
}

fn default_allowed_domains() -> Vec<String> {
    [
        crate::origin::MAIN_HOST,
        crate::origin::API_HOST,
        crate::origin::RAW_HOST,
        "githubusercontent.com",
        crate::origin::GIST_HOST,
        crate::origin::CODELOAD_HOST,
        crate::origin::OBJECTS_HOST,
        "avatars.githubusercontent.com",
        "github.io",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_max_request_size() -> u64 {
    100 * 1024 * 1024
}

fn default_hsts_max_age() -> u64 {
    31_536_000
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
    #[serde(default = "default_metrics_namespace")]
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty metrics config")
    }
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_metrics_namespace() -> String {
    "hubproxy".to_string()
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `json` or `text`.
    #[serde(default = "default_log_format")]
    pub format: String,
    /// `stdout` or `file`.
    #[serde(default = "default_log_output")]
    pub output: String,
    #[serde(default)]
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty logging config")
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

// ---------------------------------------------------------------------------
// SSH tunnel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Socket address for the SSH listener (e.g. `0.0.0.0:2222`).
    #[serde(default = "default_ssh_listen")]
    pub listen: String,
    /// PEM-encoded host key. Generated at startup when empty.
    #[serde(default)]
    pub host_key_file: String,
    #[serde(default = "bool_true")]
    pub enable_password: bool,
    #[serde(default = "bool_true")]
    pub enable_pubkey: bool,
    /// Origin SSH endpoint for the outbound leg.
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,
    /// Canonical git user on the origin.
    #[serde(default = "default_upstream_user")]
    pub upstream_user: String,
    /// Host-key verification for the outbound leg.
    #[serde(default)]
    pub host_key_verification: HostKeyVerification,
    /// Base64-encoded public keys accepted for the origin when verification
    /// is `pinned`.
    #[serde(default)]
    pub known_host_keys: Vec<String>,
    /// How long to wait for in-flight sessions on shutdown before aborting.
    #[serde(default = "default_ssh_shutdown_grace", with = "secs")]
    pub shutdown_grace: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty ssh config")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyVerification {
    #[default]
    Pinned,
    InsecureAcceptAny,
}

fn default_ssh_listen() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_upstream_host() -> String {
    "github.com".to_string()
}

fn default_upstream_port() -> u16 {
    22
}

fn default_upstream_user() -> String {
    "git".to_string()
}

fn default_ssh_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

// ---------------------------------------------------------------------------
// Duration (de)serialization as integer seconds
// ---------------------------------------------------------------------------

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from a YAML file, apply the `HUBPROXY_*` environment
/// overlay, and validate it. A missing file yields the built-in defaults so
/// the binary can start from environment alone.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let mut config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read config file: {}", path.display()))
        }
    };
    apply_env_overlay(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Overlay the operationally relevant keys from `HUBPROXY_*` environment
/// variables. Unset or unparsable values leave the file value in place.
fn apply_env_overlay(config: &mut Config) {
    fn env(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }

    if let Some(v) = env("HUBPROXY_SERVER_HOST") {
        config.server.host = v;
    }
    if let Some(v) = env("HUBPROXY_SERVER_HTTP_PORT").and_then(|v| v.parse().ok()) {
        config.server.http_port = v;
    }
    if let Some(v) = env("HUBPROXY_SERVER_BASE_PATH") {
        config.server.base_path = v;
    }
    if let Some(v) = env("HUBPROXY_PROXY_ADDRESS") {
        config.proxy.address = v;
        config.proxy.enabled = true;
    }
    if let Some(v) = env("HUBPROXY_PROXY_USERNAME") {
        config.proxy.username = v;
    }
    if let Some(v) = env("HUBPROXY_PROXY_PASSWORD") {
        config.proxy.password = v;
    }
    if let Some(v) = env("HUBPROXY_CACHE_DISK_PATH") {
        config.cache.disk_path = v;
    }
    if let Some(v) = env("HUBPROXY_API_TOKEN") {
        config.auth.upstream_token = v;
    }
    if let Some(v) = env("HUBPROXY_SSH_LISTEN") {
        config.ssh.listen = v;
    }
    if let Some(v) = env("HUBPROXY_LOGGING_LEVEL") {
        config.logging.level = v;
    }
}

/// Sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.server.http_port != 0,
        "server.http_port must be non-zero"
    );
    if config.proxy.enabled && config.proxy.r#type != ProxyType::None {
        anyhow::ensure!(
            !config.proxy.address.is_empty(),
            "proxy.address is required when proxy.enabled is true"
        );
    }
    anyhow::ensure!(
        config.ratelimit.requests_per_second > 0,
        "ratelimit.requests_per_second must be positive"
    );
    anyhow::ensure!(
        config.ratelimit.burst > 0,
        "ratelimit.burst must be positive"
    );
    if config.cache.enabled && config.cache.r#type != CacheType::Memory {
        anyhow::ensure!(
            !config.cache.disk_path.is_empty(),
            "cache.disk_path is required for disk-backed cache types"
        );
    }
    if config.server.tls_cert_file.is_empty() != config.server.tls_key_file.is_empty() {
        anyhow::bail!("server.tls_cert_file and server.tls_key_file must be set together");
    }
    match config.logging.level.as_str() {
        "debug" | "info" | "warn" | "error" => {}
        other => anyhow::bail!("unknown logging.level: {other:?}"),
    }
    if config.ssh.enabled
        && config.ssh.host_key_verification == HostKeyVerification::Pinned
        && config.ssh.known_host_keys.is_empty()
    {
        // An empty pin set makes every outbound handshake fail; surface it
        // loudly at startup instead of at first clone.
        tracing::warn!(
            "ssh.known_host_keys is empty with pinned verification; \
             outbound SSH will refuse every origin host key"
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        validate_config(&config).unwrap();
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.cache.r#type, CacheType::Hybrid);
        assert_eq!(config.ratelimit.requests_per_second, 100);
        assert!(config.auth.allow_anonymous);
        assert_eq!(config.ssh.upstream_host, "github.com");
        assert_eq!(config.ssh.upstream_user, "git");
    }

    #[test]
    fn parses_full_yaml() {
        let yaml = r#"
server:
  host: 127.0.0.1
  http_port: 9099
  base_path: /ghproxy
  read_timeout: 15
proxy:
  enabled: true
  type: socks5
  address: 127.0.0.1:1080
  username: u
  password: p
cache:
  type: hybrid
  max_memory_size: 1048576
  disk_path: /tmp/hubproxy-cache
  ttl: 600
ratelimit:
  requests_per_second: 2
  burst: 3
auth:
  enabled: true
  allow_anonymous: false
ssh:
  listen: 0.0.0.0:2222
  host_key_verification: insecure-accept-any
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.server.base_path, "/ghproxy");
        assert_eq!(config.server.read_timeout, Duration::from_secs(15));
        assert_eq!(config.proxy.r#type, ProxyType::Socks5);
        assert_eq!(config.cache.ttl, Duration::from_secs(600));
        assert_eq!(config.ratelimit.burst, 3);
        assert!(!config.auth.allow_anonymous);
        assert_eq!(
            config.ssh.host_key_verification,
            HostKeyVerification::InsecureAcceptAny
        );
    }

    #[test]
    fn proxy_enabled_without_address_is_rejected() {
        let yaml = r#"
proxy:
  enabled: true
  type: http
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn tls_files_must_come_in_pairs() {
        let yaml = r#"
server:
  tls_cert_file: /etc/hubproxy/cert.pem
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let yaml = r#"
logging:
  level: verbose
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn allowed_domains_default_covers_origin_family() {
        let config = Config::default();
        for host in [
            "github.com",
            "raw.githubusercontent.com",
            "api.github.com",
            "gist.github.com",
            "codeload.github.com",
            "objects.githubusercontent.com",
        ] {
            assert!(
                config.security.allowed_domains.iter().any(|d| d == host),
                "missing {host}"
            );
        }
    }
}
