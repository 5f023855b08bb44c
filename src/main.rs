mod auth;
mod cache;
mod config;
mod dispatch;
mod http;
mod metrics;
mod middleware;
mod origin;
mod outbound;
mod ratelimit;
mod security;
mod ssh;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::AuthCache;
use crate::cache::Cache;
use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::ratelimit::RateLimiter;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "hubproxy", about = "Caching reverse proxy for GitHub")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/hubproxy/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub cache: Arc<Cache>,
    pub rate_limiter: Arc<RateLimiter>,
    pub auth_cache: Arc<AuthCache>,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::create_router(Arc::new(state.clone()));

    let listen_addr: SocketAddr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.http_port
    )
    .parse()
    .context("invalid server.host / server.http_port")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    init_tracing(&config);
    tracing::info!(config_path = %cli.config, "starting hubproxy");

    // ---- Outbound client ----
    let http_client =
        outbound::build_client(&config.proxy).context("failed to build outbound client")?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Cache ----
    let cache = Cache::new(&config.cache)
        .await
        .context("failed to initialise cache")?;
    cache.spawn_sweeper();

    // ---- Rate limiter ----
    let rate_limiter = Arc::new(RateLimiter::new(&config.ratelimit));
    rate_limiter.spawn_sweeper();

    // ---- Auth cache ----
    let auth_cache = Arc::new(AuthCache::new(&config.auth));
    auth_cache.spawn_sweeper();

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        http_client,
        cache,
        rate_limiter,
        auth_cache,
        metrics,
    };

    // ---- Spawn services ----
    let http_handle = tokio::spawn({
        let s = state.clone();
        async move {
            if let Err(e) = run_http_server(s).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        }
    });

    let ssh_handle = tokio::spawn({
        let s = state.clone();
        async move {
            if !s.config.ssh.enabled {
                tracing::info!("SSH server disabled by configuration");
                return;
            }
            if let Err(e) = ssh::start_ssh_server(Arc::new(s)).await {
                tracing::error!(error = %e, "SSH server failed");
            }
        }
    });

    // ---- Await shutdown ----
    // Each service observes the shutdown signal through its own
    // shutdown_signal() future and winds down independently.
    let _ = tokio::try_join!(http_handle, ssh_handle);

    tracing::info!("hubproxy shut down cleanly");
    Ok(())
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// Build an [`AppState`] for tests, pointing the disk cache at a fresh
/// temporary directory unless the config names one.
#[cfg(test)]
pub(crate) async fn test_state(mut config: Config) -> AppState {
    use rand::Rng;

    if config.cache.disk_path == "./cache" {
        let dir = std::env::temp_dir().join(format!(
            "hubproxy-test-{:08x}",
            rand::thread_rng().gen::<u32>()
        ));
        config.cache.disk_path = dir.to_string_lossy().into_owned();
    }
    let config = Arc::new(config);
    AppState {
        http_client: outbound::build_client(&config.proxy).expect("test client"),
        cache: Cache::new(&config.cache).await.expect("test cache"),
        rate_limiter: Arc::new(RateLimiter::new(&config.ratelimit)),
        auth_cache: Arc::new(AuthCache::new(&config.auth)),
        metrics: MetricsRegistry::new(),
        config,
    }
}
