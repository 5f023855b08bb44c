//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::Server;
use russh::{server, MethodSet};
use russh_keys::key::KeyPair;
use tracing::{info, warn};

use super::session::SshSession;
use crate::AppState;

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Top-level SSH server that hands each incoming connection to an
/// [`SshSession`] handler and tracks the in-flight session count for
/// bounded-drain shutdown.
pub struct SshServer {
    state: Arc<AppState>,
    active: Arc<AtomicUsize>,
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = ?peer_addr, "new SSH client connection");
        self.state.metrics.metrics.ssh_sessions.inc();
        self.state.metrics.metrics.ssh_active_sessions.inc();
        SshSession::new(Arc::clone(&self.state), peer_addr, Arc::clone(&self.active))
    }
}

// ---------------------------------------------------------------------------
// Host key
// ---------------------------------------------------------------------------

/// Load the PEM host key from the configured path, generating an ephemeral
/// Ed25519 key when no path is set. A configured-but-unreadable key is an
/// error rather than a silent downgrade.
fn load_or_generate_host_key(path: &str) -> Result<KeyPair> {
    if path.is_empty() {
        info!("no ssh.host_key_file configured; generating ephemeral Ed25519 host key");
        return Ok(KeyPair::generate_ed25519());
    }
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read SSH host key: {path}"))?;
    russh_keys::decode_secret_key(&pem, None)
        .with_context(|| format!("failed to decode SSH host key: {path}"))
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Start the SSH listener and serve until shutdown. On the shutdown signal
/// the listener stops accepting, in-flight sessions get
/// `ssh.shutdown_grace` to finish, and whatever remains is aborted.
pub async fn start_ssh_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr: SocketAddr = state.config.ssh.listen.parse().with_context(|| {
        format!("invalid SSH listen address: {:?}", state.config.ssh.listen)
    })?;

    let host_key = load_or_generate_host_key(&state.config.ssh.host_key_file)?;

    let mut methods = MethodSet::empty();
    if state.config.ssh.enable_password {
        methods |= MethodSet::PASSWORD;
    }
    if state.config.ssh.enable_pubkey {
        methods |= MethodSet::PUBLICKEY;
    }

    let config = Arc::new(server::Config {
        server_id: russh::SshId::Standard(format!(
            "SSH-2.0-hubproxy_{}",
            env!("CARGO_PKG_VERSION")
        )),
        keys: vec![host_key],
        methods,
        inactivity_timeout: Some(Duration::from_secs(600)),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: 3,
        ..Default::default()
    });

    info!(address = %listen_addr, "SSH server listening");

    let active = Arc::new(AtomicUsize::new(0));
    let mut ssh_server = SshServer {
        state: Arc::clone(&state),
        active: Arc::clone(&active),
    };

    let mut run = tokio::spawn(async move {
        ssh_server
            .run_on_address(config, listen_addr)
            .await
            .context("SSH server exited with error")
    });

    tokio::select! {
        result = &mut run => {
            return result.map_err(|e| anyhow::anyhow!("SSH server task panicked: {e}"))?;
        }
        () = crate::shutdown_signal() => {
            info!("SSH server shutting down");
        }
    }

    // Bounded drain: give in-flight pack transfers a chance to finish.
    let grace = state.config.ssh.shutdown_grace;
    let deadline = tokio::time::Instant::now() + grace;
    while active.load(Ordering::Relaxed) > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    let leftover = active.load(Ordering::Relaxed);
    if leftover > 0 {
        warn!(sessions = leftover, "forcibly closing SSH sessions after grace period");
    }
    run.abort();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_key_when_unconfigured() {
        load_or_generate_host_key("").unwrap();
    }

    #[test]
    fn missing_configured_key_is_an_error() {
        assert!(load_or_generate_host_key("/nonexistent/hubproxy-host-key").is_err());
    }
}
