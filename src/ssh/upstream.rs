//! Outbound SSH leg and the bidirectional bridge.
//!
//! For each accepted `exec` the proxy dials the origin SSH endpoint as the
//! canonical git user, issues the same Git command against
//! `<owner>/<repo>.git` and splices the streams: client stdin copies into the
//! origin's stdin, origin stdout copies back to the client. End-of-stream on
//! either side half-closes the opposite write side so the pack protocol can
//! finish; a copy error tears the whole session down with a non-zero
//! exit-status.
//!
//! Authorisation of this hop is not the tunnel's concern: Git-level auth
//! rides inside the stream, so the connection is made with `none`
//! authentication. Host-key verification is pinned by default.

use std::sync::Arc;

use anyhow::{Context, Result};
use russh::client;
use russh::CryptoVec;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::session::GitService;
use crate::config::HostKeyVerification;
use crate::AppState;

/// Client-to-origin traffic, fed by the server-side session handler.
#[derive(Debug)]
pub enum BridgeInput {
    Data(Vec<u8>),
    Eof,
}

// ---------------------------------------------------------------------------
// Origin host-key policy
// ---------------------------------------------------------------------------

struct OriginHandler {
    verification: HostKeyVerification,
    pins: Vec<String>,
}

#[async_trait::async_trait]
impl client::Handler for OriginHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.verification {
            HostKeyVerification::InsecureAcceptAny => Ok(true),
            HostKeyVerification::Pinned => {
                let presented = server_public_key.public_key_base64();
                let ok = key_is_pinned(&self.pins, &presented);
                if !ok {
                    warn!(
                        fingerprint = %server_public_key.fingerprint(),
                        "origin host key is not in ssh.known_host_keys"
                    );
                }
                Ok(ok)
            }
        }
    }
}

/// A pin entry may be the bare base64 blob or a full
/// `ssh-ed25519 AAAA... comment` known-hosts style line.
fn key_is_pinned(pins: &[String], presented: &str) -> bool {
    pins.iter().any(|pin| {
        pin.trim() == presented || pin.split_whitespace().any(|field| field == presented)
    })
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Run the tunnel for one exec request and report its outcome to the client
/// channel. Never propagates an error upward: failures become an stderr line
/// plus `exit-status 1`.
pub async fn run_bridge(
    state: Arc<AppState>,
    handle: russh::server::Handle,
    channel_id: russh::ChannelId,
    service: GitService,
    owner: String,
    repo: String,
    rx: mpsc::Receiver<BridgeInput>,
) {
    match bridge(&state, &handle, channel_id, service, &owner, &repo, rx).await {
        Ok(status) => {
            debug!(%owner, %repo, status, "SSH bridge finished");
            let _ = handle.exit_status_request(channel_id, status).await;
            let _ = handle.close(channel_id).await;
        }
        Err(e) => {
            warn!(%owner, %repo, error = %e, "SSH bridge failed");
            let _ = handle
                .extended_data(
                    channel_id,
                    1,
                    CryptoVec::from_slice(format!("ERROR: {e}\r\n").as_bytes()),
                )
                .await;
            let _ = handle.exit_status_request(channel_id, 1).await;
            let _ = handle.close(channel_id).await;
        }
    }
}

async fn bridge(
    state: &AppState,
    handle: &russh::server::Handle,
    channel_id: russh::ChannelId,
    service: GitService,
    owner: &str,
    repo: &str,
    mut rx: mpsc::Receiver<BridgeInput>,
) -> Result<u32> {
    let ssh_config = &state.config.ssh;

    // ---- dial the origin ----
    let client_config = Arc::new(client::Config::default());
    let origin_handler = OriginHandler {
        verification: ssh_config.host_key_verification,
        pins: ssh_config.known_host_keys.clone(),
    };

    let mut origin = client::connect(
        client_config,
        (ssh_config.upstream_host.as_str(), ssh_config.upstream_port),
        origin_handler,
    )
    .await
    .with_context(|| {
        format!(
            "failed to reach origin SSH host {}:{}",
            ssh_config.upstream_host, ssh_config.upstream_port
        )
    })?;

    let authenticated = origin
        .authenticate_none(ssh_config.upstream_user.as_str())
        .await
        .context("origin SSH authentication errored")?;
    anyhow::ensure!(
        authenticated,
        "origin SSH endpoint refused the tunnel connection"
    );

    // ---- issue the command ----
    let mut channel = origin
        .channel_open_session()
        .await
        .context("failed to open session channel to origin")?;
    let command = format!("{} '{owner}/{repo}.git'", service.as_str());
    info!(%command, "running Git command on origin");
    channel
        .exec(true, command.as_str())
        .await
        .context("failed to start Git command on origin")?;

    // ---- splice ----
    // One copy per direction. The write half carries client stdin to the
    // origin and shuts down on client EOF so the origin can finish the pack;
    // the read half carries origin stdout back and half-closes the client's
    // side when the origin is done.
    let (mut origin_out, mut origin_in) = tokio::io::split(channel.into_stream());

    let writer = tokio::spawn(async move {
        while let Some(input) = rx.recv().await {
            match input {
                BridgeInput::Data(bytes) => {
                    origin_in.write_all(&bytes).await?;
                }
                BridgeInput::Eof => break,
            }
        }
        // Either client EOF or the session handler going away: half-close.
        origin_in.shutdown().await?;
        Ok::<(), std::io::Error>(())
    });

    let mut buf = vec![0u8; 32 * 1024];
    let mut copy_error: Option<anyhow::Error> = None;
    loop {
        match origin_out.read(&mut buf).await {
            Ok(0) => {
                let _ = handle.eof(channel_id).await;
                break;
            }
            Ok(n) => {
                if handle
                    .data(channel_id, CryptoVec::from_slice(&buf[..n]))
                    .await
                    .is_err()
                {
                    copy_error = Some(anyhow::anyhow!("client connection dropped mid-transfer"));
                    break;
                }
            }
            Err(e) => {
                copy_error = Some(anyhow::Error::from(e).context("read from origin failed"));
                break;
            }
        }
    }

    if let Some(e) = copy_error {
        writer.abort();
        return Err(e);
    }

    match writer.await {
        Ok(Ok(())) => Ok(0),
        Ok(Err(e)) => Err(anyhow::Error::from(e).context("write to origin failed")),
        Err(e) => Err(anyhow::anyhow!("bridge writer task failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
