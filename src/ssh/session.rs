//! SSH session handler implementing the `russh` server [`Handler`] trait.
//!
//! Each inbound connection is served by a dedicated [`SshSession`]. After
//! authentication the handler accepts exactly one `exec` request carrying a
//! Git transport command, opens the outbound leg to the origin and wires the
//! two together. `shell` and `pty-req` are refused, `env` is accepted and
//! ignored, non-session channels are rejected with `UnknownChannelType`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::upstream::{self, BridgeInput};
use crate::auth::{validator, Credentials};
use crate::origin;
use crate::security::validation;
use crate::AppState;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    state: Arc<AppState>,
    peer_addr: Option<SocketAddr>,
    username: Option<String>,
    /// Sender feeding client stdin bytes into the active bridge.
    bridge_tx: Option<mpsc::Sender<BridgeInput>>,
    active: Arc<AtomicUsize>,
}

impl SshSession {
    pub fn new(
        state: Arc<AppState>,
        peer_addr: Option<SocketAddr>,
        active: Arc<AtomicUsize>,
    ) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self {
            state,
            peer_addr,
            username: None,
            bridge_tx: None,
            active,
        }
    }

    fn reject(&self) -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(MethodSet::PASSWORD | MethodSet::PUBLICKEY),
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.state.metrics.metrics.ssh_active_sessions.dec();
    }
}

// ---------------------------------------------------------------------------
// Git command parsing
// ---------------------------------------------------------------------------

/// The two Git transport commands recognised over SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitService {
    UploadPack,
    ReceivePack,
}

impl GitService {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitService::UploadPack => "git-upload-pack",
            GitService::ReceivePack => "git-receive-pack",
        }
    }
}

/// Parse a Git SSH exec request such as:
///
/// ```text
/// git-upload-pack 'octocat/Hello-World.git'
/// git-receive-pack '/octocat/Hello-World'
/// ```
///
/// Returns the service and the normalised `(owner, repo)` pair: surrounding
/// quotes, leading/trailing slashes and the `.git` suffix are stripped, and
/// both halves must satisfy the owner/repo shape rules.
pub fn parse_git_command(raw: &str) -> Result<(GitService, String, String)> {
    let raw = raw.trim();
    let (service, rest) = if let Some(rest) = raw.strip_prefix("git-upload-pack") {
        (GitService::UploadPack, rest)
    } else if let Some(rest) = raw.strip_prefix("git-receive-pack") {
        (GitService::ReceivePack, rest)
    } else {
        anyhow::bail!("unsupported command: only git-upload-pack and git-receive-pack are allowed");
    };

    let repo_path = rest
        .trim()
        .trim_matches('\'')
        .trim_matches('"')
        .trim_start_matches('/')
        .trim_end_matches('/');
    let repo_path = repo_path.strip_suffix(".git").unwrap_or(repo_path);

    let (owner, repo) = repo_path
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("invalid repository path (expected owner/repo)"))?;
    if repo.contains('/') {
        anyhow::bail!("invalid repository path (expected owner/repo)");
    }
    validation::validate_owner(owner)?;
    validation::validate_repo(repo)?;

    Ok((service, owner.to_string(), repo.to_string()))
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Password authentication: the password is a credential validated the
    /// same way as an HTTP `Authorization` header, through the verdict cache
    /// and the upstream user endpoint.
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if !self.state.config.ssh.enable_password {
            return Ok(self.reject());
        }

        let creds = Credentials {
            username: user.to_string(),
            secret: password.to_string(),
        };
        match validator::validate(
            &self.state.http_client,
            &self.state.auth_cache,
            origin::API_USER_URL,
            &creds,
        )
        .await
        {
            Ok(verdict) => {
                info!(peer = ?self.peer_addr, login = %verdict.login, "SSH password auth accepted");
                self.username = Some(user.to_string());
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!(peer = ?self.peer_addr, user = %user, error = %e, "SSH password auth rejected");
                self.state.metrics.metrics.auth_failures.inc();
                Ok(self.reject())
            }
        }
    }

    /// Public-key authentication. The default policy is permissive: Git-level
    /// authorisation travels inside the pack stream, so possession of a key
    /// only grants tunnel access.
    async fn auth_publickey(&mut self, user: &str, _key: &PublicKey) -> Result<Auth, Self::Error> {
        if !self.state.config.ssh.enable_pubkey {
            return Ok(self.reject());
        }
        debug!(peer = ?self.peer_addr, user = %user, "SSH public-key auth accepted");
        self.username = Some(user.to_string());
        Ok(Auth::Accept)
    }

    /// Only `session` channels are accepted; russh rejects other channel
    /// types with `UnknownChannelType` by default.
    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// Shell access is refused; this endpoint only speaks Git.
    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel_id);
        session.extended_data(
            channel_id,
            1,
            CryptoVec::from_slice(
                b"Shell access is not supported. Only Git operations are allowed.\r\n",
            ),
        );
        session.close(channel_id);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel_id);
        Ok(())
    }

    /// Environment variables are accepted and ignored.
    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        _name: &str,
        _value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel_id);
        Ok(())
    }

    /// Handle the single `exec` request carrying the Git command.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data).into_owned();
        info!(
            peer = ?self.peer_addr,
            username = ?self.username,
            command = %raw,
            "SSH exec request"
        );

        let (service, owner, repo) = match parse_git_command(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(command = %raw, error = %e, "rejecting SSH exec command");
                session.channel_failure(channel_id);
                session.extended_data(
                    channel_id,
                    1,
                    CryptoVec::from_slice(format!("ERROR: {e}\r\n").as_bytes()),
                );
                session.exit_status_request(channel_id, 1);
                session.close(channel_id);
                return Ok(());
            }
        };

        session.channel_success(channel_id);

        // Feed for client stdin; the bridge owns the outbound connection.
        let (tx, rx) = mpsc::channel::<BridgeInput>(32);
        self.bridge_tx = Some(tx);

        let state = Arc::clone(&self.state);
        let handle = session.handle();
        tokio::spawn(async move {
            upstream::run_bridge(state, handle, channel_id, service, owner, repo, rx).await;
        });

        Ok(())
    }

    /// Client stdin bytes flow into the bridge.
    async fn data(
        &mut self,
        _channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = &self.bridge_tx {
            let _ = tx.send(BridgeInput::Data(data.to_vec())).await;
        }
        Ok(())
    }

    /// Client EOF half-closes the origin's stdin so it can finish the pack.
    async fn channel_eof(
        &mut self,
        _channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = &self.bridge_tx {
            let _ = tx.send(BridgeInput::Eof).await;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the sender tears the bridge down.
        self.bridge_tx = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
