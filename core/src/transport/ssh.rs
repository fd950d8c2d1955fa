//! SSH transport backed by an externally configured host.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;

use crate::config::HarnessConfig;
use crate::error::{Error, Result};
use crate::git::Git;
use crate::snapshot::Snapshot;

use super::{ensure_running, Endpoint, Liveness, ServerState, TransportKind, TransportServer};

/// Returns the non-interactive ssh command line used by every invocation.
pub fn batch_ssh_command(connect_timeout: Duration) -> String {
    format!(
        "ssh -o BatchMode=yes -o StrictHostKeyChecking=accept-new -o ConnectTimeout={}",
        connect_timeout.as_secs().max(1)
    )
}

/// Parsed `ssh://[user@]host[:port]/base/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
    pub base_path: String,
}

impl SshTarget {
    /// Parses an `ssh://` URL.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = url::Url::parse(raw)
            .map_err(|e| Error::Config(format!("invalid ssh url '{}': {}", raw, e)))?;
        if url.scheme() != "ssh" {
            return Err(Error::Config(format!("'{}' is not an ssh:// url", raw)));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("ssh url '{}' has no host", raw)))?
            .to_string();
        let user = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let base_path = url.path().trim_end_matches('/').to_string();

        Ok(Self {
            user,
            host,
            port: url.port().unwrap_or(22),
            base_path,
        })
    }

    /// Returns `user@host` or `host`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Returns the URL of `path` on this host.
    pub fn url_for(&self, path: &str) -> String {
        format!("ssh://{}:{}{}", self.destination(), self.port, path)
    }
}

/// Delegates to a pre-configured SSH host; the harness never runs sshd itself.
///
/// Each server instance publishes into its own directory under the base path
/// so concurrent scenarios sharing the host do not collide.
pub struct SshServer {
    git: Git,
    url: Option<String>,
    start_timeout: Duration,
    connect_timeout: Duration,
    namespace: String,
    target: Option<SshTarget>,
    state: ServerState,
    liveness: Liveness,
}

impl SshServer {
    /// Creates a server for the configured SSH URL, if any.
    pub fn new(git: Git, config: &HarnessConfig) -> Self {
        Self {
            git,
            url: config.active_ssh_url().map(str::to_string),
            start_timeout: config.server_start_timeout(),
            connect_timeout: config.default_timeout(),
            namespace: format!("harness-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            target: None,
            state: ServerState::Created,
            liveness: Liveness::default(),
        }
    }

    fn namespace_path(&self, target: &SshTarget) -> String {
        format!("{}/{}", target.base_path, self.namespace)
    }

    fn repo_path(&self, target: &SshTarget, name: &str) -> String {
        format!("{}/{}.git", self.namespace_path(target), name)
    }

    fn running_target(&self) -> Result<&SshTarget> {
        ensure_running(self.kind(), self.state)?;
        self.target
            .as_ref()
            .ok_or_else(|| Error::StaleEndpoint("ssh server has no target".to_string()))
    }

    /// Runs a shell command on the remote host.
    async fn remote(&self, target: &SshTarget, command: &str) -> Result<()> {
        let output = Command::new("ssh")
            .args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-p")
            .arg(target.port.to_string())
            .arg(target.destination())
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "ssh {} `{}` failed: {}",
                target.destination(),
                command,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn init_remote(&self, target: &SshTarget, path: &str, head: &str) -> Result<()> {
        let command = format!(
            "rm -rf '{0}' && git init -q --bare '{0}' && git --git-dir='{0}' symbolic-ref HEAD '{1}'",
            path, head
        );
        self.remote(target, &command).await
    }
}

#[async_trait]
impl TransportServer for SshServer {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn state(&self) -> ServerState {
        self.state
    }

    async fn start(&mut self) -> Result<Endpoint> {
        let Some(raw) = self.url.clone() else {
            return Err(Error::Skipped("no SSH endpoint configured".to_string()));
        };

        if self.state != ServerState::Running {
            let target = SshTarget::parse(&raw).map_err(|e| {
                self.state = ServerState::Failed;
                Error::ServerStart {
                    transport: TransportKind::Ssh.to_string(),
                    reason: e.to_string(),
                }
            })?;

            let reachable = tokio::time::timeout(
                self.start_timeout,
                TcpStream::connect((target.host.as_str(), target.port)),
            )
            .await;
            if !matches!(reachable, Ok(Ok(_))) {
                self.state = ServerState::Failed;
                return Err(Error::ServerStart {
                    transport: TransportKind::Ssh.to_string(),
                    reason: format!(
                        "{}:{} not reachable within {:?}",
                        target.host, target.port, self.start_timeout
                    ),
                });
            }

            tracing::info!(host = %target.host, port = target.port, namespace = %self.namespace, "ssh endpoint reachable");
            self.target = Some(target);
            self.state = ServerState::Running;
            self.liveness.set(true);
        }

        let target = self.running_target()?;
        Ok(Endpoint::new(
            target.url_for(&self.namespace_path(target)),
            self.kind(),
            self.liveness.clone(),
        ))
    }

    async fn stop(&mut self) -> Result<()> {
        self.liveness.set(false);
        if self.state == ServerState::Running {
            if let Some(target) = self.target.clone() {
                let path = self.namespace_path(&target);
                if let Err(e) = self.remote(&target, &format!("rm -rf '{}'", path)).await {
                    tracing::warn!(error = %e, "failed to remove remote repositories");
                }
            }
            self.state = ServerState::Stopped;
        }
        Ok(())
    }

    async fn serve(&mut self, snapshot: &Snapshot) -> Result<Endpoint> {
        let target = self.running_target()?.clone();
        let name = snapshot.name();
        let path = self.repo_path(&target, &name);
        let head = snapshot
            .head
            .clone()
            .unwrap_or_else(|| "refs/heads/main".to_string());

        self.init_remote(&target, &path, &head).await?;
        if !snapshot.is_empty() {
            let url = target.url_for(&path);
            self.git
                .clone()
                .with_env("GIT_SSH_COMMAND", batch_ssh_command(self.connect_timeout))
                .run(&snapshot.root, &["push", "-q", "--mirror", &url])
                .await?;
        }

        tracing::debug!(repo = %name, url = %target.url_for(&path), "published repository over ssh");
        Ok(self.endpoint_for(&name))
    }

    async fn serve_empty(&mut self, name: &str, head_branch: &str) -> Result<Endpoint> {
        let target = self.running_target()?.clone();
        let path = self.repo_path(&target, name);
        self.init_remote(&target, &path, &format!("refs/heads/{}", head_branch))
            .await?;
        Ok(self.endpoint_for(name))
    }

    fn endpoint_for(&self, name: &str) -> Endpoint {
        let url = match &self.target {
            Some(target) => target.url_for(&self.repo_path(target, name)),
            None => format!("ssh://unconfigured/{}.git", name),
        };
        Endpoint::new(url, self.kind(), self.liveness.clone())
    }

    fn repository_path(&self, _name: &str) -> Option<PathBuf> {
        None
    }
}
