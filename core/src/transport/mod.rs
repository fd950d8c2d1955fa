//! Transport servers that publish fixture repositories to the client.
//!
//! Supports the local filesystem, the native daemon, read-only dumb HTTP and
//! a pre-configured SSH host.

mod daemon;
pub(crate) mod http;
mod local;
mod ssh;

pub use daemon::DaemonServer;
pub use http::{AuthPolicy, HttpServer};
pub use local::LocalServer;
pub use ssh::{batch_ssh_command, SshServer, SshTarget};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::builder::Builder;
use crate::config::HarnessConfig;
use crate::error::{Error, Result};
use crate::git::Git;
use crate::snapshot::Snapshot;

/// Wire transport a server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    File,
    Daemon,
    Http,
    Ssh,
}

impl TransportKind {
    /// Every transport, in report order.
    pub const ALL: [TransportKind; 4] = [
        TransportKind::File,
        TransportKind::Daemon,
        TransportKind::Http,
        TransportKind::Ssh,
    ];

    /// Returns the lowercase name used in tags and reports.
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::File => "file",
            TransportKind::Daemon => "daemon",
            TransportKind::Http => "http",
            TransportKind::Ssh => "ssh",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle state of a transport server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Created,
    Running,
    Stopped,
    Failed,
}

/// Shared flag telling endpoints whether their server is still running.
#[derive(Debug, Clone, Default)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    /// Marks the owning server live or dead.
    pub fn set(&self, live: bool) {
        self.0.store(live, Ordering::SeqCst);
    }

    /// Returns whether the owning server is running.
    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Address of one repository on a running server.
#[derive(Debug, Clone)]
pub struct Endpoint {
    url: String,
    kind: TransportKind,
    liveness: Liveness,
}

impl Endpoint {
    /// Creates an endpoint tied to a server's liveness flag.
    pub fn new(url: impl Into<String>, kind: TransportKind, liveness: Liveness) -> Self {
        Self {
            url: url.into(),
            kind,
            liveness,
        }
    }

    /// Returns the URL without checking liveness.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the transport kind.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Returns whether the owning server is running.
    pub fn is_live(&self) -> bool {
        self.liveness.is_live()
    }

    /// Returns the URL, failing if the owning server is no longer running.
    pub fn resolve(&self) -> Result<&str> {
        if self.liveness.is_live() {
            Ok(&self.url)
        } else {
            Err(Error::StaleEndpoint(self.url.clone()))
        }
    }

    /// Returns a copy pointing at another URL, owned by the same server.
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: self.kind,
            liveness: self.liveness.clone(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.url, self.kind)
    }
}

/// A server publishing repositories over one transport.
///
/// State machine: `Created -> Running` on [`start`](Self::start),
/// `Running -> Stopped` on [`stop`](Self::stop). A failed start leaves the
/// server `Failed` with every acquired process and socket released. Stopping
/// a server that is not running is a no-op.
#[async_trait]
pub trait TransportServer: Send + Sync {
    /// Returns the transport this server speaks.
    fn kind(&self) -> TransportKind;

    /// Returns the current lifecycle state.
    fn state(&self) -> ServerState;

    /// Returns whether clients may push to this server.
    fn supports_push(&self) -> bool {
        true
    }

    /// Starts the server and returns its base endpoint.
    async fn start(&mut self) -> Result<Endpoint>;

    /// Stops the server and releases its resources.
    async fn stop(&mut self) -> Result<()>;

    /// Publishes `snapshot` as `<name>.git` and returns its endpoint.
    async fn serve(&mut self, snapshot: &Snapshot) -> Result<Endpoint>;

    /// Publishes an empty repository whose HEAD names `head_branch`.
    async fn serve_empty(&mut self, name: &str, head_branch: &str) -> Result<Endpoint>;

    /// Returns the endpoint of a published repository.
    fn endpoint_for(&self, name: &str) -> Endpoint;

    /// Returns the server-side path of a published repository, if local.
    fn repository_path(&self, name: &str) -> Option<PathBuf>;
}

/// Builds a server for `kind` rooted at `root`.
pub fn for_kind(kind: TransportKind, root: &Path, config: &HarnessConfig) -> Box<dyn TransportServer> {
    let git = Git::from_config(config);
    match kind {
        TransportKind::File => Box::new(LocalServer::new(root, git)),
        TransportKind::Daemon => Box::new(DaemonServer::new(root, git, config)),
        TransportKind::Http => Box::new(HttpServer::new(root, git, AuthPolicy::Open)),
        TransportKind::Ssh => Box::new(SshServer::new(git, config)),
    }
}

/// Directory of bare repositories shared by the local, daemon and HTTP servers.
#[derive(Debug, Clone)]
pub(crate) struct ServeRoot {
    root: PathBuf,
    git: Git,
}

impl ServeRoot {
    pub(crate) fn new(root: &Path, git: Git) -> Self {
        Self {
            root: root.to_path_buf(),
            git,
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn repo_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.git", name))
    }

    pub(crate) async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Bare-clones the snapshot under the root, replacing any previous copy.
    pub(crate) async fn publish(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        let name = snapshot.name();
        let dest = self.repo_dir(&name);
        if dest.exists() {
            tokio::fs::remove_dir_all(&dest).await?;
        }

        let source = snapshot.root.display().to_string();
        let target = dest.display().to_string();
        self.git
            .run(&self.root, &["clone", "-q", "--bare", &source, &target])
            .await?;
        if let Some(head) = &snapshot.head {
            self.git.run(&dest, &["symbolic-ref", "HEAD", head]).await?;
        }
        self.git.run(&dest, &["update-server-info"]).await?;

        tracing::debug!(repo = %name, path = ?dest, "published repository");
        Ok(dest)
    }

    /// Creates an empty bare repository under the root.
    pub(crate) async fn publish_empty(&self, name: &str, head_branch: &str) -> Result<PathBuf> {
        let dest = self.repo_dir(name);
        if dest.exists() {
            tokio::fs::remove_dir_all(&dest).await?;
        }
        Builder::new(self.git.clone())
            .init_bare(&dest, head_branch)
            .await?;
        self.git.run(&dest, &["update-server-info"]).await?;
        Ok(dest)
    }
}

/// Fails unless the server is running.
pub(crate) fn ensure_running(kind: TransportKind, state: ServerState) -> Result<()> {
    if state == ServerState::Running {
        Ok(())
    } else {
        Err(Error::StaleEndpoint(format!("{} server is {:?}", kind, state)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_goes_stale_with_its_server() {
        let liveness = Liveness::default();
        let endpoint = Endpoint::new("git://127.0.0.1:9/x.git", TransportKind::Daemon, liveness.clone());
        assert!(matches!(endpoint.resolve(), Err(Error::StaleEndpoint(_))));

        liveness.set(true);
        assert_eq!(endpoint.resolve().unwrap(), "git://127.0.0.1:9/x.git");

        let rewritten = endpoint.with_url("git://127.0.0.1:10/x.git");
        liveness.set(false);
        assert!(rewritten.resolve().is_err());
    }

    #[test]
    fn transport_kind_serializes_lowercase() {
        let kind: TransportKind = serde_yaml::from_str("daemon").unwrap();
        assert_eq!(kind, TransportKind::Daemon);
        assert_eq!(TransportKind::Http.to_string(), "http");
    }

    #[test]
    fn ensure_running_rejects_other_states() {
        assert!(ensure_running(TransportKind::File, ServerState::Running).is_ok());
        assert!(ensure_running(TransportKind::File, ServerState::Stopped).is_err());
    }

    #[test]
    fn factory_builds_every_kind_in_created_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = HarnessConfig::default();
        for kind in TransportKind::ALL {
            let server = for_kind(kind, dir.path(), &config);
            assert_eq!(server.kind(), kind);
            assert_eq!(server.state(), ServerState::Created);
        }
    }

    #[tokio::test]
    async fn published_empty_repository_is_bare_with_named_head() {
        let dir = tempfile::TempDir::new().unwrap();
        let git = Git::default();
        let root = ServeRoot::new(&dir.path().join("served"), git.clone());
        root.prepare().await.unwrap();

        let repo = root.publish_empty("source", "trunk").await.unwrap();
        assert_eq!(repo, root.repo_dir("source"));

        let bare = git.run(&repo, &["rev-parse", "--is-bare-repository"]).await.unwrap();
        assert_eq!(bare.trim(), "true");
        let head = git.run(&repo, &["symbolic-ref", "HEAD"]).await.unwrap();
        assert_eq!(head.trim(), "refs/heads/trunk");
        assert!(repo.join("info/refs").exists());
    }
}
