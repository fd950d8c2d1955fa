//! Local filesystem transport.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;
use crate::git::Git;
use crate::snapshot::Snapshot;

use super::{ensure_running, Endpoint, Liveness, ServeRoot, ServerState, TransportKind, TransportServer};

/// Serves repositories straight from a directory; no process involved.
pub struct LocalServer {
    root: ServeRoot,
    state: ServerState,
    liveness: Liveness,
    file_urls: bool,
}

impl LocalServer {
    /// Creates a server rooted at `root`, handing out plain paths.
    pub fn new(root: &Path, git: Git) -> Self {
        Self {
            root: ServeRoot::new(root, git),
            state: ServerState::Created,
            liveness: Liveness::default(),
            file_urls: false,
        }
    }

    /// Hands out `file://` URLs instead of plain paths.
    pub fn with_file_urls(mut self) -> Self {
        self.file_urls = true;
        self
    }

    fn url_for(&self, path: &Path) -> String {
        if self.file_urls {
            format!("file://{}", path.display())
        } else {
            path.display().to_string()
        }
    }
}

#[async_trait]
impl TransportServer for LocalServer {
    fn kind(&self) -> TransportKind {
        TransportKind::File
    }

    fn state(&self) -> ServerState {
        self.state
    }

    async fn start(&mut self) -> Result<Endpoint> {
        if self.state != ServerState::Running {
            if let Err(e) = self.root.prepare().await {
                self.state = ServerState::Failed;
                return Err(e);
            }
            self.state = ServerState::Running;
            self.liveness.set(true);
            tracing::debug!(root = ?self.root.root(), "local server started");
        }
        Ok(Endpoint::new(
            self.url_for(self.root.root()),
            TransportKind::File,
            self.liveness.clone(),
        ))
    }

    async fn stop(&mut self) -> Result<()> {
        if self.state == ServerState::Running {
            self.liveness.set(false);
            self.state = ServerState::Stopped;
        }
        Ok(())
    }

    async fn serve(&mut self, snapshot: &Snapshot) -> Result<Endpoint> {
        ensure_running(self.kind(), self.state)?;
        self.root.publish(snapshot).await?;
        Ok(self.endpoint_for(&snapshot.name()))
    }

    async fn serve_empty(&mut self, name: &str, head_branch: &str) -> Result<Endpoint> {
        ensure_running(self.kind(), self.state)?;
        self.root.publish_empty(name, head_branch).await?;
        Ok(self.endpoint_for(name))
    }

    fn endpoint_for(&self, name: &str) -> Endpoint {
        Endpoint::new(
            self.url_for(&self.root.repo_dir(name)),
            TransportKind::File,
            self.liveness.clone(),
        )
    }

    fn repository_path(&self, name: &str) -> Option<PathBuf> {
        Some(self.root.repo_dir(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lifecycle_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut server = LocalServer::new(dir.path(), Git::default());

        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Created);

        server.start().await.unwrap();
        let endpoint = server.endpoint_for("repo");
        assert!(endpoint.resolve().is_ok());

        server.stop().await.unwrap();
        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(matches!(endpoint.resolve(), Err(Error::StaleEndpoint(_))));
    }

    #[tokio::test]
    async fn file_urls_are_prefixed() {
        let dir = TempDir::new().unwrap();
        let mut server = LocalServer::new(dir.path(), Git::default()).with_file_urls();
        server.start().await.unwrap();

        assert!(server.endpoint_for("repo").url().starts_with("file://"));
        assert!(server.endpoint_for("repo").url().ends_with("repo.git"));
    }

    #[tokio::test]
    async fn serve_requires_running_server() {
        let dir = TempDir::new().unwrap();
        let mut server = LocalServer::new(dir.path(), Git::default());
        let result = server.serve_empty("repo", "main").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn serve_empty_creates_bare_repository() {
        let dir = TempDir::new().unwrap();
        let mut server = LocalServer::new(&dir.path().join("served"), Git::default());
        server.start().await.unwrap();

        server.serve_empty("pushed", "main").await.unwrap();
        let path = server.repository_path("pushed").unwrap();
        assert!(path.join("HEAD").exists());
    }
}
