//! Native daemon transport (`git://`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::config::HarnessConfig;
use crate::error::{Error, Result};
use crate::git::Git;
use crate::process::{reserve_port, terminate_group, wait_for_listener};
use crate::snapshot::Snapshot;

use super::{ensure_running, Endpoint, Liveness, ServeRoot, ServerState, TransportKind, TransportServer};

/// Attempts made when the daemon exits during start (port taken in between).
const START_ATTEMPTS: usize = 3;

enum StartFailure {
    Exited(String),
    TimedOut,
}

/// Runs `<server-bin> daemon` on a loopback port in its own process group.
pub struct DaemonServer {
    root: ServeRoot,
    server_bin: PathBuf,
    env: Vec<(String, String)>,
    start_timeout: Duration,
    stop_grace: Duration,
    state: ServerState,
    liveness: Liveness,
    child: Option<Child>,
    port: Option<u16>,
}

impl DaemonServer {
    /// Creates a daemon server rooted at `root`.
    pub fn new(root: &Path, git: Git, config: &HarnessConfig) -> Self {
        let env = git.base_env();
        Self {
            root: ServeRoot::new(root, git),
            server_bin: config.server_bin.clone(),
            env,
            start_timeout: config.server_start_timeout(),
            stop_grace: config.stop_grace(),
            state: ServerState::Created,
            liveness: Liveness::default(),
            child: None,
            port: None,
        }
    }

    /// Returns the listening port while running.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    fn log_path(&self) -> PathBuf {
        self.root.root().with_extension("daemon.log")
    }

    fn base_url(&self) -> String {
        format!("git://127.0.0.1:{}/", self.port.unwrap_or(0))
    }

    fn spawn(&self, port: u16) -> Result<Child> {
        let log = std::fs::File::create(self.log_path())?;
        let root = self.root.root().display().to_string();

        let child = Command::new(&self.server_bin)
            .arg("daemon")
            .arg("--reuseaddr")
            .arg("--export-all")
            .arg("--enable=receive-pack")
            .arg("--informative-errors")
            .arg(format!("--base-path={}", root))
            .arg("--listen=127.0.0.1")
            .arg(format!("--port={}", port))
            .arg(&root)
            .envs(self.env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }

    async fn await_ready(&self, child: &mut Child, port: u16) -> std::result::Result<(), StartFailure> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        tokio::select! {
            ready = wait_for_listener(addr, self.start_timeout) => {
                if ready {
                    Ok(())
                } else {
                    Err(StartFailure::TimedOut)
                }
            }
            status = child.wait() => {
                let log = std::fs::read_to_string(self.log_path()).unwrap_or_default();
                let status = status.map_or_else(|e| e.to_string(), |s| s.to_string());
                Err(StartFailure::Exited(format!("daemon exited with {}: {}", status, log.trim())))
            }
        }
    }

    fn fail(&mut self, reason: String) -> Error {
        self.state = ServerState::Failed;
        self.liveness.set(false);
        self.port = None;
        tracing::error!(reason = %reason, "daemon failed to start");
        Error::ServerStart {
            transport: TransportKind::Daemon.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl TransportServer for DaemonServer {
    fn kind(&self) -> TransportKind {
        TransportKind::Daemon
    }

    fn state(&self) -> ServerState {
        self.state
    }

    async fn start(&mut self) -> Result<Endpoint> {
        if self.state == ServerState::Running {
            return Ok(Endpoint::new(self.base_url(), self.kind(), self.liveness.clone()));
        }
        if let Err(e) = self.root.prepare().await {
            return Err(self.fail(e.to_string()));
        }

        let mut last_error = String::new();
        for attempt in 1..=START_ATTEMPTS {
            let port = match reserve_port().await {
                Ok(port) => port,
                Err(e) => return Err(self.fail(format!("no free port: {}", e))),
            };
            let mut child = match self.spawn(port) {
                Ok(child) => child,
                Err(e) => return Err(self.fail(format!("failed to spawn daemon: {}", e))),
            };

            match self.await_ready(&mut child, port).await {
                Ok(()) => {
                    tracing::info!(port, root = ?self.root.root(), "daemon started");
                    self.child = Some(child);
                    self.port = Some(port);
                    self.state = ServerState::Running;
                    self.liveness.set(true);
                    return Ok(Endpoint::new(self.base_url(), self.kind(), self.liveness.clone()));
                }
                Err(StartFailure::Exited(reason)) => {
                    tracing::warn!(attempt, port, reason = %reason, "daemon exited during start");
                    let _ = terminate_group(&mut child, self.stop_grace).await;
                    last_error = reason;
                }
                Err(StartFailure::TimedOut) => {
                    let _ = terminate_group(&mut child, self.stop_grace).await;
                    let reason = format!(
                        "port {} not accepting connections after {:?}",
                        port, self.start_timeout
                    );
                    return Err(self.fail(reason));
                }
            }
        }

        Err(self.fail(last_error))
    }

    async fn stop(&mut self) -> Result<()> {
        self.liveness.set(false);
        if let Some(mut child) = self.child.take() {
            tracing::debug!(port = ?self.port, "stopping daemon");
            terminate_group(&mut child, self.stop_grace).await?;
        }
        if self.state == ServerState::Running {
            self.state = ServerState::Stopped;
        }
        self.port = None;
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
            format!("{}{}.git", self.base_url(), name),
            self.kind(),
            self.liveness.clone(),
        )
    }

    fn repository_path(&self, name: &str) -> Option<PathBuf> {
        Some(self.root.repo_dir(name))
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        self.liveness.set(false);
        if let Some(pid) = self.child.as_ref().and_then(Child::id) {
            // Connection handlers live in the same group as the daemon.
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn missing_server_binary_fails_start() {
        let dir = TempDir::new().unwrap();
        let config = HarnessConfig::default().with_server_bin("/nonexistent/git-binary");
        let mut server = DaemonServer::new(&dir.path().join("served"), Git::default(), &config);

        let result = server.start().await;
        assert!(matches!(result, Err(Error::ServerStart { .. })));
        assert_eq!(server.state(), ServerState::Failed);

        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Failed);
    }

    #[tokio::test]
    async fn daemon_exiting_during_start_is_reported_without_waiting() {
        let dir = TempDir::new().unwrap();
        let config = HarnessConfig::default()
            .with_server_bin("false")
            .with_server_start_timeout(Duration::from_secs(30));
        let mut server = DaemonServer::new(&dir.path().join("served"), Git::default(), &config);

        let started = std::time::Instant::now();
        let result = server.start().await;

        match result {
            Err(Error::ServerStart { reason, .. }) => assert!(reason.contains("exited"), "{}", reason),
            other => panic!("expected a start failure, got {:?}", other.map(|e| e.url().to_string())),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn endpoint_urls_use_loopback_port() {
        let dir = TempDir::new().unwrap();
        let mut server = DaemonServer::new(&dir.path().join("served"), Git::default(), &HarnessConfig::default());
        server.port = Some(9418);
        assert_eq!(server.endpoint_for("repo").url(), "git://127.0.0.1:9418/repo.git");
    }

    #[tokio::test]
    async fn start_and_stop_release_the_port() {
        let dir = TempDir::new().unwrap();
        let mut server = DaemonServer::new(&dir.path().join("served"), Git::default(), &HarnessConfig::default());

        server.start().await.unwrap();
        let port = server.port().unwrap();
        assert_eq!(server.state(), ServerState::Running);

        server.stop().await.unwrap();
        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}
