//! Client driver: runs one client operation against an endpoint.
//!
//! Every invocation is non-interactive, time-bounded and runs in its own
//! process group so a timeout can take down helpers (remote helpers, ssh)
//! along with the client.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::{HarnessConfig, DEFAULT_MAX_OUTPUT_BYTES};
use crate::error::{Error, Result};
use crate::git::Git;
use crate::process::{read_bounded, terminate_group, Captured, ProcessGroups};
use crate::transport::{batch_ssh_command, Endpoint};

/// Marker the client prints for each conflicted path during a merge.
pub const CONFLICT_MARKER: &str = "CONFLICT";

/// Client operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Clone,
    Push,
    Fetch,
    Pull,
    RemoteAdd,
    RemoteRemove,
    RemoteRename,
    LsRemote,
}

/// A client operation and its local parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Clone into `dest`. `protocol` pins the wire protocol version.
    Clone {
        dest: PathBuf,
        branch: Option<String>,
        depth: Option<u32>,
        bare: bool,
        protocol: Option<u8>,
    },
    /// Push from `repo`. Empty `refspecs` pushes every branch.
    Push {
        repo: PathBuf,
        refspecs: Vec<String>,
        tags: bool,
        set_upstream: bool,
    },
    /// Fetch into `repo` through `remote`.
    Fetch {
        repo: PathBuf,
        remote: String,
        all: bool,
        tags: bool,
        prune: bool,
        protocol: Option<u8>,
    },
    /// Pull into `repo` through `remote`.
    Pull {
        repo: PathBuf,
        remote: String,
        branch: Option<String>,
        rebase: bool,
    },
    /// Register the endpoint as remote `name` of `repo`.
    RemoteAdd { repo: PathBuf, name: String },
    /// Drop remote `name` from `repo`.
    RemoteRemove { repo: PathBuf, name: String },
    /// Rename remote `from` of `repo` to `to`.
    RemoteRename {
        repo: PathBuf,
        from: String,
        to: String,
    },
    /// List the refs the endpoint advertises.
    LsRemote { dir: PathBuf },
}

impl Operation {
    /// A full clone into `dest`.
    pub fn clone_into(dest: impl Into<PathBuf>) -> Self {
        Operation::Clone {
            dest: dest.into(),
            branch: None,
            depth: None,
            bare: false,
            protocol: None,
        }
    }

    /// Pushes every branch and tag of `repo`.
    pub fn push_all(repo: impl Into<PathBuf>) -> Self {
        Operation::Push {
            repo: repo.into(),
            refspecs: Vec::new(),
            tags: true,
            set_upstream: false,
        }
    }

    /// Fetches through `origin`.
    pub fn fetch(repo: impl Into<PathBuf>) -> Self {
        Operation::Fetch {
            repo: repo.into(),
            remote: "origin".to_string(),
            all: false,
            tags: false,
            prune: false,
            protocol: None,
        }
    }

    /// Merging pull through `origin`.
    pub fn pull(repo: impl Into<PathBuf>, branch: Option<String>) -> Self {
        Operation::Pull {
            repo: repo.into(),
            remote: "origin".to_string(),
            branch,
            rebase: false,
        }
    }

    /// Pins the wire protocol version; only clone and fetch carry one.
    pub fn with_protocol(mut self, version: Option<u8>) -> Self {
        if let Operation::Clone { protocol, .. } | Operation::Fetch { protocol, .. } = &mut self {
            *protocol = version;
        }
        self
    }

    /// Returns the operation kind.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Clone { .. } => OperationKind::Clone,
            Operation::Push { .. } => OperationKind::Push,
            Operation::Fetch { .. } => OperationKind::Fetch,
            Operation::Pull { .. } => OperationKind::Pull,
            Operation::RemoteAdd { .. } => OperationKind::RemoteAdd,
            Operation::RemoteRemove { .. } => OperationKind::RemoteRemove,
            Operation::RemoteRename { .. } => OperationKind::RemoteRename,
            Operation::LsRemote { .. } => OperationKind::LsRemote,
        }
    }

    /// Directory the client runs in.
    fn working_dir(&self) -> PathBuf {
        match self {
            Operation::Clone { dest, .. } => dest
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            Operation::Push { repo, .. }
            | Operation::Fetch { repo, .. }
            | Operation::Pull { repo, .. }
            | Operation::RemoteAdd { repo, .. }
            | Operation::RemoteRemove { repo, .. }
            | Operation::RemoteRename { repo, .. } => repo.clone(),
            Operation::LsRemote { dir } => dir.clone(),
        }
    }

    /// Remote that must point at the endpoint before the client runs.
    fn bound_remote(&self) -> Option<&str> {
        match self {
            Operation::Fetch { remote, .. } | Operation::Pull { remote, .. } => Some(remote),
            Operation::Push {
                set_upstream: true, ..
            } => Some("origin"),
            _ => None,
        }
    }

    /// Per-invocation configuration placed before the subcommand.
    fn global_args(&self) -> Vec<String> {
        let mut args = vec!["-c".to_string(), "credential.helper=".to_string()];
        if let Operation::Clone {
            protocol: Some(version),
            ..
        }
        | Operation::Fetch {
            protocol: Some(version),
            ..
        } = self
        {
            args.push("-c".into());
            args.push(format!("protocol.version={}", version));
        }
        args
    }

    /// Client arguments (after the global options) for this operation.
    fn args(&self, url: &str) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        match self {
            Operation::Clone {
                dest,
                branch,
                depth,
                bare,
                ..
            } => {
                args.push("clone".into());
                if *bare {
                    args.push("--bare".into());
                }
                if let Some(branch) = branch {
                    args.push("--branch".into());
                    args.push(branch.clone());
                }
                if let Some(depth) = depth {
                    args.push("--depth".into());
                    args.push(depth.to_string());
                    args.push("--no-single-branch".into());
                }
                args.push(url.to_string());
                args.push(dest.display().to_string());
            }
            Operation::Push {
                refspecs,
                tags,
                set_upstream,
                ..
            } => {
                args.push("push".into());
                if *set_upstream {
                    args.push("--set-upstream".into());
                    args.push("origin".into());
                } else {
                    args.push(url.to_string());
                }
                if refspecs.is_empty() {
                    args.push("refs/heads/*:refs/heads/*".into());
                    if *tags {
                        args.push("refs/tags/*:refs/tags/*".into());
                    }
                } else {
                    if *tags {
                        args.push("--tags".into());
                    }
                    args.extend(refspecs.iter().cloned());
                }
            }
            Operation::Fetch {
                remote,
                all,
                tags,
                prune,
                ..
            } => {
                args.push("fetch".into());
                if *prune {
                    args.push("--prune".into());
                }
                if *tags {
                    args.push("--tags".into());
                }
                if *all {
                    args.push("--all".into());
                } else {
                    args.push(remote.clone());
                }
            }
            Operation::Pull {
                remote,
                branch,
                rebase,
                ..
            } => {
                args.push("pull".into());
                args.push(if *rebase { "--rebase" } else { "--no-rebase" }.into());
                args.push(remote.clone());
                if let Some(branch) = branch {
                    args.push(branch.clone());
                }
            }
            Operation::RemoteAdd { name, .. } => {
                args.push("remote".into());
                args.push("add".into());
                args.push(name.clone());
                args.push(url.to_string());
            }
            Operation::RemoteRemove { name, .. } => {
                args.push("remote".into());
                args.push("remove".into());
                args.push(name.clone());
            }
            Operation::RemoteRename { from, to, .. } => {
                args.push("remote".into());
                args.push("rename".into());
                args.push(from.clone());
                args.push(to.clone());
            }
            Operation::LsRemote { .. } => {
                args.push("ls-remote".into());
                args.push(url.to_string());
            }
        }
        args
    }

    /// Local repository the operation leaves behind, if it exists.
    fn repository(&self) -> Option<PathBuf> {
        let path = match self {
            Operation::Clone { dest, .. } => dest,
            Operation::Push { repo, .. }
            | Operation::Fetch { repo, .. }
            | Operation::Pull { repo, .. }
            | Operation::RemoteAdd { repo, .. }
            | Operation::RemoteRemove { repo, .. }
            | Operation::RemoteRename { repo, .. } => repo,
            Operation::LsRemote { .. } => return None,
        };
        if path.join(".git").exists() || path.join("HEAD").exists() {
            Some(path.clone())
        } else {
            None
        }
    }
}

/// How the client process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "code", rename_all = "snake_case")]
pub enum ExitStatusKind {
    Exited(i32),
    Signaled,
    Timeout,
}

/// Per-invocation settings.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Hard time bound.
    pub timeout: Duration,
    /// Extra environment for the client.
    pub env: Vec<(String, String)>,
    /// Bytes retained per output stream.
    pub max_output_bytes: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            env: Vec::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl RunOptions {
    /// Options from the harness configuration.
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            timeout: config.default_timeout(),
            env: Vec::new(),
            max_output_bytes: config.max_output_bytes,
        }
    }

    /// Sets the time bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Immutable record of one client invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    kind: OperationKind,
    argv: Vec<String>,
    status: ExitStatusKind,
    duration_ms: u64,
    timeout_ms: u64,
    stdout: String,
    stderr: String,
    stdout_truncated: bool,
    stderr_truncated: bool,
    repository: Option<PathBuf>,
    endpoint: String,
}

impl OperationResult {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn status(&self) -> ExitStatusKind {
        self.status
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn stdout_truncated(&self) -> bool {
        self.stdout_truncated
    }

    pub fn stderr_truncated(&self) -> bool {
        self.stderr_truncated
    }

    /// Local repository present after the operation.
    pub fn repository(&self) -> Option<&Path> {
        self.repository.as_deref()
    }

    /// URL the client was pointed at.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns true for a zero exit.
    pub fn success(&self) -> bool {
        self.status == ExitStatusKind::Exited(0)
    }

    /// Returns true if either stream contains `marker`.
    pub fn contains(&self, marker: &str) -> bool {
        self.stdout.contains(marker) || self.stderr.contains(marker)
    }

    /// Returns true if the client reported a merge conflict.
    pub fn has_conflict_marker(&self) -> bool {
        self.contains(CONFLICT_MARKER)
    }

    /// Returns the command line as one string.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }

    /// Returns the error this result represents, if it is not a success.
    pub fn error(&self) -> Option<Error> {
        match self.status {
            ExitStatusKind::Exited(0) => None,
            ExitStatusKind::Timeout => Some(Error::Timeout {
                command: self.command_line(),
                after: Duration::from_millis(self.timeout_ms),
            }),
            ExitStatusKind::Exited(code) => Some(self.client_error(Some(code))),
            ExitStatusKind::Signaled => Some(self.client_error(None)),
        }
    }

    fn client_error(&self, code: Option<i32>) -> Error {
        Error::Client {
            command: self.command_line(),
            code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
    }

    /// Converts a failed invocation into its error.
    pub fn into_result(self) -> Result<Self> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Runs client operations against endpoints.
#[derive(Debug, Clone)]
pub struct ClientDriver {
    git: Git,
    grace: Duration,
    defaults: RunOptions,
}

impl ClientDriver {
    /// Creates a driver for `git` with default options.
    pub fn new(git: Git) -> Self {
        Self {
            git,
            grace: Duration::from_secs(2),
            defaults: RunOptions::default(),
        }
    }

    /// Creates a driver from the harness configuration.
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            git: Git::from_config(config),
            grace: config.stop_grace(),
            defaults: RunOptions::from_config(config),
        }
    }

    /// Returns the configured default options.
    pub fn options(&self) -> RunOptions {
        self.defaults.clone()
    }

    /// Returns the client invoker.
    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Returns a driver whose client processes are recorded in `groups`.
    pub fn tracked(&self, groups: &ProcessGroups) -> Self {
        Self {
            git: self.git.clone().tracked(groups),
            grace: self.grace,
            defaults: self.defaults.clone(),
        }
    }

    /// Runs `operation` against `endpoint`.
    ///
    /// A nonzero exit or a timeout is a successful run with a failing status;
    /// only infrastructure problems (stale endpoint, spawn failure) are errors.
    pub async fn run(
        &self,
        operation: &Operation,
        endpoint: &Endpoint,
        options: &RunOptions,
    ) -> Result<OperationResult> {
        let url = endpoint.resolve()?.to_string();
        let cwd = operation.working_dir();
        tokio::fs::create_dir_all(&cwd).await?;

        if let Some(remote) = operation.bound_remote() {
            self.bind_remote(&cwd, remote, &url).await?;
        }

        let mut args = operation.global_args();
        args.extend(operation.args(&url));
        let mut argv = vec![self.git.bin().display().to_string()];
        argv.extend(args.iter().cloned());

        let mut cmd = self.git.command(&cwd, &args);
        cmd.env("GIT_SSH_COMMAND", batch_ssh_command(options.timeout))
            .env("GIT_ASKPASS", "false")
            .env("SSH_ASKPASS", "false")
            .envs(options.env.iter().cloned());

        tracing::info!(
            kind = ?operation.kind(),
            endpoint = %endpoint,
            timeout = ?options.timeout,
            "running client operation"
        );

        let started = Instant::now();
        let mut child = cmd.spawn()?;
        let lease = self.git.track(&child);
        let stdout = child
            .stdout
            .take()
            .map(|s| tokio::spawn(read_bounded(s, options.max_output_bytes)));
        let stderr = child
            .stderr
            .take()
            .map(|s| tokio::spawn(read_bounded(s, options.max_output_bytes)));

        let status = match tokio::time::timeout(options.timeout, child.wait()).await {
            Ok(Ok(status)) => match status.code() {
                Some(code) => ExitStatusKind::Exited(code),
                None => ExitStatusKind::Signaled,
            },
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                tracing::warn!(kind = ?operation.kind(), after = ?options.timeout, "client timed out");
                terminate_group(&mut child, self.grace).await?;
                ExitStatusKind::Timeout
            }
        };
        lease.release();
        let duration = started.elapsed();

        let stdout = self.collect(stdout).await;
        let stderr = self.collect(stderr).await;

        let result = OperationResult {
            kind: operation.kind(),
            argv,
            status,
            duration_ms: duration.as_millis() as u64,
            timeout_ms: options.timeout.as_millis() as u64,
            stdout: stdout.text(),
            stderr: stderr.text(),
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            repository: operation.repository(),
            endpoint: url,
        };

        tracing::debug!(
            kind = ?result.kind,
            status = ?result.status,
            duration = ?duration,
            "client operation finished"
        );
        Ok(result)
    }

    /// Lists the references `endpoint` advertises.
    pub async fn ls_remote(&self, endpoint: &Endpoint, options: &RunOptions) -> Result<BTreeMap<String, String>> {
        let operation = Operation::LsRemote {
            dir: std::env::temp_dir(),
        };
        let result = self.run(&operation, endpoint, options).await?.into_result()?;
        Ok(parse_ls_remote(result.stdout()))
    }

    async fn bind_remote(&self, repo: &Path, remote: &str, url: &str) -> Result<()> {
        if self.git.succeeds(repo, &["remote", "get-url", remote]).await? {
            self.git.run(repo, &["remote", "set-url", remote, url]).await?;
        } else {
            self.git.run(repo, &["remote", "add", remote, url]).await?;
        }
        Ok(())
    }

    async fn collect(
        &self,
        task: Option<tokio::task::JoinHandle<std::io::Result<Captured>>>,
    ) -> Captured {
        let Some(task) = task else {
            return Captured::default();
        };
        match tokio::time::timeout(self.grace, task).await {
            Ok(Ok(Ok(captured))) => captured,
            Ok(Ok(Err(e))) => {
                tracing::debug!(error = %e, "failed reading client output");
                Captured::default()
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "output reader panicked");
                Captured::default()
            }
            Err(_) => Captured {
                bytes: Vec::new(),
                truncated: true,
            },
        }
    }
}

fn parse_ls_remote(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (id, name) = line.split_once('\t')?;
            Some((name.trim().to_string(), id.trim().to_string()))
        })
        .collect()
}
