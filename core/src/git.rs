//! Thin async wrapper around the client binary.
//!
//! Every invocation runs with a fixed identity and with system/global
//! configuration disabled, so fixtures and inspections behave the same on
//! every machine.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use tokio::process::{Child, Command};

use crate::config::HarnessConfig;
use crate::error::{Error, Result};
use crate::process::{GroupLease, ProcessGroups};

/// Author and committer name used for every commit the harness creates.
pub const IDENTITY_NAME: &str = "Harness User";

/// Author and committer email used for every commit the harness creates.
pub const IDENTITY_EMAIL: &str = "harness@example.com";

/// Invoker for the version-control client binary.
#[derive(Debug, Clone)]
pub struct Git {
    bin: PathBuf,
    env: Vec<(String, String)>,
    groups: Option<ProcessGroups>,
}

impl Default for Git {
    fn default() -> Self {
        Self::new("git")
    }
}

impl Git {
    /// Creates an invoker for the given binary.
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            env: Vec::new(),
            groups: None,
        }
    }

    /// Creates an invoker for the configured client binary.
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.client_bin.clone())
    }

    /// Adds an environment variable to every invocation.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Records every spawned process group in `groups`.
    pub fn tracked(mut self, groups: &ProcessGroups) -> Self {
        self.groups = Some(groups.clone());
        self
    }

    /// Registers the group led by `child` with the attached registry, if any.
    pub fn track(&self, child: &Child) -> GroupLease {
        match (&self.groups, child.id()) {
            (Some(groups), Some(pid)) => groups.register(pid),
            _ => GroupLease::untracked(),
        }
    }

    /// Returns the binary path.
    pub fn bin(&self) -> &Path {
        &self.bin
    }

    /// Returns the environment applied to every invocation.
    pub fn base_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("GIT_AUTHOR_NAME".to_string(), IDENTITY_NAME.to_string()),
            ("GIT_AUTHOR_EMAIL".to_string(), IDENTITY_EMAIL.to_string()),
            ("GIT_COMMITTER_NAME".to_string(), IDENTITY_NAME.to_string()),
            ("GIT_COMMITTER_EMAIL".to_string(), IDENTITY_EMAIL.to_string()),
            ("GIT_CONFIG_NOSYSTEM".to_string(), "1".to_string()),
            ("GIT_CONFIG_GLOBAL".to_string(), null_device().to_string()),
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
            ("LC_ALL".to_string(), "C".to_string()),
        ];
        env.extend(self.env.iter().cloned());
        env
    }

    /// Builds a command running in `dir` with the base environment applied.
    ///
    /// The child leads its own process group so that helpers it forks can be
    /// signalled together with it.
    pub fn command<I, S>(&self, dir: &Path, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .current_dir(dir)
            .envs(self.base_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        cmd
    }

    /// Spawns `cmd` and collects its output while its group is tracked.
    pub async fn collect(&self, mut cmd: Command) -> std::io::Result<Output> {
        let child = cmd.spawn()?;
        let lease = self.track(&child);
        let output = child.wait_with_output().await?;
        lease.release();
        Ok(output)
    }

    /// Runs the client and returns its raw output, whatever the exit status.
    pub async fn output(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        let output = self.collect(self.command(dir, args)).await?;
        Ok(output)
    }

    /// Runs the client and returns stdout, failing on a nonzero exit.
    pub async fn run(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self.output(dir, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Git(format!(
                "`{}` failed in {}: {}",
                self.display_command(args),
                dir.display(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Runs the client and reports only whether it exited zero.
    pub async fn succeeds(&self, dir: &Path, args: &[&str]) -> Result<bool> {
        Ok(self.output(dir, args).await?.status.success())
    }

    /// Renders an invocation for logs and error messages.
    pub fn display_command(&self, args: &[&str]) -> String {
        let mut rendered = self.bin.display().to_string();
        for arg in args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

fn null_device() -> &'static str {
    if cfg!(windows) {
        "NUL"
    } else {
        "/dev/null"
    }
}
