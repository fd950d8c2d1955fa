//! Harness configuration and validation.
//!
//! Environment variables (all optional):
//! - `HARNESS_CONFIG` - TOML file loaded before the overrides below
//! - `HARNESS_SKIP_SSH=1` - Treat the SSH transport as unavailable
//! - `HARNESS_SKIP_NETWORK=1` - Skip scenarios that require network access
//! - `HARNESS_CLIENT_BIN` - Client binary (default: `git`)
//! - `HARNESS_SERVER_BIN` - Server binary used for the native daemon (default: `git`)
//! - `HARNESS_DEFAULT_TIMEOUT_SECS` - Per-invocation client timeout (default: 30)
//! - `HARNESS_SSH_URL` - Pre-configured SSH base URL, e.g. `ssh://git@host:2222/srv/git`
//! - `HARNESS_PARALLELISM` - Concurrent scenarios (default: 1)
//! - `HARNESS_WORK_DIR` - Parent directory for scenario working directories

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default maximum retained bytes per captured output stream.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Configuration shared by every scenario in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Client binary used for fixtures and client operations.
    #[serde(default = "default_bin")]
    pub client_bin: PathBuf,

    /// Server binary used by the native daemon transport.
    #[serde(default = "default_bin")]
    pub server_bin: PathBuf,

    /// Per-invocation client timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Whether the SSH transport is disabled.
    #[serde(default)]
    pub skip_ssh: bool,

    /// Whether scenarios requiring network access are skipped.
    #[serde(default)]
    pub skip_network: bool,

    /// Pre-configured SSH base URL.
    #[serde(default)]
    pub ssh_url: Option<String>,

    /// Maximum number of concurrently running scenarios.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Parent directory for scenario working directories (system temp if unset).
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Maximum retained bytes per captured output stream.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Time a server has to become reachable, in milliseconds.
    #[serde(default = "default_start_timeout_ms")]
    pub server_start_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL, in milliseconds.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Whole-scenario timeout in seconds (Building through Verifying).
    #[serde(default = "default_scenario_timeout_secs")]
    pub scenario_timeout_secs: u64,
}

fn default_bin() -> PathBuf {
    PathBuf::from("git")
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_parallelism() -> usize {
    1
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_start_timeout_ms() -> u64 {
    5_000
}

fn default_stop_grace_ms() -> u64 {
    2_000
}

fn default_scenario_timeout_secs() -> u64 {
    300
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            client_bin: default_bin(),
            server_bin: default_bin(),
            default_timeout_secs: default_timeout_secs(),
            skip_ssh: false,
            skip_network: false,
            ssh_url: None,
            parallelism: default_parallelism(),
            work_dir: None,
            max_output_bytes: default_max_output_bytes(),
            server_start_timeout_ms: default_start_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            scenario_timeout_secs: default_scenario_timeout_secs(),
        }
    }
}

impl HarnessConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    ///
    /// `HARNESS_CONFIG` names a TOML file used as the base; every other
    /// variable overrides a single field.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("HARNESS_CONFIG") {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(v) = lookup("HARNESS_SKIP_SSH") {
            config.skip_ssh = parse_flag(&v);
        }
        if let Some(v) = lookup("HARNESS_SKIP_NETWORK") {
            config.skip_network = parse_flag(&v);
        }
        if let Some(v) = lookup("HARNESS_CLIENT_BIN") {
            config.client_bin = PathBuf::from(v);
        }
        if let Some(v) = lookup("HARNESS_SERVER_BIN") {
            config.server_bin = PathBuf::from(v);
        }
        if let Some(v) = lookup("HARNESS_DEFAULT_TIMEOUT_SECS") {
            config.default_timeout_secs = v.trim().parse().map_err(|_| {
                Error::Config(format!("HARNESS_DEFAULT_TIMEOUT_SECS is not a number: {}", v))
            })?;
        }
        if let Some(v) = lookup("HARNESS_SSH_URL") {
            config.ssh_url = if v.trim().is_empty() { None } else { Some(v) };
        }
        if let Some(v) = lookup("HARNESS_PARALLELISM") {
            config.parallelism = v.trim().parse().map_err(|_| {
                Error::Config(format!("HARNESS_PARALLELISM is not a number: {}", v))
            })?;
        }
        if let Some(v) = lookup("HARNESS_WORK_DIR") {
            config.work_dir = Some(PathBuf::from(v));
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(Error::Io)?;

        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse harness config: {}", e)))
    }

    /// Sets the client binary.
    pub fn with_client_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.client_bin = bin.into();
        self
    }

    /// Sets the server binary.
    pub fn with_server_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.server_bin = bin.into();
        self
    }

    /// Sets the per-invocation client timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Sets the SSH base URL.
    pub fn with_ssh_url(mut self, url: Option<String>) -> Self {
        self.ssh_url = url;
        self
    }

    /// Sets whether SSH is skipped.
    pub fn with_skip_ssh(mut self, skip: bool) -> Self {
        self.skip_ssh = skip;
        self
    }

    /// Sets whether network scenarios are skipped.
    pub fn with_skip_network(mut self, skip: bool) -> Self {
        self.skip_network = skip;
        self
    }

    /// Sets the scenario parallelism.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Sets the time a server has to become reachable.
    pub fn with_server_start_timeout(mut self, timeout: Duration) -> Self {
        self.server_start_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the whole-scenario timeout.
    pub fn with_scenario_timeout(mut self, timeout: Duration) -> Self {
        self.scenario_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Sets the parent directory for scenario working directories.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Returns the per-invocation client timeout.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Returns the server start timeout.
    pub fn server_start_timeout(&self) -> Duration {
        Duration::from_millis(self.server_start_timeout_ms)
    }

    /// Returns the SIGTERM grace period.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Returns the whole-scenario timeout.
    pub fn scenario_timeout(&self) -> Duration {
        Duration::from_secs(self.scenario_timeout_secs)
    }

    /// Returns the configured SSH URL if SSH is enabled.
    pub fn active_ssh_url(&self) -> Option<&str> {
        if self.skip_ssh {
            return None;
        }
        self.ssh_url.as_deref()
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.to_lowercase() == "true"
}

impl Validate for HarnessConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.client_bin.as_os_str().is_empty() {
            result.add_error("client_bin cannot be empty");
        }
        if self.server_bin.as_os_str().is_empty() {
            result.add_error("server_bin cannot be empty");
        }
        if self.default_timeout_secs == 0 {
            result.add_error("default_timeout_secs must be at least 1");
        }
        if self.parallelism == 0 {
            result.add_error("parallelism must be at least 1");
        }
        if self.max_output_bytes == 0 {
            result.add_error("max_output_bytes must be at least 1");
        }
        if self.scenario_timeout_secs <= self.default_timeout_secs {
            result.add_warning(
                "scenario_timeout_secs does not exceed default_timeout_secs; a single slow operation can abort the scenario",
            );
        }
        if self.server_start_timeout_ms < 500 {
            result.add_warning("server_start_timeout_ms under 500ms may fail on loaded machines");
        }

        if let Some(url) = &self.ssh_url {
            match url::Url::parse(url) {
                Ok(parsed) if parsed.scheme() == "ssh" => {
                    if parsed.host_str().is_none() {
                        result.add_error(format!("ssh_url '{}' has no host", url));
                    }
                }
                Ok(parsed) => result.add_error(format!(
                    "ssh_url must use the ssh scheme, got '{}'",
                    parsed.scheme()
                )),
                Err(e) => result.add_error(format!("ssh_url '{}' is invalid: {}", url, e)),
            }
        }

        result
    }
}
