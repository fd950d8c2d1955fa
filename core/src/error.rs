//! Error types for the conformance harness.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::verifier::Divergence;

/// Top-level error type for harness operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Fixture construction failed. Never retried.
    #[error("failed to build fixture: `{command}` {reason}")]
    Build { command: String, reason: String },

    /// A transport server did not become reachable.
    #[error("{transport} server failed to start: {reason}")]
    ServerStart { transport: String, reason: String },

    /// A client invocation exceeded its time bound.
    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    /// The client process exited nonzero.
    #[error("`{command}` exited with {}: {stderr}", exit_label(.code))]
    Client {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// Post-operation repository state mismatch.
    #[error("repository state diverged: {0}")]
    Divergence(Divergence),

    /// A precondition is unmet (e.g. SSH not configured).
    #[error("skipped: {0}")]
    Skipped(String),

    /// The endpoint's owning server is not running.
    #[error("endpoint {0} is no longer served")]
    StaleEndpoint(String),

    /// A fault cannot be applied to the given target.
    #[error("fault injection error: {0}")]
    Fault(String),

    /// Git inspection of a repository failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// HTTP listener error.
    #[error("http error: {0}")]
    Http(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The path is not a usable repository location.
    #[error("invalid repository path: {0}")]
    InvalidPath(PathBuf),

    /// Harness or scenario configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

impl Error {
    /// Returns the report classification for this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Build { .. } => ErrorClass::Build,
            Error::ServerStart { .. } => ErrorClass::ServerStart,
            Error::Timeout { .. } => ErrorClass::Timeout,
            Error::Client { .. } => ErrorClass::Client,
            Error::Divergence(_) => ErrorClass::Divergence,
            Error::Skipped(_) => ErrorClass::Skipped,
            _ => ErrorClass::Infrastructure,
        }
    }

    /// Returns true if this error means "precondition unmet" rather than failure.
    pub fn is_skip(&self) -> bool {
        matches!(self, Error::Skipped(_))
    }
}

/// Coarse classification of a scenario failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Build,
    ServerStart,
    Timeout,
    Client,
    Divergence,
    /// The operation behaved differently from what the scenario declared.
    Expectation,
    Skipped,
    Infrastructure,
}

impl ErrorClass {
    /// Returns the snake_case label used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClass::Build => "build",
            ErrorClass::ServerStart => "server_start",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Client => "client",
            ErrorClass::Divergence => "divergence",
            ErrorClass::Expectation => "expectation",
            ErrorClass::Skipped => "skipped",
            ErrorClass::Infrastructure => "infrastructure",
        }
    }
}

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, Error>;
