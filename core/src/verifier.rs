//! Snapshot comparison and repository integrity checks.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::git::Git;
use crate::snapshot::Snapshot;

/// Unexpected differences between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divergence {
    /// Reference names present on one side only or pointing at different commits.
    pub references: BTreeSet<String>,
    /// Commit ids present in exactly one side.
    pub missing_commits: BTreeSet<String>,
    /// Paths whose HEAD-tree entries differ.
    pub content: BTreeSet<PathBuf>,
}

impl Divergence {
    /// Returns true if the snapshots are equivalent.
    pub fn is_empty(&self) -> bool {
        self.references.is_empty() && self.missing_commits.is_empty() && self.content.is_empty()
    }
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut parts = Vec::new();
        if !self.references.is_empty() {
            let names: Vec<&str> = self.references.iter().map(String::as_str).collect();
            parts.push(format!("references [{}]", names.join(", ")));
        }
        if !self.missing_commits.is_empty() {
            parts.push(format!("{} commit(s) on one side only", self.missing_commits.len()));
        }
        if !self.content.is_empty() {
            let paths: Vec<String> = self
                .content
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            parts.push(format!("content [{}]", paths.join(", ")));
        }
        write!(f, "{}", parts.join("; "))
    }
}

/// Differences a scenario tolerates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedDivergence {
    /// Reference names allowed to differ.
    #[serde(default)]
    pub references: BTreeSet<String>,
    /// Commit ids allowed to be present on one side only.
    #[serde(default)]
    pub commits: BTreeSet<String>,
    /// Paths allowed to differ.
    #[serde(default)]
    pub paths: BTreeSet<PathBuf>,
    /// Commits of the first snapshot may be absent from the second (shallow clones).
    #[serde(default)]
    pub truncated_history: bool,
}

impl ExpectedDivergence {
    /// Tolerates a truncated history on the second side.
    pub fn truncated() -> Self {
        Self {
            truncated_history: true,
            ..Self::default()
        }
    }

    /// Tolerates a difference in the given reference.
    pub fn with_reference(mut self, name: impl Into<String>) -> Self {
        self.references.insert(name.into());
        self
    }
}

/// Result of a connectivity check on one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Location that was checked.
    #[serde(default)]
    pub repository: Option<PathBuf>,
    /// Whether a repository existed at the checked location.
    pub repository_exists: bool,
    /// References whose history is not fully present.
    pub broken_refs: BTreeSet<String>,
    /// Client stderr for the first failing check.
    pub detail: Option<String>,
}

impl IntegrityReport {
    /// Returns true if no reference points at incomplete history.
    pub fn is_clean(&self) -> bool {
        self.broken_refs.is_empty()
    }
}

/// Compares snapshots and checks repository connectivity.
pub struct Verifier;

impl Verifier {
    /// Computes the unexpected differences between `a` and `b`.
    pub fn compare(a: &Snapshot, b: &Snapshot, expected: &ExpectedDivergence) -> Divergence {
        let mut divergence = Divergence::default();

        let names: BTreeSet<&String> = a.refs.keys().chain(b.refs.keys()).collect();
        for name in names {
            if a.refs.get(name) != b.refs.get(name) && !expected.references.contains(name) {
                divergence.references.insert(name.clone());
            }
        }

        for id in a.commits.keys() {
            if b.commits.contains_key(id)
                || expected.truncated_history
                || expected.commits.contains(id)
            {
                continue;
            }
            divergence.missing_commits.insert(id.clone());
        }
        for id in b.commits.keys() {
            if !a.commits.contains_key(id) && !expected.commits.contains(id) {
                divergence.missing_commits.insert(id.clone());
            }
        }

        let paths: BTreeSet<&PathBuf> = a.files.keys().chain(b.files.keys()).collect();
        for path in paths {
            if a.files.get(path) != b.files.get(path) && !expected.paths.contains(path) {
                divergence.content.insert(path.clone());
            }
        }

        if !divergence.is_empty() {
            tracing::debug!(
                a = ?a.root,
                b = ?b.root,
                %divergence,
                "snapshots diverge"
            );
        }
        divergence
    }

    /// Fails with [`Error::Divergence`] if the snapshots differ unexpectedly.
    pub fn ensure_equivalent(a: &Snapshot, b: &Snapshot, expected: &ExpectedDivergence) -> Result<()> {
        let divergence = Self::compare(a, b, expected);
        if divergence.is_empty() {
            Ok(())
        } else {
            Err(Error::Divergence(divergence))
        }
    }

    /// Checks that every reference in `repo` points at fully present history.
    ///
    /// A missing repository is clean: a failed clone that left nothing behind
    /// cannot expose broken references.
    pub async fn check_integrity(git: &Git, repo: &Path) -> Result<IntegrityReport> {
        let mut report = IntegrityReport {
            repository: Some(repo.to_path_buf()),
            ..IntegrityReport::default()
        };
        if !repo.join(".git").exists() && !repo.join("HEAD").exists() {
            return Ok(report);
        }
        report.repository_exists = true;

        let output = git
            .output(repo, &["for-each-ref", "--format=%(refname)"])
            .await?;
        if !output.status.success() {
            report.broken_refs.insert("<refs>".to_string());
            report.detail = Some(String::from_utf8_lossy(&output.stderr).trim().to_string());
            return Ok(report);
        }

        let mut names: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .filter(|l| !l.is_empty())
            .collect();
        if git
            .succeeds(repo, &["rev-parse", "-q", "--verify", "HEAD"])
            .await?
        {
            names.push("HEAD".to_string());
        }

        for name in names {
            let output = git
                .output(repo, &["rev-list", "--objects", "--quiet", &name, "--"])
                .await?;
            if !output.status.success() {
                tracing::warn!(repo = ?repo, reference = %name, "reference points at incomplete history");
                if report.detail.is_none() {
                    report.detail =
                        Some(String::from_utf8_lossy(&output.stderr).trim().to_string());
                }
                report.broken_refs.insert(name);
            }
        }

        Ok(report)
    }
}
