//! Deterministic repository fixtures.
//!
//! Every step goes through the client binary with a pinned identity and a
//! commit date derived from the commit index, so a given [`FixtureSpec`]
//! produces the same object ids on every run.

use std::path::{Path, PathBuf};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::git::Git;
use crate::process::ProcessGroups;
use crate::snapshot::Snapshot;

/// Epoch of the first fixture commit.
const BASE_EPOCH: u64 = 1_700_000_000;

/// Dates for commits appended after the initial build start here.
const EXTEND_EPOCH_OFFSET: u64 = 1_000;

/// Size of generated binary blobs.
const BINARY_BLOB_BYTES: usize = 4096;

/// Name of the side branch in diverging and merge topologies.
pub const FEATURE_BRANCH: &str = "feature";

/// Paths written by [`FileProfile::SpecialCharacters`].
pub const SPECIAL_PATHS: &[&str] = &[
    "file with spaces.txt",
    "file-with-dashes.txt",
    "file_with_underscores.txt",
    "file.multiple.dots.txt",
    "+)'?$>%!.txt",
    "日本語.txt",
    "a/b/c/d/e/f/g/h/i/j/file.txt",
    "empty.txt",
];

/// Shape of the commit graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// One branch, one parent per commit.
    #[default]
    Linear,
    /// A `feature` branch forks halfway and carries its own commits.
    Diverging,
    /// Like diverging, with the feature branch merged back (no fast-forward).
    Merge,
}

/// Kind of content written into the fixture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileProfile {
    /// Small text files.
    #[default]
    Text,
    /// Text files plus seeded binary blobs.
    Binary,
    /// Text files plus one large seeded blob in the first commit.
    Oversized { bytes: usize },
    /// Text files plus awkward path names in the first commit.
    SpecialCharacters,
}

/// Declarative description of a fixture repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureSpec {
    /// Commits on the default branch.
    #[serde(default = "default_commit_count")]
    pub commit_count: usize,
    /// Commit graph shape.
    #[serde(default)]
    pub topology: Topology,
    /// Content profile.
    #[serde(default)]
    pub files: FileProfile,
    /// Initialise without any commit.
    #[serde(default)]
    pub empty: bool,
    /// Seed for generated content.
    #[serde(default)]
    pub seed: u64,
    /// Branch HEAD points at.
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Tag every default-branch commit `v0.<i>`.
    #[serde(default)]
    pub tags: bool,
    /// Produce a bare repository.
    #[serde(default)]
    pub bare: bool,
}

fn default_commit_count() -> usize {
    3
}

fn default_branch() -> String {
    "main".to_string()
}

impl Default for FixtureSpec {
    fn default() -> Self {
        Self {
            commit_count: default_commit_count(),
            topology: Topology::default(),
            files: FileProfile::default(),
            empty: false,
            seed: 0,
            default_branch: default_branch(),
            tags: false,
            bare: false,
        }
    }
}

impl FixtureSpec {
    /// A linear history of `count` commits.
    pub fn linear(count: usize) -> Self {
        Self {
            commit_count: count,
            ..Self::default()
        }
    }

    /// An initialised repository with no commits.
    pub fn empty() -> Self {
        Self {
            commit_count: 0,
            empty: true,
            ..Self::default()
        }
    }

    /// Sets the topology.
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Sets the content profile.
    pub fn with_files(mut self, files: FileProfile) -> Self {
        self.files = files;
        self
    }

    /// Sets the content seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Enables tagging.
    pub fn with_tags(mut self) -> Self {
        self.tags = true;
        self
    }

    /// Produces a bare repository.
    pub fn bare(mut self) -> Self {
        self.bare = true;
        self
    }

    /// Returns true if the fixture has no commits.
    pub fn is_empty(&self) -> bool {
        self.empty || self.commit_count == 0
    }

    /// Index of the default-branch commit the feature branch forks from.
    fn fork_point(&self) -> usize {
        (self.commit_count / 2).max(1) - 1
    }

    /// Number of commits on the feature branch.
    fn feature_commits(&self) -> usize {
        self.commit_count
            .saturating_sub(self.fork_point() + 1)
            .max(1)
    }
}

/// Line of history a commit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Main,
    Feature,
    Extension,
}

impl Line {
    fn label(self) -> &'static str {
        match self {
            Line::Main => "main",
            Line::Feature => "feature",
            Line::Extension => "extension",
        }
    }
}

/// Returns the files written by commit `index` on `line`.
///
/// Pure: depends only on `spec`, `line` and `index`.
pub fn files_for_commit(spec: &FixtureSpec, line: Line, index: usize) -> Vec<(PathBuf, Vec<u8>)> {
    let mut rng = rng_for(spec.seed, line.label(), index);
    let mut files = Vec::new();

    match line {
        Line::Main => {
            files.push((
                PathBuf::from("README.md"),
                format!("# Fixture\n\nrevision {}\n", index).into_bytes(),
            ));
            files.push((
                PathBuf::from(format!("src/file_{}.txt", index)),
                format!("commit {}\ntoken {:016x}\n", index, rng.next_u64()).into_bytes(),
            ));
        }
        Line::Feature => {
            files.push((
                PathBuf::from(format!("feature/change_{}.txt", index)),
                format!("feature commit {}\ntoken {:016x}\n", index, rng.next_u64()).into_bytes(),
            ));
        }
        Line::Extension => {
            files.push((
                PathBuf::from(format!("src/extra_{:x}_{}.txt", spec.seed, index)),
                format!("extension {}\ntoken {:016x}\n", index, rng.next_u64()).into_bytes(),
            ));
        }
    }

    if line == Line::Main {
        match &spec.files {
            FileProfile::Text => {}
            FileProfile::Binary => {
                let mut blob = vec![0u8; BINARY_BLOB_BYTES];
                rng.fill_bytes(&mut blob);
                // NUL in the first bytes keeps the client's binary detection honest.
                blob[0] = 0;
                files.push((PathBuf::from(format!("data/blob_{}.bin", index)), blob));
            }
            FileProfile::Oversized { bytes } if index == 0 => {
                let mut blob = vec![0u8; *bytes];
                rng.fill_bytes(&mut blob);
                files.push((PathBuf::from("large.bin"), blob));
            }
            FileProfile::SpecialCharacters if index == 0 => {
                for name in SPECIAL_PATHS {
                    let content = if *name == "empty.txt" {
                        Vec::new()
                    } else {
                        format!("content of {}\n", name).into_bytes()
                    };
                    files.push((PathBuf::from(name), content));
                }
            }
            _ => {}
        }
    }

    files
}

fn rng_for(seed: u64, label: &str, index: usize) -> ChaCha20Rng {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in label.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    ChaCha20Rng::seed_from_u64(seed ^ hash ^ (index as u64).rotate_left(32))
}

fn commit_date(slot: u64) -> String {
    format!("{} +0000", BASE_EPOCH + slot * 60)
}

/// Replaces the last non-empty line of `existing` with `replacement`.
fn edit_last_line(existing: &str, replacement: &str) -> String {
    let mut lines: Vec<&str> = existing.lines().collect();
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    if lines.is_empty() {
        lines = vec!["line1", "line2", "line3"];
    }
    lines.pop();
    lines.push(replacement);
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Creates fixture repositories through the client binary.
#[derive(Debug, Clone)]
pub struct Builder {
    git: Git,
}

impl Builder {
    /// Creates a builder using the given client.
    pub fn new(git: Git) -> Self {
        Self { git }
    }

    /// Returns the client used for every step.
    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Returns a builder whose steps are recorded in `groups`.
    pub fn tracked(&self, groups: &ProcessGroups) -> Self {
        Self::new(self.git.clone().tracked(groups))
    }

    /// Builds the fixture described by `spec` at `dest` and captures it.
    pub async fn build(&self, spec: &FixtureSpec, dest: &Path) -> Result<Snapshot> {
        tracing::info!(
            dest = ?dest,
            commits = spec.commit_count,
            topology = ?spec.topology,
            bare = spec.bare,
            "building fixture"
        );

        let work = if spec.bare {
            sibling(dest, "work")
        } else {
            dest.to_path_buf()
        };
        self.create_dir(&work).await?;
        self.step(&work, &["init", "-q"], None).await?;
        let head = format!("refs/heads/{}", spec.default_branch);
        self.step(&work, &["symbolic-ref", "HEAD", &head], None)
            .await?;

        if !spec.is_empty() {
            self.populate(spec, &work).await?;
        }

        if spec.bare {
            let parent = parent_of(dest);
            let work_arg = work.display().to_string();
            let dest_arg = dest.display().to_string();
            self.step(&parent, &["clone", "-q", "--bare", &work_arg, &dest_arg], None)
                .await?;
            if spec.is_empty() {
                self.step(dest, &["symbolic-ref", "HEAD", &head], None).await?;
            }
            self.step(dest, &["update-server-info"], None).await?;
            tokio::fs::remove_dir_all(&work).await?;
        }

        self.capture(dest).await
    }

    async fn populate(&self, spec: &FixtureSpec, work: &Path) -> Result<()> {
        let branched = spec.topology != Topology::Linear;
        let fork = spec.fork_point();
        let mut slot = 0u64;

        for i in 0..spec.commit_count {
            self.commit_files(work, &files_for_commit(spec, Line::Main, i), &format!("Commit {}", i), slot)
                .await?;
            slot += 1;
            if spec.tags {
                self.step(work, &["tag", &format!("v0.{}", i)], None).await?;
            }
            if branched && i == fork {
                self.step(work, &["branch", FEATURE_BRANCH], None).await?;
            }
        }

        if !branched {
            return Ok(());
        }

        self.step(work, &["checkout", "-q", FEATURE_BRANCH], None)
            .await?;
        for i in 0..spec.feature_commits() {
            self.commit_files(
                work,
                &files_for_commit(spec, Line::Feature, i),
                &format!("Feature commit {}", i),
                slot,
            )
            .await?;
            slot += 1;
        }
        self.step(work, &["checkout", "-q", &spec.default_branch], None)
            .await?;

        if spec.topology == Topology::Merge {
            let message = format!("Merge branch '{}'", FEATURE_BRANCH);
            self.step(
                work,
                &["merge", "-q", "--no-ff", "-m", &message, FEATURE_BRANCH],
                Some(slot),
            )
            .await?;
        }

        Ok(())
    }

    /// Appends `count` commits to the repository at `origin` via a scratch clone.
    ///
    /// `served` is the server-side path of the repository when it is local, so
    /// dumb-protocol info files can be refreshed. Returns the origin as seen
    /// by the scratch clone after the push.
    pub async fn extend(
        &self,
        origin: &str,
        served: Option<&Path>,
        scratch: &Path,
        count: usize,
        seed: u64,
    ) -> Result<Snapshot> {
        tracing::info!(origin = %origin, count, "extending served repository");

        self.scratch_clone(origin, scratch).await?;
        let spec = FixtureSpec::default().with_seed(seed);
        for i in 0..count {
            self.commit_files(
                scratch,
                &files_for_commit(&spec, Line::Extension, i),
                &format!("Extension commit {}", i),
                EXTEND_EPOCH_OFFSET + i as u64,
            )
            .await?;
        }
        self.step(scratch, &["push", "-q", "origin", "HEAD"], None)
            .await?;
        self.refresh_server_info(served).await?;

        // Pick up the pushed branch as a tracking ref.
        self.step(scratch, &["fetch", "-q", "origin"], None).await?;
        Ok(self.capture(scratch).await?.remote_view("origin"))
    }

    /// Seeds divergent edits of the last line of `path` on the server and the client.
    ///
    /// The server side goes through a scratch clone of `origin` and a push;
    /// the client side is a local commit in `client`. A later pull of the
    /// client conflicts.
    pub async fn seed_conflict(
        &self,
        origin: &str,
        served: Option<&Path>,
        client: &Path,
        scratch: &Path,
        path: &str,
    ) -> Result<()> {
        tracing::info!(origin = %origin, client = ?client, path, "seeding merge conflict");

        self.scratch_clone(origin, scratch).await?;
        self.edit_and_commit(scratch, path, "server edit", EXTEND_EPOCH_OFFSET)
            .await?;
        self.step(scratch, &["push", "-q", "origin", "HEAD"], None)
            .await?;
        self.refresh_server_info(served).await?;

        self.edit_and_commit(client, path, "client edit", EXTEND_EPOCH_OFFSET + 1)
            .await
    }

    /// Initialises an empty bare repository whose HEAD names `head_branch`.
    pub async fn init_bare(&self, dest: &Path, head_branch: &str) -> Result<()> {
        self.create_dir(dest).await?;
        self.step(dest, &["init", "-q", "--bare"], None).await?;
        let head = format!("refs/heads/{}", head_branch);
        self.step(dest, &["symbolic-ref", "HEAD", &head], None)
            .await?;
        Ok(())
    }

    async fn edit_and_commit(&self, repo: &Path, path: &str, replacement: &str, slot: u64) -> Result<()> {
        let existing = tokio::fs::read_to_string(repo.join(path))
            .await
            .unwrap_or_default();
        let content = edit_last_line(&existing, replacement);
        self.commit_files(
            repo,
            &[(PathBuf::from(path), content.into_bytes())],
            &format!("Edit {} ({})", path, replacement),
            slot,
        )
        .await
    }

    async fn scratch_clone(&self, origin: &str, scratch: &Path) -> Result<()> {
        let parent = parent_of(scratch);
        self.create_dir(&parent).await?;
        let scratch_arg = scratch.display().to_string();
        self.step(&parent, &["clone", "-q", origin, &scratch_arg], None)
            .await?;
        Ok(())
    }

    async fn refresh_server_info(&self, served: Option<&Path>) -> Result<()> {
        if let Some(served) = served {
            self.step(served, &["update-server-info"], None).await?;
        }
        Ok(())
    }

    async fn commit_files(
        &self,
        repo: &Path,
        files: &[(PathBuf, Vec<u8>)],
        message: &str,
        slot: u64,
    ) -> Result<()> {
        for (path, content) in files {
            let full = repo.join(path);
            if let Some(parent) = full.parent() {
                self.create_dir(parent).await?;
            }
            tokio::fs::write(&full, content)
                .await
                .map_err(|e| Error::Build {
                    command: format!("write {}", full.display()),
                    reason: e.to_string(),
                })?;
        }
        self.step(repo, &["add", "-A"], None).await?;
        self.step(repo, &["commit", "-q", "-m", message], Some(slot))
            .await?;
        Ok(())
    }

    async fn create_dir(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Build {
                command: format!("mkdir {}", dir.display()),
                reason: e.to_string(),
            })
    }

    async fn capture(&self, repo: &Path) -> Result<Snapshot> {
        Snapshot::capture(&self.git, repo)
            .await
            .map_err(|e| Error::Build {
                command: format!("capture {}", repo.display()),
                reason: e.to_string(),
            })
    }

    /// Runs one client step, mapping any failure to [`Error::Build`].
    async fn step(&self, dir: &Path, args: &[&str], date_slot: Option<u64>) -> Result<String> {
        let command = self.git.display_command(args);
        let mut cmd = self.git.command(dir, args);
        if let Some(slot) = date_slot {
            let date = commit_date(slot);
            cmd.env("GIT_AUTHOR_DATE", &date)
                .env("GIT_COMMITTER_DATE", &date);
        }

        let output = self.git.collect(cmd).await.map_err(|e| Error::Build {
            command: command.clone(),
            reason: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(Error::Build {
                command,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn parent_of(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "fixture".to_string());
    parent_of(path).join(format!("{}.{}", name, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generated_files_are_deterministic() {
        let spec = FixtureSpec::linear(3).with_files(FileProfile::Binary).with_seed(42);
        assert_eq!(
            files_for_commit(&spec, Line::Main, 1),
            files_for_commit(&spec, Line::Main, 1)
        );

        let other = spec.clone().with_seed(43);
        assert_ne!(
            files_for_commit(&spec, Line::Main, 1),
            files_for_commit(&other, Line::Main, 1)
        );
    }

    #[test]
    fn binary_profile_writes_blobs_with_nul() {
        let spec = FixtureSpec::linear(1).with_files(FileProfile::Binary);
        let files = files_for_commit(&spec, Line::Main, 0);
        let (_, blob) = files
            .iter()
            .find(|(p, _)| p.starts_with("data"))
            .unwrap();
        assert_eq!(blob.len(), BINARY_BLOB_BYTES);
        assert_eq!(blob[0], 0);
    }

    #[test]
    fn special_paths_only_in_first_commit() {
        let spec = FixtureSpec::linear(2).with_files(FileProfile::SpecialCharacters);
        let first = files_for_commit(&spec, Line::Main, 0);
        let second = files_for_commit(&spec, Line::Main, 1);

        assert!(first.iter().any(|(p, _)| p == Path::new("日本語.txt")));
        assert!(first
            .iter()
            .any(|(p, c)| p == Path::new("empty.txt") && c.is_empty()));
        assert!(!second.iter().any(|(p, _)| p == Path::new("日本語.txt")));
    }

    #[test]
    fn feature_line_never_touches_main_paths() {
        let spec = FixtureSpec::linear(4).with_topology(Topology::Diverging);
        for i in 0..spec.feature_commits() {
            for (path, _) in files_for_commit(&spec, Line::Feature, i) {
                assert!(path.starts_with("feature"));
            }
        }
        assert_eq!(spec.fork_point(), 1);
        assert_eq!(spec.feature_commits(), 2);
    }

    #[test]
    fn fixture_spec_parses_from_yaml_with_defaults() {
        let spec: FixtureSpec =
            serde_yaml::from_str("topology: merge\nfiles:\n  kind: oversized\n  bytes: 1024\n").unwrap();
        assert_eq!(spec.commit_count, 3);
        assert_eq!(spec.topology, Topology::Merge);
        assert_eq!(spec.files, FileProfile::Oversized { bytes: 1024 });
        assert_eq!(spec.default_branch, "main");
    }

    #[test]
    fn edit_last_line_replaces_final_line() {
        assert_eq!(edit_last_line("a\nb\nc\n\n", "x"), "a\nb\nx\n");
        assert_eq!(edit_last_line("", "x"), "line1\nline2\nx\n");
    }

    #[tokio::test]
    async fn build_linear_fixture_is_reproducible() {
        let dir = TempDir::new().unwrap();
        let builder = Builder::new(Git::default());
        let spec = FixtureSpec::linear(3).with_tags();

        let first = builder.build(&spec, &dir.path().join("one")).await.unwrap();
        let second = builder.build(&spec, &dir.path().join("two")).await.unwrap();

        assert_eq!(first.commits.len(), 3);
        assert_eq!(first.refs.len(), 4);
        assert_eq!(first.head.as_deref(), Some("refs/heads/main"));
        assert_eq!(first.refs, second.refs);
        assert_eq!(first.files, second.files);
    }

    #[tokio::test]
    async fn build_merge_topology_creates_merge_commit() {
        let dir = TempDir::new().unwrap();
        let builder = Builder::new(Git::default());
        let spec = FixtureSpec::linear(4).with_topology(Topology::Merge);

        let snapshot = builder.build(&spec, &dir.path().join("merge")).await.unwrap();
        let head = snapshot.head_commit().unwrap();

        assert_eq!(snapshot.commits[head].parents.len(), 2);
        assert!(snapshot.refs.contains_key("refs/heads/feature"));
    }

    #[tokio::test]
    async fn build_empty_bare_fixture_has_no_refs() {
        let dir = TempDir::new().unwrap();
        let builder = Builder::new(Git::default());

        let snapshot = builder
            .build(&FixtureSpec::empty().bare(), &dir.path().join("empty.git"))
            .await
            .unwrap();

        assert!(snapshot.bare);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.head.as_deref(), Some("refs/heads/main"));
        assert!(!dir.path().join("empty.git.work").exists());
    }

    #[tokio::test]
    async fn failing_step_is_a_build_error() {
        let dir = TempDir::new().unwrap();
        let builder = Builder::new(Git::new("/nonexistent/git-binary"));

        let result = builder
            .build(&FixtureSpec::linear(1), &dir.path().join("repo"))
            .await;
        assert!(matches!(result, Err(Error::Build { .. })));
    }
}
