//! Content-addressed captures of repository state.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::git::Git;

const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';

/// One commit in the captured DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitNode {
    /// Parent commit ids (empty for roots).
    pub parents: Vec<String>,
    /// Root tree id.
    pub tree: String,
    /// First line of the commit message.
    pub subject: String,
}

/// One entry of the HEAD tree listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Octal file mode as reported by the client (e.g. `100644`).
    pub mode: String,
    /// Blob id.
    pub blob: String,
}

/// A captured repository state.
///
/// Everything is keyed by content address: reference targets, commit ids,
/// tree ids and blob ids. Timestamps and filesystem metadata are never part
/// of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Repository root (work tree for regular repositories).
    pub root: PathBuf,
    /// Whether the repository is bare.
    pub bare: bool,
    /// Symbolic target of HEAD, if HEAD is symbolic.
    pub head: Option<String>,
    /// Full reference name to object id.
    pub refs: BTreeMap<String, String>,
    /// Commit id to commit node, for every commit reachable from any reference.
    pub commits: BTreeMap<String, CommitNode>,
    /// HEAD tree listing: path to entry.
    pub files: BTreeMap<PathBuf, FileEntry>,
}

impl Snapshot {
    /// Captures the state of the repository at `root`.
    pub async fn capture(git: &Git, root: &Path) -> Result<Self> {
        if !root.exists() {
            return Err(Error::InvalidPath(root.to_path_buf()));
        }

        let bare = git
            .run(root, &["rev-parse", "--is-bare-repository"])
            .await?
            .trim()
            == "true";

        let head = {
            let output = git.output(root, &["symbolic-ref", "-q", "HEAD"]).await?;
            if output.status.success() {
                Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
            } else {
                None
            }
        };

        let refs = parse_refs(
            &git.run(root, &["for-each-ref", "--format=%(objectname) %(refname)"])
                .await?,
        );

        let mut commits = if refs.is_empty() {
            BTreeMap::new()
        } else {
            let format = format!("--format=%H{0}%T{0}%P{0}%s{1}", "%x1f", "%x1e");
            parse_commits(&git.run(root, &["log", "--all", &format]).await?)
        };
        // The client hides the parents of shallow commits; restore them so the
        // cut shows up as a boundary.
        for id in shallow_commits(git, root).await? {
            if let Some(node) = commits.get_mut(&id) {
                let raw = git.run(root, &["cat-file", "commit", &id]).await?;
                node.parents = parse_commit_parents(&raw);
            }
        }

        let files = if git
            .succeeds(root, &["rev-parse", "-q", "--verify", "HEAD^{tree}"])
            .await?
        {
            parse_tree(&git.run(root, &["ls-tree", "-r", "-z", "--full-tree", "HEAD"]).await?)
        } else {
            BTreeMap::new()
        };

        tracing::debug!(
            root = ?root,
            refs = refs.len(),
            commits = commits.len(),
            files = files.len(),
            "captured snapshot"
        );

        Ok(Self {
            root: root.to_path_buf(),
            bare,
            head,
            refs,
            commits,
            files,
        })
    }

    /// Returns the last path component of the root, without a `.git` suffix.
    pub fn name(&self) -> String {
        let raw = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repo".to_string());
        raw.strip_suffix(".git").map(str::to_string).unwrap_or(raw)
    }

    /// Returns the short branch name HEAD points at.
    pub fn head_branch(&self) -> Option<&str> {
        self.head
            .as_deref()
            .and_then(|h| h.strip_prefix("refs/heads/"))
    }

    /// Returns the commit HEAD resolves to.
    pub fn head_commit(&self) -> Option<&str> {
        self.head
            .as_ref()
            .and_then(|h| self.refs.get(h))
            .map(String::as_str)
    }

    /// Returns true if the repository has no references.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Returns the view a server would publish: branches and tags only.
    pub fn published_view(&self) -> Self {
        let refs = self
            .refs
            .iter()
            .filter(|(name, _)| name.starts_with("refs/heads/") || name.starts_with("refs/tags/"))
            .map(|(name, id)| (name.clone(), id.clone()))
            .collect();
        Self {
            refs,
            ..self.clone()
        }
    }

    /// Returns the view of `remote` as recorded by this (client) repository.
    ///
    /// `refs/remotes/<remote>/<branch>` becomes `refs/heads/<branch>`; tags are
    /// kept; local branches and the remote's symbolic HEAD are dropped.
    pub fn remote_view(&self, remote: &str) -> Self {
        let prefix = format!("refs/remotes/{}/", remote);
        let mut refs = BTreeMap::new();
        for (name, id) in &self.refs {
            if let Some(branch) = name.strip_prefix(&prefix) {
                if branch != "HEAD" {
                    refs.insert(format!("refs/heads/{}", branch), id.clone());
                }
            } else if name.starts_with("refs/tags/") {
                refs.insert(name.clone(), id.clone());
            }
        }
        Self {
            refs,
            ..self.clone()
        }
    }

    /// Returns a copy without the HEAD tree listing.
    ///
    /// Used where an operation legitimately leaves the work tree untouched
    /// (e.g. fetch).
    pub fn history_only(&self) -> Self {
        Self {
            files: BTreeMap::new(),
            ..self.clone()
        }
    }

    /// Returns references whose target is not a commit in the captured DAG.
    ///
    /// Annotated tag objects are reported too; fixtures only create
    /// lightweight tags.
    pub fn unresolved_refs(&self) -> BTreeSet<String> {
        self.refs
            .iter()
            .filter(|(_, id)| !self.commits.contains_key(*id))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Returns commits whose parents are absent from the capture.
    ///
    /// Non-empty only for shallow or damaged repositories. Shallow commits
    /// keep their recorded parents, so a shallow clone reports its cut here.
    pub fn boundary_commits(&self) -> BTreeSet<String> {
        self.commits
            .iter()
            .filter(|(_, node)| node.parents.iter().any(|p| !self.commits.contains_key(p)))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn parse_refs(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (id, name) = line.split_once(' ')?;
            if name == "refs/stash" {
                return None;
            }
            Some((name.trim().to_string(), id.trim().to_string()))
        })
        .collect()
}

/// Lists the commits recorded in the repository's shallow file.
async fn shallow_commits(git: &Git, root: &Path) -> Result<Vec<String>> {
    let relative = git.run(root, &["rev-parse", "--git-path", "shallow"]).await?;
    let path = root.join(relative.trim());
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn parse_commit_parents(raw: &str) -> Vec<String> {
    raw.lines()
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.strip_prefix("parent "))
        .map(|id| id.trim().to_string())
        .collect()
}

fn parse_commits(output: &str) -> BTreeMap<String, CommitNode> {
    output
        .split(RECORD_SEP)
        .filter_map(|record| {
            let record = record.trim_start_matches('\n');
            if record.trim().is_empty() {
                return None;
            }
            let mut fields = record.split(FIELD_SEP);
            let id = fields.next()?.trim().to_string();
            let tree = fields.next()?.trim().to_string();
            let parents = fields
                .next()?
                .split_whitespace()
                .map(str::to_string)
                .collect();
            let subject = fields.next().unwrap_or("").trim_end().to_string();
            Some((
                id,
                CommitNode {
                    parents,
                    tree,
                    subject,
                },
            ))
        })
        .collect()
}

fn parse_tree(output: &str) -> BTreeMap<PathBuf, FileEntry> {
    output
        .split('\0')
        .filter_map(|entry| {
            let (meta, path) = entry.split_once('\t')?;
            let mut parts = meta.split_whitespace();
            let mode = parts.next()?.to_string();
            let _kind = parts.next()?;
            let blob = parts.next()?.to_string();
            Some((PathBuf::from(path), FileEntry { mode, blob }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with_refs(refs: &[(&str, &str)]) -> Snapshot {
        Snapshot {
            root: PathBuf::from("/tmp/client"),
            bare: false,
            head: Some("refs/heads/main".to_string()),
            refs: refs
                .iter()
                .map(|(n, id)| (n.to_string(), id.to_string()))
                .collect(),
            commits: BTreeMap::new(),
            files: BTreeMap::new(),
        }
    }

    #[test]
    fn parses_for_each_ref_output() {
        let refs = parse_refs("aaa refs/heads/main\nbbb refs/tags/v0.1\nccc refs/stash\n");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs["refs/heads/main"], "aaa");
        assert_eq!(refs["refs/tags/v0.1"], "bbb");
    }

    #[test]
    fn parses_commit_records_with_and_without_parents() {
        let raw = "c2\u{1f}t2\u{1f}c1\u{1f}second\u{1e}\nc1\u{1f}t1\u{1f}\u{1f}first\u{1e}\n";
        let commits = parse_commits(raw);

        assert_eq!(commits.len(), 2);
        assert_eq!(commits["c2"].parents, vec!["c1".to_string()]);
        assert_eq!(commits["c2"].tree, "t2");
        assert!(commits["c1"].parents.is_empty());
        assert_eq!(commits["c1"].subject, "first");
    }

    #[test]
    fn commit_header_parents_stop_at_message() {
        let raw = "tree t1\nparent p1\nparent p2\nauthor a <a@x> 1 +0000\n\nparent not-a-header\n";
        assert_eq!(parse_commit_parents(raw), vec!["p1".to_string(), "p2".to_string()]);
    }

    #[tokio::test]
    async fn shallow_clone_reports_its_boundary() {
        let dir = tempfile::TempDir::new().unwrap();
        let git = Git::default();
        let origin = dir.path().join("origin");
        tokio::fs::create_dir_all(&origin).await.unwrap();
        git.run(&origin, &["init", "-q"]).await.unwrap();
        for n in 0..3 {
            git.run(&origin, &["commit", "-q", "--allow-empty", "-m", &format!("c{}", n)])
                .await
                .unwrap();
        }

        let url = format!("file://{}", origin.display());
        git.run(dir.path(), &["clone", "-q", "--depth", "1", &url, "shallow"])
            .await
            .unwrap();
        let shallow = Snapshot::capture(&git, &dir.path().join("shallow")).await.unwrap();
        assert_eq!(shallow.commits.len(), 1);
        assert_eq!(shallow.boundary_commits().len(), 1);

        let full = Snapshot::capture(&git, &origin).await.unwrap();
        assert_eq!(full.commits.len(), 3);
        assert!(full.boundary_commits().is_empty());
    }

    #[test]
    fn parses_nul_separated_tree_listing_with_unusual_names() {
        let raw = "100644 blob b1\tfile with spaces.txt\0100644 blob b2\t日本語.txt\0100755 blob b3\ta/b/run.sh\0";
        let files = parse_tree(raw);

        assert_eq!(files.len(), 3);
        assert_eq!(files[&PathBuf::from("file with spaces.txt")].blob, "b1");
        assert_eq!(files[&PathBuf::from("日本語.txt")].blob, "b2");
        assert_eq!(files[&PathBuf::from("a/b/run.sh")].mode, "100755");
    }

    #[test]
    fn remote_view_maps_tracking_refs_onto_branches() {
        let snapshot = snapshot_with_refs(&[
            ("refs/heads/main", "c1"),
            ("refs/heads/local-only", "c9"),
            ("refs/remotes/origin/HEAD", "c1"),
            ("refs/remotes/origin/main", "c1"),
            ("refs/remotes/origin/feature", "c2"),
            ("refs/remotes/upstream/main", "c7"),
            ("refs/tags/v0.1", "c1"),
        ]);

        let view = snapshot.remote_view("origin");
        let names: Vec<&str> = view.refs.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec!["refs/heads/feature", "refs/heads/main", "refs/tags/v0.1"]
        );
    }

    #[test]
    fn published_view_drops_remote_tracking_refs() {
        let snapshot = snapshot_with_refs(&[
            ("refs/heads/main", "c1"),
            ("refs/remotes/origin/main", "c1"),
            ("refs/tags/v0.1", "c1"),
        ]);
        assert_eq!(snapshot.published_view().refs.len(), 2);
    }

    #[test]
    fn unresolved_refs_are_reported() {
        let mut snapshot = snapshot_with_refs(&[("refs/heads/main", "c1"), ("refs/heads/x", "zz")]);
        snapshot.commits.insert(
            "c1".to_string(),
            CommitNode {
                parents: vec![],
                tree: "t1".to_string(),
                subject: "root".to_string(),
            },
        );

        let unresolved = snapshot.unresolved_refs();
        assert_eq!(unresolved.len(), 1);
        assert!(unresolved.contains("refs/heads/x"));
        assert_eq!(snapshot.head_commit(), Some("c1"));
        assert_eq!(snapshot.head_branch(), Some("main"));
    }

    #[test]
    fn name_strips_git_suffix() {
        let mut snapshot = snapshot_with_refs(&[]);
        snapshot.root = PathBuf::from("/srv/served/fixture.git");
        assert_eq!(snapshot.name(), "fixture");
    }
}
