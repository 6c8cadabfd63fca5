//! Git adapter for the version-control seam.
//!
//! The engine snapshots before each task, commits after validation passes and
//! rolls back on interrupt, so we keep a small, explicit wrapper around `git`
//! subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::CommitRef;

/// Snapshot/commit/rollback operations the control loop depends on.
pub trait VersionControl {
    /// Record the current state as a restore point.
    fn snapshot(&self) -> Result<CommitRef>;
    /// Commit all working-tree changes. Succeeds even when nothing changed.
    fn commit(&self, message: &str) -> Result<CommitRef>;
    /// Discard all uncommitted changes and return to `to`.
    fn rollback(&self, to: &CommitRef) -> Result<()>;
    fn current_ref(&self) -> Result<CommitRef>;
}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if `workdir` is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    #[instrument(skip_all)]
    pub fn init(&self) -> Result<()> {
        debug!(workdir = %self.workdir.display(), "initializing repository");
        self.run_checked(&["init", "--quiet"])?;
        Ok(())
    }

    /// Configure a repository-local committer identity when none is set, so
    /// unattended commits cannot fail on a fresh machine.
    pub fn ensure_identity(&self) -> Result<()> {
        for (key, fallback) in [("user.name", "planloop"), ("user.email", "planloop@localhost")] {
            let configured = self
                .run(&["config", "--get", key])
                .map(|out| out.status.success())
                .unwrap_or(false);
            if !configured {
                debug!(key, fallback, "setting local git identity");
                self.run_checked(&["config", key, fallback])?;
            }
        }
        Ok(())
    }

    /// Full SHA of HEAD.
    pub fn head(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// True once the repository has at least one commit.
    pub fn has_commits(&self) -> bool {
        self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Stage everything and commit, allowing an empty commit. Returns the new HEAD.
    #[instrument(skip_all)]
    pub fn commit_all(&self, message: &str) -> Result<String> {
        self.add_all()?;
        if !self.has_staged_changes()? {
            debug!("no changes staged, recording empty commit");
        }
        self.run_checked(&["commit", "--quiet", "--allow-empty", "-m", message])?;
        self.head()
    }

    /// Reset tracked files to `rev` and delete untracked, non-ignored files.
    #[instrument(skip_all, fields(rev))]
    pub fn reset_hard(&self, rev: &str) -> Result<()> {
        debug!(rev, "resetting worktree");
        self.run_checked(&["reset", "--hard", "--quiet", rev])?;
        self.run_checked(&["clean", "-fd", "--quiet"])?;
        Ok(())
    }

    /// Number of commits reachable from HEAD but not from `rev`.
    pub fn commits_since(&self, rev: &str) -> Result<usize> {
        let range = format!("{rev}..HEAD");
        let out = self.run_capture(&["rev-list", "--count", &range])?;
        out.trim()
            .parse()
            .with_context(|| format!("parse rev-list count '{}'", out.trim()))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl VersionControl for Git {
    fn snapshot(&self) -> Result<CommitRef> {
        let head = self.current_ref()?;
        let dirty = self.status_porcelain()?;
        if !dirty.is_empty() {
            // Uncommitted changes are not part of the restore point.
            warn!(
                changed = dirty.len(),
                "worktree has uncommitted changes at snapshot"
            );
        }
        debug!(head = %head.short(), "snapshot taken");
        Ok(head)
    }

    fn commit(&self, message: &str) -> Result<CommitRef> {
        let sha = self.commit_all(message).context("commit task changes")?;
        Ok(CommitRef(sha))
    }

    fn rollback(&self, to: &CommitRef) -> Result<()> {
        warn!(to = %to.short(), "rolling back worktree");
        self.reset_hard(to.as_str())
            .with_context(|| format!("roll back to {}", to.short()))
    }

    fn current_ref(&self) -> Result<CommitRef> {
        Ok(CommitRef(self.head().context("resolve HEAD")?))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    /// Verifies commit records changes and rollback discards later edits.
    ///
    /// Commits one file, then modifies it and adds an untracked file; rollback
    /// to the commit restores the committed content and removes the new file.
    #[test]
    fn commit_then_rollback_restores_snapshot() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let base = git.snapshot().expect("snapshot");

        fs::write(repo.path().join("a.txt"), "v1").expect("write");
        let committed = git.commit("add a").expect("commit");
        assert_ne!(committed, base);
        assert_eq!(git.commits_since(base.as_str()).expect("count"), 1);

        fs::write(repo.path().join("a.txt"), "v2").expect("write");
        fs::write(repo.path().join("stray.txt"), "junk").expect("write");
        git.rollback(&committed).expect("rollback");

        assert_eq!(
            fs::read_to_string(repo.path().join("a.txt")).expect("read"),
            "v1"
        );
        assert!(!repo.path().join("stray.txt").exists());
        assert!(git.status_porcelain().expect("status").is_empty());
    }

    #[test]
    fn commit_without_changes_still_advances_head() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let before = git.current_ref().expect("head");
        let after = git.commit("nothing to see").expect("commit");
        assert_ne!(before, after);
    }
}
