//! Git adapter for the loop's safety-net commits and git-backed memory.
//!
//! The loop never hard-fails on git trouble (a repo-less workdir is legal),
//! so callers treat most errors here as warnings. We keep a small, explicit
//! wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

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

    /// Whether the workdir sits inside a git worktree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
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

    /// True if the worktree has any modified or untracked files.
    #[instrument(skip_all)]
    pub fn has_uncommitted_changes(&self) -> Result<bool> {
        let entries = self.status_porcelain()?;
        debug!(entry_count = entries.len(), "worktree status");
        Ok(!entries.is_empty())
    }

    /// Recent commit subjects, newest first, one per line.
    pub fn log_oneline(&self, max_count: usize) -> Result<Vec<String>> {
        let arg = format!("--max-count={max_count}");
        let out = self.run_capture(&["log", "--oneline", "--no-decorate", &arg])?;
        Ok(out.lines().map(str::to_string).collect())
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

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Stage everything and commit, used as the end-of-iteration safety net.
    ///
    /// Returns Ok(false) when the worktree was already clean.
    #[instrument(skip_all)]
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        self.add_all()?;
        let committed = self.commit_staged(message)?;
        if !committed {
            warn!("safety-net commit requested but nothing to commit");
        }
        Ok(committed)
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
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: " M".to_string(),
                path: "src/main.rs".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn commit_all_commits_dirty_worktree_once() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        assert!(!git.has_uncommitted_changes().expect("status"));

        std::fs::write(repo.path().join("new.txt"), "hi").expect("write");
        assert!(git.has_uncommitted_changes().expect("status"));

        assert!(git.commit_all("iteration 1 work").expect("commit"));
        assert!(!git.has_uncommitted_changes().expect("status"));
        assert!(!git.commit_all("again").expect("commit"));

        let log = git.log_oneline(5).expect("log");
        assert!(log[0].contains("iteration 1 work"));
    }

    #[test]
    fn is_repo_false_outside_worktree() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(!Git::new(dir.path()).is_repo());
    }
}
