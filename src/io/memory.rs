//! Cross-iteration memory behind a single trait.
//!
//! Two backends: `GitMemory` reads recent commit subjects and writes nothing,
//! `FileMemory` appends structured iteration blocks to a progress file and
//! reads them back. Either way the summary that reaches the prompt leads with
//! a failure banner when the previous iteration's gates failed, so the agent
//! sees the breakage before the history.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::io::gates::GateReport;
use crate::io::git::Git;

/// One iteration's record, written by the file backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryEntry {
    pub iteration: u32,
    pub task: String,
    pub decisions: Vec<String>,
    pub files_changed: Vec<String>,
    pub notes: String,
    /// Rendered gate outcome line, e.g. "3 passed, 1 failed (Test)".
    pub gates: String,
}

/// Source of the context summary fed into each iteration's prompt.
pub trait Memory {
    /// Summarize recent history, prefixed with a failure banner when the
    /// prior iteration's gates failed.
    fn summarize(&self, prior_gates: Option<&GateReport>) -> Result<String>;

    /// Persist one iteration's record. No-op for read-only backends.
    fn record(&self, entry: &MemoryEntry) -> Result<()>;
}

fn failure_banner(prior_gates: Option<&GateReport>) -> Option<String> {
    let report = prior_gates?;
    if report.all_passed() {
        return None;
    }
    let names: Vec<&str> = report.failed_required().map(|r| r.name.as_str()).collect();
    let mut banner = format!(
        "ATTENTION: the previous iteration failed quality checks ({}). Fix these before anything else.\n",
        names.join(", ")
    );
    banner.push_str(&report.render_summary());
    Some(banner)
}

/// Memory derived from git history. Zero bookkeeping: the safety-net commit
/// at the end of each iteration is the write path.
pub struct GitMemory {
    git: Git,
    depth: usize,
}

impl GitMemory {
    pub fn new(workdir: impl Into<PathBuf>, depth: usize) -> Self {
        Self {
            git: Git::new(workdir),
            depth,
        }
    }
}

impl Memory for GitMemory {
    #[instrument(skip_all)]
    fn summarize(&self, prior_gates: Option<&GateReport>) -> Result<String> {
        let mut out = String::new();
        if let Some(banner) = failure_banner(prior_gates) {
            out.push_str(&banner);
            out.push('\n');
        }
        if !self.git.is_repo() {
            warn!("not a git repository, memory summary is empty");
            return Ok(out);
        }
        let subjects = self
            .git
            .log_oneline(self.depth)
            .context("read git log for memory")?;
        if subjects.is_empty() {
            return Ok(out);
        }
        out.push_str("Recent commits (newest first):\n");
        for subject in subjects {
            let _ = writeln!(out, "- {subject}");
        }
        Ok(out)
    }

    fn record(&self, _entry: &MemoryEntry) -> Result<()> {
        // Commits are the record; nothing extra to write.
        Ok(())
    }
}

/// Memory kept in an append-only progress file with one block per iteration.
pub struct FileMemory {
    path: PathBuf,
    depth: usize,
}

impl FileMemory {
    pub fn new(path: impl Into<PathBuf>, depth: usize) -> Self {
        Self {
            path: path.into(),
            depth,
        }
    }

    fn read_blocks(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("read progress file {}", self.path.display()))?;
        let mut blocks = Vec::new();
        let mut current = String::new();
        for line in text.lines() {
            if line.starts_with("## Iteration ") {
                if current.starts_with("## Iteration ") {
                    blocks.push(current.trim_end().to_string());
                }
                current = String::new();
            }
            current.push_str(line);
            current.push('\n');
        }
        if current.starts_with("## Iteration ") {
            blocks.push(current.trim_end().to_string());
        }
        Ok(blocks)
    }
}

impl Memory for FileMemory {
    #[instrument(skip_all)]
    fn summarize(&self, prior_gates: Option<&GateReport>) -> Result<String> {
        let mut out = String::new();
        if let Some(banner) = failure_banner(prior_gates) {
            out.push_str(&banner);
            out.push('\n');
        }
        let blocks = self.read_blocks()?;
        if blocks.is_empty() {
            debug!("no progress history yet");
            return Ok(out);
        }
        let start = blocks.len().saturating_sub(self.depth);
        out.push_str("Progress so far (oldest first):\n\n");
        for block in &blocks[start..] {
            out.push_str(block);
            out.push_str("\n\n");
        }
        Ok(out.trim_end().to_string() + "\n")
    }

    #[instrument(skip_all, fields(iteration = entry.iteration))]
    fn record(&self, entry: &MemoryEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create progress dir {}", parent.display()))?;
        }
        let mut block = String::new();
        let _ = writeln!(
            block,
            "## Iteration {} - {}",
            entry.iteration,
            Utc::now().to_rfc3339()
        );
        let _ = writeln!(block, "Task: {}", entry.task);
        if !entry.gates.is_empty() {
            let _ = writeln!(block, "Gates: {}", entry.gates);
        }
        for decision in &entry.decisions {
            let _ = writeln!(block, "Decision: {decision}");
        }
        if !entry.files_changed.is_empty() {
            let _ = writeln!(block, "Files: {}", entry.files_changed.join(", "));
        }
        if !entry.notes.trim().is_empty() {
            let _ = writeln!(block, "Notes: {}", entry.notes.trim().replace('\n', " "));
        }

        let mut text = if self.path.exists() {
            fs::read_to_string(&self.path)
                .with_context(|| format!("read progress file {}", self.path.display()))?
        } else {
            String::from("# Progress\n")
        };
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push('\n');
        text.push_str(&block);
        fs::write(&self.path, text)
            .with_context(|| format!("write progress file {}", self.path.display()))?;
        debug!("recorded iteration block");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::gates::GateResult;
    use crate::test_support::TestRepo;

    fn failing_report() -> GateReport {
        GateReport {
            results: vec![GateResult {
                name: "Test".to_string(),
                command: "npm test".to_string(),
                required: true,
                passed: false,
                duration_secs: 2.0,
                output: "1 failing".to_string(),
                note: None,
            }],
        }
    }

    #[test]
    fn file_memory_round_trips_blocks_newest_last() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = FileMemory::new(dir.path().join("progress.md"), 10);

        for i in 1..=3u32 {
            memory
                .record(&MemoryEntry {
                    iteration: i,
                    task: format!("task {i}"),
                    notes: format!("note {i}"),
                    ..Default::default()
                })
                .expect("record");
        }

        let summary = memory.summarize(None).expect("summarize");
        let pos1 = summary.find("task 1").expect("task 1");
        let pos3 = summary.find("task 3").expect("task 3");
        assert!(pos1 < pos3);
        assert!(summary.contains("## Iteration 2"));
    }

    #[test]
    fn file_memory_depth_limits_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = FileMemory::new(dir.path().join("progress.md"), 2);
        for i in 1..=4u32 {
            memory
                .record(&MemoryEntry {
                    iteration: i,
                    task: format!("task {i}"),
                    ..Default::default()
                })
                .expect("record");
        }
        let summary = memory.summarize(None).expect("summarize");
        assert!(!summary.contains("task 1"));
        assert!(!summary.contains("task 2"));
        assert!(summary.contains("task 3"));
        assert!(summary.contains("task 4"));
    }

    #[test]
    fn failure_banner_leads_the_summary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = FileMemory::new(dir.path().join("progress.md"), 10);
        memory
            .record(&MemoryEntry {
                iteration: 1,
                task: "build the thing".to_string(),
                ..Default::default()
            })
            .expect("record");

        let report = failing_report();
        let summary = memory.summarize(Some(&report)).expect("summarize");
        assert!(summary.starts_with("ATTENTION:"));
        assert!(summary.contains("(Test)"));
        let banner_pos = summary.find("ATTENTION").expect("banner");
        let history_pos = summary.find("build the thing").expect("history");
        assert!(banner_pos < history_pos);
    }

    #[test]
    fn passing_report_produces_no_banner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = FileMemory::new(dir.path().join("progress.md"), 10);
        let report = GateReport { results: vec![] };
        let summary = memory.summarize(Some(&report)).expect("summarize");
        assert!(!summary.contains("ATTENTION"));
    }

    #[test]
    fn git_memory_lists_recent_commits() {
        let repo = TestRepo::new().expect("repo");
        repo.commit_file("a.txt", "a", "add feature a").expect("commit");
        repo.commit_file("b.txt", "b", "add feature b").expect("commit");

        let memory = GitMemory::new(repo.path(), 10);
        let summary = memory.summarize(None).expect("summarize");
        assert!(summary.contains("add feature a"));
        assert!(summary.contains("add feature b"));

        // record is a no-op
        memory
            .record(&MemoryEntry::default())
            .expect("record");
    }

    #[test]
    fn git_memory_outside_repo_is_empty_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = GitMemory::new(dir.path(), 10);
        let summary = memory.summarize(None).expect("summarize");
        assert!(summary.is_empty());
    }
}
