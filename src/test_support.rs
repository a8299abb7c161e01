//! Test-only helpers: deterministic task builders, a scripted agent, a
//! scripted gate runner, and a throwaway git repository.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};

use crate::core::gates::GateCheck;
use crate::core::tasklist::{Criterion, Priority, TaskItem, TaskList, TaskStatus};
use crate::intervene::InterventionChannel;
use crate::io::agent::{Agent, AgentRequest, AgentRun, Transcript};
use crate::io::gates::{GateReport, GateRequest, GateResult, GateRunner};

/// Create a deterministic pending task.
pub fn task(id: &str, description: &str, priority: Priority) -> TaskItem {
    TaskItem {
        id: id.to_string(),
        category: "functional".to_string(),
        description: description.to_string(),
        priority,
        requirements: Vec::new(),
        criteria: Vec::new(),
        status: TaskStatus::Pending,
        passes: false,
    }
}

/// Create a task with unfinished criteria.
pub fn task_with_criteria(
    id: &str,
    description: &str,
    priority: Priority,
    criteria: &[&str],
) -> TaskItem {
    let mut item = task(id, description, priority);
    item.criteria = criteria
        .iter()
        .map(|text| Criterion {
            text: (*text).to_string(),
            done: false,
        })
        .collect();
    item
}

/// Wrap tasks in a list with deterministic defaults.
pub fn list(items: Vec<TaskItem>) -> TaskList {
    TaskList {
        name: "Tasks".to_string(),
        description: None,
        items,
    }
}

/// One scripted response for [`ScriptedAgent`].
pub enum ScriptedRun {
    /// Complete with a successful transcript carrying this reply text.
    Reply(String),
    /// Complete with a transcript whose `ok` flag is false.
    Failed(String),
    /// Report an interrupt, as if a human stopped the agent.
    Interrupted,
    /// Return an error from the invocation itself.
    Error(String),
}

/// Agent double that pops scripted runs in order and records prompts.
pub struct ScriptedAgent {
    runs: RefCell<VecDeque<ScriptedRun>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Prompts received so far, in invocation order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl Agent for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest, _channel: &InterventionChannel) -> Result<AgentRun> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        let run = self
            .runs
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent exhausted"))?;
        match run {
            ScriptedRun::Reply(text) => Ok(AgentRun::Completed(Transcript {
                text,
                ok: true,
                ..Default::default()
            })),
            ScriptedRun::Failed(text) => Ok(AgentRun::Completed(Transcript {
                text,
                ok: false,
                ..Default::default()
            })),
            ScriptedRun::Interrupted => Ok(AgentRun::Interrupted),
            ScriptedRun::Error(message) => Err(anyhow!(message)),
        }
    }
}

/// Gate runner double that pops scripted reports in order.
pub struct ScriptedGateRunner {
    reports: RefCell<VecDeque<GateReport>>,
}

impl ScriptedGateRunner {
    pub fn new(reports: Vec<GateReport>) -> Self {
        Self {
            reports: RefCell::new(reports.into()),
        }
    }

    /// A runner whose every report passes.
    pub fn always_passing() -> Self {
        Self {
            reports: RefCell::new(VecDeque::new()),
        }
    }
}

impl GateRunner for ScriptedGateRunner {
    fn run_all(&self, checks: &[GateCheck], _request: &GateRequest) -> Result<GateReport> {
        if let Some(report) = self.reports.borrow_mut().pop_front() {
            return Ok(report);
        }
        Ok(GateReport {
            results: checks
                .iter()
                .map(|check| GateResult {
                    name: check.name.clone(),
                    command: check.command_display(),
                    required: check.required,
                    passed: true,
                    duration_secs: 0.0,
                    output: String::new(),
                    note: None,
                })
                .collect(),
        })
    }
}

/// A report with a single failing required check, for failure-path tests.
pub fn failing_report(name: &str) -> GateReport {
    GateReport {
        results: vec![GateResult {
            name: name.to_string(),
            command: format!("run {name}"),
            required: true,
            passed: false,
            duration_secs: 0.1,
            output: "it broke".to_string(),
            note: None,
        }],
    }
}

/// Throwaway git repository with identity configured and an initial commit.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo dir")?;
        let repo = Self { dir };
        repo.git(&["init", "--initial-branch=main"])?;
        repo.git(&["config", "user.name", "tester"])?;
        repo.git(&["config", "user.email", "tester@example.com"])?;
        std::fs::write(repo.path().join("README.md"), "# test\n").context("write README")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-m", "initial commit"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn path_buf(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Write a file and commit it.
    pub fn commit_file(&self, name: &str, contents: &str, message: &str) -> Result<()> {
        std::fs::write(self.path().join(name), contents)
            .with_context(|| format!("write {name}"))?;
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-m", message])?;
        Ok(())
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !status.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&status.stderr).trim()
            ));
        }
        Ok(())
    }
}
