//! Quality-gate execution: sequential timed runs of extracted checks.
//!
//! Check extraction is pure (`core::gates`); this module owns the process
//! side, including the auto-detect ladder where exit code 127 (command not
//! found) moves on to the next candidate instead of failing the gate.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::gates::{GateCheck, GateCommand, GateKind};
use crate::io::process::run_command_with_timeout;

pub const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_CANDIDATE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 200_000;

/// Exit code shells report for an unresolvable command.
const EXIT_NOT_FOUND: i32 = 127;

/// Outcome of a single check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    /// The command that actually ran (the winning candidate for auto-detect).
    pub command: String,
    pub required: bool,
    pub passed: bool,
    pub duration_secs: f64,
    /// Combined stdout/stderr, bounded.
    pub output: String,
    /// Set when the result needs qualification, e.g. no candidate tool found.
    pub note: Option<String>,
}

/// Aggregate of one gate run. Ephemeral, rebuilt every iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateReport {
    pub results: Vec<GateResult>,
}

impl GateReport {
    /// True when every required check passed. Non-required failures and
    /// checks whose tools were absent do not fail the aggregate.
    pub fn all_passed(&self) -> bool {
        self.results.iter().filter(|r| r.required).all(|r| r.passed)
    }

    pub fn failed_required(&self) -> impl Iterator<Item = &GateResult> {
        self.results.iter().filter(|r| r.required && !r.passed)
    }

    /// Compact summary for prompts and memory entries.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        for result in &self.results {
            let icon = if result.passed { "pass" } else { "FAIL" };
            let req = if result.required { "" } else { " (optional)" };
            out.push_str(&format!(
                "- {} [{}{}] `{}` ({:.1}s)\n",
                result.name, icon, req, result.command, result.duration_secs
            ));
            if let Some(note) = &result.note {
                out.push_str(&format!("  note: {note}\n"));
            }
            if !result.passed {
                for line in excerpt(&result.output, 10) {
                    out.push_str(&format!("  {line}\n"));
                }
            }
        }
        out
    }
}

fn excerpt(output: &str, max_lines: usize) -> Vec<&str> {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() <= max_lines {
        lines
    } else {
        lines[lines.len() - max_lines..].to_vec()
    }
}

/// Settings for one gate run.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub candidate_timeout: Duration,
    pub output_limit_bytes: usize,
}

impl GateRequest {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: DEFAULT_GATE_TIMEOUT,
            candidate_timeout: DEFAULT_CANDIDATE_TIMEOUT,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

/// Seam for gate execution so the loop can be tested with scripted reports.
pub trait GateRunner {
    fn run_all(&self, checks: &[GateCheck], request: &GateRequest) -> Result<GateReport>;
}

/// Runs checks sequentially through `sh -c`.
pub struct ShellGateRunner;

impl GateRunner for ShellGateRunner {
    #[instrument(skip_all, fields(check_count = checks.len()))]
    fn run_all(&self, checks: &[GateCheck], request: &GateRequest) -> Result<GateReport> {
        let mut results = Vec::with_capacity(checks.len());
        for check in checks {
            let result = match &check.command {
                GateCommand::Shell(cmd) => run_shell_check(check, cmd, request)?,
                GateCommand::Auto(kind) => run_auto_check(check, *kind, request)?,
            };
            if result.passed {
                info!(name = %result.name, "gate passed");
            } else {
                warn!(name = %result.name, required = result.required, "gate failed");
            }
            results.push(result);
        }
        Ok(GateReport { results })
    }
}

fn run_shell_check(check: &GateCheck, cmd: &str, request: &GateRequest) -> Result<GateResult> {
    let (passed, output, duration, timed_out, _code) = run_one(cmd, request, request.timeout)?;
    Ok(GateResult {
        name: check.name.clone(),
        command: cmd.to_string(),
        required: check.required,
        passed,
        duration_secs: duration.as_secs_f64(),
        output,
        note: timed_out.then(|| format!("timed out after {}s", request.timeout.as_secs())),
    })
}

/// Try each candidate in order; a candidate whose tool is absent (exit 127)
/// or present but unconfigured (no matching script/recipe) drops out of the
/// ladder. If every candidate drops out the check passes with a note rather
/// than blocking projects that lack the tooling entirely.
fn run_auto_check(check: &GateCheck, kind: GateKind, request: &GateRequest) -> Result<GateResult> {
    let started = Instant::now();
    for candidate in kind.candidates() {
        let (passed, output, duration, timed_out, code) =
            run_one(candidate, request, request.candidate_timeout)?;
        if candidate_not_applicable(code, &output) {
            debug!(candidate, "candidate not applicable, trying next");
            continue;
        }
        return Ok(GateResult {
            name: check.name.clone(),
            command: (*candidate).to_string(),
            required: check.required,
            passed,
            duration_secs: duration.as_secs_f64(),
            output,
            note: timed_out
                .then(|| format!("timed out after {}s", request.candidate_timeout.as_secs())),
        });
    }
    debug!(kind = kind.display_name(), "no candidate tool found");
    Ok(GateResult {
        name: check.name.clone(),
        command: format!("auto-detect {}", kind.display_name().to_lowercase()),
        required: check.required,
        passed: true,
        duration_secs: started.elapsed().as_secs_f64(),
        output: String::new(),
        note: Some("no matching tool found, skipped".to_string()),
    })
}

/// True when a ladder candidate says nothing about the project: the tool is
/// absent (exit 127), or the runner exists but has no matching script or
/// recipe (npm/pnpm "Missing script", just "does not contain recipe" or no
/// justfile at all). A failing run of a configured tool is a real failure.
fn candidate_not_applicable(code: Option<i32>, output: &str) -> bool {
    if code == Some(EXIT_NOT_FOUND) {
        return true;
    }
    if code == Some(0) {
        return false;
    }
    let lower = output.to_lowercase();
    [
        "missing script",
        "no such script",
        "err_pnpm_no_script",
        "does not contain recipe",
        "no justfile found",
    ]
    .iter()
    .any(|marker| lower.contains(marker))
}

fn run_one(
    cmd: &str,
    request: &GateRequest,
    timeout: Duration,
) -> Result<(bool, String, Duration, bool, Option<i32>)> {
    let mut command = Command::new("sh");
    command.args(["-c", cmd]).current_dir(&request.workdir);
    let started = Instant::now();
    let output = run_command_with_timeout(command, None, timeout, request.output_limit_bytes)?;
    let duration = started.elapsed();
    let passed = output.status.success() && !output.timed_out;
    let code = output.status.code();
    Ok((passed, output.combined_lossy(cmd), duration, output.timed_out, code))
}

/// Write the full report to a log file for the iteration artifact directory.
pub fn write_gate_log(path: &Path, report: &GateReport) -> Result<()> {
    use anyhow::Context;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create gate log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    for result in &report.results {
        buf.push_str(&format!(
            "=== {} `{}` {} ===\n",
            result.name,
            result.command,
            if result.passed { "pass" } else { "fail" }
        ));
        if let Some(note) = &result.note {
            buf.push_str(&format!("note: {note}\n"));
        }
        buf.push_str(&result.output);
        if !buf.ends_with('\n') {
            buf.push('\n');
        }
    }
    std::fs::write(path, buf).with_context(|| format!("write gate log {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gates::{GateCheck, GateCommand};

    fn shell_check(name: &str, cmd: &str, required: bool) -> GateCheck {
        GateCheck {
            name: name.to_string(),
            command: GateCommand::Shell(cmd.to_string()),
            required,
        }
    }

    fn request() -> GateRequest {
        let mut req = GateRequest::new(std::env::temp_dir());
        req.timeout = Duration::from_secs(10);
        req.candidate_timeout = Duration::from_secs(10);
        req
    }

    #[test]
    fn required_failure_fails_aggregate_but_runs_everything() {
        let checks = vec![
            shell_check("Build", "true", true),
            shell_check("Test", "echo boom; exit 1", true),
            shell_check("Lint", "true", true),
        ];
        let report = ShellGateRunner.run_all(&checks, &request()).expect("run");
        assert_eq!(report.results.len(), 3);
        assert!(!report.all_passed());
        assert!(report.results[1].output.contains("boom"));
        assert!(report.results[2].passed);
    }

    #[test]
    fn optional_failure_does_not_fail_aggregate() {
        let checks = vec![
            shell_check("Test", "true", true),
            shell_check("Lint", "exit 1", false),
        ];
        let report = ShellGateRunner.run_all(&checks, &request()).expect("run");
        assert!(report.all_passed());
        assert_eq!(report.failed_required().count(), 0);
    }

    #[test]
    fn exit_127_on_direct_command_is_a_plain_failure() {
        let checks = vec![shell_check("Test", "definitely-not-a-real-tool-xyz", true)];
        let report = ShellGateRunner.run_all(&checks, &request()).expect("run");
        assert!(!report.all_passed());
    }

    #[test]
    fn auto_detect_with_no_tools_passes_with_note() {
        let report = GateReport {
            results: vec![GateResult {
                name: "Typecheck".to_string(),
                command: "auto-detect typecheck".to_string(),
                required: true,
                passed: true,
                duration_secs: 0.0,
                output: String::new(),
                note: Some("no matching tool found, skipped".to_string()),
            }],
        };
        assert!(report.all_passed());
    }

    #[test]
    fn unconfigured_runner_drops_out_of_the_ladder() {
        assert!(candidate_not_applicable(
            Some(1),
            "npm ERR! Missing script: \"typecheck\""
        ));
        assert!(candidate_not_applicable(
            Some(1),
            "error: Justfile does not contain recipe `lint`"
        ));
        assert!(candidate_not_applicable(
            Some(1),
            " ERR_PNPM_NO_SCRIPT  Missing script: test"
        ));
        assert!(candidate_not_applicable(Some(1), "error: No justfile found"));
        assert!(candidate_not_applicable(Some(127), ""));
        // A configured tool that fails is a real failure.
        assert!(!candidate_not_applicable(Some(1), "assertion failed: x == y"));
        // Marker text in a passing run's output changes nothing.
        assert!(!candidate_not_applicable(
            Some(0),
            "warning: missing script docs"
        ));
    }

    #[test]
    fn timeout_marks_check_failed_with_note() {
        let checks = vec![shell_check("Test", "sleep 30", true)];
        let mut req = request();
        req.timeout = Duration::from_millis(200);
        let report = ShellGateRunner.run_all(&checks, &req).expect("run");
        assert!(!report.results[0].passed);
        assert!(report.results[0].note.as_deref().unwrap_or("").contains("timed out"));
    }

    #[test]
    fn summary_includes_failure_excerpt() {
        let report = GateReport {
            results: vec![GateResult {
                name: "Test".to_string(),
                command: "npm test".to_string(),
                required: true,
                passed: false,
                duration_secs: 1.5,
                output: "line one\nassertion failed: x == y\n".to_string(),
                note: None,
            }],
        };
        let summary = report.render_summary();
        assert!(summary.contains("Test [FAIL]"));
        assert!(summary.contains("assertion failed"));
    }
}
