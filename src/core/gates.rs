//! Quality-gate check extraction from the project configuration document.
//!
//! Checks are ephemeral: recomputed from the document on every run, never
//! persisted. Execution lives in `io::gates`; this module is pure text
//! processing plus the auto-detect candidate policy table.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static BACK_PRESSURE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)back.?pressure").unwrap());
static SETUP_COMMANDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)setup\s+commands").unwrap());
static NAMED_CHECK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-*]\s*([^:`]+?)\s*:\s*`([^`]+)`").unwrap());
static BARE_CHECK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[-*]\s*`([^`]+)`").unwrap());
static OPTIONAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\(optional\)").unwrap());

/// Category used when a check's command must be auto-detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    Typecheck,
    Lint,
    Test,
    Build,
    Format,
}

impl GateKind {
    pub fn display_name(self) -> &'static str {
        match self {
            GateKind::Typecheck => "Typecheck",
            GateKind::Lint => "Lint",
            GateKind::Test => "Test",
            GateKind::Build => "Build",
            GateKind::Format => "Format",
        }
    }

    /// Ordered candidate commands tried during auto-detection: a task runner,
    /// two package-manager invocations, then a direct tool invocation. The
    /// first candidate that is found on the system decides the outcome.
    pub fn candidates(self) -> &'static [&'static str] {
        match self {
            GateKind::Typecheck => &[
                "just typecheck",
                "npm run typecheck",
                "pnpm run typecheck",
                "cargo check",
            ],
            GateKind::Lint => &["just lint", "npm run lint", "pnpm run lint", "cargo clippy"],
            GateKind::Test => &["just test", "npm test", "pnpm test", "cargo test"],
            GateKind::Build => &["just build", "npm run build", "pnpm run build", "cargo build"],
            GateKind::Format => &[
                "just fmt",
                "npm run format",
                "pnpm run format",
                "cargo fmt --check",
            ],
        }
    }
}

/// Command for a check: a literal shell command or the auto-detect sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateCommand {
    Shell(String),
    Auto(GateKind),
}

/// A named verification command derived from the project configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateCheck {
    /// Display label.
    pub name: String,
    pub command: GateCommand,
    /// Failure of a required check fails the aggregate.
    pub required: bool,
}

impl GateCheck {
    fn auto(kind: GateKind) -> Self {
        Self {
            name: kind.display_name().to_string(),
            command: GateCommand::Auto(kind),
            required: true,
        }
    }

    /// Human-readable command for display in prompts and reports.
    pub fn command_display(&self) -> String {
        match &self.command {
            GateCommand::Shell(cmd) => cmd.clone(),
            GateCommand::Auto(kind) => format!("auto-detect {}", kind.display_name().to_lowercase()),
        }
    }
}

/// The fixed default set used when no configuration yields any checks.
pub fn default_checks() -> Vec<GateCheck> {
    vec![
        GateCheck::auto(GateKind::Typecheck),
        GateCheck::auto(GateKind::Lint),
        GateCheck::auto(GateKind::Test),
    ]
}

/// Extract the ordered check list from a project configuration document.
///
/// Prefers a "Back pressure" section; falls back to "Setup commands" (checks
/// there are non-required); falls back to [`default_checks`] when neither
/// section exists or extraction yields nothing.
pub fn extract_checks(doc: &str) -> Vec<GateCheck> {
    if let Some(section) = find_section(doc, &BACK_PRESSURE_RE) {
        let checks = extract_from_section(&section, true);
        if !checks.is_empty() {
            return checks;
        }
    }
    if let Some(section) = find_section(doc, &SETUP_COMMANDS_RE) {
        let checks = extract_from_section(&section, false);
        if !checks.is_empty() {
            return checks;
        }
    }
    default_checks()
}

/// Lines of the first section whose heading matches `heading_re`, up to the
/// next heading of any level.
fn find_section(doc: &str, heading_re: &Regex) -> Option<Vec<String>> {
    let mut section = Vec::new();
    let mut found = false;
    for line in doc.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            if found {
                break;
            }
            found = heading_re.is_match(trimmed);
            continue;
        }
        if found {
            section.push(line.to_string());
        }
    }
    found.then_some(section)
}

fn extract_from_section(lines: &[String], required_default: bool) -> Vec<GateCheck> {
    let mut checks = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        let optional = OPTIONAL_RE.is_match(trimmed);
        if let Some(caps) = NAMED_CHECK_RE.captures(trimmed) {
            let raw_name = caps.get(1).unwrap().as_str();
            let name = OPTIONAL_RE.replace_all(raw_name, "").trim().to_string();
            let command = caps.get(2).unwrap().as_str().trim().to_string();
            checks.push(GateCheck {
                name,
                command: GateCommand::Shell(command),
                required: required_default && !optional,
            });
        } else if let Some(caps) = BARE_CHECK_RE.captures(trimmed) {
            let command = caps.get(1).unwrap().as_str().trim().to_string();
            checks.push(GateCheck {
                name: infer_name(&command),
                command: GateCommand::Shell(command),
                required: required_default && !optional,
            });
        }
    }
    checks
}

/// Infer a display name from command content by keyword matching.
pub fn infer_name(command: &str) -> String {
    let lower = command.to_lowercase();
    if lower.contains("test") {
        return "Test".to_string();
    }
    if lower.contains("lint") || lower.contains("eslint") || lower.contains("clippy") {
        return "Lint".to_string();
    }
    if lower.contains("typecheck")
        || lower.contains("tsc")
        || lower.contains("mypy")
        || lower.contains("check")
    {
        return "Typecheck".to_string();
    }
    if lower.contains("build") || lower.contains("compile") {
        return "Build".to_string();
    }
    if lower.contains("format") || lower.contains("fmt") {
        return "Format".to_string();
    }
    command
        .split_whitespace()
        .next()
        .unwrap_or("Check")
        .to_string()
}
