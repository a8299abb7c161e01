//! Loop configuration stored under `.pilot/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Loop configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PilotConfig {
    /// Hard cap on loop iterations per run.
    pub max_iterations: u32,

    /// Pause for human confirmation between iterations.
    pub hitl: bool,

    /// Explicit task list path; discovery applies when unset.
    pub prd_path: Option<String>,

    /// Explicit project configuration document; discovery applies when unset.
    pub project_doc: Option<String>,

    pub memory: MemoryConfig,
    pub agent: AgentConfig,
    pub gates: GateConfig,
}

/// Which memory backend feeds context into each prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryBackend {
    Git,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    pub backend: MemoryBackend,
    /// How many commits or progress blocks the summary includes.
    pub depth: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: MemoryBackend::Git,
            depth: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Program plus leading arguments (e.g. `["claude","-p"]`).
    pub command: Vec<String>,

    pub max_turns: u32,

    /// Per-invocation wall-clock budget in seconds.
    pub timeout_secs: u64,

    /// Environment variables that must be set before the agent can run.
    pub require_env: Vec<String>,

    /// Truncate prompt context beyond this many bytes.
    pub prompt_budget_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            max_turns: 30,
            timeout_secs: 30 * 60,
            require_env: vec!["ANTHROPIC_API_KEY".to_string()],
            prompt_budget_bytes: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    /// Per-check wall-clock budget in seconds.
    pub timeout_secs: u64,

    /// Budget for each auto-detect candidate.
    pub candidate_timeout_secs: u64,

    /// Truncate check stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            candidate_timeout_secs: 120,
            output_limit_bytes: 200_000,
        }
    }
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            hitl: false,
            prd_path: None,
            project_doc: None,
            memory: MemoryConfig::default(),
            agent: AgentConfig::default(),
            gates: GateConfig::default(),
        }
    }
}

impl PilotConfig {
    /// Collect every problem instead of failing on the first, so a hand-edited
    /// file gets one complete report.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.max_iterations == 0 {
            problems.push("max_iterations must be > 0".to_string());
        }
        if self.memory.depth == 0 {
            problems.push("memory.depth must be > 0".to_string());
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            problems.push("agent.command must be a non-empty array".to_string());
        }
        if self.agent.max_turns == 0 {
            problems.push("agent.max_turns must be > 0".to_string());
        }
        if self.agent.timeout_secs == 0 {
            problems.push("agent.timeout_secs must be > 0".to_string());
        }
        if self.agent.prompt_budget_bytes == 0 {
            problems.push("agent.prompt_budget_bytes must be > 0".to_string());
        }
        if self.gates.timeout_secs == 0 {
            problems.push("gates.timeout_secs must be > 0".to_string());
        }
        if self.gates.candidate_timeout_secs == 0 {
            problems.push("gates.candidate_timeout_secs must be > 0".to_string());
        }
        if self.gates.output_limit_bytes == 0 {
            problems.push("gates.output_limit_bytes must be > 0".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("invalid config:\n- {}", problems.join("\n- ")))
        }
    }

    /// Check that every required environment variable is present, via an
    /// injectable lookup so tests need not mutate the process environment.
    pub fn check_required_env(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let missing: Vec<&str> = self
            .agent
            .require_env
            .iter()
            .filter(|name| {
                lookup(name)
                    .map(|v| v.trim().is_empty())
                    .unwrap_or(true)
            })
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "missing required environment variables: {}",
                missing.join(", ")
            ))
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<PilotConfig> {
    if !path.exists() {
        let cfg = PilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PilotConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
