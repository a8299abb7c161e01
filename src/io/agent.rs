//! Agent adapter: spawns the configured coding-agent CLI, feeds it the
//! prompt on stdin, and consumes its JSONL event stream while staying
//! responsive to human interrupts.
//!
//! The [`Agent`] trait decouples the loop from the backend. Tests use
//! scripted agents that return predetermined transcripts without spawning
//! processes.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::intervene::InterventionChannel;

const AGENT_RESULT_SCHEMA: &str = include_str!("../schemas/agent_result.schema.json");

static RESULT_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: serde_json::Value =
        serde_json::from_str(AGENT_RESULT_SCHEMA).expect("parse agent result schema");
    validator_for(&schema).expect("compile agent result schema")
});

/// How long the consume loop sleeps between interrupt checks.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// One line of the agent's JSONL stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    Result {
        ok: bool,
        #[serde(default)]
        result: String,
        #[serde(default)]
        cost_usd: Option<f64>,
        #[serde(default)]
        turns: Option<u32>,
    },
}

/// Everything accumulated from one completed invocation.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    /// Concatenated text events plus the final result text.
    pub text: String,
    /// Tool names in invocation order.
    pub tool_uses: Vec<String>,
    pub ok: bool,
    pub cost_usd: Option<f64>,
    pub turns: Option<u32>,
}

impl Transcript {
    /// Last portion of the reply text, for memory notes.
    pub fn tail(&self, max_chars: usize) -> &str {
        let start = self.text.len().saturating_sub(max_chars);
        // Walk forward to a char boundary.
        let mut idx = start;
        while idx < self.text.len() && !self.text.is_char_boundary(idx) {
            idx += 1;
        }
        &self.text[idx..]
    }
}

/// Outcome of one invocation.
#[derive(Debug)]
pub enum AgentRun {
    Completed(Transcript),
    /// Killed in response to a human interrupt; the iteration retries.
    Interrupted,
}

/// Parameters for an invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub workdir: PathBuf,
    pub prompt: String,
    /// Selection-phase calls run tool-free so they stay fast and read-only.
    pub allow_tools: bool,
    pub max_turns: u32,
    pub timeout: Duration,
    /// When set, raw event lines are teed here for the iteration artifact.
    pub events_path: Option<PathBuf>,
}

/// Abstraction over coding-agent backends.
pub trait Agent {
    fn invoke(&self, request: &AgentRequest, channel: &InterventionChannel) -> Result<AgentRun>;
}

/// Agent that spawns a CLI speaking JSONL on stdout, prompt on stdin.
pub struct CliAgent {
    /// Program plus leading arguments, e.g. `["claude", "-p"]`.
    command: Vec<String>,
}

impl CliAgent {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("agent command is empty"));
        }
        Ok(Self { command })
    }

    fn build_command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd.arg("--output-format").arg("stream-json");
        cmd.arg("--max-turns").arg(request.max_turns.to_string());
        if !request.allow_tools {
            cmd.arg("--allowedTools").arg("");
        }
        cmd.current_dir(&request.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }
}

impl Agent for CliAgent {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), allow_tools = request.allow_tools))]
    fn invoke(&self, request: &AgentRequest, channel: &InterventionChannel) -> Result<AgentRun> {
        info!(workdir = %request.workdir.display(), "starting agent");
        let mut cmd = self.build_command(request);
        let mut child = cmd.spawn().with_context(|| {
            format!("spawn agent `{}`", self.command.join(" "))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("agent stdin was not piped"))?;
        stdin
            .write_all(request.prompt.as_bytes())
            .context("write prompt to agent")?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("agent stdout was not piped"))?;

        let (tx, rx) = mpsc::channel::<String>();
        let reader_handle = thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(err = %e, "agent stdout read error");
                        break;
                    }
                }
            }
        });

        let mut events_file = match &request.events_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create events dir {}", parent.display()))?;
                }
                Some(
                    std::fs::File::create(path)
                        .with_context(|| format!("create events file {}", path.display()))?,
                )
            }
            None => None,
        };

        let deadline = Instant::now() + request.timeout;
        let mut transcript = Transcript::default();
        let mut saw_result = false;

        let outcome = loop {
            if channel.interrupt_raised() {
                info!("interrupt raised, killing agent");
                child.kill().context("kill agent on interrupt")?;
                child.wait().context("wait agent after interrupt kill")?;
                break AgentRun::Interrupted;
            }
            if Instant::now() >= deadline {
                warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
                child.kill().context("kill agent on timeout")?;
                child.wait().context("wait agent after timeout kill")?;
                return Err(anyhow!(
                    "agent timed out after {}s",
                    request.timeout.as_secs()
                ));
            }
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    if let Some(file) = events_file.as_mut() {
                        let _ = writeln!(file, "{line}");
                    }
                    if let Some(event) = parse_event(&line) {
                        if let AgentEvent::Result { .. } = &event {
                            saw_result = true;
                        }
                        fold_event(&mut transcript, event);
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    let status = child.wait().context("wait agent")?;
                    if !status.success() {
                        return Err(anyhow!(
                            "agent exited with status {:?}",
                            status.code()
                        ));
                    }
                    if !saw_result {
                        warn!("agent stream ended without a result event");
                        transcript.ok = true;
                    }
                    break AgentRun::Completed(transcript);
                }
            }
        };

        let _ = reader_handle.join();
        debug!("agent finished");
        Ok(outcome)
    }
}

/// Parse one stream line. Unknown or malformed lines are skipped; a
/// well-formed result event must additionally satisfy the schema.
fn parse_event(line: &str) -> Option<AgentEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            debug!(err = %e, "skipping non-JSON stream line");
            return None;
        }
    };
    if value.get("type").and_then(|t| t.as_str()) == Some("result")
        && !RESULT_VALIDATOR.is_valid(&value)
    {
        let messages = RESULT_VALIDATOR
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        warn!(errors = %messages.join("; "), "malformed result event");
        return None;
    }
    match serde_json::from_value(value) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!(err = %e, "skipping unrecognized event");
            None
        }
    }
}

fn fold_event(transcript: &mut Transcript, event: AgentEvent) {
    match event {
        AgentEvent::Text { text } => {
            if !transcript.text.is_empty() && !transcript.text.ends_with('\n') {
                transcript.text.push('\n');
            }
            transcript.text.push_str(&text);
        }
        AgentEvent::ToolUse { name, .. } => transcript.tool_uses.push(name),
        AgentEvent::Result {
            ok,
            result,
            cost_usd,
            turns,
        } => {
            transcript.ok = ok;
            transcript.cost_usd = cost_usd;
            transcript.turns = turns;
            if !result.trim().is_empty() {
                if !transcript.text.is_empty() && !transcript.text.ends_with('\n') {
                    transcript.text.push('\n');
                }
                transcript.text.push_str(&result);
            }
        }
    }
}
