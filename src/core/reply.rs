//! Parsing of agent reply text: selection answers, per-task completion
//! markers, and the run-complete sentinel.

use std::sync::LazyLock;

use regex::Regex;

/// Emitted by the agent when every remaining item is already satisfied.
pub const RUN_COMPLETE_SENTINEL: &str = "ALL_TASKS_COMPLETE";

static SELECTED_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*SELECTED_TASK_ID:\s*(\S+)\s*$").unwrap());
static SELECTED_DESC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*SELECTED_TASK:\s*(.+?)\s*$").unwrap());
static TASK_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)task\s*#(\d+)").unwrap());
static COMPLETED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*#{1,6}\s*Completed:\s*(.+?)\s*$").unwrap());

/// An answer extracted from a selection-phase reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Strict id line, or a loose `Task #N` mention.
    Id(String),
    /// Strict description line; must be resolved against the list.
    Description(String),
}

/// Extract the selected task from a reply, preferring the strict line formats
/// over the loose `Task #N` fallback. Returns `None` when nothing matches and
/// the caller should fall back to single-phase mode.
pub fn parse_selection(reply: &str) -> Option<Selection> {
    if let Some(caps) = SELECTED_ID_RE.captures(reply) {
        return Some(Selection::Id(caps[1].to_string()));
    }
    if let Some(caps) = SELECTED_DESC_RE.captures(reply) {
        return Some(Selection::Description(caps[1].to_string()));
    }
    if let Some(caps) = TASK_NUMBER_RE.captures(reply) {
        return Some(Selection::Id(caps[1].to_string()));
    }
    None
}

/// Find the task description the agent claims to have completed, from a
/// `## Completed: <description>` heading anywhere in the reply. The last
/// marker wins when several appear.
pub fn find_completion_marker(reply: &str) -> Option<String> {
    COMPLETED_RE
        .captures_iter(reply)
        .last()
        .map(|caps| caps[1].to_string())
}

/// Whether the reply declares the whole run complete.
pub fn contains_run_complete(reply: &str) -> bool {
    reply.contains(RUN_COMPLETE_SENTINEL)
}
