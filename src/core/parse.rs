//! Task list parser: a single forward scan over classified lines.
//!
//! Accepts the heading-driven PRD dialect and the legacy checkbox dialect in
//! one pass. Each line is matched against a fixed precedence of classifiers
//! (priority heading, feature heading, sub-heading, criterion, legacy
//! checkbox, plain bullet) feeding a small explicit accumulator state.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::tasklist::{Criterion, Priority, TaskItem, TaskList, TaskStatus};

static FEATURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^#{1,6}\s*feature(?:\s+(\d+))?\s*:\s*(.+)$").unwrap()
});
static CHECKBOX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)[-*]\s*\[([^\]]*)\]\s*(.*)$").unwrap());
static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\s*)[-*]\s+(.+)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Requirements,
    Criteria,
}

struct ParseState {
    list: TaskList,
    tier: Priority,
    current: Option<TaskItem>,
    /// Explicit status tag seen on the current item's heading/checkbox.
    explicit_status: Option<TaskStatus>,
    /// True when the current item was opened by a legacy checkbox line.
    legacy: bool,
    section: Section,
    doc_description: Vec<String>,
}

impl ParseState {
    fn new() -> Self {
        Self {
            list: TaskList::new(""),
            tier: Priority::Medium,
            current: None,
            explicit_status: None,
            legacy: false,
            section: Section::None,
            doc_description: Vec::new(),
        }
    }

    fn open_item(&mut self, item: TaskItem, explicit: Option<TaskStatus>, legacy: bool) {
        self.flush();
        self.current = Some(item);
        self.explicit_status = explicit;
        self.legacy = legacy;
        self.section = Section::None;
    }

    fn flush(&mut self) {
        let Some(mut item) = self.current.take() else {
            return;
        };
        if item.criteria.is_empty()
            && let Some(status) = self.explicit_status
        {
            item.status = status;
        }
        item.derive_status();
        self.list.items.push(item);
        self.explicit_status = None;
        self.legacy = false;
        self.section = Section::None;
    }
}

/// Parse a task list document (PRD dialect or legacy checkbox dialect).
pub fn parse(text: &str) -> TaskList {
    let mut state = ParseState::new();

    for raw in text.lines() {
        let line = raw.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        if line.trim_start().starts_with('#') {
            classify_heading(&mut state, line.trim_start());
            continue;
        }
        if let Some(caps) = CHECKBOX_RE.captures(line) {
            classify_checkbox(&mut state, &caps);
            continue;
        }
        if let Some(caps) = BULLET_RE.captures(line) {
            classify_bullet(&mut state, &caps);
            continue;
        }
        classify_text(&mut state, line);
    }

    state.flush();
    normalize(&mut state.list, &state.doc_description);
    state.list
}

fn classify_heading(state: &mut ParseState, heading: &str) {
    let text = heading.trim_start_matches('#').trim();
    let lower = text.to_lowercase();

    // Feature headings win over tier detection: a description may itself
    // contain priority words (`## Feature: High priority thing`).
    if let Some(caps) = FEATURE_RE.captures(heading) {
        let id = caps
            .get(1)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        let (description, explicit) = strip_status_tags(caps.get(2).unwrap().as_str());
        let mut item = TaskItem::new(description, state.tier);
        item.id = id;
        state.open_item(item, explicit, false);
        return;
    }

    // Priority-tier headings flush the in-progress item and switch tier.
    if lower.contains("priority")
        && let Some(tier) = Priority::from_text(&lower)
    {
        state.flush();
        state.tier = tier;
        return;
    }

    // Sub-section headings within an item.
    if state.current.is_some() {
        if lower.contains("acceptance criteria") {
            state.section = Section::Criteria;
            return;
        }
        if lower.contains("requirements") || lower.contains("steps") {
            state.section = Section::Requirements;
            return;
        }
    }

    // A top-level heading before any item names the document.
    if heading.starts_with("# ")
        && state.current.is_none()
        && state.list.items.is_empty()
        && state.list.name.is_empty()
    {
        state.list.name = text.to_string();
    }
}

fn classify_checkbox(state: &mut ParseState, caps: &regex::Captures<'_>) {
    let indent = caps.get(1).unwrap().as_str();
    let bracket = caps.get(2).unwrap().as_str().trim();
    let rest = caps.get(3).unwrap().as_str().trim();
    let done = bracket.eq_ignore_ascii_case("x") || bracket.eq_ignore_ascii_case("done");

    // Inside an Acceptance Criteria subsection, checkbox lines are criteria.
    if state.current.is_some() && state.section == Section::Criteria {
        push_criterion(state, rest, done);
        return;
    }

    // Indented checkboxes under a legacy item are criteria too.
    if state.legacy && !indent.is_empty() {
        push_criterion(state, rest, done);
        return;
    }

    if indent.is_empty() {
        // Legacy checkbox task line: derive status from the bracket content.
        let explicit = if done {
            Some(TaskStatus::Done)
        } else if bracket.eq_ignore_ascii_case("working") {
            Some(TaskStatus::Working)
        } else {
            None
        };
        let mut item = TaskItem::new(rest, state.tier);
        item.category = "general".to_string();
        state.open_item(item, explicit, true);
    }
}

fn classify_bullet(state: &mut ParseState, caps: &regex::Captures<'_>) {
    let indent = caps.get(1).unwrap().as_str();
    let text = caps.get(2).unwrap().as_str().trim();
    if state.current.is_none() {
        return;
    }
    match state.section {
        Section::Requirements => {
            if let Some(item) = state.current.as_mut() {
                item.requirements.push(text.to_string());
            }
        }
        Section::Criteria => push_criterion(state, text, false),
        Section::None => {
            // Indented bullets under a legacy item become unchecked criteria.
            if state.legacy && !indent.is_empty() {
                push_criterion(state, text, false);
            }
        }
    }
}

fn classify_text(state: &mut ParseState, line: &str) {
    let trimmed = line.trim();
    match state.current.as_mut() {
        Some(item) if state.section == Section::None => {
            if let Some(rest) = strip_meta(trimmed, "category") {
                item.category = rest.to_string();
            } else if let Some(rest) = strip_meta(trimmed, "priority") {
                if let Some(tier) = Priority::from_text(rest) {
                    item.priority = tier;
                }
            } else {
                // Multi-line item descriptions accumulate free text.
                if !item.description.is_empty() {
                    item.description.push('\n');
                }
                item.description.push_str(trimmed);
            }
        }
        Some(_) => {}
        None => {
            if state.list.items.is_empty() {
                state.doc_description.push(trimmed.to_string());
            }
        }
    }
}

fn push_criterion(state: &mut ParseState, text: &str, done: bool) {
    if let Some(item) = state.current.as_mut() {
        item.criteria.push(Criterion {
            text: text.to_string(),
            done,
        });
    }
}

/// Strip `[DONE]` / `[WORKING]` tags from a feature heading description.
fn strip_status_tags(text: &str) -> (String, Option<TaskStatus>) {
    let mut explicit = None;
    let mut out = text.to_string();
    for (tag, status) in [("[done]", TaskStatus::Done), ("[working]", TaskStatus::Working)] {
        let lower = out.to_lowercase();
        if let Some(pos) = lower.find(tag) {
            explicit = Some(status);
            out.replace_range(pos..pos + tag.len(), "");
        }
    }
    (out.trim().to_string(), explicit)
}

fn strip_meta<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let stripped = line.trim_start_matches("**");
    let lower = stripped.to_lowercase();
    if !lower.starts_with(key) {
        return None;
    }
    let rest = &stripped[key.len()..];
    let rest = rest.trim_start_matches("**");
    let rest = rest.strip_prefix(':')?;
    Some(rest.trim_start_matches("**").trim())
}

/// Fill missing ids, categories, and the document name/description.
fn normalize(list: &mut TaskList, doc_description: &[String]) {
    if list.name.is_empty() {
        list.name = "Tasks".to_string();
    }
    if !doc_description.is_empty() {
        list.description = Some(doc_description.join("\n"));
    }

    let used: Vec<String> = list
        .items
        .iter()
        .filter(|i| !i.id.is_empty())
        .map(|i| i.id.clone())
        .collect();
    let mut next = 1usize;
    for item in &mut list.items {
        if item.id.is_empty() {
            while used.contains(&next.to_string()) {
                next += 1;
            }
            item.id = next.to_string();
            next += 1;
        }
        if item.category.is_empty() {
            item.category = "functional".to_string();
        }
        item.derive_status();
    }
}
