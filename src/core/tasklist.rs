//! In-memory task list model (the PRD).
//!
//! These types define the stable contract between the parser, the serializer,
//! and the iteration controller. They hold no I/O; reading and writing the
//! backing document lives in `io::store`.

use serde::{Deserialize, Serialize};

/// Priority tier for a task item. Canonical read order is High, Medium, Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// Parse a tier from free text (e.g. a heading), case-insensitive.
    pub fn from_text(text: &str) -> Option<Priority> {
        let lower = text.to_lowercase();
        if lower.contains("high") {
            Some(Priority::High)
        } else if lower.contains("medium") {
            Some(Priority::Medium)
        } else if lower.contains("low") {
            Some(Priority::Low)
        } else {
            None
        }
    }
}

/// Derived status of a task item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Working,
    Done,
}

/// A single acceptance criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub text: String,
    pub done: bool,
}

/// A single work item in the task list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskItem {
    /// Unique within the list; assigned sequentially by the parser if absent.
    pub id: String,
    /// Free-text classifier (setup/architecture/functional/testing/...).
    pub category: String,
    pub description: String,
    pub priority: Priority,
    /// Informational requirements; not tracked for completion.
    pub requirements: Vec<String>,
    pub criteria: Vec<Criterion>,
    pub status: TaskStatus,
    /// Legacy mirror of `status == Done` kept for older integrations.
    pub passes: bool,
}

impl TaskItem {
    pub fn new(description: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: String::new(),
            category: "functional".to_string(),
            description: description.into(),
            priority,
            requirements: Vec::new(),
            criteria: Vec::new(),
            status: TaskStatus::Pending,
            passes: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }

    /// Re-derive `status` and `passes` from the criteria set.
    ///
    /// Items with zero criteria keep their explicit status: they transition to
    /// done only via [`TaskList::mark_item_complete`] or an explicit tag in the
    /// source document.
    pub fn derive_status(&mut self) {
        if !self.criteria.is_empty() {
            let done = self.criteria.iter().filter(|c| c.done).count();
            self.status = if done == self.criteria.len() {
                TaskStatus::Done
            } else if done > 0 {
                TaskStatus::Working
            } else {
                TaskStatus::Pending
            };
        }
        self.passes = self.status == TaskStatus::Done;
    }
}

/// An ordered task list with a name and optional free-text description.
///
/// Item order is insertion order within a priority tier; the canonical read
/// order is High -> Medium -> Low, first-incomplete-first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskList {
    pub name: String,
    pub description: Option<String>,
    pub items: Vec<TaskItem>,
}

impl TaskList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            items: Vec::new(),
        }
    }

    /// All items in canonical order (tier by tier, insertion order within).
    pub fn items_canonical(&self) -> Vec<&TaskItem> {
        Priority::ALL
            .iter()
            .flat_map(|tier| self.items.iter().filter(move |i| i.priority == *tier))
            .collect()
    }

    /// Incomplete items (status != done) in canonical order.
    pub fn incomplete_items(&self) -> Vec<&TaskItem> {
        self.items_canonical()
            .into_iter()
            .filter(|i| !i.is_done())
            .collect()
    }

    /// Incomplete items bucketed by tier, in High/Medium/Low order.
    pub fn items_by_priority(&self) -> [(Priority, Vec<&TaskItem>); 3] {
        Priority::ALL.map(|tier| {
            let bucket = self
                .items
                .iter()
                .filter(|i| i.priority == tier && !i.is_done())
                .collect();
            (tier, bucket)
        })
    }

    /// The next item the loop should work on, if any.
    pub fn next_item(&self) -> Option<&TaskItem> {
        self.incomplete_items().into_iter().next()
    }

    pub fn is_complete(&self) -> bool {
        self.items.iter().all(TaskItem::is_done)
    }

    pub fn find_by_id(&self, id: &str) -> Option<&TaskItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Fuzzy match an item by description: exact match preferred, otherwise
    /// case-insensitive substring in either direction, first match in
    /// canonical order.
    pub fn find_by_description(&self, text: &str) -> Option<&TaskItem> {
        let needle = text.trim();
        if let Some(item) = self
            .items_canonical()
            .into_iter()
            .find(|i| i.description == needle)
        {
            return Some(item);
        }
        let lower = needle.to_lowercase();
        self.items_canonical().into_iter().find(|i| {
            let desc = i.description.to_lowercase();
            desc.contains(&lower) || lower.contains(&desc)
        })
    }

    /// Mark an item as being worked on, clearing the flag on every other item
    /// so that at most one item is ever `working`.
    ///
    /// Only affects items whose status is not derived from criteria (derived
    /// statuses are recomputed on the next `derive_status` pass anyway); the
    /// controller treats the tag as presentation state, never as the source
    /// of the current selection.
    pub fn mark_working(&mut self, id: &str) -> bool {
        let mut found = false;
        for item in &mut self.items {
            if item.id == id {
                found = true;
                if item.status != TaskStatus::Done {
                    item.status = TaskStatus::Working;
                }
            } else if item.status == TaskStatus::Working && item.criteria.is_empty() {
                item.status = TaskStatus::Pending;
            }
        }
        found
    }

    /// Mark the first criterion of `id` whose text contains `needle`
    /// (case-insensitive) as done. Returns false if no criterion matched.
    pub fn mark_criterion_done(&mut self, id: &str, needle: &str) -> bool {
        let lower = needle.trim().to_lowercase();
        let Some(item) = self.items.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        let matched = item
            .criteria
            .iter_mut()
            .find(|c| c.text.to_lowercase().contains(&lower));
        match matched {
            Some(criterion) => {
                criterion.done = true;
                item.derive_status();
                true
            }
            None => false,
        }
    }

    /// Mark an item complete: all criteria done, status done.
    pub fn mark_item_complete(&mut self, id: &str) -> bool {
        let Some(item) = self.items.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        for criterion in &mut item.criteria {
            criterion.done = true;
        }
        item.status = TaskStatus::Done;
        item.passes = true;
        true
    }

    /// Fuzzy-match `text` against item descriptions and mark the match
    /// complete. Returns the matched item's id, if any.
    pub fn mark_complete_by_description(&mut self, text: &str) -> Option<String> {
        let id = self.find_by_description(text)?.id.clone();
        self.mark_item_complete(&id);
        Some(id)
    }

    /// One-line-per-item summary used in prompts and `pilot select` output.
    pub fn render_summary(&self) -> String {
        let mut lines = Vec::new();
        for (tier, bucket) in self.items_by_priority() {
            if bucket.is_empty() {
                continue;
            }
            lines.push(format!("{} priority:", capitalize(tier.as_str())));
            for item in bucket {
                let marker = match item.status {
                    TaskStatus::Working => " [working]",
                    _ => "",
                };
                let done = item.criteria.iter().filter(|c| c.done).count();
                let progress = if item.criteria.is_empty() {
                    String::new()
                } else {
                    format!(" ({}/{} criteria)", done, item.criteria.len())
                };
                lines.push(format!(
                    "- Task {}: {}{}{}",
                    item.id, item.description, progress, marker
                ));
            }
        }
        if lines.is_empty() {
            lines.push("All tasks complete.".to_string());
        }
        lines.join("\n")
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
