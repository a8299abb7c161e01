//! Prompt builder for deterministic agent input.
//!
//! Templates carry HTML-comment section markers so rendered output can be
//! split, budgeted, and reassembled: `<!-- section:KEY required|droppable -->`.

use anyhow::Result;
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::tasklist::TaskItem;

const SELECTION_TEMPLATE: &str = include_str!("prompts/selection.md");
const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");
const LEGACY_TEMPLATE: &str = include_str!("prompts/legacy.md");

/// Shared context fed into every prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    /// Rendered task list summary.
    pub tasks: String,
    /// Memory summary, possibly with a leading failure banner.
    pub memory: String,
    /// Gate command list for the "must pass" section.
    pub gates: String,
    /// Project configuration document contents.
    pub doc: String,
    /// Pending operator message, folded in at most once.
    pub intervention: Option<String>,
}

/// Template engine wrapper around minijinja.
#[derive(Clone)]
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("selection", SELECTION_TEMPLATE)
            .expect("selection template should be valid");
        env.add_template("implement", IMPLEMENT_TEMPLATE)
            .expect("implement template should be valid");
        env.add_template("legacy", LEGACY_TEMPLATE)
            .expect("legacy template should be valid");
        Self { env }
    }

    fn render_selection(&self, input: &PromptInputs) -> Result<String> {
        let template = self.env.get_template("selection")?;
        let rendered = template.render(context! {
            tasks => input.tasks.trim(),
            memory => nonempty(&input.memory),
            intervention => input.intervention.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    fn render_implement(&self, input: &PromptInputs, task: &TaskItem) -> Result<String> {
        let template = self.env.get_template("implement")?;
        let rendered = template.render(context! {
            task => render_task_detail(task),
            gates => nonempty(&input.gates),
            memory => nonempty(&input.memory),
            doc => nonempty(&input.doc),
            intervention => input.intervention.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    fn render_legacy(&self, input: &PromptInputs) -> Result<String> {
        let template = self.env.get_template("legacy")?;
        let rendered = template.render(context! {
            tasks => nonempty(&input.tasks),
            gates => nonempty(&input.gates),
            memory => nonempty(&input.memory),
            doc => nonempty(&input.doc),
            intervention => input.intervention.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }
}

fn nonempty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// One task rendered with its requirements and open criteria.
fn render_task_detail(task: &TaskItem) -> String {
    let mut out = format!("Task {}: {}\n", task.id, task.description);
    out.push_str(&format!("Priority: {}\n", task.priority.as_str()));
    if !task.requirements.is_empty() {
        out.push_str("\nRequirements:\n");
        for requirement in &task.requirements {
            out.push_str(&format!("- {requirement}\n"));
        }
    }
    if !task.criteria.is_empty() {
        out.push_str("\nAcceptance criteria:\n");
        for criterion in &task.criteria {
            let mark = if criterion.done { "x" } else { " " };
            out.push_str(&format!("- [{}] {}\n", mark, criterion.text));
        }
    }
    out
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    use std::sync::LazyLock;
    static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
    });

    let mut sections = Vec::new();
    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();

    for (i, caps) in matches.iter().enumerate() {
        let key = caps.get(1).unwrap().as_str().to_string();
        let required = caps.get(2).unwrap().as_str() == "required";
        let start = caps.get(0).unwrap().end();
        let end = matches
            .get(i + 1)
            .map(|m| m.get(0).unwrap().start())
            .unwrap_or(rendered.len());

        let content = rendered[start..end].trim().to_string();
        if !content.is_empty() {
            sections.push(ParsedSection {
                key,
                required,
                content,
            });
        }
    }

    sections
}

/// Apply budget to parsed sections, dropping droppable sections as needed.
///
/// Drop order: doc -> memory -> gates. Sections marked required survive; if
/// the prompt is still over budget the last section is truncated.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    if total_len(sections) <= budget {
        return;
    }

    let drop_order = ["doc", "memory", "gates"];
    for key in drop_order {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let dropped_len = sections[idx].content.len();
            debug!(
                section = key,
                bytes_dropped = dropped_len,
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) > budget && !sections.is_empty() {
        let other_len: usize = sections
            .iter()
            .take(sections.len() - 1)
            .map(|s| s.content.len())
            .sum();
        let allowed = budget.saturating_sub(other_len);
        let last = sections.last_mut().unwrap();
        let before_len = last.content.len();
        if last.content.len() > allowed {
            if allowed > 12 {
                last.content.truncate(allowed - 12);
                last.content.push_str("\n[truncated]");
            } else {
                last.content.truncate(allowed);
            }
            debug!(
                section = last.key,
                before_len,
                after_len = last.content.len(),
                "truncated section for budget"
            );
        }
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds prompts within a byte budget, dropping less critical sections first.
/// Templates are compiled once at construction.
#[derive(Clone)]
pub struct PromptBuilder {
    engine: PromptEngine,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            engine: PromptEngine::new(),
            budget_bytes,
        }
    }

    /// Phase-one prompt: pick the next task, read-only.
    pub fn build_selection(&self, input: &PromptInputs) -> String {
        let rendered = self
            .engine
            .render_selection(input)
            .expect("selection template rendering should not fail");
        self.finish(&rendered)
    }

    /// Phase-two prompt: implement the selected task.
    pub fn build_implement(&self, input: &PromptInputs, task: &TaskItem) -> String {
        let rendered = self
            .engine
            .render_implement(input, task)
            .expect("implement template rendering should not fail");
        self.finish(&rendered)
    }

    /// Single-phase prompt used when there is no task list or selection
    /// produced nothing usable.
    pub fn build_legacy(&self, input: &PromptInputs) -> String {
        let rendered = self
            .engine
            .render_legacy(input)
            .expect("legacy template rendering should not fail");
        self.finish(&rendered)
    }

    fn finish(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        render_sections(&sections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tasklist::{Criterion, Priority, TaskStatus};

    fn sample_task() -> TaskItem {
        TaskItem {
            id: "2".to_string(),
            category: "functional".to_string(),
            description: "Add login form".to_string(),
            priority: Priority::High,
            requirements: vec!["use the existing session store".to_string()],
            criteria: vec![
                Criterion {
                    text: "form renders".to_string(),
                    done: true,
                },
                Criterion {
                    text: "session persists".to_string(),
                    done: false,
                },
            ],
            status: TaskStatus::Pending,
            passes: false,
        }
    }

    fn full_inputs() -> PromptInputs {
        PromptInputs {
            tasks: "1. [ ] Add login form".to_string(),
            memory: "did things".to_string(),
            gates: "- `npm test`".to_string(),
            doc: "project notes".to_string(),
            intervention: Some("focus on the session bug".to_string()),
        }
    }

    #[test]
    fn selection_prompt_orders_sections_and_forbids_tools() {
        let content = PromptBuilder::new(10_000).build_selection(&full_inputs());

        let contract = content.find("### Selection Contract").expect("contract");
        let intervention = content.find("### Operator Message").expect("intervention");
        let memory = content.find("### Recent Progress").expect("memory");
        let tasks = content.find("### Task List").expect("tasks");
        assert!(contract < intervention);
        assert!(intervention < memory);
        assert!(memory < tasks);
        assert!(content.contains("Do not modify any files"));
        assert!(content.contains("SELECTED_TASK_ID"));
    }

    #[test]
    fn implement_prompt_carries_task_detail_and_completion_protocol() {
        let content = PromptBuilder::new(10_000).build_implement(&full_inputs(), &sample_task());
        assert!(content.contains("Task 2: Add login form"));
        assert!(content.contains("- [x] form renders"));
        assert!(content.contains("- [ ] session persists"));
        assert!(content.contains("## Completed:"));
        assert!(content.contains("focus on the session bug"));
    }

    #[test]
    fn legacy_prompt_survives_empty_inputs() {
        let content = PromptBuilder::new(10_000).build_legacy(&PromptInputs::default());
        assert!(content.contains("### Implementation Contract"));
        assert!(!content.contains("### Task List"));
        assert!(!content.contains("### Operator Message"));
        assert!(content.contains("ALL_TASKS_COMPLETE"));
    }

    #[test]
    fn one_builder_serves_every_prompt_kind() {
        let builder = PromptBuilder::new(10_000);
        let inputs = full_inputs();
        assert!(
            builder
                .build_selection(&inputs)
                .contains("### Selection Contract")
        );
        assert!(
            builder
                .build_implement(&inputs, &sample_task())
                .contains("### Selected Task")
        );
        assert!(
            builder
                .build_legacy(&inputs)
                .contains("### Implementation Contract")
        );
    }

    #[test]
    fn budget_drops_doc_and_memory_before_required_sections() {
        let mut input = full_inputs();
        input.doc = "doc".repeat(300);
        input.memory = "memory".repeat(200);
        let content = PromptBuilder::new(900).build_implement(&input, &sample_task());

        assert!(!content.contains("### Project Notes"), "doc dropped first");
        assert!(!content.contains("### Recent Progress"), "memory dropped next");
        assert!(content.contains("### Implementation Contract"));
        assert!(content.contains("### Selected Task"));
        assert!(content.contains("### Operator Message"));
    }

    #[test]
    fn intervention_is_never_dropped_for_budget() {
        let mut input = full_inputs();
        input.doc = "doc".repeat(500);
        input.memory = "memory".repeat(500);
        input.gates = "gates".repeat(200);
        let content = PromptBuilder::new(800).build_selection(&input);
        assert!(content.contains("focus on the session bug"));
    }
}
