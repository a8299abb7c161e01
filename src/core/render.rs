//! Task list serializer: a near-inverse of `core::parse`.
//!
//! Round-trips are not byte-identical but must be semantically idempotent:
//! `parse(serialize(parse(text)))` equals `parse(text)` under item-level
//! equality (id, description, priority, criteria set, status).

use crate::core::tasklist::{Priority, TaskItem, TaskList, TaskStatus};

/// Serialize a task list back to the PRD markdown dialect.
pub fn serialize(list: &TaskList) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n", list.name));
    if let Some(description) = &list.description {
        out.push('\n');
        out.push_str(description.trim_end());
        out.push('\n');
    }

    for tier in Priority::ALL {
        let items: Vec<&TaskItem> = list.items.iter().filter(|i| i.priority == tier).collect();
        if items.is_empty() {
            continue;
        }
        out.push_str(&format!("\n## {} Priority\n", tier_label(tier)));
        for item in items {
            render_item(&mut out, item);
        }
    }
    out
}

fn tier_label(tier: Priority) -> &'static str {
    match tier {
        Priority::High => "High",
        Priority::Medium => "Medium",
        Priority::Low => "Low",
    }
}

fn render_item(out: &mut String, item: &TaskItem) {
    let tag = match item.status {
        TaskStatus::Done => " [DONE]",
        TaskStatus::Working => " [WORKING]",
        TaskStatus::Pending => "",
    };
    let description = item.description.replace('\n', " ");
    out.push_str(&format!("\n## Feature {}: {}{}\n", item.id, description, tag));

    if item.category != "functional" && item.category != "general" {
        out.push_str(&format!("\nCategory: {}\n", item.category));
    }

    if !item.requirements.is_empty() {
        out.push_str("\n### Requirements\n\n");
        for requirement in &item.requirements {
            out.push_str(&format!("- {requirement}\n"));
        }
    }

    if !item.criteria.is_empty() {
        out.push_str("\n### Acceptance Criteria\n\n");
        for criterion in &item.criteria {
            let mark = if criterion.done { "x" } else { " " };
            out.push_str(&format!("- [{}] {}\n", mark, criterion.text));
        }
    }
}
