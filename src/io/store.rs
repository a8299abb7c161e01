//! Task list and project document discovery, load, and save.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::parse::parse;
use crate::core::render::serialize;
use crate::core::tasklist::TaskList;
use crate::io::config::write_atomic;

/// Candidate task list locations relative to the project root, in priority
/// order.
const PRD_CANDIDATES: &[&str] = &["PRD.md", ".pilot/PRD.md", "docs/PRD.md"];

/// Candidate project configuration documents, in priority order.
const PROJECT_DOC_CANDIDATES: &[&str] = &["AGENTS.md", "AGENT.md"];

/// Locate the task list: the explicit path wins, then the discovery order.
/// Returns `None` when nothing exists, which sends the loop into legacy
/// single-prompt mode.
#[instrument(skip_all)]
pub fn find_task_list(root: &Path, explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        let resolved = root.join(path);
        if !resolved.is_file() {
            return Err(anyhow!("task list not found: {}", resolved.display()));
        }
        return Ok(Some(resolved));
    }
    for candidate in PRD_CANDIDATES {
        let path = root.join(candidate);
        if path.is_file() {
            debug!(path = %path.display(), "found task list");
            return Ok(Some(path));
        }
    }
    debug!("no task list found");
    Ok(None)
}

/// Locate the project configuration document, if any.
pub fn find_project_doc(root: &Path, explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        let resolved = root.join(path);
        return resolved.is_file().then_some(resolved);
    }
    PROJECT_DOC_CANDIDATES
        .iter()
        .map(|candidate| root.join(candidate))
        .find(|path| path.is_file())
}

pub fn load_task_list(path: &Path) -> Result<TaskList> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read task list {}", path.display()))?;
    Ok(parse(&text))
}

/// Serialize and atomically replace the task list file.
pub fn save_task_list(path: &Path, list: &TaskList) -> Result<()> {
    write_atomic(path, &serialize(list))
        .with_context(|| format!("save task list {}", path.display()))
}
