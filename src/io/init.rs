//! Initialization helpers for `.pilot/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{PilotConfig, write_config};

/// All canonical paths within `.pilot/` for a project root.
#[derive(Debug, Clone)]
pub struct PilotPaths {
    pub root: PathBuf,
    pub pilot_dir: PathBuf,
    pub config_path: PathBuf,
    pub progress_path: PathBuf,
    pub prd_path: PathBuf,
    pub iterations_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl PilotPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let pilot_dir = root.join(".pilot");
        Self {
            root: root.clone(),
            config_path: pilot_dir.join("config.toml"),
            progress_path: pilot_dir.join("progress.md"),
            prd_path: pilot_dir.join("PRD.md"),
            iterations_dir: pilot_dir.join("iterations"),
            gitignore_path: pilot_dir.join(".gitignore"),
            pilot_dir,
        }
    }

    /// Artifact directory for one iteration, e.g. `.pilot/iterations/3`.
    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.iterations_dir.join(iteration.to_string())
    }
}

/// Options for `init_pilot`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing pilot-owned files.
    pub force: bool,
}

/// Create `.pilot/` scaffolding in `root`.
///
/// Fails if `.pilot/` already exists unless `options.force` is set.
pub fn init_pilot(root: &Path, options: &InitOptions) -> Result<PilotPaths> {
    let paths = PilotPaths::new(root);
    if paths.pilot_dir.exists() && !options.force {
        return Err(anyhow!(
            "init: .pilot already exists (use --force to overwrite)"
        ));
    }
    if paths.pilot_dir.exists() && !paths.pilot_dir.is_dir() {
        return Err(anyhow!("init: .pilot exists but is not a directory"));
    }

    create_dir(&paths.pilot_dir)?;
    create_dir(&paths.iterations_dir)?;

    write_file(&paths.gitignore_path, PILOT_GITIGNORE)?;
    write_config(&paths.config_path, &PilotConfig::default())?;
    write_file(&paths.progress_path, PROGRESS_PLACEHOLDER)?;
    if options.force || !paths.prd_path.exists() {
        write_file(&paths.prd_path, PRD_PLACEHOLDER)?;
    }

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const PROGRESS_PLACEHOLDER: &str = "# Progress\n";
const PRD_PLACEHOLDER: &str = "\
# Tasks

## High Priority

## Feature: Describe the first feature here

### Acceptance Criteria

- [ ] Describe a verifiable outcome
";
const PILOT_GITIGNORE: &str = "iterations/\n";
