//! Convergence loop CLI.
//!
//! Drives an external coding agent through a markdown task list (PRD) until
//! every task is done, quality gates pass, or the iteration cap is reached.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use pilot::exit_codes;
use pilot::intervene::InterventionChannel;
use pilot::io::agent::CliAgent;
use pilot::io::config::{MemoryBackend, PilotConfig, load_config};
use pilot::io::gates::ShellGateRunner;
use pilot::io::init::{InitOptions, PilotPaths, init_pilot};
use pilot::io::store::{find_project_doc, find_task_list, load_task_list};
use pilot::iteration::IterationContext;
use pilot::looping::{LoopStop, run_loop};

#[derive(Parser)]
#[command(
    name = "pilot",
    version,
    about = "Drive a coding agent through a PRD task list to convergence"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.pilot/` scaffolding (config, progress file, PRD template).
    Init {
        /// Overwrite existing pilot-owned files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the loop until complete, halted, or the iteration cap.
    Run {
        /// Override the configured iteration cap.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Pause for confirmation between iterations.
        #[arg(long)]
        hitl: bool,
        /// Memory backend: git or file.
        #[arg(long, value_enum)]
        memory: Option<MemoryArg>,
        /// Explicit task list path (discovery applies when omitted).
        #[arg(long)]
        prd: Option<PathBuf>,
        /// Agent command, e.g. "claude -p" (overrides config).
        #[arg(long)]
        agent: Option<String>,
    },
    /// Print the next task the loop would work on.
    Select {
        #[arg(long)]
        prd: Option<PathBuf>,
    },
    /// Print the quality checks extracted from the project document.
    Gates,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum MemoryArg {
    Git,
    File,
}

fn main() {
    pilot::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("determine working directory")?;
    match cli.command {
        Command::Init { force } => {
            init_pilot(&root, &InitOptions { force })?;
            println!("initialized .pilot/");
            Ok(exit_codes::OK)
        }
        Command::Run {
            max_iterations,
            hitl,
            memory,
            prd,
            agent,
        } => cmd_run(&root, max_iterations, hitl, memory, prd, agent),
        Command::Select { prd } => cmd_select(&root, prd),
        Command::Gates => cmd_gates(&root),
    }
}

fn cmd_run(
    root: &std::path::Path,
    max_iterations: Option<u32>,
    hitl: bool,
    memory: Option<MemoryArg>,
    prd: Option<PathBuf>,
    agent_override: Option<String>,
) -> Result<i32> {
    let paths = PilotPaths::new(root);
    let mut config = load_config(&paths.config_path)?;
    if let Some(n) = max_iterations {
        config.max_iterations = n;
    }
    if hitl {
        config.hitl = true;
    }
    if let Some(backend) = memory {
        config.memory.backend = match backend {
            MemoryArg::Git => MemoryBackend::Git,
            MemoryArg::File => MemoryBackend::File,
        };
    }
    if let Some(command) = agent_override {
        config.agent.command = command.split_whitespace().map(str::to_string).collect();
    }
    config.validate()?;
    config.check_required_env(|name| std::env::var(name).ok())?;

    let agent = CliAgent::new(config.agent.command.clone())?;
    let gate_runner = ShellGateRunner;
    let channel = InterventionChannel::new();
    channel.spawn_stdin_listener();

    let prd_override = prd.or_else(|| config.prd_path.as_ref().map(PathBuf::from));
    let ctx = IterationContext {
        root: root.to_path_buf(),
        paths,
        config: &config,
        agent: &agent,
        gate_runner: &gate_runner,
        channel: &channel,
        prd_override,
    };

    let outcome = run_loop(&ctx)?;
    match outcome.stop {
        LoopStop::Complete => {
            println!("complete after {} iteration(s)", outcome.iterations);
            Ok(exit_codes::OK)
        }
        LoopStop::MaxIterations => {
            println!(
                "stopped at iteration cap ({}) with work remaining",
                outcome.iterations
            );
            Ok(exit_codes::HALTED)
        }
        LoopStop::Halted => {
            println!("halted after {} iteration(s)", outcome.iterations);
            Ok(exit_codes::HALTED)
        }
    }
}

fn cmd_select(root: &std::path::Path, prd: Option<PathBuf>) -> Result<i32> {
    let Some(path) = find_task_list(root, prd.as_deref())? else {
        eprintln!("no task list found");
        return Ok(exit_codes::INVALID);
    };
    let list = load_task_list(&path)?;
    match list.next_item() {
        Some(item) => {
            println!("Task {}: {}", item.id, item.description);
            Ok(exit_codes::OK)
        }
        None => {
            println!("all tasks complete");
            Ok(exit_codes::COMPLETE)
        }
    }
}

fn cmd_gates(root: &std::path::Path) -> Result<i32> {
    let doc = match find_project_doc(root, None) {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("read project doc {}", path.display()))?,
        None => String::new(),
    };
    for check in pilot::core::gates::extract_checks(&doc) {
        let optional = if check.required { "" } else { " (optional)" };
        println!("{}{}: {}", check.name, optional, check.command_display());
    }
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_flags() {
        let cli = Cli::parse_from(["pilot", "run", "--max-iterations", "3", "--hitl"]);
        match cli.command {
            Command::Run {
                max_iterations,
                hitl,
                ..
            } => {
                assert_eq!(max_iterations, Some(3));
                assert!(hitl);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["pilot", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_memory_backend() {
        let cli = Cli::parse_from(["pilot", "run", "--memory", "file"]);
        match cli.command {
            Command::Run { memory, .. } => assert!(matches!(memory, Some(MemoryArg::File))),
            _ => panic!("expected run command"),
        }
    }
}
