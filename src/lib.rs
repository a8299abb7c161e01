//! Convergence loop that drives an external coding agent through a markdown
//! task list until the work is done.
//!
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (task list model, markdown
//!   parsing and rendering, gate extraction, reply parsing). No I/O.
//! - **[`io`]**: Side-effecting adapters (processes, git, the agent CLI,
//!   gate execution, memory, config, prompts). Isolated to enable scripted
//!   doubles in tests.
//!
//! Orchestration modules ([`select`], [`iteration`], [`looping`]) coordinate
//! core logic with I/O to implement the CLI commands, with the
//! [`intervene`] channel threading human input through all of them.

pub mod core;
pub mod exit_codes;
pub mod intervene;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod looping;
pub mod select;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
