//! Side-effecting adapters: processes, git, the agent CLI, gate execution,
//! memory persistence, configuration, and prompt assembly.

pub mod agent;
pub mod config;
pub mod gates;
pub mod git;
pub mod init;
pub mod memory;
pub mod process;
pub mod prompt;
pub mod store;
