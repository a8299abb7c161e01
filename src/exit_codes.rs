//! Stable exit codes for pilot CLI commands.

/// Command succeeded or an open task was selected.
pub const OK: i32 = 0;
/// Command failed due to invalid configuration, layout, or other errors.
pub const INVALID: i32 = 1;
/// `pilot select` found no open task (task list complete).
pub const COMPLETE: i32 = 2;
/// `pilot run` halted on an agent error or hit the iteration limit.
pub const HALTED: i32 = 3;
