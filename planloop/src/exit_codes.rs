//! Stable exit codes for planloop CLI commands.

/// Command succeeded, the task list is complete, or `--max-tasks` was reached.
pub const OK: i32 = 0;
/// Invalid workspace, config or task list, unknown task id, or engine error.
pub const INVALID: i32 = 1;
/// The run halted with failed tasks that need manual action.
pub const HALTED: i32 = 3;
/// The run was interrupted and the in-flight task was returned to pending.
pub const INTERRUPTED: i32 = 130;
