//! I/O adapters: filesystem state, git, child processes, agent sessions.

pub mod analyzer;
pub mod config;
pub mod cost_ledger;
pub mod git;
pub mod init;
pub mod interrupt;
pub mod process;
pub mod progress_log;
pub mod prompt;
pub mod replanner;
pub mod session;
pub mod task_store;
pub mod validator;
