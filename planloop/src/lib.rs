//! Unattended executor for decomposed project plans.
//!
//! planloop hands one task at a time to an external agent session, validates
//! the result, commits it, and re-plans failed tasks until the list is done
//! or a retry ceiling is hit. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (ordering, selection, state
//!   transitions, re-planning legality, stall classification). No I/O.
//! - **[`io`]**: Side-effecting adapters (task file, git, child processes,
//!   agent sessions, validation, cost and progress logs).
//!
//! Orchestration modules ([`control`], [`gate`], [`replan`], [`supervise`],
//! [`status`], [`reset`]) combine the two to implement CLI commands.

pub mod control;
pub mod core;
pub mod exit_codes;
pub mod gate;
pub mod io;
pub mod logging;
pub mod replan;
pub mod reset;
pub mod status;
pub mod supervise;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
