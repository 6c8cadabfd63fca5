//! Deterministic, pure logic shared by the planloop engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! task lists and return deterministic outputs suitable for tests.

pub mod error;
pub mod invariants;
pub mod monitor;
pub mod ordering;
pub mod replan;
pub mod selector;
pub mod transition;
pub mod types;
