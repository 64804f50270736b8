//! Deterministic, pure logic shared by the gauntlet.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! values (tool output, inference responses, step results) and return
//! deterministic outputs suitable for tests.

pub mod extract;
pub mod findings;
pub mod report;
pub mod signatures;
pub mod types;
pub mod verdict;
