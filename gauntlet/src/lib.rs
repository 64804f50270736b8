//! Validation-and-integration gauntlet for candidate code artifacts.
//!
//! A run takes one source file, places it into a target project, and drives
//! it through an ordered pipeline of isolated checks (dependency audit,
//! formatting, linting, type checking, AI test generation and execution, AI
//! review, conditional commit). The result is a sealed [`core::report::RunReport`]
//! with an aggregate verdict. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (verdict policy, response
//!   extraction, report types). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (config files, child processes,
//!   runtime environments, git, the inference endpoint, report output).
//!
//! Orchestration modules ([`pipeline`], [`run`]) coordinate core logic with
//! I/O to implement the CLI.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
