//! Side-effecting adapters (filesystem, child processes, git, HTTP).
//!
//! Each module wraps one external collaborator and keeps its types narrow so
//! pipeline steps can be tested against fakes.

use std::path::{Path, PathBuf};

pub mod config;
pub mod environment;
pub mod git;
pub mod invocation_log;
pub mod llm;
pub mod lock;
pub mod process;
pub mod report;
pub mod tools;

/// Directory under the target project holding gauntlet state.
pub const STATE_DIR: &str = ".gauntlet";

pub fn state_dir(target_dir: &Path) -> PathBuf {
    target_dir.join(STATE_DIR)
}
