//! Git adapter used by the commit step.
//!
//! Calls go through the [`ToolInvoker`] so they are resolved like any other
//! tool and land in the invocation log.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::error::ToolError;
use crate::io::tools::{ToolInvocation, ToolInvoker, ToolRun};

/// Commit id reported when the file has no pending changes.
pub const NO_CHANGES: &str = "NO_CHANGES";
/// Commit id reported when staging left nothing to commit.
pub const NO_EFFECTIVE_CHANGES: &str = "NO_EFFECTIVE_CHANGES";

const GIT: &str = "git";

#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("git {args} exited with {code}: {stderr}")]
    Failed {
        args: String,
        code: i32,
        stderr: String,
    },
    #[error("unexpected porcelain line: '{0}'")]
    Porcelain(String),
}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { commit_id: String },
    NoChanges,
    NoEffectiveChanges,
}

impl CommitOutcome {
    /// Commit id, or the sentinel standing in for one.
    pub fn commit_id(&self) -> &str {
        match self {
            Self::Committed { commit_id } => commit_id,
            Self::NoChanges => NO_CHANGES,
            Self::NoEffectiveChanges => NO_EFFECTIVE_CHANGES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Git {
    invoker: ToolInvoker,
    workdir: PathBuf,
}

impl Git {
    pub fn new(invoker: ToolInvoker, workdir: impl Into<PathBuf>) -> Self {
        Self {
            invoker,
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Pending changes, optionally limited to one path.
    pub fn status_porcelain(&self, pathspec: Option<&str>) -> Result<Vec<StatusEntry>, GitError> {
        let mut args = vec!["status", "--porcelain=v1", "-uall"];
        if let Some(path) = pathspec {
            args.extend(["--", path]);
        }
        let out = self.run_checked(&args)?;
        out.stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    pub fn add(&self, path: &str) -> Result<(), GitError> {
        self.run_checked(&["add", "--", path])?;
        Ok(())
    }

    pub fn head_sha(&self) -> Result<String, GitError> {
        let out = self.run_checked(&["rev-parse", "HEAD"])?;
        Ok(out.stdout.trim().to_string())
    }

    /// Stage and commit `path`. Never creates an empty revision.
    #[instrument(skip(self, message))]
    pub fn commit_file(&self, path: &str, message: &str) -> Result<CommitOutcome, GitError> {
        if self.status_porcelain(Some(path))?.is_empty() {
            info!("no pending changes, skipping commit");
            return Ok(CommitOutcome::NoChanges);
        }
        self.add(path)?;
        let out = self.run(&["commit", "-m", message, "--", path])?;
        if !out.succeeded() {
            let combined = out.combined_output();
            if combined.contains("nothing to commit") || combined.contains("no changes added") {
                info!("staging left nothing to commit");
                return Ok(CommitOutcome::NoEffectiveChanges);
            }
            return Err(failed(&["commit"], &out));
        }
        let commit_id = self.head_sha()?;
        debug!(%commit_id, "committed");
        Ok(CommitOutcome::Committed { commit_id })
    }

    fn run_checked(&self, args: &[&str]) -> Result<ToolRun, GitError> {
        let out = self.run(args)?;
        if !out.succeeded() {
            return Err(failed(args, &out));
        }
        Ok(out)
    }

    fn run(&self, args: &[&str]) -> Result<ToolRun, GitError> {
        let invocation = ToolInvocation::new(GIT, &self.workdir).args(args.iter().copied());
        Ok(self.invoker.run(&invocation)?)
    }
}

fn failed(args: &[&str], out: &ToolRun) -> GitError {
    GitError::Failed {
        args: args.join(" "),
        code: out.exit_code,
        stderr: out.stderr.trim().to_string(),
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry, GitError> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 || !line.is_char_boundary(2) || !line.is_char_boundary(3) {
        return Err(GitError::Porcelain(line.to_string()));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
