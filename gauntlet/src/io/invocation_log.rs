//! Append-only JSON-lines record of every child-process invocation.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    Completed,
    TimedOut,
    NotFound,
    LaunchFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub timestamp: String,
    pub command: Vec<String>,
    pub cwd: String,
    pub exit_code: Option<i32>,
    pub outcome: InvocationOutcome,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// One JSON object per line at `<target>/.gauntlet/invocations.jsonl`.
#[derive(Debug)]
pub struct InvocationLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl InvocationLog {
    pub const FILE_NAME: &'static str = "invocations.jsonl";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn for_target(target_dir: &Path) -> Self {
        Self::new(super::state_dir(target_dir).join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &InvocationRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("serialize invocation record")?;
        line.push('\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("invocation log lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open invocation log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append invocation log {}", self.path.display()))?;
        Ok(())
    }

    /// Read back every record, oldest first.
    pub fn read_all(&self) -> Result<Vec<InvocationRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read invocation log {}", self.path.display()))?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parse invocation log line {}", idx + 1))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(command: &str, outcome: InvocationOutcome) -> InvocationRecord {
        InvocationRecord {
            timestamp: "2025-03-01T12:00:00.000Z".to_string(),
            command: vec![command.to_string(), "--version".to_string()],
            cwd: "/tmp/project".to_string(),
            exit_code: Some(0),
            outcome,
            stdout: "ok".to_string(),
            stderr: String::new(),
            duration_ms: 12,
        }
    }

    #[test]
    fn appends_one_line_per_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = InvocationLog::for_target(temp.path());
        log.append(&record("ruff", InvocationOutcome::Completed))
            .expect("append");
        log.append(&record("mypy", InvocationOutcome::TimedOut))
            .expect("append");

        let raw = fs::read_to_string(log.path()).expect("read");
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.contains("\"outcome\":\"timed_out\""));

        let records = log.read_all().expect("read all");
        assert_eq!(records[0].command[0], "ruff");
        assert_eq!(records[1].outcome, InvocationOutcome::TimedOut);
    }

    #[test]
    fn missing_log_reads_as_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = InvocationLog::for_target(temp.path());
        assert!(log.read_all().expect("read").is_empty());
    }
}
