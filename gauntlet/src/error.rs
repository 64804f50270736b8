//! Error taxonomy shared by every gauntlet component.
//!
//! Expected semantic outcomes (lint findings, failing tests, audit findings)
//! are never errors; they travel as step status. These types are reserved for
//! conditions that stop a step or the whole run.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = GauntletError> = std::result::Result<T, E>;

/// Failure to locate or launch an external executable.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("executable `{name}` not found")]
    NotFound { name: String },
    #[error("failed to launch `{program}`: {message}")]
    Launch { program: String, message: String },
    /// Ran, but exited with a code the calling step does not interpret.
    #[error("`{program}` exited unexpectedly with {code}: {stderr}")]
    UnexpectedExit {
        program: String,
        code: i32,
        stderr: String,
    },
    #[error("`{program}` was terminated by signal {signal}: {stderr}")]
    Signalled {
        program: String,
        signal: i32,
        stderr: String,
    },
    #[error("`{program}` timed out after {timeout_secs}s")]
    TimedOut { program: String, timeout_secs: u64 },
}

#[derive(Debug, Error)]
pub enum GauntletError {
    #[error("configuration error at `{key}`: {message}")]
    Configuration { key: String, message: String },
    #[error("input error: {0}")]
    Input(String),
    #[error("environment error: {0}")]
    Environment(String),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("inference api error: {0}")]
    Api(String),
    #[error("file system error at {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("run cancelled")]
    Cancelled,
}

/// Serializable discriminant used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Input,
    Environment,
    Tool,
    Api,
    FileSystem,
    Cancelled,
}

impl GauntletError {
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Input(_) => ErrorKind::Input,
            Self::Environment(_) => ErrorKind::Environment,
            Self::Tool(_) => ErrorKind::Tool,
            Self::Api(_) => ErrorKind::Api,
            Self::FileSystem { .. } => ErrorKind::FileSystem,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}
