//! Resolve and run external tools.
//!
//! Resolution order is config override, then the provisioned runtime's
//! `bin/`, then the process search path. Every run is appended to the
//! invocation log whatever its outcome.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, instrument, warn};

use crate::error::ToolError;
use crate::io::config::Config;
use crate::io::environment::RuntimeHandle;
use crate::io::invocation_log::{InvocationLog, InvocationOutcome, InvocationRecord};
use crate::io::process::{run_captured, truncate_text};

/// Exit code reported for an invocation killed by its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -1;
/// Exit code reported for a child terminated by a signal it did not expect.
pub const SIGNAL_EXIT_CODE: i32 = -2;

const UNEXPECTED_EXIT_STDERR_BYTES: usize = 500;

/// Which tier of the resolution order produced a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedFrom {
    Override,
    Runtime,
    SearchPath,
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTool {
    pub path: PathBuf,
    pub from: ResolvedFrom,
}

/// One child-process execution request.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Falls back to `tools.default_timeout_secs`.
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn command_line(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Result of an invocation that launched. Exit codes are surfaced verbatim.
#[derive(Debug, Clone)]
pub struct ToolRun {
    pub program: String,
    pub path: PathBuf,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Signal that terminated the child, outside of a timeout kill.
    pub signal: Option<i32>,
    pub timeout: Duration,
    pub duration: Duration,
}

impl ToolRun {
    /// Error for an exit the calling step has no interpretation for.
    pub fn unexpected_exit(&self) -> ToolError {
        if self.timed_out {
            return ToolError::TimedOut {
                program: self.program.clone(),
                timeout_secs: self.timeout.as_secs(),
            };
        }
        if let Some(signal) = self.signal {
            return ToolError::Signalled {
                program: self.program.clone(),
                signal,
                stderr: truncate_text(self.stderr.trim(), UNEXPECTED_EXIT_STDERR_BYTES),
            };
        }
        ToolError::UnexpectedExit {
            program: self.program.clone(),
            code: self.exit_code,
            stderr: truncate_text(self.stderr.trim(), UNEXPECTED_EXIT_STDERR_BYTES),
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// Stdout and stderr joined, for notes and prompts.
    pub fn combined_output(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolInvoker {
    overrides: BTreeMap<String, PathBuf>,
    runtime: Option<RuntimeHandle>,
    search_path: Option<OsString>,
    default_timeout: Duration,
    output_limit_bytes: usize,
    log_output_limit_bytes: usize,
    log: Option<Arc<InvocationLog>>,
}

impl ToolInvoker {
    pub fn new(config: &Config) -> Self {
        Self {
            overrides: config.tool_paths.clone(),
            runtime: None,
            search_path: std::env::var_os("PATH"),
            default_timeout: Duration::from_secs(config.tools.default_timeout_secs),
            output_limit_bytes: config.tools.output_limit_bytes,
            log_output_limit_bytes: config.tools.log_output_limit_bytes,
            log: None,
        }
    }

    pub fn with_runtime(mut self, runtime: RuntimeHandle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_log(mut self, log: Arc<InvocationLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Replace the search path captured from the process environment.
    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    pub fn runtime(&self) -> Option<&RuntimeHandle> {
        self.runtime.as_ref()
    }

    #[instrument(skip(self))]
    pub fn resolve(&self, name: &str) -> Result<ResolvedTool, ToolError> {
        if name.contains(std::path::MAIN_SEPARATOR) {
            let path = PathBuf::from(name);
            if is_executable(&path) {
                return Ok(ResolvedTool {
                    path,
                    from: ResolvedFrom::Explicit,
                });
            }
            return Err(ToolError::NotFound {
                name: name.to_string(),
            });
        }

        if let Some(path) = self.overrides.get(name) {
            if is_executable(path) {
                debug!(path = %path.display(), "using configured override");
                return Ok(ResolvedTool {
                    path: path.clone(),
                    from: ResolvedFrom::Override,
                });
            }
            warn!(path = %path.display(), "configured override is not executable, ignoring");
        }

        if let Some(runtime) = &self.runtime {
            let candidate = runtime.bin_dir().join(name);
            if is_executable(&candidate) {
                return Ok(ResolvedTool {
                    path: candidate,
                    from: ResolvedFrom::Runtime,
                });
            }
        }

        if let Some(search_path) = &self.search_path {
            for dir in std::env::split_paths(search_path) {
                let candidate = dir.join(name);
                if is_executable(&candidate) {
                    return Ok(ResolvedTool {
                        path: candidate,
                        from: ResolvedFrom::SearchPath,
                    });
                }
            }
        }

        Err(ToolError::NotFound {
            name: name.to_string(),
        })
    }

    /// Resolve and run. `Err` means the tool never ran (not found, or the OS
    /// refused to launch it); timeouts come back as `Ok` with
    /// [`TIMEOUT_EXIT_CODE`].
    #[instrument(skip_all, fields(program = %invocation.program))]
    pub fn run(&self, invocation: &ToolInvocation) -> Result<ToolRun, ToolError> {
        let started_at = Utc::now();
        let resolved = match self.resolve(&invocation.program) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(error = %err, "tool not resolved");
                self.record(invocation, started_at, None, InvocationOutcome::NotFound, "", &err.to_string(), Duration::ZERO);
                return Err(err);
            }
        };

        let mut cmd = Command::new(&resolved.path);
        cmd.args(&invocation.args).current_dir(&invocation.cwd);
        self.apply_runtime_env(&mut cmd);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }
        let timeout = invocation.timeout.unwrap_or(self.default_timeout);
        debug!(path = %resolved.path.display(), args = ?invocation.args, timeout_ms = timeout.as_millis() as u64, "running tool");

        let output = match run_captured(cmd, timeout, self.output_limit_bytes) {
            Ok(output) => output,
            Err(err) => {
                let not_found = err
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
                let (outcome, tool_err) = if not_found {
                    (
                        InvocationOutcome::NotFound,
                        ToolError::NotFound {
                            name: invocation.program.clone(),
                        },
                    )
                } else {
                    (
                        InvocationOutcome::LaunchFailed,
                        ToolError::Launch {
                            program: invocation.program.clone(),
                            message: format!("{err:#}"),
                        },
                    )
                };
                warn!(error = %tool_err, "tool failed to launch");
                self.record(invocation, started_at, None, outcome, "", &tool_err.to_string(), Duration::ZERO);
                return Err(tool_err);
            }
        };

        let stdout = output.stdout_text();
        let stderr = output.stderr_text();
        let signal = if output.timed_out {
            None
        } else {
            terminating_signal(output.status)
        };
        let exit_code = match (output.timed_out, output.status.code()) {
            (true, _) => TIMEOUT_EXIT_CODE,
            (false, Some(code)) => code,
            (false, None) => SIGNAL_EXIT_CODE,
        };
        let outcome = if output.timed_out {
            InvocationOutcome::TimedOut
        } else {
            InvocationOutcome::Completed
        };
        self.record(invocation, started_at, Some(exit_code), outcome, &stdout, &stderr, output.elapsed);
        info!(exit_code, timed_out = output.timed_out, signal = ?signal, elapsed_ms = output.elapsed.as_millis() as u64, "tool finished");

        Ok(ToolRun {
            program: invocation.program.clone(),
            path: resolved.path,
            exit_code,
            stdout,
            stderr,
            timed_out: output.timed_out,
            signal,
            timeout,
            duration: output.elapsed,
        })
    }

    fn apply_runtime_env(&self, cmd: &mut Command) {
        let Some(runtime) = &self.runtime else {
            return;
        };
        let mut dirs = vec![runtime.bin_dir()];
        if let Some(search_path) = &self.search_path {
            dirs.extend(std::env::split_paths(search_path));
        }
        match std::env::join_paths(dirs) {
            Ok(joined) => {
                cmd.env("PATH", joined);
            }
            Err(err) => warn!(error = %err, "could not prepend runtime to PATH"),
        }
        cmd.env("VIRTUAL_ENV", runtime.root()).env_remove("PYTHONHOME");
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        invocation: &ToolInvocation,
        started_at: chrono::DateTime<Utc>,
        exit_code: Option<i32>,
        outcome: InvocationOutcome,
        stdout: &str,
        stderr: &str,
        duration: Duration,
    ) {
        let Some(log) = &self.log else {
            return;
        };
        let record = InvocationRecord {
            timestamp: started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            command: invocation.command_line(),
            cwd: invocation.cwd.display().to_string(),
            exit_code,
            outcome,
            stdout: truncate_text(stdout, self.log_output_limit_bytes),
            stderr: truncate_text(stderr, self.log_output_limit_bytes),
            duration_ms: duration.as_millis() as u64,
        };
        if let Err(err) = log.append(&record) {
            warn!(error = %format!("{err:#}"), path = %log.path().display(), "failed to append invocation log");
        }
    }

    /// Truncate text to the configured log/report limit.
    pub fn clip(&self, text: &str) -> String {
        truncate_text(text, self.log_output_limit_bytes)
    }
}

#[cfg(unix)]
fn terminating_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn terminating_signal(_status: ExitStatus) -> Option<i32> {
    None
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
