//! Isolated Python runtime under the target project.

use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use crate::core::findings::{AuditFinding, parse_audit_findings};
use crate::error::{GauntletError, Result};
use crate::io::tools::{ToolInvocation, ToolInvoker, ToolRun};

/// Runtime directory name under the target.
pub const RUNTIME_DIR: &str = ".venv";
/// Marker file present in every initialized runtime.
pub const RUNTIME_MARKER: &str = "pyvenv.cfg";

const PYTHON: &str = "python3";
const AUDIT_TOOL: &str = "pip-audit";
/// Optional-dependency groups tried against `pyproject.toml`, widest first.
const PYPROJECT_GROUPS: [&str; 5] = [
    "[dev,test,lint,format]",
    "[dev,test,lint]",
    "[dev,test]",
    "[dev]",
    "",
];

/// Handle to a provisioned runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    root: PathBuf,
    reused: bool,
}

impl RuntimeHandle {
    pub fn new(root: impl Into<PathBuf>, reused: bool) -> Self {
        Self {
            root: root.into(),
            reused,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True when provisioning found an existing runtime and left it alone.
    pub fn reused(&self) -> bool {
        self.reused
    }

    pub fn bin_dir(&self) -> PathBuf {
        if cfg!(windows) {
            self.root.join("Scripts")
        } else {
            self.root.join("bin")
        }
    }

    pub fn python(&self) -> PathBuf {
        self.bin_dir().join("python")
    }
}

/// How dependency installation went when it did not raise.
#[derive(Debug)]
pub enum InstallOutcome {
    Installed { strategy: String, run: ToolRun },
    NoManifest,
}

/// Parsed (or unparseable) scanner output.
#[derive(Debug)]
pub enum AuditOutcome {
    Parsed {
        findings: Vec<AuditFinding>,
        run: ToolRun,
    },
    Unparseable {
        reason: String,
        run: ToolRun,
    },
}

#[derive(Debug, Clone)]
pub struct EnvironmentManager {
    invoker: ToolInvoker,
    target_dir: PathBuf,
}

impl EnvironmentManager {
    pub fn new(invoker: ToolInvoker, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            invoker,
            target_dir: target_dir.into(),
        }
    }

    pub fn runtime_root(&self) -> PathBuf {
        self.target_dir.join(RUNTIME_DIR)
    }

    /// Create the runtime unless one already exists, in which case it is
    /// reused untouched.
    #[instrument(skip(self), fields(target_dir = %self.target_dir.display()))]
    pub fn provision(&self) -> Result<RuntimeHandle> {
        let root = self.runtime_root();
        if root.join(RUNTIME_MARKER).is_file() {
            info!(root = %root.display(), "reusing existing runtime");
            return Ok(RuntimeHandle::new(root, true));
        }
        if root.exists() {
            return Err(GauntletError::Environment(format!(
                "{} exists but is not a python runtime (no {RUNTIME_MARKER})",
                root.display()
            )));
        }

        info!(root = %root.display(), "creating runtime");
        let create = ToolInvocation::new(PYTHON, &self.target_dir)
            .args(["-m", "venv"])
            .arg(root.display().to_string());
        let run = self.invoker.run(&create).map_err(|err| {
            GauntletError::Environment(format!("cannot create runtime: {err}"))
        })?;
        if !run.succeeded() {
            return Err(GauntletError::Environment(format!(
                "runtime creation exited with {}: {}",
                run.exit_code,
                self.invoker.clip(run.stderr.trim())
            )));
        }
        let handle = RuntimeHandle::new(root, false);
        if !handle.python().is_file() {
            return Err(GauntletError::Environment(format!(
                "runtime at {} has no python executable",
                handle.root().display()
            )));
        }

        let upgrade = self
            .runtime_python(&handle)
            .args(["-m", "pip", "install", "--disable-pip-version-check", "--upgrade"])
            .args(["pip", "setuptools", "wheel"]);
        match self.invoker.run(&upgrade) {
            Ok(run) if run.succeeded() => info!("runtime packaging tools upgraded"),
            Ok(run) => warn!(exit_code = run.exit_code, "packaging tools upgrade failed"),
            Err(err) => warn!(error = %err, "packaging tools upgrade failed"),
        }
        Ok(handle)
    }

    /// Install declared dependencies. The first working manifest strategy wins.
    #[instrument(skip_all, fields(target_dir = %self.target_dir.display()))]
    pub fn install_dependencies(&self, runtime: &RuntimeHandle) -> Result<InstallOutcome> {
        let pyproject = self.target_dir.join("pyproject.toml");
        let requirements = self.target_dir.join("requirements.txt");

        if pyproject.is_file() {
            let mut last_error = String::new();
            for group in PYPROJECT_GROUPS {
                let spec = format!(".{group}");
                let install = self
                    .runtime_python(runtime)
                    .args(["-m", "pip", "install", "--disable-pip-version-check", "-e"])
                    .arg(spec.clone());
                match self.invoker.run(&install) {
                    Ok(run) if run.succeeded() => {
                        info!(strategy = %spec, "dependencies installed from pyproject.toml");
                        return Ok(InstallOutcome::Installed {
                            strategy: format!("pyproject.toml {spec}"),
                            run,
                        });
                    }
                    Ok(run) => {
                        warn!(strategy = %spec, exit_code = run.exit_code, "install strategy failed");
                        last_error = self.invoker.clip(run.stderr.trim());
                    }
                    Err(err) => {
                        warn!(strategy = %spec, error = %err, "install strategy failed");
                        last_error = err.to_string();
                    }
                }
            }
            return Err(GauntletError::Environment(format!(
                "every pyproject.toml install strategy failed: {last_error}"
            )));
        }

        if requirements.is_file() {
            let install = self
                .runtime_python(runtime)
                .args(["-m", "pip", "install", "--disable-pip-version-check", "-r"])
                .arg(requirements.display().to_string());
            let run = self.invoker.run(&install).map_err(|err| {
                GauntletError::Environment(format!("cannot install requirements.txt: {err}"))
            })?;
            if !run.succeeded() {
                return Err(GauntletError::Environment(format!(
                    "requirements.txt install exited with {}: {}",
                    run.exit_code,
                    self.invoker.clip(run.stderr.trim())
                )));
            }
            info!("dependencies installed from requirements.txt");
            return Ok(InstallOutcome::Installed {
                strategy: "requirements.txt".to_string(),
                run,
            });
        }

        info!("no dependency manifest found");
        Ok(InstallOutcome::NoManifest)
    }

    /// Run the vulnerability scanner, installing it into the runtime first.
    #[instrument(skip_all, fields(target_dir = %self.target_dir.display()))]
    pub fn audit_dependencies(&self, runtime: &RuntimeHandle) -> Result<AuditOutcome> {
        let ensure = self
            .runtime_python(runtime)
            .args(["-m", "pip", "install", "--disable-pip-version-check", AUDIT_TOOL]);
        match self.invoker.run(&ensure) {
            Ok(run) if run.succeeded() => {}
            Ok(run) => warn!(exit_code = run.exit_code, "scanner install failed, audit may fail"),
            Err(err) => warn!(error = %err, "scanner install failed, audit may fail"),
        }

        let audit = ToolInvocation::new(AUDIT_TOOL, &self.target_dir)
            .args(["--format", "json", "--progress-spinner", "off"]);
        let run = self.invoker.run(&audit)?;
        if run.timed_out {
            return Ok(AuditOutcome::Unparseable {
                reason: "scanner timed out".to_string(),
                run,
            });
        }
        match parse_audit_findings(&run.stdout) {
            Ok(findings) => {
                info!(findings = findings.len(), "audit parsed");
                Ok(AuditOutcome::Parsed { findings, run })
            }
            Err(reason) => {
                warn!(%reason, exit_code = run.exit_code, "audit output unparseable");
                Ok(AuditOutcome::Unparseable { reason, run })
            }
        }
    }

    fn runtime_python(&self, runtime: &RuntimeHandle) -> ToolInvocation {
        ToolInvocation::new(runtime.python().display().to_string(), &self.target_dir)
    }
}
