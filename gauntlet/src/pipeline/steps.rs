//! The step catalogue.

use std::fs;
use std::path::{Path, PathBuf};

use minijinja::{Environment, UndefinedBehavior, context};
use tracing::{debug, info, warn};

use crate::core::findings::{parse_lint_findings, parse_test_summary};
use crate::core::report::StepDetails;
use crate::core::signatures::extract_signatures;
use crate::core::types::{StepName, StepStatus};
use crate::core::verdict::Gate;
use crate::error::{GauntletError, Result, ToolError};
use crate::io::environment::{AuditOutcome, InstallOutcome};
use crate::io::git::GitError;
use crate::io::tools::{ToolInvocation, ToolRun};
use crate::pipeline::{Artifact, Artifacts, Produced, Step, StepContext, StepOutput};

const FORMATTER: &str = "ruff";
const LINTER: &str = "ruff";
const TYPE_CHECKER: &str = "mypy";
const TEST_RUNNER: &str = "pytest";
const PRECOMMIT: &str = "pre-commit";
const PRECOMMIT_CONFIG: &str = ".pre-commit-config.yaml";

/// pytest exit code when no tests were collected.
const PYTEST_NO_TESTS: i32 = 5;

/// Build the ordered step list for a run.
pub fn build_steps(names: &[StepName]) -> Vec<Box<dyn Step>> {
    names.iter().map(|name| step_for(*name)).collect()
}

fn step_for(name: StepName) -> Box<dyn Step> {
    match name {
        StepName::InstallDeps => Box::new(InstallDeps),
        StepName::AuditDeps => Box::new(AuditDeps),
        StepName::ApplyCode => Box::new(ApplyCode),
        StepName::FormatCode => Box::new(FormatCode),
        StepName::LintCode => Box::new(LintCode),
        StepName::TypeCheck => Box::new(TypeCheck),
        StepName::ExtractSignatures => Box::new(ExtractSignatures),
        StepName::GenerateTests => Box::new(GenerateTests),
        StepName::SaveTests => Box::new(SaveTests),
        StepName::ExecuteTests => Box::new(ExecuteTests),
        StepName::ReviewCode => Box::new(ReviewCode),
        StepName::RunPrecommit => Box::new(RunPrecommit),
        StepName::CommitChanges => Box::new(CommitChanges),
    }
}

fn tool_details(ctx: &StepContext<'_>, run: &ToolRun, message: impl Into<String>) -> StepDetails {
    StepDetails::Tool {
        tool: run.program.clone(),
        exit_code: Some(run.exit_code),
        message: message.into(),
        stdout: ctx.invoker.clip(run.stdout.trim()),
        stderr: ctx.invoker.clip(run.stderr.trim()),
    }
}

fn target_arg(ctx: &StepContext<'_>) -> String {
    ctx.target_file().display().to_string()
}

struct InstallDeps;

impl Step for InstallDeps {
    fn name(&self) -> StepName {
        StepName::InstallDeps
    }

    fn gate(&self) -> Gate {
        Gate::Always
    }

    fn run(&self, ctx: &StepContext<'_>, _artifacts: &Artifacts) -> Result<StepOutput> {
        match ctx.environment.install_dependencies(ctx.runtime)? {
            InstallOutcome::Installed { strategy, run } => Ok(StepOutput::new(
                StepStatus::Success,
                tool_details(ctx, &run, format!("installed from {strategy}")),
            )),
            InstallOutcome::NoManifest => Ok(StepOutput::skipped(
                "no pyproject.toml or requirements.txt, nothing to install",
            )),
        }
    }
}

struct AuditDeps;

impl Step for AuditDeps {
    fn name(&self) -> StepName {
        StepName::AuditDeps
    }

    fn gate(&self) -> Gate {
        Gate::Audit
    }

    fn run(&self, ctx: &StepContext<'_>, _artifacts: &Artifacts) -> Result<StepOutput> {
        let (findings, run) = match ctx.environment.audit_dependencies(ctx.runtime)? {
            AuditOutcome::Parsed { findings, run } => (findings, run),
            AuditOutcome::Unparseable { reason, run } => {
                return Ok(StepOutput::new(
                    StepStatus::Warning,
                    tool_details(ctx, &run, format!("audit output unusable: {reason}")),
                ));
            }
        };

        let highest = findings.iter().map(|f| f.severity).max();
        let threshold = ctx.config.thresholds.fail_on_audit_severity;
        let (status, message) = match highest {
            None => (StepStatus::Success, "no known vulnerabilities".to_string()),
            Some(severity) if threshold.is_reached_by(severity) => (
                StepStatus::Failure,
                format!(
                    "{} vulnerabilities, highest {severity} reaches threshold {threshold}",
                    findings.len()
                ),
            ),
            Some(severity) => (
                StepStatus::Warning,
                format!(
                    "{} vulnerabilities, highest {severity} below threshold {threshold}",
                    findings.len()
                ),
            ),
        };
        let details = StepDetails::Audit {
            tool: run.program.clone(),
            findings: findings.len(),
            highest,
            message,
        };
        Ok(StepOutput::new(status, details).producing(Produced::AuditFindings(findings)))
    }
}

struct ApplyCode;

impl Step for ApplyCode {
    fn name(&self) -> StepName {
        StepName::ApplyCode
    }

    fn gate(&self) -> Gate {
        Gate::Always
    }

    fn run(&self, ctx: &StepContext<'_>, _artifacts: &Artifacts) -> Result<StepOutput> {
        let target = ctx.target_file();
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| GauntletError::fs(parent, err))?;
        }
        let bytes = fs::copy(ctx.source, &target).map_err(|err| GauntletError::fs(&target, err))?;
        info!(bytes, dest = %target.display(), "artifact applied");
        Ok(StepOutput::new(
            StepStatus::Success,
            StepDetails::Generation {
                message: format!("copied {} to {}", ctx.source.display(), ctx.dest_display()),
                path: Some(ctx.dest_display()),
                bytes: usize::try_from(bytes).unwrap_or(usize::MAX),
            },
        ))
    }
}

struct FormatCode;

impl Step for FormatCode {
    fn name(&self) -> StepName {
        StepName::FormatCode
    }

    fn gate(&self) -> Gate {
        Gate::Always
    }

    fn run(&self, ctx: &StepContext<'_>, _artifacts: &Artifacts) -> Result<StepOutput> {
        let run = ctx.invoker.run(
            &ToolInvocation::new(FORMATTER, ctx.target_dir)
                .arg("format")
                .arg(target_arg(ctx)),
        )?;
        if !run.succeeded() {
            return Err(run.unexpected_exit().into());
        }
        Ok(StepOutput::new(
            StepStatus::Success,
            tool_details(ctx, &run, "formatted"),
        ))
    }
}

struct LintCode;

impl Step for LintCode {
    fn name(&self) -> StepName {
        StepName::LintCode
    }

    fn gate(&self) -> Gate {
        Gate::Lint
    }

    fn run(&self, ctx: &StepContext<'_>, _artifacts: &Artifacts) -> Result<StepOutput> {
        let run = ctx.invoker.run(
            &ToolInvocation::new(LINTER, ctx.target_dir)
                .args(["check", "--fix", "--output-format", "json"])
                .arg(target_arg(ctx)),
        )?;
        if run.timed_out || !matches!(run.exit_code, 0 | 1) {
            return Err(run.unexpected_exit().into());
        }
        let findings = match parse_lint_findings(&run.stdout) {
            Ok(findings) => findings,
            Err(reason) if run.exit_code == 0 => {
                debug!(%reason, "clean lint run without json body");
                Vec::new()
            }
            Err(reason) => {
                return Ok(StepOutput::new(
                    StepStatus::Failure,
                    tool_details(ctx, &run, format!("lint reported issues but output is unusable: {reason}")),
                ));
            }
        };

        let critical = findings.iter().filter(|f| f.critical).count();
        let (status, message) = if findings.is_empty() {
            (StepStatus::Success, "no lint findings".to_string())
        } else if critical > 0 {
            (
                StepStatus::Failure,
                format!("{} lint findings, {critical} critical", findings.len()),
            )
        } else {
            (
                StepStatus::Warning,
                format!("{} minor lint findings", findings.len()),
            )
        };
        Ok(StepOutput::new(
            status,
            StepDetails::Lint {
                tool: run.program.clone(),
                findings,
                message,
            },
        ))
    }
}

struct TypeCheck;

impl Step for TypeCheck {
    fn name(&self) -> StepName {
        StepName::TypeCheck
    }

    fn gate(&self) -> Gate {
        Gate::TypeCheck
    }

    fn run(&self, ctx: &StepContext<'_>, _artifacts: &Artifacts) -> Result<StepOutput> {
        let run = ctx
            .invoker
            .run(&ToolInvocation::new(TYPE_CHECKER, ctx.target_dir).arg(target_arg(ctx)))?;
        match (run.timed_out, run.exit_code) {
            (false, 0) => Ok(StepOutput::new(
                StepStatus::Success,
                tool_details(ctx, &run, "no type errors"),
            )),
            (false, 1) => Ok(StepOutput::new(
                StepStatus::Failure,
                tool_details(ctx, &run, "type errors found"),
            )),
            _ => Err(run.unexpected_exit().into()),
        }
    }
}

struct ExtractSignatures;

impl Step for ExtractSignatures {
    fn name(&self) -> StepName {
        StepName::ExtractSignatures
    }

    fn gate(&self) -> Gate {
        Gate::Always
    }

    fn run(&self, ctx: &StepContext<'_>, _artifacts: &Artifacts) -> Result<StepOutput> {
        let source = ctx.read_target()?;
        let signatures = extract_signatures(&source);
        let joined = signatures.join("\n\n");
        Ok(StepOutput::new(
            StepStatus::Success,
            StepDetails::Generation {
                message: format!("extracted {} signatures", signatures.len()),
                path: None,
                bytes: joined.len(),
            },
        )
        .producing(Produced::Signatures(joined)))
    }
}

struct GenerateTests;

impl Step for GenerateTests {
    fn name(&self) -> StepName {
        StepName::GenerateTests
    }

    fn gate(&self) -> Gate {
        Gate::Always
    }

    fn consumes(&self) -> &'static [Artifact] {
        &[Artifact::Signatures]
    }

    fn run(&self, ctx: &StepContext<'_>, artifacts: &Artifacts) -> Result<StepOutput> {
        let code = ctx.read_target()?;
        let signatures = artifacts.signatures.as_deref().unwrap_or_default();
        match ctx.llm.generate_tests(&code, &ctx.dest_display(), signatures) {
            Ok(tests) if tests.trim().is_empty() => Ok(StepOutput::new(
                StepStatus::Failure,
                StepDetails::note("model returned no test code"),
            )),
            Ok(tests) => Ok(StepOutput::new(
                StepStatus::Success,
                StepDetails::Generation {
                    message: "tests generated".to_string(),
                    path: None,
                    bytes: tests.len(),
                },
            )
            .producing(Produced::GeneratedTests(tests))),
            Err(err @ GauntletError::Api(_)) => {
                warn!(error = %err, "test generation failed");
                Ok(StepOutput::new(
                    StepStatus::Failure,
                    StepDetails::note("test generation failed"),
                )
                .with_error(err.to_string()))
            }
            Err(err) => Err(err),
        }
    }
}

struct SaveTests;

impl SaveTests {
    fn test_path(ctx: &StepContext<'_>) -> PathBuf {
        let stem = ctx
            .dest
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        let safe: String = stem
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        ctx.target_dir
            .join(&ctx.config.pipeline.generated_test_dir)
            .join(format!("test_{safe}_gauntlet.py"))
    }
}

impl Step for SaveTests {
    fn name(&self) -> StepName {
        StepName::SaveTests
    }

    fn gate(&self) -> Gate {
        Gate::Always
    }

    fn consumes(&self) -> &'static [Artifact] {
        &[Artifact::GeneratedTests]
    }

    fn run(&self, ctx: &StepContext<'_>, artifacts: &Artifacts) -> Result<StepOutput> {
        let code = artifacts.generated_tests.as_deref().unwrap_or_default();
        let path = Self::test_path(ctx);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| GauntletError::fs(parent, err))?;
        }
        let mut contents = code.to_string();
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        fs::write(&path, &contents).map_err(|err| GauntletError::fs(&path, err))?;
        let shown = relative_display(ctx.target_dir, &path);
        Ok(StepOutput::new(
            StepStatus::Success,
            StepDetails::Generation {
                message: format!("tests saved to {shown}"),
                path: Some(shown),
                bytes: contents.len(),
            },
        )
        .producing(Produced::SavedTests(path)))
    }
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}

struct ExecuteTests;

impl Step for ExecuteTests {
    fn name(&self) -> StepName {
        StepName::ExecuteTests
    }

    fn gate(&self) -> Gate {
        Gate::Tests
    }

    fn consumes(&self) -> &'static [Artifact] {
        &[Artifact::SavedTests]
    }

    fn run(&self, ctx: &StepContext<'_>, artifacts: &Artifacts) -> Result<StepOutput> {
        let Some(test_file) = artifacts.saved_tests.as_ref() else {
            return Ok(StepOutput::skipped("missing input: saved_tests"));
        };
        if !test_file.is_file() {
            return Ok(StepOutput::new(
                StepStatus::Failure,
                StepDetails::note(format!("test file not found: {}", test_file.display())),
            ));
        }

        let mut python_path = vec![ctx.target_dir.to_path_buf(), ctx.target_dir.join("src")];
        if let Some(existing) = std::env::var_os("PYTHONPATH") {
            python_path.extend(std::env::split_paths(&existing));
        }
        let python_path = std::env::join_paths(python_path)
            .map_err(|err| GauntletError::Input(format!("cannot build PYTHONPATH: {err}")))?;

        let run = ctx.invoker.run(
            &ToolInvocation::new(TEST_RUNNER, ctx.target_dir)
                .arg(test_file.display().to_string())
                .arg("-v")
                .env("PYTHONPATH", python_path.to_string_lossy()),
        )?;
        if run.timed_out {
            return Err(run.unexpected_exit().into());
        }
        let summary = parse_test_summary(&run.stdout, run.exit_code);
        let (status, message) = match run.exit_code {
            0 => (StepStatus::Success, "all generated tests passed".to_string()),
            1 => (
                StepStatus::Failure,
                format!("{} failed, {} errors", summary.failed, summary.errors),
            ),
            PYTEST_NO_TESTS => (StepStatus::Warning, "no tests collected".to_string()),
            _ => return Err(run.unexpected_exit().into()),
        };
        let output = ctx.invoker.clip(run.combined_output().as_str());
        Ok(StepOutput::new(
            status,
            StepDetails::TestRun {
                tool: run.program.clone(),
                summary: summary.clone(),
                message,
                output,
            },
        )
        .producing(Produced::TestSummary(summary)))
    }
}

struct ReviewCode;

impl Step for ReviewCode {
    fn name(&self) -> StepName {
        StepName::ReviewCode
    }

    fn gate(&self) -> Gate {
        Gate::Advisory
    }

    fn run(&self, ctx: &StepContext<'_>, _artifacts: &Artifacts) -> Result<StepOutput> {
        let code = ctx.read_target()?;
        let file_name = ctx
            .dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| ctx.dest_display());
        match ctx.llm.review(&code, &file_name) {
            Ok(Some(findings)) => Ok(StepOutput::new(
                StepStatus::Advisory,
                StepDetails::Review {
                    findings: findings.len(),
                    message: format!("review produced {} advisory findings", findings.len()),
                },
            )
            .producing(Produced::ReviewFindings(findings))),
            Ok(None) => Ok(StepOutput::new(
                StepStatus::Advisory,
                StepDetails::Review {
                    findings: 0,
                    message: "review response was not a finding list".to_string(),
                },
            )),
            Err(err @ GauntletError::Api(_)) => {
                warn!(error = %err, "review unavailable");
                Ok(StepOutput::new(
                    StepStatus::Advisory,
                    StepDetails::Review {
                        findings: 0,
                        message: "review unavailable".to_string(),
                    },
                )
                .with_error(err.to_string()))
            }
            Err(err) => Err(err),
        }
    }
}

struct RunPrecommit;

impl Step for RunPrecommit {
    fn name(&self) -> StepName {
        StepName::RunPrecommit
    }

    fn gate(&self) -> Gate {
        Gate::Always
    }

    fn run(&self, ctx: &StepContext<'_>, _artifacts: &Artifacts) -> Result<StepOutput> {
        if !ctx.target_dir.join(PRECOMMIT_CONFIG).is_file() {
            return Ok(StepOutput::skipped(format!("no {PRECOMMIT_CONFIG}")));
        }
        let run = ctx.invoker.run(
            &ToolInvocation::new(PRECOMMIT, ctx.target_dir)
                .args(["run", "--files"])
                .arg(ctx.dest_display()),
        )?;
        if run.succeeded() {
            Ok(StepOutput::new(
                StepStatus::Success,
                tool_details(ctx, &run, "pre-commit hooks passed"),
            ))
        } else {
            let message = if run.timed_out {
                "pre-commit timed out".to_string()
            } else {
                format!("pre-commit hooks failed with exit {}", run.exit_code)
            };
            Ok(StepOutput::new(StepStatus::Failure, tool_details(ctx, &run, message)))
        }
    }
}

struct CommitChanges;

impl CommitChanges {
    fn message(ctx: &StepContext<'_>) -> Result<String> {
        let file_name = ctx
            .dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| ctx.dest_display());
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.render_str(
            &ctx.config.pipeline.commit_message,
            context! { target_file => file_name },
        )
        .map_err(|err| {
            GauntletError::config(
                "pipeline.commit_message",
                format!("template does not render: {err}"),
            )
        })
    }
}

impl Step for CommitChanges {
    fn name(&self) -> StepName {
        StepName::CommitChanges
    }

    fn gate(&self) -> Gate {
        Gate::Always
    }

    fn run(&self, ctx: &StepContext<'_>, _artifacts: &Artifacts) -> Result<StepOutput> {
        let message = Self::message(ctx)?;
        match ctx.git.commit_file(&ctx.dest_display(), &message) {
            Ok(outcome) => {
                let commit_id = outcome.commit_id().to_string();
                let note = match commit_id.as_str() {
                    crate::io::git::NO_CHANGES => "no pending changes".to_string(),
                    crate::io::git::NO_EFFECTIVE_CHANGES => "nothing left to commit after staging".to_string(),
                    id => format!("committed {id}"),
                };
                Ok(StepOutput::new(
                    StepStatus::Success,
                    StepDetails::Commit {
                        commit_id: Some(commit_id.clone()),
                        message: note,
                    },
                )
                .producing(Produced::CommitId(commit_id)))
            }
            Err(GitError::Tool(ToolError::NotFound { .. })) => Ok(StepOutput::new(
                StepStatus::Warning,
                StepDetails::Commit {
                    commit_id: None,
                    message: "git not found, commit skipped".to_string(),
                },
            )),
            Err(GitError::Tool(err)) => Err(err.into()),
            Err(err) => Ok(StepOutput::new(
                StepStatus::Failure,
                StepDetails::Commit {
                    commit_id: None,
                    message: "commit failed".to_string(),
                },
            )
            .with_error(err.to_string())),
        }
    }
}
