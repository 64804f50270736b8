//! End-to-end runs against a fake toolchain and scripted inference.
//!
//! Each scenario builds a throwaway target project whose python, ruff, mypy,
//! pytest and pip-audit are shell scripts, then drives `run_gauntlet` and
//! inspects the sealed report.
#![cfg(unix)]

use std::fs;
use std::sync::Arc;

use gauntlet::core::report::{RunReport, StepResult};
use gauntlet::core::types::{Mode, RunStatus, StepName, StepStatus};
use gauntlet::core::verdict::Verdict;
use gauntlet::error::ErrorKind;
use gauntlet::exit_codes;
use gauntlet::io::git::NO_CHANGES;
use gauntlet::io::invocation_log::InvocationLog;
use gauntlet::io::lock::LOCK_FILE_NAME;
use gauntlet::io::state_dir;
use gauntlet::run::run_gauntlet;
use gauntlet::test_support::{
    GENERATED_TESTS, REVIEW_FINDINGS, ScriptedInference, TestProject, git_available,
    init_git_repo,
};

const APP: &str = "def add(a: int, b: int) -> int:\n    return a + b\n";

fn step(report: &RunReport, name: StepName) -> &StepResult {
    report
        .steps
        .iter()
        .find(|step| step.name == name)
        .unwrap_or_else(|| panic!("no {name} step in report"))
}

fn answering() -> Arc<ScriptedInference> {
    Arc::new(ScriptedInference::new(vec![
        Ok(GENERATED_TESTS.to_string()),
        Ok(REVIEW_FINDINGS.to_string()),
    ]))
}

#[test]
fn clean_artifact_passes_every_gate_in_apply_mode() {
    let project = TestProject::new();
    let source = project.write_source("app.py", APP);
    let inference = answering();

    let outcome = run_gauntlet(
        &project.request(&source, "src/app.py", Mode::Apply),
        &project.options(inference.clone()),
    );
    let report = &outcome.report;

    assert_eq!(report.status, RunStatus::Success, "{report:#?}");
    assert!(!report.has_warnings);
    assert_eq!(outcome.exit_code(), exit_codes::OK);
    assert_eq!(report.steps.len(), StepName::ALL.len());
    assert_eq!(step(report, StepName::InstallDeps).status, StepStatus::Skipped);
    assert_eq!(step(report, StepName::LintCode).status, StepStatus::Success);
    assert_eq!(step(report, StepName::ExecuteTests).status, StepStatus::Success);
    assert_eq!(step(report, StepName::ReviewCode).status, StepStatus::Advisory);
    assert_eq!(step(report, StepName::ReviewCode).contribution, None);
    assert_eq!(step(report, StepName::CommitChanges).status, StepStatus::Skipped);

    assert_eq!(
        fs::read_to_string(project.target().join("src/app.py")).expect("applied"),
        APP
    );
    assert!(
        project
            .target()
            .join("tests/gauntlet_generated/test_app_gauntlet.py")
            .is_file()
    );
    assert_eq!(report.test_summary.as_ref().map(|s| s.passed), Some(2));
    assert_eq!(report.review_findings.as_ref().map(Vec::len), Some(1));
    assert_eq!(report.audit_findings.as_ref().map(Vec::len), Some(0));
    assert_eq!(report.artifact_sha256.as_ref().map(String::len), Some(64));
    assert!(inference.prompts()[0].contains("def add(a: int, b: int) -> int:"));

    let log = InvocationLog::for_target(project.target());
    assert!(!log.read_all().expect("invocation log").is_empty());
    assert!(!state_dir(project.target()).join(LOCK_FILE_NAME).exists());
}

#[test]
fn minor_lint_finding_warns_without_failing() {
    let project = TestProject::new();
    project.toolchain.add(
        "ruff",
        "#!/bin/sh\n[ \"$1\" = \"check\" ] || exit 0\necho '[{\"code\":\"F401\",\"message\":\"unused import\",\"location\":{\"row\":1}}]'\nexit 1\n",
    );
    let source = project.write_source("app.py", APP);

    let outcome = run_gauntlet(
        &project.request(&source, "app.py", Mode::Apply),
        &project.options(answering()),
    );
    let report = &outcome.report;
    let lint = step(report, StepName::LintCode);
    assert_eq!(lint.status, StepStatus::Warning);
    assert_eq!(lint.contribution, Some(Verdict::Warning));
    assert_eq!(report.status, RunStatus::Success);
    assert!(report.has_warnings);
    assert_eq!(outcome.exit_code(), exit_codes::OK);
}

#[test]
fn ungated_critical_lint_only_warns() {
    let project = TestProject::new();
    project.write_config("[thresholds]\nfail_on_lint_critical = false\n");
    project.toolchain.add(
        "ruff",
        "#!/bin/sh\n[ \"$1\" = \"check\" ] || exit 0\necho '[{\"code\":\"F821\",\"message\":\"undefined name\",\"location\":{\"row\":2}}]'\nexit 1\n",
    );
    let source = project.write_source("app.py", APP);

    let outcome = run_gauntlet(
        &project.request(&source, "app.py", Mode::Apply),
        &project.options(answering()),
    );
    let lint = step(&outcome.report, StepName::LintCode);
    assert_eq!(lint.status, StepStatus::Failure);
    assert_eq!(lint.contribution, Some(Verdict::Warning));
    assert_eq!(outcome.report.status, RunStatus::Success);
    assert!(outcome.report.has_warnings);
}

#[test]
fn failing_type_check_fails_the_run_and_blocks_commit() {
    let project = TestProject::new();
    project.toolchain.add(
        "mypy",
        "#!/bin/sh\necho 'app.py:2: error: Incompatible return value'\nexit 1\n",
    );
    let source = project.write_source("app.py", APP);

    let outcome = run_gauntlet(
        &project.request(&source, "app.py", Mode::Commit),
        &project.options(answering()),
    );
    let report = &outcome.report;
    assert_eq!(step(report, StepName::TypeCheck).status, StepStatus::Failure);
    // Later steps still run; only the commit is withheld.
    assert_eq!(step(report, StepName::ExecuteTests).status, StepStatus::Success);
    let commit = step(report, StepName::CommitChanges);
    assert_eq!(commit.status, StepStatus::Skipped);
    assert_eq!(report.status, RunStatus::Failure);
    assert_eq!(outcome.exit_code(), exit_codes::FAILED);
    assert!(report.commit_id.is_none());
}

#[test]
fn unreachable_model_fails_generation_and_skips_dependents() {
    let project = TestProject::new();
    project.write_config("[network]\nretries = 1\nretry_delay_ms = 10\n");
    let source = project.write_source("app.py", APP);
    let inference = Arc::new(ScriptedInference::unreachable());

    let outcome = run_gauntlet(
        &project.request(&source, "app.py", Mode::Apply),
        &project.options(inference.clone()),
    );
    let report = &outcome.report;

    let generate = step(report, StepName::GenerateTests);
    assert_eq!(generate.status, StepStatus::Failure);
    assert!(
        generate
            .error
            .as_deref()
            .is_some_and(|e| e.contains("after 2 attempts")),
        "{generate:?}"
    );
    for dependent in [StepName::SaveTests, StepName::ExecuteTests] {
        let skipped = step(report, dependent);
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert!(skipped.details.message().starts_with("missing input"));
    }
    let review = step(report, StepName::ReviewCode);
    assert_eq!(review.status, StepStatus::Advisory);
    assert!(review.error.is_some());
    assert_eq!(report.status, RunStatus::Failure);
    assert_eq!(outcome.exit_code(), exit_codes::FAILED);
    // Two attempts for generation, two for review.
    assert_eq!(inference.calls(), 4);
}

#[test]
fn review_only_mode_stops_after_review() {
    let project = TestProject::new();
    let source = project.write_source("app.py", APP);

    let mut config_steps = String::from("[pipeline]\nsteps = [");
    for name in [
        StepName::ApplyCode,
        StepName::LintCode,
        StepName::ReviewCode,
        StepName::TypeCheck,
        StepName::RunPrecommit,
        StepName::CommitChanges,
    ] {
        config_steps.push_str(&format!("\"{name}\", "));
    }
    config_steps.push_str("]\n");
    project.write_config(&config_steps);

    let inference = Arc::new(ScriptedInference::new(vec![Ok(REVIEW_FINDINGS.to_string())]));
    let outcome = run_gauntlet(
        &project.request(&source, "app.py", Mode::ReviewOnly),
        &project.options(inference),
    );
    let report = &outcome.report;
    let statuses: Vec<StepStatus> = report.steps.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Success,
            StepStatus::Success,
            StepStatus::Advisory,
            StepStatus::Skipped,
            StepStatus::Skipped,
            StepStatus::Skipped,
        ]
    );
    assert_eq!(report.status, RunStatus::Success);
}

#[test]
fn unchanged_file_commits_with_no_changes_sentinel() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let project = TestProject::new();
    init_git_repo(project.target());
    fs::write(project.target().join("app.py"), APP).expect("seed file");
    fs::write(project.target().join(".gitignore"), ".venv/\n.gauntlet/\ntests/\n")
        .expect("gitignore");
    let git = |args: &[&str]| {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(project.target())
            .status()
            .expect("git");
        assert!(status.success());
    };
    git(&["add", "."]);
    git(&["commit", "-q", "-m", "seed"]);

    let source = project.write_source("app.py", APP);
    let outcome = run_gauntlet(
        &project.request(&source, "app.py", Mode::Commit),
        &project.options(answering()),
    );
    let report = &outcome.report;
    assert_eq!(step(report, StepName::CommitChanges).status, StepStatus::Success);
    assert_eq!(report.commit_id.as_deref(), Some(NO_CHANGES));
    assert_eq!(report.status, RunStatus::Success);
}

#[test]
fn changed_file_is_committed_with_rendered_message() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let project = TestProject::new();
    init_git_repo(project.target());
    let source = project.write_source("app.py", APP);

    let outcome = run_gauntlet(
        &project.request(&source, "app.py", Mode::Commit),
        &project.options(answering()),
    );
    let report = &outcome.report;
    let commit_id = report.commit_id.clone().expect("commit id");
    assert_eq!(commit_id.len(), 40, "{commit_id}");

    let log = std::process::Command::new("git")
        .args(["log", "-1", "--format=%s"])
        .current_dir(project.target())
        .output()
        .expect("git log");
    assert!(String::from_utf8_lossy(&log.stdout).contains("app.py"));
}

#[test]
fn missing_target_aborts_before_any_step() {
    let project = TestProject::new();
    let source = project.write_source("app.py", APP);
    let mut request = project.request(&source, "app.py", Mode::Apply);
    request.target_dir = project.target().join("does-not-exist");

    let outcome = run_gauntlet(&request, &project.options(answering()));
    assert!(outcome.aborted);
    assert_eq!(outcome.exit_code(), exit_codes::ABORTED);
    assert!(outcome.report.steps.is_empty());
    assert_eq!(outcome.report.status, RunStatus::Failure);
    let error = outcome.report.error.as_ref().expect("error");
    assert_eq!(error.kind, ErrorKind::Input);
}

#[test]
fn invalid_config_aborts_with_configuration_error() {
    let project = TestProject::new();
    project.write_config("[network]\nretries = \"many\"\n");
    let source = project.write_source("app.py", APP);

    let outcome = run_gauntlet(
        &project.request(&source, "app.py", Mode::Apply),
        &project.options(answering()),
    );
    assert!(outcome.aborted);
    let error = outcome.report.error.as_ref().expect("error");
    assert_eq!(error.kind, ErrorKind::Configuration);
    assert!(error.message.contains("network.retries"), "{}", error.message);
}

#[test]
fn held_lock_aborts_the_second_run() {
    let project = TestProject::new();
    let lock = state_dir(project.target()).join(LOCK_FILE_NAME);
    fs::create_dir_all(lock.parent().expect("state dir")).expect("state dir");
    fs::write(&lock, "gauntlet_20250101_000000_abcdef\n").expect("lock");
    let source = project.write_source("app.py", APP);

    let outcome = run_gauntlet(
        &project.request(&source, "app.py", Mode::Apply),
        &project.options(answering()),
    );
    assert!(outcome.aborted);
    let error = outcome.report.error.as_ref().expect("error");
    assert_eq!(error.kind, ErrorKind::Input);
    assert!(error.message.contains("gauntlet_20250101_000000_abcdef"));
    assert!(lock.exists());
}

#[test]
fn cancelled_run_records_no_steps() {
    let project = TestProject::new();
    let source = project.write_source("app.py", APP);
    let options = project.options(answering());
    options.cancel.cancel();

    let outcome = run_gauntlet(&project.request(&source, "app.py", Mode::Apply), &options);
    assert!(!outcome.aborted);
    assert!(outcome.report.steps.is_empty());
    assert_eq!(
        outcome.report.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::Cancelled)
    );
    assert_eq!(outcome.exit_code(), exit_codes::FAILED);
}

#[test]
fn raising_step_halts_the_pipeline_with_a_tool_error() {
    let project = TestProject::new();
    project.toolchain.add(
        "ruff",
        "#!/bin/sh\nif [ \"$1\" = \"format\" ]; then echo 'cannot parse app.py' >&2; exit 2; fi\necho '[]'\n",
    );
    let source = project.write_source("app.py", APP);
    let inference = answering();

    let outcome = run_gauntlet(
        &project.request(&source, "app.py", Mode::Apply),
        &project.options(inference.clone()),
    );
    let report = &outcome.report;

    let last = report.steps.last().expect("steps recorded");
    assert_eq!(last.name, StepName::FormatCode);
    assert_eq!(last.status, StepStatus::Failure);
    assert_eq!(last.contribution, Some(Verdict::Failure));
    assert!(
        last.error.as_deref().is_some_and(|e| e.contains("cannot parse app.py")),
        "{last:?}"
    );
    assert!(report.steps.iter().all(|s| s.name != StepName::LintCode));

    let error = report.error.as_ref().expect("top-level error");
    assert_eq!(error.kind, ErrorKind::Tool);
    assert_eq!(report.status, RunStatus::Failure);
    assert!(!outcome.aborted);
    assert_eq!(outcome.exit_code(), exit_codes::FAILED);
    assert_eq!(inference.calls(), 0);
}

fn audit_script(severity: &str) -> String {
    format!(
        "#!/bin/sh\necho '{{\"dependencies\": [{{\"name\": \"flask\", \"version\": \"0.1\", \"vulns\": [{{\"id\": \"GHSA-0001\", \"severity\": \"{severity}\", \"description\": \"bad\"}}]}}]}}'\nexit 1\n"
    )
}

#[test]
fn audit_finding_below_threshold_only_warns() {
    let project = TestProject::new();
    project.toolchain.add("pip-audit", &audit_script("moderate"));
    let source = project.write_source("app.py", APP);

    let outcome = run_gauntlet(
        &project.request(&source, "app.py", Mode::Apply),
        &project.options(answering()),
    );
    let report = &outcome.report;
    let audit = step(report, StepName::AuditDeps);
    assert_eq!(audit.status, StepStatus::Warning);
    assert_eq!(audit.contribution, Some(Verdict::Warning));
    assert_eq!(report.audit_findings.as_ref().map(Vec::len), Some(1));
    assert_eq!(report.status, RunStatus::Success);
    assert!(report.has_warnings);
}

#[test]
fn audit_finding_at_threshold_fails_the_run() {
    let project = TestProject::new();
    project.toolchain.add("pip-audit", &audit_script("critical"));
    let source = project.write_source("app.py", APP);

    let outcome = run_gauntlet(
        &project.request(&source, "app.py", Mode::Apply),
        &project.options(answering()),
    );
    let report = &outcome.report;
    let audit = step(report, StepName::AuditDeps);
    assert_eq!(audit.status, StepStatus::Failure);
    assert_eq!(audit.contribution, Some(Verdict::Failure));
    // A semantic failure does not halt the pipeline.
    assert_eq!(step(report, StepName::ExecuteTests).status, StepStatus::Success);
    assert_eq!(report.status, RunStatus::Failure);
    assert!(report.error.is_none());
    assert_eq!(outcome.exit_code(), exit_codes::FAILED);
}

#[test]
fn audit_threshold_none_never_escalates() {
    let project = TestProject::new();
    project.write_config("[thresholds]\nfail_on_audit_severity = \"none\"\n");
    project.toolchain.add("pip-audit", &audit_script("critical"));
    let source = project.write_source("app.py", APP);

    let outcome = run_gauntlet(
        &project.request(&source, "app.py", Mode::Apply),
        &project.options(answering()),
    );
    let report = &outcome.report;
    let audit = step(report, StepName::AuditDeps);
    assert_ne!(audit.contribution, Some(Verdict::Failure));
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(outcome.exit_code(), exit_codes::OK);
}

#[test]
fn review_only_mode_requires_review_step() {
    let project = TestProject::new();
    project.write_config("[pipeline]\nsteps = [\"apply_code\", \"lint_code\", \"commit_changes\"]\n");
    let source = project.write_source("app.py", APP);

    let outcome = run_gauntlet(
        &project.request(&source, "app.py", Mode::ReviewOnly),
        &project.options(answering()),
    );
    assert!(outcome.aborted);
    assert!(outcome.report.steps.is_empty());
    let error = outcome.report.error.as_ref().expect("error");
    assert_eq!(error.kind, ErrorKind::Configuration);
    assert!(error.message.contains("pipeline.steps"), "{}", error.message);
    assert!(!project.target().join("app.py").exists());
}
