//! In-memory step results and the run report they accumulate into.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::core::findings::{AuditFinding, LintFinding, ReviewFinding, TestSummary};
use crate::core::types::{Mode, RunStatus, Severity, StepName, StepStatus};
use crate::core::verdict::{Verdict, aggregate, run_status};
use crate::error::{ErrorKind, GauntletError};

/// Typed payload attached to a finished step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepDetails {
    Note {
        message: String,
    },
    Tool {
        tool: String,
        exit_code: Option<i32>,
        message: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        stdout: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        stderr: String,
    },
    Audit {
        tool: String,
        findings: usize,
        highest: Option<Severity>,
        message: String,
    },
    Lint {
        tool: String,
        findings: Vec<LintFinding>,
        message: String,
    },
    TestRun {
        tool: String,
        summary: TestSummary,
        message: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        output: String,
    },
    Generation {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        bytes: usize,
    },
    Review {
        findings: usize,
        message: String,
    },
    Commit {
        #[serde(skip_serializing_if = "Option::is_none")]
        commit_id: Option<String>,
        message: String,
    },
}

impl StepDetails {
    pub fn note(message: impl Into<String>) -> Self {
        Self::Note {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Note { message }
            | Self::Tool { message, .. }
            | Self::Audit { message, .. }
            | Self::Lint { message, .. }
            | Self::TestRun { message, .. }
            | Self::Generation { message, .. }
            | Self::Review { message, .. }
            | Self::Commit { message, .. } => message,
        }
    }
}

/// A step that has begun but not yet finished.
#[derive(Debug)]
pub struct PendingStep {
    name: StepName,
    started_at: DateTime<Utc>,
}

impl PendingStep {
    pub fn begin(name: StepName, now: DateTime<Utc>) -> Self {
        Self {
            name,
            started_at: now,
        }
    }

    pub fn name(&self) -> StepName {
        self.name
    }

    pub fn status(&self) -> StepStatus {
        StepStatus::Pending
    }

    /// Finalize the step. Consumes `self`, so a step is finished once.
    pub fn finish(self, outcome: StepOutcome, now: DateTime<Utc>) -> StepResult {
        let StepOutcome {
            mut status,
            details,
            mut error,
            contribution,
        } = outcome;
        if !status.is_terminal() {
            status = StepStatus::Failure;
            error.get_or_insert_with(|| "step finished without a terminal status".to_string());
        }
        let duration_ms = (now - self.started_at).num_milliseconds().max(0);
        StepResult {
            name: self.name,
            status,
            contribution,
            started_at: timestamp(self.started_at),
            ended_at: timestamp(now),
            duration_secs: duration_ms as f64 / 1000.0,
            details,
            error,
        }
    }
}

/// Everything a step decided, before timestamps are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub details: StepDetails,
    pub error: Option<String>,
    pub contribution: Option<Verdict>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub name: StepName,
    pub status: StepStatus,
    /// Policy-adjusted share in the run verdict; `None` for advisory steps.
    pub contribution: Option<Verdict>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_secs: f64,
    pub details: StepDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Sealed record of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub gauntlet_version: String,
    pub run_id: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_secs: f64,
    pub status: RunStatus,
    pub has_warnings: bool,
    pub mode: Mode,
    pub target_dir: String,
    pub target_file: String,
    pub artifact_sha256: Option<String>,
    pub steps: Vec<StepResult>,
    pub audit_findings: Option<Vec<AuditFinding>>,
    pub review_findings: Option<Vec<ReviewFinding>>,
    pub test_summary: Option<TestSummary>,
    pub commit_id: Option<String>,
    pub error: Option<ReportError>,
}

/// Identity of a run, fixed before the first step.
#[derive(Debug, Clone)]
pub struct RunHeader {
    pub run_id: String,
    pub mode: Mode,
    pub target_dir: String,
    pub target_file: String,
}

/// Append-only accumulator for a run in progress.
#[derive(Debug)]
pub struct RunRecorder {
    header: RunHeader,
    started_at: DateTime<Utc>,
    artifact_sha256: Option<String>,
    steps: Vec<StepResult>,
    audit_findings: Option<Vec<AuditFinding>>,
    review_findings: Option<Vec<ReviewFinding>>,
    test_summary: Option<TestSummary>,
    commit_id: Option<String>,
    error: Option<ReportError>,
}

impl RunRecorder {
    pub fn start(header: RunHeader, now: DateTime<Utc>) -> Self {
        Self {
            header,
            started_at: now,
            artifact_sha256: None,
            steps: Vec::new(),
            audit_findings: None,
            review_findings: None,
            test_summary: None,
            commit_id: None,
            error: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.header.run_id
    }

    pub fn mode(&self) -> Mode {
        self.header.mode
    }

    pub fn status(&self) -> RunStatus {
        RunStatus::Running
    }

    pub fn steps(&self) -> &[StepResult] {
        &self.steps
    }

    pub fn push(&mut self, step: StepResult) {
        self.steps.push(step);
    }

    /// True once any recorded step contributes FAILURE or the run aborted.
    pub fn is_failing(&self) -> bool {
        self.error.is_some()
            || self
                .steps
                .iter()
                .any(|step| step.contribution == Some(Verdict::Failure))
    }

    /// Record the error that stopped the run. The first error wins.
    pub fn fail(&mut self, err: &GauntletError) {
        if self.error.is_none() {
            self.error = Some(ReportError {
                kind: err.kind(),
                message: err.to_string(),
            });
        }
    }

    pub fn set_artifact_sha256(&mut self, digest: String) {
        self.artifact_sha256 = Some(digest);
    }

    pub fn set_audit_findings(&mut self, findings: Vec<AuditFinding>) {
        self.audit_findings = Some(findings);
    }

    pub fn set_review_findings(&mut self, findings: Vec<ReviewFinding>) {
        self.review_findings = Some(findings);
    }

    pub fn set_test_summary(&mut self, summary: TestSummary) {
        self.test_summary = Some(summary);
    }

    pub fn set_commit_id(&mut self, commit_id: String) {
        self.commit_id = Some(commit_id);
    }

    /// Seal the run and compute its status.
    pub fn finish(self, now: DateTime<Utc>) -> RunReport {
        let verdict = aggregate(self.steps.iter().map(|step| step.contribution));
        let has_warnings = self
            .steps
            .iter()
            .any(|step| step.contribution == Some(Verdict::Warning));
        let duration_ms = (now - self.started_at).num_milliseconds().max(0);
        RunReport {
            gauntlet_version: env!("CARGO_PKG_VERSION").to_string(),
            run_id: self.header.run_id,
            started_at: timestamp(self.started_at),
            ended_at: timestamp(now),
            duration_secs: duration_ms as f64 / 1000.0,
            status: run_status(verdict, self.error.is_some()),
            has_warnings,
            mode: self.header.mode,
            target_dir: self.header.target_dir,
            target_file: self.header.target_file,
            artifact_sha256: self.artifact_sha256,
            steps: self.steps,
            audit_findings: self.audit_findings,
            review_findings: self.review_findings,
            test_summary: self.test_summary,
            commit_id: self.commit_id,
            error: self.error,
        }
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn header() -> RunHeader {
        RunHeader {
            run_id: "gauntlet_20250301_120000_abc123".to_string(),
            mode: Mode::Apply,
            target_dir: "/tmp/project".to_string(),
            target_file: "src/app.py".to_string(),
        }
    }

    fn finished(name: StepName, status: StepStatus, contribution: Option<Verdict>) -> StepResult {
        PendingStep::begin(name, t0()).finish(
            StepOutcome {
                status,
                details: StepDetails::note("done"),
                error: None,
                contribution,
            },
            t0() + Duration::milliseconds(1500),
        )
    }

    #[test]
    fn finish_records_timestamps_and_duration() {
        let step = finished(StepName::LintCode, StepStatus::Warning, Some(Verdict::Warning));
        assert_eq!(step.started_at, "2025-03-01T12:00:00.000Z");
        assert_eq!(step.ended_at, "2025-03-01T12:00:01.500Z");
        assert_eq!(step.duration_secs, 1.5);
        assert_eq!(step.details.message(), "done");
    }

    #[test]
    fn pending_outcome_is_coerced_to_failure() {
        let step = finished(StepName::TypeCheck, StepStatus::Pending, Some(Verdict::Failure));
        assert_eq!(step.status, StepStatus::Failure);
        assert!(step.error.is_some());
    }

    #[test]
    fn warning_only_run_is_success_with_warnings() {
        let mut recorder = RunRecorder::start(header(), t0());
        recorder.push(finished(StepName::FormatCode, StepStatus::Success, Some(Verdict::Success)));
        recorder.push(finished(StepName::LintCode, StepStatus::Failure, Some(Verdict::Warning)));
        recorder.push(finished(StepName::ReviewCode, StepStatus::Advisory, None));
        assert!(!recorder.is_failing());
        let report = recorder.finish(t0() + Duration::seconds(3));
        assert_eq!(report.status, RunStatus::Success);
        assert!(report.has_warnings);
        assert_eq!(report.steps[1].status, StepStatus::Failure);
    }

    #[test]
    fn recorded_error_fails_the_run_and_first_error_wins() {
        let mut recorder = RunRecorder::start(header(), t0());
        recorder.fail(&GauntletError::Input("target missing".to_string()));
        recorder.fail(&GauntletError::Cancelled);
        assert!(recorder.is_failing());
        let report = recorder.finish(t0());
        assert_eq!(report.status, RunStatus::Failure);
        let error = report.error.expect("error recorded");
        assert_eq!(error.kind, ErrorKind::Input);
        assert!(error.message.contains("target missing"));
    }

    #[test]
    fn details_serialize_with_kind_tag() {
        let value = serde_json::to_value(StepDetails::Commit {
            commit_id: None,
            message: "NO_CHANGES".to_string(),
        })
        .expect("serialize");
        assert_eq!(value, serde_json::json!({"kind": "commit", "message": "NO_CHANGES"}));
    }
}
