//! Report rendering (JSON or text) and persistence.

use std::fmt::{Debug, Write as _};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::core::report::RunReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Json,
    Text,
}

pub fn render(report: &RunReport, format: ReportFormat) -> String {
    match format {
        ReportFormat::Json => render_json(report),
        ReportFormat::Text => render_text(report),
    }
}

/// Serialize `value`, falling back to its `Debug` rendering as a JSON string.
pub fn json_or_debug<T: Serialize + Debug>(value: &T) -> Value {
    match serde_json::to_value(value) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "value not serializable, using debug rendering");
            Value::String(format!("{value:?}"))
        }
    }
}

/// Pretty JSON. Each field and step is serialized on its own so one bad value
/// cannot take down the whole report.
pub fn render_json(report: &RunReport) -> String {
    let mut map = Map::new();
    let mut put = |key: &str, value: Value| {
        map.insert(key.to_string(), value);
    };
    put("gauntlet_version", json_or_debug(&report.gauntlet_version));
    put("run_id", json_or_debug(&report.run_id));
    put("started_at", json_or_debug(&report.started_at));
    put("ended_at", json_or_debug(&report.ended_at));
    put("duration_secs", json_or_debug(&report.duration_secs));
    put("status", json_or_debug(&report.status));
    put("has_warnings", json_or_debug(&report.has_warnings));
    put("mode", json_or_debug(&report.mode));
    put("target_dir", json_or_debug(&report.target_dir));
    put("target_file", json_or_debug(&report.target_file));
    put("artifact_sha256", json_or_debug(&report.artifact_sha256));
    put(
        "steps",
        Value::Array(report.steps.iter().map(json_or_debug).collect()),
    );
    put("audit_findings", json_or_debug(&report.audit_findings));
    put("review_findings", json_or_debug(&report.review_findings));
    put("test_summary", json_or_debug(&report.test_summary));
    put("commit_id", json_or_debug(&report.commit_id));
    put("error", json_or_debug(&report.error));
    let value = Value::Object(map);
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
}

pub fn render_text(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "gauntlet {} run {}", report.gauntlet_version, report.run_id);
    let _ = writeln!(
        out,
        "status: {}{}",
        report.status,
        if report.has_warnings { " (with warnings)" } else { "" }
    );
    let _ = writeln!(out, "target: {} -> {}", report.target_dir, report.target_file);
    let _ = writeln!(out, "mode: {}", report.mode.as_str());
    let _ = writeln!(
        out,
        "time: {} .. {} ({:.3}s)",
        report.started_at, report.ended_at, report.duration_secs
    );
    if let Some(digest) = &report.artifact_sha256 {
        let _ = writeln!(out, "artifact sha256: {digest}");
    }

    let _ = writeln!(out, "\nsteps:");
    if report.steps.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for step in &report.steps {
        let _ = write!(
            out,
            "  [{}] {} ({:.3}s) - {}",
            step.status,
            step.name,
            step.duration_secs,
            one_line(step.details.message())
        );
        if let Some(error) = &step.error {
            let _ = write!(out, " | error: {}", one_line(error));
        }
        out.push('\n');
    }

    if let Some(findings) = &report.audit_findings {
        let _ = writeln!(out, "\naudit findings ({}):", findings.len());
        for finding in findings {
            let _ = writeln!(
                out,
                "  - [{}] {}{}: {}",
                finding.severity,
                finding.identifier,
                finding
                    .package
                    .as_deref()
                    .map(|pkg| format!(" ({pkg})"))
                    .unwrap_or_default(),
                one_line(&finding.description)
            );
        }
    }
    if let Some(findings) = &report.review_findings {
        let _ = writeln!(out, "\nreview findings ({}, advisory):", findings.len());
        for finding in findings {
            let _ = writeln!(
                out,
                "  - [{}] {}: {}",
                finding.severity,
                finding.location,
                one_line(&finding.description)
            );
        }
    }
    if let Some(summary) = &report.test_summary {
        let _ = writeln!(
            out,
            "\ntests: {} passed, {} failed, {} errors, {} skipped (exit {})",
            summary.passed, summary.failed, summary.errors, summary.skipped, summary.exit_code
        );
    }
    if let Some(commit_id) = &report.commit_id {
        let _ = writeln!(out, "\ncommit: {commit_id}");
    }
    if let Some(error) = &report.error {
        let _ = writeln!(out, "\nerror ({}): {}", error_kind(error.kind), error.message);
    }
    out
}

fn error_kind(kind: crate::error::ErrorKind) -> String {
    match json_or_debug(&kind) {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

fn one_line(text: &str) -> String {
    let first = text.lines().next().unwrap_or_default();
    if text.lines().nth(1).is_some() {
        format!("{first} ...")
    } else {
        first.to_string()
    }
}

/// Write the rendered report to `path`, creating parent directories.
pub fn write_report(path: &Path, rendered: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create report dir {}", parent.display()))?;
    }
    fs::write(path, rendered).with_context(|| format!("write report {}", path.display()))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::core::findings::ReviewFinding;
    use crate::core::report::{PendingStep, RunHeader, RunRecorder, StepDetails, StepOutcome};
    use crate::core::types::{Mode, StepName, StepStatus};
    use crate::core::verdict::Verdict;
    use crate::error::GauntletError;

    fn sample_report(fail: bool) -> RunReport {
        let t0 = Utc
            .with_ymd_and_hms(2025, 3, 1, 12, 0, 0)
            .single()
            .expect("timestamp");
        let mut recorder = RunRecorder::start(
            RunHeader {
                run_id: "gauntlet_20250301_120000_abc123".to_string(),
                mode: Mode::Commit,
                target_dir: "/srv/project".to_string(),
                target_file: "src/app.py".to_string(),
            },
            t0,
        );
        recorder.push(PendingStep::begin(StepName::LintCode, t0).finish(
            StepOutcome {
                status: StepStatus::Warning,
                details: StepDetails::note("2 style findings\nsecond line"),
                error: None,
                contribution: Some(Verdict::Warning),
            },
            t0,
        ));
        recorder.set_review_findings(vec![ReviewFinding {
            severity: "low".to_string(),
            description: "rename x".to_string(),
            location: "f".to_string(),
        }]);
        if fail {
            recorder.fail(&GauntletError::Api("unreachable".to_string()));
        }
        recorder.finish(t0)
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("refusing"))
        }
    }

    impl Debug for Unserializable {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("Unserializable(opaque)")
        }
    }

    #[test]
    fn unserializable_values_fall_back_to_debug_text() {
        assert_eq!(
            json_or_debug(&Unserializable),
            Value::String("Unserializable(opaque)".to_string())
        );
    }

    #[test]
    fn json_report_uses_snake_case_and_tagged_details() {
        let rendered = render_json(&sample_report(false));
        let value: Value = serde_json::from_str(&rendered).expect("valid json");
        assert_eq!(value["status"], "SUCCESS");
        assert_eq!(value["has_warnings"], true);
        assert_eq!(value["mode"], "commit");
        assert_eq!(value["steps"][0]["name"], "lint_code");
        assert_eq!(value["steps"][0]["details"]["kind"], "note");
        assert_eq!(value["error"], Value::Null);
    }

    #[test]
    fn text_report_lists_steps_and_error() {
        let rendered = render_text(&sample_report(true));
        assert!(rendered.contains("status: FAILURE (with warnings)"), "{rendered}");
        assert!(rendered.contains("[WARNING] lint_code (0.000s) - 2 style findings ..."));
        assert!(rendered.contains("review findings (1, advisory)"));
        assert!(rendered.contains("error (api): inference api error: unreachable"));
    }

    #[test]
    fn write_report_creates_parent_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out/report.json");
        write_report(&path, "{}").expect("write");
        assert_eq!(fs::read_to_string(path).expect("read"), "{}");
    }
}
