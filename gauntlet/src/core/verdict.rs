//! Run-level verdict policy.
//!
//! A step's recorded status is its true outcome. Whether a FAILURE escalates
//! the run is decided here, per step gate, from the configured thresholds.
//! Toggling a threshold therefore changes only aggregation, never the status
//! stored on the step.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::types::{RunStatus, Severity, StepStatus};

/// Cutoff for dependency-audit findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AuditThreshold {
    /// Audit findings never fail the step.
    Never,
    /// Findings at or above this severity fail the step.
    AtLeast(Severity),
}

impl AuditThreshold {
    /// True if a finding of `severity` reaches the cutoff.
    pub fn is_reached_by(self, severity: Severity) -> bool {
        match self {
            Self::Never => false,
            Self::AtLeast(cutoff) => severity >= cutoff,
        }
    }
}

impl FromStr for AuditThreshold {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.trim().eq_ignore_ascii_case("none") {
            return Ok(Self::Never);
        }
        raw.parse::<Severity>()
            .map(Self::AtLeast)
            .map_err(|_| format!("expected one of none|info|low|moderate|high|critical, got '{raw}'"))
    }
}

impl TryFrom<String> for AuditThreshold {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<AuditThreshold> for String {
    fn from(value: AuditThreshold) -> Self {
        value.to_string()
    }
}

impl fmt::Display for AuditThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("none"),
            Self::AtLeast(severity) => f.write_str(severity.as_str()),
        }
    }
}

/// Fail thresholds, one per gated step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Thresholds {
    pub fail_on_audit_severity: AuditThreshold,
    pub fail_on_lint_critical: bool,
    pub fail_on_type_error: bool,
    pub fail_on_test_failure: bool,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            fail_on_audit_severity: AuditThreshold::AtLeast(Severity::High),
            fail_on_lint_critical: true,
            fail_on_type_error: true,
            fail_on_test_failure: true,
        }
    }
}

/// Which threshold, if any, governs a step's contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// FAILURE always escalates the run.
    Always,
    Audit,
    Lint,
    TypeCheck,
    Tests,
    /// Never affects the run (AI review).
    Advisory,
}

/// A step's policy-adjusted contribution to the run verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Success,
    Warning,
    Failure,
}

impl Thresholds {
    fn escalates(&self, gate: Gate) -> bool {
        match gate {
            Gate::Always => true,
            Gate::Audit => self.fail_on_audit_severity != AuditThreshold::Never,
            Gate::Lint => self.fail_on_lint_critical,
            Gate::TypeCheck => self.fail_on_type_error,
            Gate::Tests => self.fail_on_test_failure,
            Gate::Advisory => false,
        }
    }
}

/// Contribution of one finalized step. `None` means the step is ignored by
/// aggregation (advisory).
pub fn contribution(status: StepStatus, gate: Gate, thresholds: &Thresholds) -> Option<Verdict> {
    if gate == Gate::Advisory || status == StepStatus::Advisory {
        return None;
    }
    let verdict = match status {
        StepStatus::Success | StepStatus::Skipped => Verdict::Success,
        StepStatus::Warning => Verdict::Warning,
        StepStatus::Failure if thresholds.escalates(gate) => Verdict::Failure,
        StepStatus::Failure => Verdict::Warning,
        // An unfinished step never counts as passing.
        StepStatus::Pending => Verdict::Failure,
        StepStatus::Advisory => return None,
    };
    Some(verdict)
}

/// Worst contribution wins; no contributions at all is a success.
pub fn aggregate<I>(contributions: I) -> Verdict
where
    I: IntoIterator<Item = Option<Verdict>>,
{
    contributions
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(Verdict::Success)
}

/// Collapse an aggregate verdict into the binary run status.
pub fn run_status(verdict: Verdict, aborted: bool) -> RunStatus {
    if aborted || verdict == Verdict::Failure {
        RunStatus::Failure
    } else {
        RunStatus::Success
    }
}
