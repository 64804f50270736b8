//! Shared deterministic types for gauntlet core logic.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ranked severity used by audit findings and thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Moderate,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "info" | "informational" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "moderate" | "medium" => Ok(Self::Moderate),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a single step.
///
/// Every step starts `Pending` and is finalized exactly once to one of the
/// terminal variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Success,
    Failure,
    Warning,
    Skipped,
    Advisory,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Warning => "WARNING",
            Self::Skipped => "SKIPPED",
            Self::Advisory => "ADVISORY",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-level status. `Running` only exists while steps execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far a run goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Run through the AI review, then stop without touching version control.
    ReviewOnly,
    /// Run every validation step but never commit.
    Apply,
    /// Run every validation step and commit when the run is still passing.
    Commit,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReviewOnly => "review-only",
            Self::Apply => "apply",
            Self::Commit => "commit",
        }
    }
}

/// Catalogue of pipeline steps, in their conventional order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    InstallDeps,
    AuditDeps,
    ApplyCode,
    FormatCode,
    LintCode,
    TypeCheck,
    ExtractSignatures,
    GenerateTests,
    SaveTests,
    ExecuteTests,
    ReviewCode,
    RunPrecommit,
    CommitChanges,
}

impl StepName {
    pub const ALL: [StepName; 13] = [
        Self::InstallDeps,
        Self::AuditDeps,
        Self::ApplyCode,
        Self::FormatCode,
        Self::LintCode,
        Self::TypeCheck,
        Self::ExtractSignatures,
        Self::GenerateTests,
        Self::SaveTests,
        Self::ExecuteTests,
        Self::ReviewCode,
        Self::RunPrecommit,
        Self::CommitChanges,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InstallDeps => "install_deps",
            Self::AuditDeps => "audit_deps",
            Self::ApplyCode => "apply_code",
            Self::FormatCode => "format_code",
            Self::LintCode => "lint_code",
            Self::TypeCheck => "type_check",
            Self::ExtractSignatures => "extract_signatures",
            Self::GenerateTests => "generate_tests",
            Self::SaveTests => "save_tests",
            Self::ExecuteTests => "execute_tests",
            Self::ReviewCode => "review_code",
            Self::RunPrecommit => "run_precommit",
            Self::CommitChanges => "commit_changes",
        }
    }
}

impl FromStr for StepName {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == raw)
            .ok_or_else(|| format!("unknown step '{raw}'"))
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_parses_aliases_and_orders_by_rank() {
        assert_eq!("MEDIUM".parse::<Severity>(), Ok(Severity::Moderate));
        assert_eq!(" critical ".parse::<Severity>(), Ok(Severity::Critical));
        assert!("urgent".parse::<Severity>().is_err());
        assert!(Severity::High > Severity::Moderate);
        assert!(Severity::Info < Severity::Low);
    }

    #[test]
    fn step_names_round_trip_through_strings() {
        for name in StepName::ALL {
            assert_eq!(name.as_str().parse::<StepName>(), Ok(name));
        }
        assert!("generate_report".parse::<StepName>().is_err());
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(StepStatus::Advisory.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
    }
}
