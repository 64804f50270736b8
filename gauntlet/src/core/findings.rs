//! Parsers for the structured output of audit, lint, and test tools.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::Severity;

/// Severity assigned to scanner findings that carry no rating.
pub const UNRATED_SEVERITY: Severity = Severity::High;

/// Rule-code prefixes ruff treats as hard errors (syntax errors, invalid
/// comparisons, misplaced statements, undefined names).
const CRITICAL_LINT_PREFIXES: [&str; 4] = ["E9", "F63", "F7", "F82"];

/// One known vulnerability in a declared dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFinding {
    pub identifier: String,
    pub severity: Severity,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

/// Parse dependency-scanner JSON.
///
/// Accepts pip-audit's `{"dependencies": [{"name", "vulns": [...]}]}`, its
/// older bare-array form, and a flat `{"vulnerabilities": [...]}` list.
pub fn parse_audit_findings(raw: &str) -> Result<Vec<AuditFinding>, String> {
    let value: Value =
        serde_json::from_str(raw.trim()).map_err(|err| format!("invalid audit json: {err}"))?;
    let mut findings = Vec::new();

    let dependencies = match &value {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get("dependencies").and_then(Value::as_array),
        _ => None,
    };
    if let Some(dependencies) = dependencies {
        for dependency in dependencies {
            let package = dependency
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string);
            let vulns = dependency
                .get("vulns")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for vuln in vulns {
                findings.push(audit_finding(vuln, package.clone()));
            }
        }
    }

    if let Some(flat) = value.get("vulnerabilities").and_then(Value::as_array) {
        for vuln in flat {
            let package = vuln
                .get("package")
                .or_else(|| vuln.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string);
            findings.push(audit_finding(vuln, package));
        }
    }

    if dependencies.is_none() && !value.get("vulnerabilities").is_some_and(Value::is_array) {
        return Err("audit json has neither 'dependencies' nor 'vulnerabilities'".to_string());
    }
    Ok(findings)
}

fn audit_finding(vuln: &Value, package: Option<String>) -> AuditFinding {
    let identifier = vuln
        .get("id")
        .or_else(|| vuln.get("identifier"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let severity = vuln
        .get("severity")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(UNRATED_SEVERITY);
    let description = vuln
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    AuditFinding {
        identifier,
        severity,
        description,
        package,
    }
}

/// One remaining lint violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintFinding {
    /// Rule code; `None` for syntax errors reported without a rule.
    pub code: Option<String>,
    pub message: String,
    pub line: Option<u64>,
    pub critical: bool,
}

#[derive(Debug, Deserialize)]
struct RuffDiagnostic {
    code: Option<String>,
    message: String,
    location: Option<RuffLocation>,
}

#[derive(Debug, Deserialize)]
struct RuffLocation {
    row: u64,
}

/// Parse `ruff check --output-format json` output.
pub fn parse_lint_findings(raw: &str) -> Result<Vec<LintFinding>, String> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let diagnostics: Vec<RuffDiagnostic> =
        serde_json::from_str(raw.trim()).map_err(|err| format!("invalid lint json: {err}"))?;
    Ok(diagnostics
        .into_iter()
        .map(|diag| LintFinding {
            critical: is_critical_rule(diag.code.as_deref()),
            code: diag.code,
            message: diag.message,
            line: diag.location.map(|loc| loc.row),
        })
        .collect())
}

fn is_critical_rule(code: Option<&str>) -> bool {
    match code {
        None => true,
        Some(code) => CRITICAL_LINT_PREFIXES
            .iter()
            .any(|prefix| code.starts_with(prefix)),
    }
}

/// Counts parsed from pytest's final summary line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub exit_code: i32,
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub skipped: u32,
}

static PYTEST_COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) (passed|failed|errors?|skipped)").expect("pytest count regex is valid")
});

/// Parse the last `===== N passed, M failed in 0.12s =====` line.
pub fn parse_test_summary(stdout: &str, exit_code: i32) -> TestSummary {
    let mut summary = TestSummary {
        exit_code,
        ..TestSummary::default()
    };
    let Some(line) = stdout
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with('=') && line.contains(" in "))
    else {
        return summary;
    };
    for caps in PYTEST_COUNT_RE.captures_iter(line) {
        let count: u32 = caps[1].parse().unwrap_or(0);
        match &caps[2] {
            "passed" => summary.passed = count,
            "failed" => summary.failed = count,
            "skipped" => summary.skipped = count,
            _ => summary.errors = count,
        }
    }
    summary
}

/// One advisory observation from the AI review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub severity: String,
    pub description: String,
    pub location: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pip_audit_dependencies_shape() {
        let raw = r#"{"dependencies":[
            {"name":"jinja2","version":"2.4.1","vulns":[
                {"id":"PYSEC-2021-66","fix_versions":["2.11.3"],"description":"ReDoS"}]},
            {"name":"six","version":"1.16.0","vulns":[]}
        ],"fixes":[]}"#;
        let findings = parse_audit_findings(raw).expect("parse");
        assert_eq!(
            findings,
            vec![AuditFinding {
                identifier: "PYSEC-2021-66".to_string(),
                severity: UNRATED_SEVERITY,
                description: "ReDoS".to_string(),
                package: Some("jinja2".to_string()),
            }]
        );
    }

    #[test]
    fn parses_flat_vulnerability_list_with_severity() {
        let raw = r#"{"vulnerabilities":[{"id":"CVE-1","severity":"medium","description":"x","package":"requests"}]}"#;
        let findings = parse_audit_findings(raw).expect("parse");
        assert_eq!(findings[0].severity, Severity::Moderate);
        assert_eq!(findings[0].package.as_deref(), Some("requests"));
    }

    #[test]
    fn rejects_unrecognized_audit_shape() {
        assert!(parse_audit_findings("{\"ok\":true}").is_err());
        assert!(parse_audit_findings("not json").is_err());
    }

    #[test]
    fn classifies_lint_codes_by_criticality() {
        let raw = r#"[
            {"code":"E501","message":"Line too long","location":{"row":3,"column":89}},
            {"code":"F821","message":"Undefined name `x`","location":{"row":7,"column":5}},
            {"code":null,"message":"SyntaxError: invalid syntax","location":{"row":9,"column":1}}
        ]"#;
        let findings = parse_lint_findings(raw).expect("parse");
        let critical: Vec<bool> = findings.iter().map(|f| f.critical).collect();
        assert_eq!(critical, vec![false, true, true]);
        assert_eq!(findings[0].line, Some(3));
    }

    #[test]
    fn empty_lint_output_has_no_findings() {
        assert!(parse_lint_findings("  \n").expect("parse").is_empty());
    }

    #[test]
    fn parses_pytest_summary_line() {
        let stdout = "collected 4 items\n\ntest_a.py ..F.\n\n===== 3 passed, 1 failed, 2 errors in 0.12s =====\n";
        let summary = parse_test_summary(stdout, 1);
        assert_eq!(
            summary,
            TestSummary {
                exit_code: 1,
                passed: 3,
                failed: 1,
                errors: 2,
                skipped: 0,
            }
        );
    }

    #[test]
    fn missing_pytest_summary_yields_zero_counts() {
        let summary = parse_test_summary("no tests ran", 5);
        assert_eq!(summary.passed, 0);
        assert_eq!(summary.exit_code, 5);
    }
}
