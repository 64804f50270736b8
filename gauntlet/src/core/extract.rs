//! Pull usable payloads out of free-form model responses.

use std::sync::LazyLock;

use jsonschema::Validator;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::findings::ReviewFinding;

/// Marker placed between fenced blocks when a response carries several.
pub const BLOCK_SEPARATOR: &str = "\n\n# --- next generated block ---\n\n";

const REVIEW_FINDING_SCHEMA: &str = include_str!("../schemas/review_finding.schema.json");
const REVIEW_FIELDS: [&str; 3] = ["severity", "description", "location"];

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```([A-Za-z0-9_.+-]*)[^\n]*\n(.*?)```").expect("fence regex is valid")
});

static REVIEW_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(REVIEW_FINDING_SCHEMA).map_err(|err| err.to_string())?;
    jsonschema::validator_for(&schema).map_err(|err| err.to_string())
});

struct FencedBlock<'a> {
    tag: &'a str,
    body: &'a str,
}

fn fenced_blocks(response: &str) -> Vec<FencedBlock<'_>> {
    FENCE_RE
        .captures_iter(response)
        .filter_map(|caps| {
            Some(FencedBlock {
                tag: caps.get(1)?.as_str(),
                body: caps.get(2)?.as_str(),
            })
        })
        .collect()
}

/// Extract code from a model response.
///
/// Blocks tagged with `hint` (case-insensitive) or left untagged are preferred.
/// One such block yields its trimmed body, several are joined in order with
/// [`BLOCK_SEPARATOR`]. Without any preferred block the first fenced block of
/// another language is used, and without any fence the whole trimmed response.
pub fn extract_code(response: &str, hint: &str) -> String {
    let blocks = fenced_blocks(response);
    let preferred: Vec<&str> = blocks
        .iter()
        .filter(|block| block.tag.is_empty() || block.tag.eq_ignore_ascii_case(hint))
        .map(|block| block.body.trim())
        .collect();

    match preferred.len() {
        0 => match blocks.first() {
            Some(block) => {
                warn!(tag = block.tag, hint, "no block matched hint, using first fenced block");
                block.body.trim().to_string()
            }
            None => {
                debug!("no fenced block in response, using full text");
                response.trim().to_string()
            }
        },
        1 => preferred[0].to_string(),
        count => {
            warn!(count, hint, "response carried several blocks, concatenating");
            preferred.join(BLOCK_SEPARATOR)
        }
    }
}

/// Parse a review response into findings.
///
/// Returns `None` when the response is not JSON or is neither a list nor a
/// finding object. Candidates failing the finding schema are dropped.
pub fn parse_review_findings(raw: &str) -> Option<Vec<ReviewFinding>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        warn!("empty review response");
        return Some(Vec::new());
    }
    let payload = match fenced_blocks(trimmed).first() {
        Some(block) if block.tag.is_empty() || block.tag.eq_ignore_ascii_case("json") => {
            block.body.trim()
        }
        _ => trimmed,
    };

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "review response is not valid json");
            return None;
        }
    };
    let validator = match REVIEW_VALIDATOR.as_ref() {
        Ok(validator) => validator,
        Err(err) => {
            warn!(error = %err, "review finding schema failed to compile");
            return None;
        }
    };

    let candidates = match value {
        Value::Array(items) => items,
        Value::Object(map) => {
            let single = Value::Object(map);
            if !validator.is_valid(&single) {
                warn!("review response object is not a finding");
                return None;
            }
            debug!("review response is a single finding, wrapping");
            vec![single]
        }
        other => {
            warn!(kind = json_kind(&other), "review response is not a finding list");
            return None;
        }
    };

    let mut findings = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !validator.is_valid(&candidate) {
            let reasons: Vec<String> = validator
                .iter_errors(&candidate)
                .map(|err| err.to_string())
                .collect();
            warn!(candidate = %candidate, reasons = %reasons.join("; "), "dropping malformed review finding");
            continue;
        }
        findings.push(ReviewFinding {
            severity: field_text(&candidate, REVIEW_FIELDS[0]),
            description: field_text(&candidate, REVIEW_FIELDS[1]),
            location: field_text(&candidate, REVIEW_FIELDS[2]),
        });
    }
    Some(findings)
}

fn field_text(candidate: &Value, key: &str) -> String {
    match candidate.get(key) {
        Some(Value::String(text)) => text.trim().to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
