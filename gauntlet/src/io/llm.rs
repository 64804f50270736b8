//! Local inference endpoint access with bounded, transport-only retries.

use std::sync::Arc;
use std::time::Duration;

use minijinja::{Environment, UndefinedBehavior, context};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::extract::{extract_code, parse_review_findings};
use crate::core::findings::ReviewFinding;
use crate::error::{GauntletError, Result};
use crate::io::config::{NetworkConfig, PromptsConfig};

/// Prompt input caps, in characters.
pub const TEST_PROMPT_CODE_CHARS: usize = 7_000;
pub const REVIEW_PROMPT_CODE_CHARS: usize = 8_000;
pub const PROMPT_SIGNATURE_CHARS: usize = 1_000;

const CODE_HINT: &str = "python";

#[derive(Debug, Error)]
pub enum InferenceError {
    /// Connection refused, reset, or timed out. Retried.
    #[error("network error: {0}")]
    Network(String),
    /// The endpoint answered but the answer is unusable. Not retried.
    #[error("api error: {0}")]
    Api(String),
}

impl InferenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    Json,
}

/// Single-shot completion against some model backend.
pub trait InferenceClient: Send + Sync {
    fn complete(&self, prompt: &str, format: ResponseFormat) -> Result<String, InferenceError>;

    fn model(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: Option<String>,
    error: Option<String>,
}

/// Ollama `/api/generate` over blocking HTTP.
#[derive(Debug)]
pub struct OllamaClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    model: String,
}

impl OllamaClient {
    pub fn new(network: &NetworkConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(network.request_timeout_secs))
            .build()
            .map_err(|err| GauntletError::Api(format!("cannot build http client: {err}")))?;
        Ok(Self {
            http,
            endpoint: format!("{}/api/generate", network.base_url.trim_end_matches('/')),
            model: network.model.clone(),
        })
    }
}

impl InferenceClient for OllamaClient {
    fn complete(&self, prompt: &str, format: ResponseFormat) -> Result<String, InferenceError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            format: match format {
                ResponseFormat::Json => Some("json"),
                ResponseFormat::Text => None,
            },
        };
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|err| InferenceError::Network(err.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .map_err(|err| InferenceError::Network(err.to_string()))?;
        let parsed: GenerateResponse = serde_json::from_str(&text).map_err(|err| {
            InferenceError::Api(format!("http {status}: unparseable body ({err})"))
        })?;
        if let Some(error) = parsed.error {
            return Err(InferenceError::Api(format!("http {status}: {error}")));
        }
        if !status.is_success() {
            return Err(InferenceError::Api(format!("http {status}")));
        }
        parsed
            .response
            .ok_or_else(|| InferenceError::Api("response field missing".to_string()))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Prompt rendering, retries, and response extraction around a client.
#[derive(Clone)]
pub struct LlmGateway {
    client: Arc<dyn InferenceClient>,
    prompts: PromptsConfig,
    retries: u32,
    retry_delay: Duration,
}

impl std::fmt::Debug for LlmGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmGateway")
            .field("model", &self.client.model())
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

impl LlmGateway {
    pub fn new(client: Arc<dyn InferenceClient>, network: &NetworkConfig, prompts: &PromptsConfig) -> Self {
        Self {
            client,
            prompts: prompts.clone(),
            retries: network.retries,
            retry_delay: Duration::from_millis(network.retry_delay_ms),
        }
    }

    /// Send `prompt`, retrying transport failures with a fixed delay.
    #[instrument(skip_all, fields(model = self.client.model(), format = ?format, prompt_chars = prompt.chars().count()))]
    pub fn complete(&self, prompt: &str, format: ResponseFormat) -> Result<String> {
        let attempts = self.retries + 1;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.client.complete(prompt, format) {
                Ok(text) => {
                    info!(attempt, "inference call succeeded");
                    return Ok(text);
                }
                Err(err) if err.is_retryable() => {
                    warn!(attempt, attempts, error = %err, "inference attempt failed");
                    last_error = err.to_string();
                    if attempt < attempts {
                        std::thread::sleep(self.retry_delay);
                    }
                }
                Err(err) => {
                    warn!(attempt, error = %err, "inference call rejected");
                    return Err(GauntletError::Api(err.to_string()));
                }
            }
        }
        Err(GauntletError::Api(format!(
            "endpoint unreachable after {attempts} attempts: {last_error}"
        )))
    }

    /// Render `template` with `substitutions`, call the model, and pull the
    /// code out of its answer.
    pub fn generate<S: Serialize>(&self, template: &str, substitutions: S) -> Result<String> {
        let prompt = render_prompt("prompt", template, substitutions)?;
        let raw = self.complete(&prompt, ResponseFormat::Text)?;
        if raw.trim().is_empty() {
            return Err(GauntletError::Api("model returned an empty response".to_string()));
        }
        Ok(extract_code(&raw, CODE_HINT))
    }

    /// Ask for pytest code covering `code`.
    pub fn generate_tests(&self, code: &str, target_file_path: &str, signatures: &str) -> Result<String> {
        let code = truncate_chars(code, TEST_PROMPT_CODE_CHARS);
        let signatures = truncate_chars(signatures, PROMPT_SIGNATURE_CHARS);
        debug!(target_file_path, "requesting generated tests");
        self.generate(
            &self.prompts.test_generation,
            context! { target_file_path, code_content => code, signatures },
        )
    }

    /// Ask for an advisory review. `Ok(None)` means the model answered with
    /// something that is not a finding list.
    pub fn review(&self, code: &str, file_name: &str) -> Result<Option<Vec<ReviewFinding>>> {
        let code = truncate_chars(code, REVIEW_PROMPT_CODE_CHARS);
        let prompt = render_prompt(
            "prompts.review",
            &self.prompts.review,
            context! { target_file_path => file_name, code_content => code, signatures => "" },
        )?;
        let raw = self.complete(&prompt, ResponseFormat::Json)?;
        Ok(parse_review_findings(&raw))
    }
}

fn render_prompt<S: Serialize>(key: &str, template: &str, substitutions: S) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.render_str(template, substitutions)
        .map_err(|err| GauntletError::config(key, format!("template does not render: {err}")))
}

/// Keep at most `limit` chars, marking the cut with `...`.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::time::Instant;

    use super::*;
    use crate::error::ErrorKind;
    use crate::test_support::ScriptedInference;

    fn gateway(client: Arc<dyn InferenceClient>, retries: u32) -> LlmGateway {
        let network = NetworkConfig {
            retries,
            retry_delay_ms: 10,
            ..NetworkConfig::default()
        };
        LlmGateway::new(client, &network, &PromptsConfig::default())
    }

    #[test]
    fn network_failures_are_retried_until_success() {
        let client = Arc::new(ScriptedInference::new(vec![
            Err(InferenceError::Network("refused".to_string())),
            Err(InferenceError::Network("refused".to_string())),
            Ok("```python\nimport pytest\n```".to_string()),
        ]));
        let code = gateway(client.clone(), 2)
            .generate_tests("def f():\n    return 1\n", "src/f.py", "def f():")
            .expect("generate");
        assert_eq!(code, "import pytest");
        assert_eq!(client.calls(), 3);
        assert!(client.prompts()[0].contains("Target File: src/f.py"));
    }

    #[test]
    fn retry_budget_exhaustion_is_an_api_error() {
        let client = Arc::new(ScriptedInference::new(vec![
            Err(InferenceError::Network("refused".to_string())),
            Err(InferenceError::Network("refused".to_string())),
        ]));
        let err = gateway(client.clone(), 1)
            .complete("hi", ResponseFormat::Text)
            .expect_err("exhausted");
        assert_eq!(err.kind(), ErrorKind::Api);
        assert!(err.to_string().contains("after 2 attempts"), "{err}");
        assert_eq!(client.calls(), 2);
    }

    #[test]
    fn api_errors_are_not_retried() {
        let client = Arc::new(ScriptedInference::new(vec![
            Err(InferenceError::Api("model not found".to_string())),
            Ok("unused".to_string()),
        ]));
        let err = gateway(client.clone(), 3)
            .complete("hi", ResponseFormat::Text)
            .expect_err("api error");
        assert!(err.to_string().contains("model not found"));
        assert_eq!(client.calls(), 1);
    }

    #[test]
    fn review_parses_findings_and_requests_json() {
        let client = Arc::new(ScriptedInference::new(vec![Ok(
            r#"[{"severity":"low","description":"naming","location":"f"}]"#.to_string(),
        )]));
        let findings = gateway(client.clone(), 0)
            .review("def f(): pass", "f.py")
            .expect("review")
            .expect("findings");
        assert_eq!(findings.len(), 1);
        assert_eq!(client.formats(), vec![ResponseFormat::Json]);
    }

    #[test]
    fn prompt_inputs_are_truncated() {
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
        assert_eq!(truncate_chars("abc", 3), "abc");
        assert_eq!(truncate_chars("ééé", 2), "éé...");
    }

    #[test]
    fn unreachable_endpoint_is_a_network_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let network = NetworkConfig {
            base_url: format!("http://127.0.0.1:{port}"),
            request_timeout_secs: 2,
            ..NetworkConfig::default()
        };
        let client = OllamaClient::new(&network).expect("client");
        let started = Instant::now();
        let err = client
            .complete("hi", ResponseFormat::Text)
            .expect_err("refused");
        assert!(err.is_retryable(), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
