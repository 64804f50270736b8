//! Gauntlet configuration resolved from `.gauntlet.toml` files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use minijinja::{Environment, UndefinedBehavior, context};
use serde::{Deserialize, Serialize};
use toml::{Table, Value};
use tracing::{debug, info, instrument};

use crate::core::types::StepName;
use crate::core::verdict::Thresholds;
use crate::error::{GauntletError, Result};

/// Conventional config file name looked up in the target and working dirs.
pub const CONFIG_FILE_NAME: &str = ".gauntlet.toml";

const MAX_RETRIES: u32 = 10;
/// Port the Ollama server listens on unless told otherwise.
const OLLAMA_DEFAULT_PORT: u16 = 11434;

const DEFAULT_TEST_PROMPT: &str = "\
You are an expert Python test generation assistant. Generate concise and effective pytest unit tests for the provided code. \
Focus on the public API described by the function and class signatures. \
The code lives in the module matching the target file (for `src/main.py`, import from `src.main`), \
and the tests MUST import what they exercise from that module. \
Begin with `import pytest` and answer with ONLY Python code inside a single ```python block.

Target File: {{ target_file_path }}
Code (may be truncated):
```python
{{ code_content }}
```
Key Signatures:
{{ signatures }}

Generated pytest code:";

const DEFAULT_REVIEW_PROMPT: &str = "\
You are an expert Python code reviewer. Review the following code for bugs, style issues, security problems and maintainability. \
Answer with a JSON list of objects. Each object MUST have `severity` (one of critical, high, moderate, low, info), \
`description` (a clear explanation) and `location` (function, class, line, or `general`). \
Return ONLY the raw JSON list without surrounding prose or markdown.

Target File: {{ target_file_path }}
Code:
```python
{{ code_content }}
```

Review findings (raw JSON list):";

const DEFAULT_COMMIT_MESSAGE: &str = "feat(gauntlet): apply validated changes to {{ target_file }}";

/// Fully resolved, validated configuration. Every key has a value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub thresholds: Thresholds,
    pub network: NetworkConfig,
    pub tools: ToolsConfig,
    /// Explicit executable overrides, `name = "/path/to/bin"`.
    pub tool_paths: BTreeMap<String, PathBuf>,
    pub prompts: PromptsConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Base URL of the Ollama-compatible inference endpoint.
    pub base_url: String,
    pub model: String,
    pub request_timeout_secs: u64,
    /// Extra attempts after the first one, for transport failures only.
    pub retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "gemma:2b".to_string(),
            request_timeout_secs: 180,
            retries: 2,
            retry_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    pub default_timeout_secs: u64,
    /// Bytes of stdout/stderr kept in memory per invocation.
    pub output_limit_bytes: usize,
    /// Bytes of stdout/stderr written to the invocation log and reports.
    pub log_output_limit_bytes: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 180,
            output_limit_bytes: 100_000,
            log_output_limit_bytes: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PromptsConfig {
    pub test_generation: String,
    pub review: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            test_generation: DEFAULT_TEST_PROMPT.to_string(),
            review: DEFAULT_REVIEW_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub steps: Vec<StepName>,
    /// Target directories must live under one of these; empty allows any.
    pub allowed_target_bases: Vec<PathBuf>,
    pub commit_message: String,
    /// Where generated tests are written, relative to the target dir.
    pub generated_test_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            steps: StepName::ALL.to_vec(),
            allowed_target_bases: Vec::new(),
            commit_message: DEFAULT_COMMIT_MESSAGE.to_string(),
            generated_test_dir: PathBuf::from("tests/gauntlet_generated"),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let net = &self.network;
        let url = reqwest::Url::parse(&net.base_url)
            .map_err(|err| GauntletError::config("network.base_url", format!("invalid url: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GauntletError::config(
                "network.base_url",
                "expected an http or https url",
            ));
        }
        if net.model.trim().is_empty() {
            return Err(GauntletError::config("network.model", "must be non-empty"));
        }
        if net.request_timeout_secs == 0 {
            return Err(GauntletError::config("network.request_timeout_secs", "must be > 0"));
        }
        if net.retries > MAX_RETRIES {
            return Err(GauntletError::config(
                "network.retries",
                format!("must be <= {MAX_RETRIES}"),
            ));
        }
        if self.tools.default_timeout_secs == 0 {
            return Err(GauntletError::config("tools.default_timeout_secs", "must be > 0"));
        }
        if self.tools.output_limit_bytes == 0 {
            return Err(GauntletError::config("tools.output_limit_bytes", "must be > 0"));
        }
        if self.tools.log_output_limit_bytes == 0 {
            return Err(GauntletError::config("tools.log_output_limit_bytes", "must be > 0"));
        }
        for (name, path) in &self.tool_paths {
            if path.as_os_str().is_empty() {
                return Err(GauntletError::config(
                    format!("tool_paths.{name}"),
                    "must be a non-empty path",
                ));
            }
        }
        if self.pipeline.steps.is_empty() {
            return Err(GauntletError::config("pipeline.steps", "must list at least one step"));
        }
        for (idx, step) in self.pipeline.steps.iter().enumerate() {
            if self.pipeline.steps[..idx].contains(step) {
                return Err(GauntletError::config(
                    "pipeline.steps",
                    format!("step '{step}' is listed twice"),
                ));
            }
        }
        let generated = &self.pipeline.generated_test_dir;
        if generated.as_os_str().is_empty()
            || generated.is_absolute()
            || generated
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(GauntletError::config(
                "pipeline.generated_test_dir",
                "must be a relative path inside the target",
            ));
        }
        self.check_templates()
    }

    fn check_templates(&self) -> Result<()> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        let prompt_ctx = context! {
            target_file_path => "src/example.py",
            code_content => "def example():\n    return 1\n",
            signatures => "def example():",
        };
        for (key, template) in [
            ("prompts.test_generation", &self.prompts.test_generation),
            ("prompts.review", &self.prompts.review),
        ] {
            env.render_str(template, &prompt_ctx)
                .map_err(|err| GauntletError::config(key, format!("template does not render: {err}")))?;
        }
        env.render_str(
            &self.pipeline.commit_message,
            context! { target_file => "example.py" },
        )
        .map_err(|err| {
            GauntletError::config(
                "pipeline.commit_message",
                format!("template does not render: {err}"),
            )
        })?;
        Ok(())
    }

    /// Apply CLI overrides on top of the resolved `[network]` section.
    pub fn apply_network_overrides(
        &mut self,
        base_url: Option<String>,
        model: Option<String>,
    ) -> Result<()> {
        if let Some(base_url) = base_url {
            self.network.base_url = normalize_base_url(&base_url);
        }
        if let Some(model) = model {
            self.network.model = model;
        }
        self.validate()
    }
}

/// Accept the `OLLAMA_HOST` forms the Ollama server accepts: a bare
/// `host[:port]` gets `http://` and, without a port, the default port.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        return trimmed.to_string();
    }
    let has_port = trimmed
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    if has_port {
        format!("http://{trimmed}")
    } else {
        debug!(raw, "bare host given, assuming default port");
        format!("http://{trimmed}:{OLLAMA_DEFAULT_PORT}")
    }
}

/// Where the resolved config came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Override(PathBuf),
    Target(PathBuf),
    WorkingDir(PathBuf),
    Defaults,
}

impl ConfigSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Override(path) | Self::Target(path) | Self::WorkingDir(path) => Some(path),
            Self::Defaults => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: Config,
    pub source: ConfigSource,
}

/// Pick the config file: override > target dir > working dir > defaults.
///
/// A missing override path is an error rather than a silent fallback.
pub fn locate_config(
    override_path: Option<&Path>,
    target_dir: &Path,
    cwd: &Path,
) -> Result<ConfigSource> {
    if let Some(path) = override_path {
        if !path.is_file() {
            return Err(GauntletError::config(
                "--config",
                format!("config file {} does not exist", path.display()),
            ));
        }
        return Ok(ConfigSource::Override(path.to_path_buf()));
    }
    let in_target = target_dir.join(CONFIG_FILE_NAME);
    if in_target.is_file() {
        return Ok(ConfigSource::Target(in_target));
    }
    let in_cwd = cwd.join(CONFIG_FILE_NAME);
    if in_cwd.is_file() {
        return Ok(ConfigSource::WorkingDir(in_cwd));
    }
    Ok(ConfigSource::Defaults)
}

/// Resolve against the process working directory.
pub fn resolve_config(override_path: Option<&Path>, target_dir: &Path) -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().map_err(|err| GauntletError::fs(".", err))?;
    resolve_config_in(override_path, target_dir, &cwd)
}

#[instrument(skip_all, fields(target_dir = %target_dir.display()))]
pub fn resolve_config_in(
    override_path: Option<&Path>,
    target_dir: &Path,
    cwd: &Path,
) -> Result<ResolvedConfig> {
    let source = locate_config(override_path, target_dir, cwd)?;
    let config = match source.path() {
        Some(path) => {
            let contents =
                fs::read_to_string(path).map_err(|err| GauntletError::fs(path, err))?;
            parse_config(&contents)?
        }
        None => {
            let config = Config::default();
            config.validate()?;
            config
        }
    };
    info!(source = ?source, "configuration resolved");
    Ok(ResolvedConfig { config, source })
}

/// Merge a TOML document over the defaults and validate the result.
pub fn parse_config(contents: &str) -> Result<Config> {
    let overlay: Table = toml::from_str(contents)
        .map_err(|err| GauntletError::config("<file>", format!("invalid toml: {err}")))?;
    let mut merged = default_table()?;
    check_against_schema(&overlay, &merged, "")?;
    deep_merge(&mut merged, overlay);
    debug!("config merged over defaults");

    let config: Config = Value::Table(merged)
        .try_into()
        .map_err(|err| GauntletError::config("<file>", err.to_string()))?;
    config.validate()?;
    Ok(config)
}

fn default_table() -> Result<Table> {
    match Value::try_from(Config::default()) {
        Ok(Value::Table(table)) => Ok(table),
        Ok(_) => Err(GauntletError::config("<defaults>", "defaults are not a table")),
        Err(err) => Err(GauntletError::config("<defaults>", err.to_string())),
    }
}

/// Tables whose keys are user-chosen; only value types are checked.
const FREE_FORM_TABLES: [&str; 1] = ["tool_paths"];

fn check_against_schema(overlay: &Table, schema: &Table, prefix: &str) -> Result<()> {
    for (key, value) in overlay {
        let dotted = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        if FREE_FORM_TABLES.contains(&dotted.as_str()) {
            let Value::Table(entries) = value else {
                return Err(type_mismatch(&dotted, "table", value));
            };
            for (name, entry) in entries {
                if !entry.is_str() {
                    return Err(type_mismatch(&format!("{dotted}.{name}"), "string", entry));
                }
            }
            continue;
        }
        let Some(expected) = schema.get(key) else {
            return Err(GauntletError::config(dotted, "unknown key"));
        };
        match (expected, value) {
            (Value::Table(expected), Value::Table(actual)) => {
                check_against_schema(actual, expected, &dotted)?;
            }
            (Value::Array(expected), Value::Array(actual)) => {
                let element_type = expected.first().map_or("string", Value::type_str);
                if let Some(bad) = actual.iter().find(|item| item.type_str() != element_type) {
                    return Err(type_mismatch(
                        &dotted,
                        &format!("array of {element_type}"),
                        bad,
                    ));
                }
            }
            (expected, actual) if expected.type_str() != actual.type_str() => {
                return Err(type_mismatch(&dotted, expected.type_str(), actual));
            }
            _ => {}
        }
    }
    Ok(())
}

fn type_mismatch(key: &str, expected: &str, actual: &Value) -> GauntletError {
    GauntletError::config(
        key,
        format!("expected {expected}, found {}", actual.type_str()),
    )
}

/// Overlay wins per key; nested tables merge recursively.
fn deep_merge(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(base_table)), Value::Table(overlay_table)) => {
                deep_merge(base_table, overlay_table);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Every dotted leaf key of a table, for totality checks.
pub fn leaf_keys(table: &Table) -> Vec<String> {
    fn walk(table: &Table, prefix: &str, out: &mut Vec<String>) {
        for (key, value) in table {
            let dotted = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            match value {
                Value::Table(inner) if !FREE_FORM_TABLES.contains(&dotted.as_str()) => {
                    walk(inner, &dotted, out)
                }
                _ => out.push(dotted),
            }
        }
    }
    let mut out = Vec::new();
    walk(table, "", &mut out);
    out
}

/// Serialize a config back into a table (for reports and totality checks).
pub fn config_table(config: &Config) -> Result<Table> {
    match Value::try_from(config) {
        Ok(Value::Table(table)) => Ok(table),
        Ok(_) => Err(GauntletError::config("<config>", "config is not a table")),
        Err(err) => Err(GauntletError::config("<config>", err.to_string())),
    }
}
