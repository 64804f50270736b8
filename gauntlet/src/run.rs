//! One gauntlet run end to end: pre-run phases, pipeline, report.

use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use sha2::{Digest, Sha256};
use tracing::{info, info_span, instrument, warn};

use crate::core::report::{RunHeader, RunRecorder, RunReport};
use crate::core::types::{Mode, RunStatus, StepName};
use crate::error::{GauntletError, Result};
use crate::exit_codes;
use crate::io::config::{Config, resolve_config, resolve_config_in};
use crate::io::environment::EnvironmentManager;
use crate::io::git::Git;
use crate::io::invocation_log::InvocationLog;
use crate::io::llm::{InferenceClient, LlmGateway, OllamaClient};
use crate::io::lock::RunLock;
use crate::io::tools::ToolInvoker;
use crate::pipeline::{CancelToken, StepContext, build_steps, execute};

/// What to validate and where.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub target_dir: PathBuf,
    pub source: PathBuf,
    /// Destination relative to `target_dir`.
    pub dest: PathBuf,
    pub mode: Mode,
    pub config_path: Option<PathBuf>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

/// Seams for embedding and tests.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Replaces `PATH` for tool resolution.
    pub search_path: Option<OsString>,
    /// Replaces the HTTP inference client.
    pub inference: Option<Arc<dyn InferenceClient>>,
    /// Directory searched for a fallback config file; defaults to the cwd.
    pub config_cwd: Option<PathBuf>,
    pub cancel: CancelToken,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    /// True when the run stopped before its first step.
    pub aborted: bool,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.aborted {
            exit_codes::ABORTED
        } else if self.report.status == RunStatus::Success {
            exit_codes::OK
        } else {
            exit_codes::FAILED
        }
    }
}

/// `gauntlet_<UTC yyyymmdd_HHMMSS>_<6 lowercase alphanumerics>`.
pub fn new_run_id(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("gauntlet_{}_{suffix}", now.format("%Y%m%d_%H%M%S"))
}

/// Paths after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedInputs {
    pub target_dir: PathBuf,
    pub source: PathBuf,
    pub dest: PathBuf,
}

/// Check paths before anything touches the target.
pub fn validate_inputs(
    target_dir: &Path,
    source: &Path,
    dest: &Path,
    allowed_bases: &[PathBuf],
) -> Result<ValidatedInputs> {
    if !target_dir.is_dir() {
        return Err(GauntletError::Input(format!(
            "target {} is not an existing directory",
            target_dir.display()
        )));
    }
    let target_dir = target_dir
        .canonicalize()
        .map_err(|err| GauntletError::fs(target_dir, err))?;

    if !allowed_bases.is_empty() {
        let allowed = allowed_bases.iter().any(|base| {
            base.canonicalize()
                .map(|base| target_dir.starts_with(base))
                .unwrap_or(false)
        });
        if !allowed {
            return Err(GauntletError::Input(format!(
                "target {} is outside pipeline.allowed_target_bases",
                target_dir.display()
            )));
        }
    }

    if !source.is_file() {
        return Err(GauntletError::Input(format!(
            "source {} is not an existing file",
            source.display()
        )));
    }
    let source = source
        .canonicalize()
        .map_err(|err| GauntletError::fs(source, err))?;

    let mut normalized = PathBuf::new();
    for component in dest.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(GauntletError::Input(format!(
                    "destination {} must be relative without '..'",
                    dest.display()
                )));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(GauntletError::Input("destination is empty".to_string()));
    }

    // Symlinked parents could still point outside the target.
    let joined = target_dir.join(&normalized);
    if let Some(parent) = joined.parent().filter(|p| p.exists()) {
        let parent = parent
            .canonicalize()
            .map_err(|err| GauntletError::fs(parent, err))?;
        if !parent.starts_with(&target_dir) {
            return Err(GauntletError::Input(format!(
                "destination {} resolves outside the target",
                dest.display()
            )));
        }
    }

    Ok(ValidatedInputs {
        target_dir,
        source,
        dest: normalized,
    })
}

/// Hex SHA-256 of a file.
pub fn file_sha256(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|err| GauntletError::fs(path, err))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

struct Prepared {
    config: Config,
    inputs: ValidatedInputs,
    invoker: ToolInvoker,
    environment: EnvironmentManager,
    runtime: crate::io::environment::RuntimeHandle,
    llm: LlmGateway,
    git: Git,
    _lock: RunLock,
}

fn prepare(request: &RunRequest, options: &RunOptions, recorder: &mut RunRecorder) -> Result<Prepared> {
    let mut resolved = match &options.config_cwd {
        Some(cwd) => resolve_config_in(request.config_path.as_deref(), &request.target_dir, cwd)?,
        None => resolve_config(request.config_path.as_deref(), &request.target_dir)?,
    };
    if request.base_url.is_some() || request.model.is_some() {
        resolved
            .config
            .apply_network_overrides(request.base_url.clone(), request.model.clone())?;
    }
    let config = resolved.config;
    if request.mode == Mode::ReviewOnly && !config.pipeline.steps.contains(&StepName::ReviewCode) {
        return Err(GauntletError::config(
            "pipeline.steps",
            "review-only mode needs `review_code` in the step list",
        ));
    }

    let inputs = validate_inputs(
        &request.target_dir,
        &request.source,
        &request.dest,
        &config.pipeline.allowed_target_bases,
    )?;
    recorder.set_artifact_sha256(file_sha256(&inputs.source)?);

    let lock = RunLock::acquire(&inputs.target_dir, recorder.run_id())?;

    let log = Arc::new(InvocationLog::for_target(&inputs.target_dir));
    let mut invoker = ToolInvoker::new(&config).with_log(log);
    if let Some(search_path) = &options.search_path {
        invoker = invoker.with_search_path(search_path.clone());
    }
    let runtime = EnvironmentManager::new(invoker.clone(), &inputs.target_dir).provision()?;
    info!(root = %runtime.root().display(), reused = runtime.reused(), "runtime ready");
    let invoker = invoker.with_runtime(runtime.clone());
    let environment = EnvironmentManager::new(invoker.clone(), &inputs.target_dir);

    let client: Arc<dyn InferenceClient> = match &options.inference {
        Some(client) => client.clone(),
        None => Arc::new(OllamaClient::new(&config.network)?),
    };
    let llm = LlmGateway::new(client, &config.network, &config.prompts);
    let git = Git::new(invoker.clone(), &inputs.target_dir);

    Ok(Prepared {
        config,
        inputs,
        invoker,
        environment,
        runtime,
        llm,
        git,
        _lock: lock,
    })
}

/// Run the gauntlet. Always returns a report; errors are recorded in it.
#[instrument(skip_all, fields(target_dir = %request.target_dir.display(), mode = request.mode.as_str()))]
pub fn run_gauntlet(request: &RunRequest, options: &RunOptions) -> RunOutcome {
    let started = Utc::now();
    let run_id = new_run_id(started);
    let span = info_span!("run", %run_id);
    let _enter = span.enter();

    let mut recorder = RunRecorder::start(
        RunHeader {
            run_id,
            mode: request.mode,
            target_dir: request.target_dir.display().to_string(),
            target_file: request.dest.display().to_string(),
        },
        started,
    );
    info!(status = %recorder.status(), "run started");

    let prepared = match prepare(request, options, &mut recorder) {
        Ok(prepared) => prepared,
        Err(err) => {
            warn!(error = %err, "run aborted before the pipeline");
            recorder.fail(&err);
            return RunOutcome {
                report: recorder.finish(Utc::now()),
                aborted: true,
            };
        }
    };

    let ctx = StepContext {
        config: &prepared.config,
        mode: request.mode,
        target_dir: &prepared.inputs.target_dir,
        source: &prepared.inputs.source,
        dest: &prepared.inputs.dest,
        invoker: &prepared.invoker,
        environment: &prepared.environment,
        runtime: &prepared.runtime,
        llm: &prepared.llm,
        git: &prepared.git,
    };
    let steps = build_steps(&prepared.config.pipeline.steps);
    execute(&ctx, &steps, &mut recorder, &options.cancel);

    let report = recorder.finish(Utc::now());
    info!(status = %report.status, has_warnings = report.has_warnings, "run finished");
    RunOutcome {
        report,
        aborted: false,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn run_id_has_timestamp_and_lowercase_suffix() {
        let now = Utc
            .with_ymd_and_hms(2025, 3, 1, 8, 9, 10)
            .single()
            .expect("timestamp");
        let id = new_run_id(now);
        let suffix = id
            .strip_prefix("gauntlet_20250301_080910_")
            .expect("prefix");
        assert_eq!(suffix.len(), 6);
        assert!(
            suffix
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
        );
    }

    #[test]
    fn destination_must_stay_inside_target() {
        let target = tempfile::tempdir().expect("target");
        let source = target.path().join("candidate.py");
        fs::write(&source, "x = 1\n").expect("source");

        for bad in ["../escape.py", "/etc/passwd", ""] {
            let err = validate_inputs(target.path(), &source, Path::new(bad), &[])
                .expect_err("bad destination");
            assert!(matches!(err, GauntletError::Input(_)), "{bad}: {err}");
        }
        let ok = validate_inputs(target.path(), &source, Path::new("./src/app.py"), &[])
            .expect("valid");
        assert_eq!(ok.dest, PathBuf::from("src/app.py"));
    }

    #[test]
    fn missing_target_or_source_is_an_input_error() {
        let target = tempfile::tempdir().expect("target");
        let missing = target.path().join("nope");
        assert!(matches!(
            validate_inputs(&missing, &missing, Path::new("a.py"), &[]),
            Err(GauntletError::Input(_))
        ));
        assert!(matches!(
            validate_inputs(target.path(), &missing, Path::new("a.py"), &[]),
            Err(GauntletError::Input(_))
        ));
    }

    #[test]
    fn allowed_bases_restrict_the_target() {
        let base = tempfile::tempdir().expect("base");
        let other = tempfile::tempdir().expect("other");
        let source = other.path().join("candidate.py");
        fs::write(&source, "x = 1\n").expect("source");

        let err = validate_inputs(
            other.path(),
            &source,
            Path::new("a.py"),
            &[base.path().to_path_buf()],
        )
        .expect_err("outside bases");
        assert!(err.to_string().contains("allowed_target_bases"));

        validate_inputs(
            other.path(),
            &source,
            Path::new("a.py"),
            &[other.path().to_path_buf()],
        )
        .expect("inside bases");
    }

    #[test]
    fn digest_is_hex_sha256() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("a.txt");
        fs::write(&path, "abc").expect("write");
        assert_eq!(
            file_sha256(&path).expect("digest"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
