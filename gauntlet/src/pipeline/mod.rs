//! Step interface and the sequential orchestrator.
//!
//! Steps run strictly in configured order. Each step sees the artifacts
//! produced so far and returns its own status; a step that raises is recorded
//! as FAILURE and halts the rest of the pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{debug, error, info, info_span, warn};

use crate::core::findings::{AuditFinding, ReviewFinding, TestSummary};
use crate::core::report::{PendingStep, RunRecorder, StepDetails, StepOutcome};
use crate::core::types::{Mode, StepName, StepStatus};
use crate::core::verdict::{Gate, Thresholds, Verdict, contribution};
use crate::error::{GauntletError, Result};
use crate::io::config::Config;
use crate::io::environment::{EnvironmentManager, RuntimeHandle};
use crate::io::git::Git;
use crate::io::llm::LlmGateway;
use crate::io::tools::ToolInvoker;

pub mod steps;

pub use steps::build_steps;

/// Shared flag checked before each step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Inter-step inputs a step may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Signatures,
    GeneratedTests,
    SavedTests,
}

impl Artifact {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signatures => "signatures",
            Self::GeneratedTests => "generated_tests",
            Self::SavedTests => "saved_tests",
        }
    }
}

/// Values handed from earlier steps to later ones.
#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    pub signatures: Option<String>,
    pub generated_tests: Option<String>,
    pub saved_tests: Option<PathBuf>,
}

impl Artifacts {
    pub fn has(&self, artifact: Artifact) -> bool {
        match artifact {
            Artifact::Signatures => self.signatures.is_some(),
            Artifact::GeneratedTests => self.generated_tests.is_some(),
            Artifact::SavedTests => self.saved_tests.is_some(),
        }
    }
}

/// Something a step hands to the orchestrator besides its status.
#[derive(Debug, Clone)]
pub enum Produced {
    Signatures(String),
    GeneratedTests(String),
    SavedTests(PathBuf),
    AuditFindings(Vec<AuditFinding>),
    ReviewFindings(Vec<ReviewFinding>),
    TestSummary(TestSummary),
    CommitId(String),
}

/// What a step decided.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub status: StepStatus,
    pub details: StepDetails,
    pub error: Option<String>,
    pub produced: Vec<Produced>,
}

impl StepOutput {
    pub fn new(status: StepStatus, details: StepDetails) -> Self {
        Self {
            status,
            details,
            error: None,
            produced: Vec::new(),
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self::new(StepStatus::Skipped, StepDetails::note(message))
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn producing(mut self, produced: Produced) -> Self {
        self.produced.push(produced);
        self
    }
}

/// Read-only view of the run shared with every step.
pub struct StepContext<'a> {
    pub config: &'a Config,
    pub mode: Mode,
    pub target_dir: &'a Path,
    pub source: &'a Path,
    /// Destination relative to `target_dir`.
    pub dest: &'a Path,
    pub invoker: &'a ToolInvoker,
    pub environment: &'a EnvironmentManager,
    pub runtime: &'a RuntimeHandle,
    pub llm: &'a LlmGateway,
    pub git: &'a Git,
}

impl StepContext<'_> {
    pub fn target_file(&self) -> PathBuf {
        self.target_dir.join(self.dest)
    }

    /// Destination in `/`-separated form, for prompts and git pathspecs.
    pub fn dest_display(&self) -> String {
        self.dest
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn read_target(&self) -> Result<String> {
        let path = self.target_file();
        std::fs::read_to_string(&path).map_err(|err| GauntletError::fs(path, err))
    }
}

/// One named unit of pipeline work.
pub trait Step {
    fn name(&self) -> StepName;

    /// Threshold that decides whether a FAILURE escalates the run.
    fn gate(&self) -> Gate;

    /// Artifacts that must exist for the step to run.
    fn consumes(&self) -> &'static [Artifact] {
        &[]
    }

    fn run(&self, ctx: &StepContext<'_>, artifacts: &Artifacts) -> Result<StepOutput>;
}

/// Why the orchestrator skips a step without running it.
fn mode_skip(mode: Mode, name: StepName, review_done: bool, failing: bool) -> Option<String> {
    match mode {
        Mode::ReviewOnly if review_done => {
            return Some("skipped in review-only mode (after review)".to_string());
        }
        Mode::ReviewOnly if matches!(name, StepName::RunPrecommit | StepName::CommitChanges) => {
            return Some("skipped in review-only mode".to_string());
        }
        Mode::Apply if name == StepName::CommitChanges => {
            return Some("commit disabled in apply mode".to_string());
        }
        _ => {}
    }
    if name == StepName::CommitChanges && failing {
        return Some("run is already failing, not committing".to_string());
    }
    None
}

/// Run `steps` in order, recording each into `recorder`.
///
/// Returns the artifacts left at the end of the run.
pub fn execute(
    ctx: &StepContext<'_>,
    steps: &[Box<dyn Step>],
    recorder: &mut RunRecorder,
    cancel: &CancelToken,
) -> Artifacts {
    let thresholds = &ctx.config.thresholds;
    let mut artifacts = Artifacts::default();
    let mut review_done = false;

    for step in steps {
        let name = step.name();
        if cancel.is_cancelled() {
            warn!(step = %name, "run cancelled before step");
            recorder.fail(&GauntletError::Cancelled);
            break;
        }
        let span = info_span!("step", step = %name);
        let _enter = span.enter();
        let pending = PendingStep::begin(name, Utc::now());
        debug!(status = %pending.status(), "step started");

        let skip_reason = mode_skip(ctx.mode, name, review_done, recorder.is_failing()).or_else(|| {
            step.consumes()
                .iter()
                .find(|artifact| !artifacts.has(**artifact))
                .map(|missing| format!("missing input: {}", missing.as_str()))
        });
        if let Some(reason) = skip_reason {
            info!(%reason, "step skipped");
            let output = StepOutput::skipped(reason);
            recorder.push(pending.finish(outcome(output, step.gate(), thresholds), Utc::now()));
            continue;
        }

        match step.run(ctx, &artifacts) {
            Ok(output) => {
                for produced in &output.produced {
                    apply_produced(produced, &mut artifacts, recorder);
                }
                let finished = outcome(output, step.gate(), thresholds);
                info!(status = %finished.status, contribution = ?finished.contribution, "step finished");
                recorder.push(pending.finish(finished, Utc::now()));
            }
            Err(err) => {
                error!(error = %err, "step raised, halting pipeline");
                let failed = StepOutcome {
                    status: StepStatus::Failure,
                    details: StepDetails::note(format!("{name} aborted")),
                    error: Some(err.to_string()),
                    contribution: Some(Verdict::Failure),
                };
                recorder.push(pending.finish(failed, Utc::now()));
                recorder.fail(&err);
                break;
            }
        }
        if name == StepName::ReviewCode {
            review_done = true;
        }
    }
    artifacts
}

fn outcome(output: StepOutput, gate: Gate, thresholds: &Thresholds) -> StepOutcome {
    StepOutcome {
        contribution: contribution(output.status, gate, thresholds),
        status: output.status,
        details: output.details,
        error: output.error,
    }
}

fn apply_produced(produced: &Produced, artifacts: &mut Artifacts, recorder: &mut RunRecorder) {
    match produced {
        Produced::Signatures(text) => artifacts.signatures = Some(text.clone()),
        Produced::GeneratedTests(code) => artifacts.generated_tests = Some(code.clone()),
        Produced::SavedTests(path) => artifacts.saved_tests = Some(path.clone()),
        Produced::AuditFindings(findings) => recorder.set_audit_findings(findings.clone()),
        Produced::ReviewFindings(findings) => recorder.set_review_findings(findings.clone()),
        Produced::TestSummary(summary) => recorder.set_test_summary(summary.clone()),
        Produced::CommitId(id) => recorder.set_commit_id(id.clone()),
    }
}
