//! Test-only helpers: fake toolchains, scripted inference, and throwaway projects.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use crate::core::types::Mode;
use crate::io::config::CONFIG_FILE_NAME;
use crate::io::llm::{InferenceClient, InferenceError, ResponseFormat};
use crate::pipeline::CancelToken;
use crate::run::{RunOptions, RunRequest};

/// Write an executable shell script.
pub fn write_script(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create script dir");
    }
    fs::write(path, body).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    }
}

/// Fake `python3` that creates a minimal runtime for `-m venv <root>`.
const FAKE_PYTHON: &str = r#"#!/bin/sh
if [ "$1" = "-m" ] && [ "$2" = "venv" ]; then
  sleep 0.3
  mkdir -p "$3/bin"
  echo "home = /usr/bin" > "$3/pyvenv.cfg"
  printf '#!/bin/sh\nexit 0\n' > "$3/bin/python"
  chmod 755 "$3/bin/python"
fi
exit 0
"#;

/// A private bin directory placed ahead of the system `PATH`.
pub struct FakeToolchain {
    dir: TempDir,
}

impl FakeToolchain {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("toolchain dir");
        let toolchain = Self { dir };
        toolchain.add("python3", FAKE_PYTHON);
        toolchain
    }

    pub fn bin(&self) -> &Path {
        self.dir.path()
    }

    /// Add (or replace) a fake tool.
    pub fn add(&self, name: &str, body: &str) -> PathBuf {
        let path = self.bin().join(name);
        write_script(&path, body);
        path
    }

    pub fn search_path(&self) -> OsString {
        let mut dirs = vec![self.bin().to_path_buf()];
        if let Some(system) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&system));
        }
        std::env::join_paths(dirs).expect("join search path")
    }
}

impl Default for FakeToolchain {
    fn default() -> Self {
        Self::new()
    }
}

/// Replays queued responses and records what was asked.
#[derive(Default)]
pub struct ScriptedInference {
    responses: Mutex<VecDeque<Result<String, InferenceError>>>,
    prompts: Mutex<Vec<String>>,
    formats: Mutex<Vec<ResponseFormat>>,
}

impl ScriptedInference {
    pub fn new(responses: Vec<Result<String, InferenceError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    /// Every call fails as if nothing listens on the endpoint.
    pub fn unreachable() -> Self {
        Self::new(
            (0..32)
                .map(|_| Err(InferenceError::Network("connection refused".to_string())))
                .collect(),
        )
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().expect("prompts lock").len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }

    pub fn formats(&self) -> Vec<ResponseFormat> {
        self.formats.lock().expect("formats lock").clone()
    }
}

impl InferenceClient for ScriptedInference {
    fn complete(&self, prompt: &str, format: ResponseFormat) -> Result<String, InferenceError> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());
        self.formats.lock().expect("formats lock").push(format);
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or_else(|| Err(InferenceError::Api("no scripted response left".to_string())))
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

/// `git init` with a local identity so commits work anywhere.
pub fn init_git_repo(path: &Path) {
    let git = |args: &[&str]| {
        let status = Command::new("git")
            .args(args)
            .current_dir(path)
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    };
    git(&["init", "-q"]);
    git(&["config", "user.email", "gauntlet@example.com"]);
    git(&["config", "user.name", "Gauntlet Tests"]);
    git(&["config", "commit.gpgsign", "false"]);
}

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Tools that behave like a clean project: everything passes.
pub const CLEAN_RUFF: &str = "#!/bin/sh\n[ \"$1\" = \"check\" ] && echo '[]'\nexit 0\n";
pub const CLEAN_MYPY: &str = "#!/bin/sh\necho 'Success: no issues found in 1 source file'\nexit 0\n";
pub const CLEAN_PYTEST: &str =
    "#!/bin/sh\necho 'collected 2 items'\necho '============ 2 passed in 0.01s ============'\nexit 0\n";
pub const CLEAN_AUDIT: &str = "#!/bin/sh\necho '{\"dependencies\": []}'\nexit 0\n";

/// Canned test-generation answer.
pub const GENERATED_TESTS: &str =
    "```python\nfrom app import add\n\ndef test_add():\n    assert add(1, 2) == 3\n```";
/// Canned review answer.
pub const REVIEW_FINDINGS: &str =
    r#"[{"severity": "low", "description": "add a docstring", "location": "add"}]"#;

/// A target project, a separate input directory, and a fake toolchain.
pub struct TestProject {
    target: TempDir,
    inputs: TempDir,
    pub toolchain: FakeToolchain,
}

impl TestProject {
    /// Project whose fake tools all pass.
    pub fn new() -> Self {
        let project = Self {
            target: tempfile::tempdir().expect("target dir"),
            inputs: tempfile::tempdir().expect("inputs dir"),
            toolchain: FakeToolchain::new(),
        };
        project.toolchain.add("ruff", CLEAN_RUFF);
        project.toolchain.add("mypy", CLEAN_MYPY);
        project.toolchain.add("pytest", CLEAN_PYTEST);
        project.toolchain.add("pip-audit", CLEAN_AUDIT);
        project
    }

    pub fn target(&self) -> &Path {
        self.target.path()
    }

    /// Write a candidate artifact outside the target.
    pub fn write_source(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.inputs.path().join(name);
        fs::write(&path, contents).expect("write source");
        path
    }

    pub fn write_config(&self, contents: &str) {
        fs::write(self.target().join(CONFIG_FILE_NAME), contents).expect("write config");
    }

    pub fn request(&self, source: &Path, dest: &str, mode: Mode) -> RunRequest {
        RunRequest {
            target_dir: self.target().to_path_buf(),
            source: source.to_path_buf(),
            dest: PathBuf::from(dest),
            mode,
            config_path: None,
            base_url: None,
            model: None,
        }
    }

    /// Options wired to the fake toolchain and the given inference client.
    pub fn options(&self, inference: Arc<dyn InferenceClient>) -> RunOptions {
        RunOptions {
            search_path: Some(self.toolchain.search_path()),
            inference: Some(inference),
            config_cwd: Some(self.inputs.path().to_path_buf()),
            cancel: CancelToken::new(),
        }
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}
