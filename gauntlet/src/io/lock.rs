//! Directory-scoped run lock.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{GauntletError, Result};

pub const LOCK_FILE_NAME: &str = "run.lock";

/// Held for the duration of a run; the lock file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Create `<target>/.gauntlet/run.lock` exclusively, recording `run_id`.
    pub fn acquire(target_dir: &Path, run_id: &str) -> Result<Self> {
        let dir = super::state_dir(target_dir);
        fs::create_dir_all(&dir).map_err(|err| GauntletError::fs(&dir, err))?;
        let path = dir.join(LOCK_FILE_NAME);
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                return Err(GauntletError::Input(format!(
                    "target is locked by run '{}' ({}); remove the lock file if that run is gone",
                    holder.trim(),
                    path.display()
                )));
            }
            Err(err) => return Err(GauntletError::fs(&path, err)),
        };
        let lock = Self { path }.record_holder(file, run_id)?;
        debug!(path = %lock.path.display(), "run lock acquired");
        Ok(lock)
    }

    /// Write the holder id; on failure `self` drops and the lock file goes with it.
    fn record_holder(self, mut out: impl Write, run_id: &str) -> Result<Self> {
        out.write_all(run_id.as_bytes())
            .map_err(|err| GauntletError::fs(&self.path, err))?;
        Ok(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}
