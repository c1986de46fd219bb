//! Engine home directory management.
//!
//! ```text
//! <path>/
//! ├─ LOCK              # Advisory lock for single-process access
//! ├─ kv.checkpoint     # Engine checkpoint image
//! └─ journal/          # Engine journal (durable connections only)
//! ```
//!
//! The LOCK file ensures only one process opens the engine home at a time.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";

/// Journal directory name, matching `log=(path=journal)` in the open string.
pub const JOURNAL_DIR: &str = "journal";

/// An engine home directory held under an exclusive lock.
#[derive(Debug)]
pub struct EngineDir {
    path: PathBuf,
    _lock_file: File,
}

impl EngineDir {
    /// Opens or creates an engine home directory and locks it.
    ///
    /// # Errors
    ///
    /// Returns `EngineLocked` if another process holds the lock,
    /// `InvalidOptions` if `path` exists but is not a directory, or I/O
    /// errors.
    pub fn open(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_options(format!(
                "engine path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::EngineLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the journal directory path.
    #[must_use]
    pub fn journal_dir(&self) -> PathBuf {
        self.path.join(JOURNAL_DIR)
    }

    /// Creates the journal directory if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn ensure_journal_dir(&self) -> std::io::Result<PathBuf> {
        let dir = self.journal_dir();
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}
