//! Advisory workspace lock.
//!
//! Two processes sharing one workspace would fight over the shadow store
//! and each other's edits. The lock is a flock-style advisory file at
//! `<workspace>/.kvit-coder.lock` containing the holder's PID on one line;
//! it is released and removed when the guard drops.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{CoderError, Result};

/// Name of the lock file inside the workspace.
pub const LOCK_FILE_NAME: &str = ".kvit-coder.lock";

/// Held advisory lock on a workspace.
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
    file: File,
}

impl WorkspaceLock {
    /// Acquire the lock for `workspace`, non-blocking.
    ///
    /// # Errors
    ///
    /// Returns [`CoderError::WorkspaceLocked`] with the holder's PID when
    /// another process holds the lock, or an I/O error.
    pub fn acquire(workspace: &Path) -> Result<Self> {
        let path = workspace.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            let mut contents = String::new();
            let _ = file.read_to_string(&mut contents);
            let pid = contents.trim().parse::<u32>().unwrap_or(0);
            return Err(CoderError::WorkspaceLocked { pid });
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;

        debug!(path = %path.display(), "workspace lock acquired");
        Ok(Self { path, file })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
        debug!(path = %self.path.display(), "workspace lock released");
    }
}
