//! Sibling `.lock` files guarding artifact reads and writes.
//!
//! The lock itself is an exclusive advisory lock on the open file, so the
//! kernel drops it when the holder exits, crashed or not. The file stays on
//! disk between holders and only carries the last holder's pid for operators.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: PathBuf, waited: Duration },
    #[error("lock {path}")]
    Io { path: PathBuf, #[source] source: io::Error },
}

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self { Self { timeout: Duration::from_secs(10) } }
}

#[derive(Debug)]
pub struct ArtifactLock {
    path: PathBuf,
    file: File,
}

impl ArtifactLock {
    pub fn acquire(path: &Path, opts: LockOptions) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io { path: path.to_path_buf(), source };
        let file = OpenOptions::new().read(true).write(true).create(true).open(path).map_err(io_err)?;
        let contended = fs2::lock_contended_error().kind();
        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == contended => {
                    if start.elapsed() >= opts.timeout {
                        return Err(LockError::Timeout { path: path.to_path_buf(), waited: start.elapsed() });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(source) => return Err(io_err(source)),
            }
        }
        if file.set_len(0).is_ok() {
            let mut w = &file;
            let _ = writeln!(w, "{}", std::process::id());
        }
        debug!(lock=%path.display(), "lock acquired");
        Ok(Self { path: path.to_path_buf(), file })
    }

    pub fn path(&self) -> &Path { &self.path }
}

impl Drop for ArtifactLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(lock=%self.path.display(), error=%e, "failed to release lock");
        }
    }
}
