//! Lock manager coordinating application, job, metadata and file operations.
//!
//! All locks are advisory file locks on sibling lock files, acquired with a
//! bounded timeout and released on every exit path through the RAII guard.
//! Shared and exclusive modes map to the host's reader/writer file locks, so
//! single-writer/multiple-reader semantics hold across processes.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Default acquisition timeout for every lock category.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between lock acquisition attempts while waiting.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Application lock file created in the output directory.
pub const APPLICATION_LOCK_NAME: &str = ".firefly.lock";

/// Prefix for per-source job lock files in the output directory.
pub const JOB_LOCK_PREFIX: &str = ".firefly_job_";

/// Suffix appended to a target path to form its sibling lock file.
const LOCK_SUFFIX: &str = ".lock";

/// Lock mode: shared for readers, exclusive for writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Error type for lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock was held by someone else for the whole timeout window.
    #[error("Timed out acquiring {mode} lock on {path} after {timeout:?}", path = .path.display())]
    Timeout {
        path: PathBuf,
        mode: LockMode,
        timeout: Duration,
    },

    /// IO error while opening or locking the lock file.
    #[error("IO error while locking: {0}")]
    Io(#[from] std::io::Error),
}

/// RAII guard for an acquired lock; releasing happens on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    lock_file_path: PathBuf,
    mode: LockMode,
}

impl FileLockGuard {
    pub fn lock_file_path(&self) -> &Path {
        &self.lock_file_path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        // Called through the trait: std::fs::File grew identically-named
        // inherent locking methods with different signatures.
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            debug!(
                "Failed to release {} lock on {}: {}",
                self.mode,
                self.lock_file_path.display(),
                e
            );
        }
    }
}

/// True when a lock attempt failed because someone else holds the lock.
fn is_lock_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Acquire a lock on the given lock file, polling until the timeout elapses.
fn acquire(lock_file_path: PathBuf, mode: LockMode, timeout: Duration) -> Result<FileLockGuard, LockError> {
    if let Some(parent) = lock_file_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_file_path)?;

    let deadline = Instant::now() + timeout;
    loop {
        let attempt = match mode {
            LockMode::Exclusive => fs2::FileExt::try_lock_exclusive(&file),
            LockMode::Shared => fs2::FileExt::try_lock_shared(&file),
        };

        match attempt {
            Ok(()) => {
                debug!("Acquired {} lock on {}", mode, lock_file_path.display());
                return Ok(FileLockGuard {
                    file,
                    lock_file_path,
                    mode,
                });
            }
            Err(e) if is_lock_contended(&e) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(LockError::Timeout {
                        path: lock_file_path,
                        mode,
                        timeout,
                    });
                }
                std::thread::sleep(LOCK_POLL_INTERVAL.min(deadline - now));
            }
            Err(e) => return Err(LockError::Io(e)),
        }
    }
}

/// Sibling lock path for metadata and file-operation locks: `<target>.lock`.
fn sibling_lock_path(target: &Path) -> PathBuf {
    let mut lock_path = target.as_os_str().to_owned();
    lock_path.push(LOCK_SUFFIX);
    PathBuf::from(lock_path)
}

/// Lock file path for a job working on the given source video.
pub fn job_lock_path(source_video_path: &Path, output_dir: &Path) -> PathBuf {
    let stem = source_video_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output_dir.join(format!("{}{}", JOB_LOCK_PREFIX, stem))
}

/// Acquire the application-wide lock preventing two instances from sharing
/// an output directory.
pub fn acquire_application_lock(output_dir: &Path, timeout: Duration) -> Result<FileLockGuard, LockError> {
    acquire(output_dir.join(APPLICATION_LOCK_NAME), LockMode::Exclusive, timeout)
}

/// Acquire the per-source job lock preventing two jobs from processing the
/// same source file.
pub fn acquire_job_lock(
    source_video_path: &Path,
    output_dir: &Path,
    timeout: Duration,
) -> Result<FileLockGuard, LockError> {
    acquire(
        job_lock_path(source_video_path, output_dir),
        LockMode::Exclusive,
        timeout,
    )
}

/// Acquire a lock guarding a journal file. Shared for reads, exclusive for writes.
pub fn acquire_metadata_lock(
    metadata_file_path: &Path,
    mode: LockMode,
    timeout: Duration,
) -> Result<FileLockGuard, LockError> {
    acquire(sibling_lock_path(metadata_file_path), mode, timeout)
}

/// Acquire a lock guarding an arbitrary file operation (probe, rename,
/// delete, copy).
pub fn acquire_file_operation_lock(
    file_path: &Path,
    mode: LockMode,
    timeout: Duration,
) -> Result<FileLockGuard, LockError> {
    acquire(sibling_lock_path(file_path), mode, timeout)
}
