//! Plain file helpers wrapping the lock manager for mutating operations.
//!
//! Hashing streams the file in 64 KiB chunks producing hex SHA-256 over the
//! exact byte stream. All mutating operations take an exclusive
//! file-operation lock.

use crate::locking::{self, LockError, LockMode, DEFAULT_LOCK_TIMEOUT};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error};

/// Chunk size for streaming hash computation.
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Error type for file operations.
#[derive(Debug, Error)]
pub enum FileOpError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Size of a file in bytes.
pub fn file_size_bytes(path: &Path) -> Result<u64, FileOpError> {
    if !path.is_file() {
        return Err(FileOpError::NotFound(path.to_path_buf()));
    }
    Ok(fs::metadata(path)?.len())
}

/// Delete a file if it exists.
///
/// Returns true when the file was deleted, false when it did not exist or
/// could not be removed (the error is logged, not propagated).
pub fn delete_file(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Deleted file: {}", path.display());
            true
        }
        Err(e) => {
            error!("Error deleting file {}: {}", path.display(), e);
            false
        }
    }
}

/// Delete a file under an exclusive file-operation lock.
pub fn delete_file_locked(path: &Path) -> Result<bool, LockError> {
    let _lock = locking::acquire_file_operation_lock(path, LockMode::Exclusive, DEFAULT_LOCK_TIMEOUT)?;
    Ok(delete_file(path))
}

/// Copy a file under an exclusive file-operation lock on the destination.
pub fn copy_file_locked(source: &Path, destination: &Path) -> Result<(), FileOpError> {
    if !source.is_file() {
        return Err(FileOpError::NotFound(source.to_path_buf()));
    }
    let _lock = locking::acquire_file_operation_lock(
        destination,
        LockMode::Exclusive,
        DEFAULT_LOCK_TIMEOUT,
    )?;
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, destination)?;
    debug!(
        "Copied file from {} to {}",
        source.display(),
        destination.display()
    );
    Ok(())
}

/// Atomically replace `to` with `from` via rename on the same filesystem.
pub fn replace_file(from: &Path, to: &Path) -> Result<(), FileOpError> {
    fs::rename(from, to)?;
    Ok(())
}

/// Hex SHA-256 over the exact byte content of the file, read in 64 KiB chunks.
pub fn sha256_hex(path: &Path) -> Result<String, FileOpError> {
    if !path.is_file() {
        return Err(FileOpError::NotFound(path.to_path_buf()));
    }

    debug!("Calculating SHA-256 for: {}", path.display());

    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
