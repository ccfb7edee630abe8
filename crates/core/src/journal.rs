//! Persistence of job journals: locked JSON reads and atomic writes.
//!
//! Journal files live at `output/firefly/data/jobs/<stem>_encoderdata.json`.
//! Writes serialize to a sibling `.tmp` file and rename over the target under
//! an exclusive metadata lock, so readers never observe a torn write. Reads
//! take a shared metadata lock and run the migration pipeline before the
//! strict parse into [`JobData`].

use crate::locking::{self, LockError, LockMode, DEFAULT_LOCK_TIMEOUT};
use crate::migrate::{MigrationError, MigrationPipeline};
use crate::model::JobData;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Suffix of every journal file in the jobs directory.
pub const JOB_FILE_SUFFIX: &str = "_encoderdata.json";

/// Error type for journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Journal file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The journal content is not valid JSON or does not match the model.
    #[error("Invalid journal content: {0}")]
    Invalid(String),

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Directory holding all job journals for an output directory.
pub fn jobs_directory(output_dir: &Path) -> PathBuf {
    output_dir.join("firefly").join("data").join("jobs")
}

/// Journal path for a given source video.
pub fn journal_path(output_dir: &Path, source_path: &Path) -> PathBuf {
    let stem = source_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    jobs_directory(output_dir).join(format!("{}{}", stem, JOB_FILE_SUFFIX))
}

/// Write a journal atomically under an exclusive metadata lock.
pub fn write_journal(job_data: &JobData, path: &Path) -> Result<(), JournalError> {
    let json = serde_json::to_string_pretty(job_data)
        .map_err(|e| JournalError::Invalid(e.to_string()))?;

    let _lock = locking::acquire_metadata_lock(path, LockMode::Exclusive, DEFAULT_LOCK_TIMEOUT)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, json)?;
    fs::rename(&temp_path, path)?;

    debug!("Journal saved: {}", path.display());
    Ok(())
}

/// Read a journal under a shared metadata lock, migrating old schemas before
/// the strict parse.
pub fn read_journal(path: &Path, migrations: &MigrationPipeline) -> Result<JobData, JournalError> {
    if !path.is_file() {
        return Err(JournalError::NotFound(path.to_path_buf()));
    }

    let content = {
        let _lock = locking::acquire_metadata_lock(path, LockMode::Shared, DEFAULT_LOCK_TIMEOUT)?;
        fs::read_to_string(path)?
    };

    let raw: Value =
        serde_json::from_str(&content).map_err(|e| JournalError::Invalid(e.to_string()))?;
    let migrated = migrations.apply(raw)?;

    let job_data: JobData =
        serde_json::from_value(migrated).map_err(|e| JournalError::Invalid(e.to_string()))?;

    debug!("Journal loaded: {}", path.display());
    Ok(job_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::{make_iteration, make_job_data};
    use tempfile::TempDir;

    fn pipeline() -> MigrationPipeline {
        MigrationPipeline::new(3)
    }

    #[test]
    fn test_jobs_directory_layout() {
        assert_eq!(
            jobs_directory(Path::new("/out")),
            PathBuf::from("/out/firefly/data/jobs")
        );
    }

    #[test]
    fn test_journal_path_naming() {
        assert_eq!(
            journal_path(Path::new("/out"), Path::new("/in/sample.mp4")),
            PathBuf::from("/out/firefly/data/jobs/sample_encoderdata.json")
        );
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = journal_path(tmp.path(), Path::new("/in/film.mp4"));

        let mut job_data = make_job_data("film.mp4", "hash_a");
        job_data.iterations.push(make_iteration("film_crf26.mp4", 26, 95.5));

        write_journal(&job_data, &path).unwrap();
        let loaded = read_journal(&path, &pipeline()).unwrap();
        assert_eq!(job_data, loaded);
    }

    #[test]
    fn test_write_is_pretty_printed_and_leaves_no_temp() {
        let tmp = TempDir::new().unwrap();
        let path = journal_path(tmp.path(), Path::new("/in/film.mp4"));

        write_journal(&make_job_data("film.mp4", "hash_a"), &path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("{\n"));
        assert!(content.contains("  \"schema_version\""));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_write_overwrites_existing_journal() {
        let tmp = TempDir::new().unwrap();
        let path = journal_path(tmp.path(), Path::new("/in/film.mp4"));

        write_journal(&make_job_data("film.mp4", "hash_a"), &path).unwrap();
        write_journal(&make_job_data("film.mp4", "hash_b"), &path).unwrap();

        let loaded = read_journal(&path, &pipeline()).unwrap();
        assert_eq!(loaded.source_video.sha256_hash, "hash_b");
    }

    #[test]
    fn test_read_missing_journal() {
        let tmp = TempDir::new().unwrap();
        let result = read_journal(&tmp.path().join("absent.json"), &pipeline());
        assert!(matches!(result, Err(JournalError::NotFound(_))));
    }

    #[test]
    fn test_read_invalid_json() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken_encoderdata.json");
        fs::write(&path, "Not json structure").unwrap();

        let result = read_journal(&path, &pipeline());
        assert!(matches!(result, Err(JournalError::Invalid(_))));
    }

    #[test]
    fn test_read_migrates_v1_journal() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("old_encoderdata.json");
        fs::write(
            &path,
            r#"{
                "schema_version": 1,
                "source_video": {
                    "file_attributes": {
                        "file_name": "old.mp4",
                        "file_size_megabytes": 2.0
                    },
                    "sha256_hash": "deadbeef"
                },
                "encoding_stage": {
                    "stage_number_from_1": 1,
                    "stage_name": "job_prepared",
                    "crf_range_min": 12,
                    "crf_range_max": 36
                },
                "iterations": []
            }"#,
        )
        .unwrap();

        let loaded = read_journal(&path, &pipeline()).unwrap();
        assert_eq!(loaded.schema_version, 3);
        assert_eq!(loaded.source_video.file_attributes.file_size_bytes, 2 * 1_048_576);
    }

    #[test]
    fn test_migrated_journal_round_trips_at_current_version() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("old_encoderdata.json");
        fs::write(
            &path,
            r#"{
                "schema_version": 1,
                "source_video": {
                    "file_attributes": { "file_name": "old.mp4", "file_size_megabytes": 1.0 },
                    "sha256_hash": "deadbeef"
                },
                "encoding_stage": {
                    "stage_number_from_1": 2,
                    "stage_name": "metadata_extracted",
                    "crf_range_min": 12,
                    "crf_range_max": 36
                },
                "iterations": []
            }"#,
        )
        .unwrap();

        // Migrate on load, re-serialize at v3, reload: the forms must agree.
        let migrated = read_journal(&path, &pipeline()).unwrap();
        write_journal(&migrated, &path).unwrap();
        let reloaded = read_journal(&path, &pipeline()).unwrap();
        assert_eq!(migrated, reloaded);
    }

    #[test]
    fn test_read_v2_journal_without_migrator_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("orphan_encoderdata.json");
        fs::write(&path, r#"{ "schema_version": 2 }"#).unwrap();

        let result = read_journal(&path, &pipeline());
        assert!(matches!(result, Err(JournalError::Migration(_))));
    }
}
