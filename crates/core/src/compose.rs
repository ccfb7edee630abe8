//! Job composer: reconcile existing journals with the input directory.
//!
//! Composition is two-phase. Existing journals are loaded, migrated and
//! validated (journals whose source vanished or changed content are
//! deleted). Then every `.mp4` directly under the input directory becomes a
//! fresh job at the PREPARED stage, unless its hash matches a loaded source
//! hash or any recorded iteration hash.

use crate::fsutil;
use crate::journal::{self, JournalError, JOB_FILE_SUFFIX};
use crate::migrate::MigrationPipeline;
use crate::model::{
    EncoderJob, EncodingStage, EncodingStageName, FileAttributes, JobData, SourceVideo,
};
use firefly_config::{AppConfig, AppMeta};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Error type for job composition.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    FileOp(#[from] crate::fsutil::FileOpError),

    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// True for files carrying the `.mp4` suffix, case-insensitively.
pub fn is_mp4(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("mp4"))
        .unwrap_or(false)
}

/// Compose the full job list: loaded journals plus fresh jobs for unknown
/// sources. Fresh jobs are persisted immediately.
pub fn compose_jobs(
    config: &AppConfig,
    meta: &AppMeta,
    migrations: &MigrationPipeline,
) -> Result<Vec<EncoderJob>, ComposeError> {
    info!("Composing encoding jobs...");
    info!("|-Input directory: {}", config.input_dir.display());
    info!("|-Output directory: {}", config.output_dir.display());

    let jobs_dir = journal::jobs_directory(&config.output_dir);
    fs::create_dir_all(&jobs_dir)?;

    let existing_jobs = load_existing_jobs(&jobs_dir, config, migrations)?;
    let new_jobs = create_jobs_from_sources(&existing_jobs, config, meta)?;

    info!(
        "Finished composing jobs: {} ({} loaded, {} created)",
        existing_jobs.len() + new_jobs.len(),
        existing_jobs.len(),
        new_jobs.len()
    );

    Ok(existing_jobs.into_iter().chain(new_jobs).collect())
}

fn handle_invalid_journal(path: &Path, reason: &str) {
    error!(
        "Failed to load job journal {}: {}. Deleting invalid journal.",
        path.display(),
        reason
    );
    fsutil::delete_file(path);
}

/// Load, migrate and validate every journal in the jobs directory.
fn load_existing_jobs(
    jobs_dir: &Path,
    config: &AppConfig,
    migrations: &MigrationPipeline,
) -> Result<Vec<EncoderJob>, ComposeError> {
    let mut journal_paths: Vec<PathBuf> = fs::read_dir(jobs_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(JOB_FILE_SUFFIX))
                    .unwrap_or(false)
        })
        .collect();
    journal_paths.sort();

    let mut jobs = Vec::new();
    for path in journal_paths {
        debug!("Loading existing job journal: {}", path.display());
        match journal::read_journal(&path, migrations) {
            Ok(job_data) => {
                if !validate_journal(&job_data, config) {
                    handle_invalid_journal(&path, "validation failed");
                    continue;
                }
                let source_path = config
                    .input_dir
                    .join(&job_data.source_video.file_attributes.file_name);
                debug!("Existing job loaded for file: {}", source_path.display());
                jobs.push(EncoderJob::new(source_path, path, job_data));
            }
            Err(e) => handle_invalid_journal(&path, &e.to_string()),
        }
    }

    Ok(jobs)
}

/// A journal is valid when its source still exists under the input
/// directory and the source's content hash matches the stored hash.
fn validate_journal(job_data: &JobData, config: &AppConfig) -> bool {
    let source_path = config
        .input_dir
        .join(&job_data.source_video.file_attributes.file_name);

    if !source_path.is_file() {
        error!(
            "Journal validation failed: source video not found at {}",
            source_path.display()
        );
        return false;
    }

    match fsutil::sha256_hex(&source_path) {
        Ok(hash) if hash == job_data.source_video.sha256_hash => true,
        Ok(_) => {
            error!(
                "Journal validation failed: source video hash mismatch for {}",
                source_path.display()
            );
            false
        }
        Err(e) => {
            error!(
                "Journal validation failed: could not hash {}: {}",
                source_path.display(),
                e
            );
            false
        }
    }
}

/// Create fresh PREPARED jobs for every unknown `.mp4` in the input
/// directory. Files whose hash matches a loaded source or any recorded
/// iteration output are never re-added.
fn create_jobs_from_sources(
    existing_jobs: &[EncoderJob],
    config: &AppConfig,
    meta: &AppMeta,
) -> Result<Vec<EncoderJob>, ComposeError> {
    let mut known_hashes: HashSet<String> = existing_jobs
        .iter()
        .flat_map(|job| job.job_data.known_hashes().map(str::to_string))
        .collect();

    // Flat layout: no recursion into subdirectories.
    let mut source_paths: Vec<PathBuf> = WalkDir::new(&config.input_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_mp4(path))
        .collect();
    source_paths.sort();

    let mut new_jobs = Vec::new();
    for source_path in source_paths {
        debug!("Considering source video: {}", source_path.display());

        let source_hash = match fsutil::sha256_hex(&source_path) {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Skipping unreadable source {}: {}", source_path.display(), e);
                continue;
            }
        };

        if known_hashes.contains(&source_hash) {
            debug!(
                "Job already exists for {} (matched by hash), skipping.",
                source_path.display()
            );
            continue;
        }

        let journal_path = journal::journal_path(&config.output_dir, &source_path);
        let job = initialize_job(&source_path, journal_path, source_hash.clone(), config, meta)?;
        journal::write_journal(&job.job_data, &job.metadata_json_file_path)?;

        debug!("Created new job for {}", source_path.display());
        known_hashes.insert(source_hash);
        new_jobs.push(job);
    }

    Ok(new_jobs)
}

/// Fresh job at PREPARED with the full configured CRF window.
fn initialize_job(
    source_path: &Path,
    journal_path: PathBuf,
    source_hash: String,
    config: &AppConfig,
    meta: &AppMeta,
) -> Result<EncoderJob, ComposeError> {
    let file_name = source_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let job_data = JobData {
        schema_version: meta.schema_version,
        source_video: SourceVideo {
            file_attributes: FileAttributes {
                file_name,
                file_size_bytes: fsutil::file_size_bytes(source_path)?,
            },
            sha256_hash: source_hash,
            video_attributes: None,
            ffmpeg_metadata: None,
        },
        encoding_stage: EncodingStage::new(
            EncodingStageName::Prepared,
            config.crf_min,
            config.crf_max,
        ),
        iterations: Vec::new(),
    };

    Ok(EncoderJob::new(
        source_path.to_path_buf(),
        journal_path,
        job_data,
    ))
}
