//! Pipeline driver: compose, validate, extract metadata, filter HDR,
//! prioritize, execute the CRF search per job, and clean up terminals.
//!
//! The whole run happens under the application lock. Per job, work happens
//! under the job lock; a contended job lock skips the job. Cancellation is
//! observed between stages and inside subprocess supervision; the journal is
//! always left at its last durably-recorded stage.

use crate::compose::{self, ComposeError};
use crate::encoder::FfmpegIterationRunner;
use crate::fsutil::{self, FileOpError};
use crate::journal::{self, JournalError};
use crate::locking::{self, LockError, DEFAULT_LOCK_TIMEOUT};
use crate::migrate::MigrationPipeline;
use crate::model::{EncoderJob, EncodingStage, EncodingStageName};
use crate::prioritize::{self, JobPrioritizer};
use crate::probe::{self, ProbeError};
use crate::search::CrfSearchEngine;
use crate::validate;
use firefly_config::{AppConfig, AppMeta};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Error type aborting a whole run.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Application lock contention or IO failure while locking. Contention
    /// means another instance owns the output directory.
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-stage failures that fail one job but not the run.
#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    FileOp(#[from] FileOpError),
}

/// Outcome counts for one driver run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverSummary {
    pub total_jobs: usize,
    pub completed: usize,
    pub stopped_safe: usize,
    pub skipped_hdr: usize,
    pub skipped_locked: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Single-threaded driver advancing every job to a terminal stage.
pub struct PipelineDriver {
    config: AppConfig,
    meta: AppMeta,
    cancel: Arc<AtomicBool>,
}

impl PipelineDriver {
    pub fn new(config: AppConfig, meta: AppMeta) -> Self {
        Self {
            config,
            meta,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag observed by the run; setting it requests a clean shutdown.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn persist(&self, job: &EncoderJob) -> Result<(), JournalError> {
        journal::write_journal(&job.job_data, &job.metadata_json_file_path)
    }

    fn vmaf_acceptable(&self, vmaf: f64) -> bool {
        self.config.vmaf_min <= vmaf && vmaf <= self.config.vmaf_max
    }

    /// Run the full pipeline once.
    pub fn run(&self) -> Result<DriverSummary, DriverError> {
        let _application_lock =
            locking::acquire_application_lock(&self.config.output_dir, DEFAULT_LOCK_TIMEOUT)?;

        let migrations = MigrationPipeline::new(self.meta.schema_version);
        let mut jobs = compose::compose_jobs(&self.config, &self.meta, &migrations)?;

        // Jobs failing stage-dependent validation are irrecoverable: their
        // journal goes away so the source becomes eligible for a fresh job.
        jobs.retain(|job| {
            if validate::validate_job(job, &self.config) {
                return true;
            }
            warn!(
                "Dropping invalid job for {}; deleting its journal.",
                job.source_file_path.display()
            );
            fsutil::delete_file(&job.metadata_json_file_path);
            false
        });

        let mut summary = DriverSummary {
            total_jobs: jobs.len(),
            ..Default::default()
        };

        // Metadata extraction for freshly prepared jobs.
        let mut extracted = Vec::new();
        for mut job in jobs {
            if self.cancelled() {
                summary.cancelled = true;
                info!("Run cancelled before metadata extraction completed.");
                return Ok(summary);
            }
            match self.extract_metadata(&mut job) {
                Ok(()) => extracted.push(job),
                Err(e) => {
                    error!(
                        "Metadata extraction failed for {}: {}",
                        job.source_file_path.display(),
                        e
                    );
                    summary.failed += 1;
                }
            }
        }

        // HDR inputs are flagged and passed through untouched.
        let mut to_process = Vec::new();
        for mut job in extracted {
            let is_hdr = job
                .job_data
                .source_video
                .ffmpeg_metadata
                .as_ref()
                .map(|m| m.is_hdr())
                .unwrap_or(false);

            if is_hdr && !job.stage_name().is_terminal() {
                info!(
                    "HDR source detected, passing through: {}",
                    job.source_file_path.display()
                );
                match self.skip_hdr(&mut job) {
                    Ok(()) => summary.skipped_hdr += 1,
                    Err(e) => {
                        error!(
                            "HDR pass-through failed for {}: {}",
                            job.source_file_path.display(),
                            e
                        );
                        summary.failed += 1;
                    }
                }
            } else {
                to_process.push(job);
            }
        }

        JobPrioritizer::default().prioritize(&mut to_process);
        prioritize::sort_by_priority(&mut to_process);

        for mut job in to_process {
            if self.cancelled() {
                summary.cancelled = true;
                break;
            }

            let _job_lock = match locking::acquire_job_lock(
                &job.source_file_path,
                &self.config.output_dir,
                DEFAULT_LOCK_TIMEOUT,
            ) {
                Ok(guard) => guard,
                Err(LockError::Timeout { .. }) => {
                    warn!(
                        "Video is already being processed: {}",
                        job.source_file_path.display()
                    );
                    summary.skipped_locked += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if matches!(
                job.stage_name(),
                EncodingStageName::MetadataExtracted | EncodingStageName::SearchingCrf
            ) {
                info!("Starting encoding job: {}", job.source_file_path.display());
                let runner = FfmpegIterationRunner::new(&self.config, &self.meta, &self.cancel);
                let mut engine = CrfSearchEngine::new(&self.config, runner);
                match engine.run(&mut job) {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {
                        info!(
                            "Run cancelled while processing {}; journal left at last checkpoint.",
                            job.source_file_path.display()
                        );
                        summary.cancelled = true;
                        break;
                    }
                    Err(e) => {
                        error!(
                            "Encoding job failed for {}: {}",
                            job.source_file_path.display(),
                            e
                        );
                        summary.failed += 1;
                        continue;
                    }
                }
            }

            if let Err(e) = self.cleanup_terminal(&mut job) {
                warn!(
                    "Terminal cleanup failed for {}: {}",
                    job.source_file_path.display(),
                    e
                );
            }

            match job.stage_name() {
                EncodingStageName::Completed => summary.completed += 1,
                EncodingStageName::StoppedVmafDelta | EncodingStageName::UnreachableVmaf => {
                    summary.stopped_safe += 1
                }
                EncodingStageName::SkippedIsHdrVideo => summary.skipped_hdr += 1,
                _ => {}
            }

            info!("Encoder: completed {}", job.source_file_path.display());
        }

        info!(
            "Run finished: {} jobs ({} completed, {} stopped, {} HDR pass-through, \
             {} locked, {} failed)",
            summary.total_jobs,
            summary.completed,
            summary.stopped_safe,
            summary.skipped_hdr,
            summary.skipped_locked,
            summary.failed
        );

        Ok(summary)
    }

    /// Probe a PREPARED job's source and advance it to METADATA_EXTRACTED.
    fn extract_metadata(&self, job: &mut EncoderJob) -> Result<(), StepError> {
        if job.stage_name() != EncodingStageName::Prepared {
            return Ok(());
        }

        let (attributes, metadata) = probe::probe_video(&job.source_file_path)?;
        job.job_data.source_video.video_attributes = Some(attributes);
        job.job_data.source_video.ffmpeg_metadata = Some(metadata);

        let stage = job.job_data.encoding_stage.clone();
        job.job_data.encoding_stage = EncodingStage::new(
            EncodingStageName::MetadataExtracted,
            stage.crf_range_min,
            stage.crf_range_max,
        )
        .with_last(stage.last_crf, stage.last_vmaf)
        .with_total_time(stage.job_total_time_seconds);
        self.persist(job)?;
        Ok(())
    }

    /// Flag an HDR source and pass the original through to the output.
    fn skip_hdr(&self, job: &mut EncoderJob) -> Result<(), StepError> {
        let stage = job.job_data.encoding_stage.clone();
        job.job_data.encoding_stage = EncodingStage::new(
            EncodingStageName::SkippedIsHdrVideo,
            stage.crf_range_min,
            stage.crf_range_max,
        )
        .with_last(stage.last_crf, stage.last_vmaf)
        .with_total_time(stage.job_total_time_seconds);
        self.persist(job)?;
        self.cleanup_safe_error(job)?;
        Ok(())
    }

    /// Terminal cleanup dispatch.
    fn cleanup_terminal(&self, job: &mut EncoderJob) -> Result<(), StepError> {
        match job.stage_name() {
            EncodingStageName::CrfFound => self.cleanup_success(job),
            EncodingStageName::StoppedVmafDelta
            | EncodingStageName::UnreachableVmaf
            | EncodingStageName::SkippedIsHdrVideo => self.cleanup_safe_error(job),
            _ => Ok(()),
        }
    }

    fn delete_iteration_output(&self, file_name: &str) {
        let path = self.config.output_dir.join(file_name);
        match fsutil::delete_file_locked(&path) {
            Ok(true) => info!("Deleted non-final iteration output: {}", path.display()),
            Ok(false) => {}
            Err(e) => warn!("Could not delete {}: {}", path.display(), e),
        }
    }

    fn copy_source_to_output(&self, job: &EncoderJob) -> Result<(), FileOpError> {
        let destination = self
            .config
            .output_dir
            .join(&job.job_data.source_video.file_attributes.file_name);
        info!(
            "Copying original source to output: {}",
            destination.display()
        );
        fsutil::copy_file_locked(&job.source_file_path, &destination)
    }

    /// CRF_FOUND: delete non-final iteration outputs, fall back to a source
    /// copy when the chosen output vanished, then transition to COMPLETED.
    fn cleanup_success(&self, job: &mut EncoderJob) -> Result<(), StepError> {
        let final_file_name = job
            .job_data
            .final_iteration()
            .map(|i| i.file_attributes.file_name.clone());

        for iteration in &job.job_data.iterations {
            if Some(&iteration.file_attributes.file_name) == final_file_name.as_ref() {
                continue;
            }
            self.delete_iteration_output(&iteration.file_attributes.file_name);
        }

        let survivor = final_file_name
            .as_ref()
            .map(|name| self.config.output_dir.join(name).is_file())
            .unwrap_or(false);
        if !survivor {
            warn!(
                "No acceptable output survived for {}; keeping the original.",
                job.source_file_path.display()
            );
            self.copy_source_to_output(job)?;
        }

        let stage = job.job_data.encoding_stage.clone();
        job.job_data.encoding_stage = EncodingStage::new(
            EncodingStageName::Completed,
            stage.crf_range_min,
            stage.crf_range_max,
        )
        .with_last(stage.last_crf, stage.last_vmaf)
        .with_total_time(stage.job_total_time_seconds);
        self.persist(job)?;
        Ok(())
    }

    /// Safe-error terminals: delete iteration outputs outside the VMAF band;
    /// when nothing acceptable remains, keep a copy of the original.
    fn cleanup_safe_error(&self, job: &mut EncoderJob) -> Result<(), StepError> {
        let mut any_acceptable = false;
        for iteration in &job.job_data.iterations {
            let path = self
                .config
                .output_dir
                .join(&iteration.file_attributes.file_name);
            if self.vmaf_acceptable(iteration.vmaf()) {
                if path.is_file() {
                    any_acceptable = true;
                }
            } else {
                self.delete_iteration_output(&iteration.file_attributes.file_name);
            }
        }

        if !any_acceptable {
            self.copy_source_to_output(job)?;
        }
        Ok(())
    }
}
