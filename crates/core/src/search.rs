//! CRF search engine: VMAF-guided secant/bisection over encoder iterations.
//!
//! One job's search is a single loop. Every decision mutates the encoding
//! stage, appends at most one iteration and is flushed to the journal before
//! the loop continues, so an interrupted search resumes exactly where it
//! stopped.

use crate::fsutil::FileOpError;
use crate::journal::{self, JournalError};
use crate::locking::LockError;
use crate::model::{EncoderJob, EncodingStage, EncodingStageName, Iteration};
use crate::probe::ProbeError;
use crate::supervisor::SupervisorError;
use crate::vmaf::VmafError;
use firefly_config::AppConfig;
use std::cmp::Ordering;
use thiserror::Error;
use tracing::{info, warn};

/// Error type for a single encode-and-measure iteration.
#[derive(Debug, Error)]
pub enum IterationError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Vmaf(#[from] VmafError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    FileOp(#[from] FileOpError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Encoding failed: {0}")]
    Encoding(String),
}

impl IterationError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            IterationError::Supervisor(SupervisorError::Cancelled) => true,
            IterationError::Vmaf(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

/// Error type for a whole job search.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Iteration(#[from] IterationError),
}

impl SearchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SearchError::Iteration(e) if e.is_cancelled())
    }
}

/// Executes one encode-plus-VMAF attempt at a given CRF.
///
/// The production implementation drives ffmpeg; tests script it.
pub trait IterationRunner {
    fn run_iteration(&mut self, job: &EncoderJob, crf: i32) -> Result<Iteration, IterationError>;
}

/// Integer midpoint of the window, matching floor division.
pub fn midpoint(crf_range_min: i32, crf_range_max: i32) -> i32 {
    (crf_range_min + crf_range_max).div_euclid(2)
}

/// Least-squares linear fit of VMAF over CRF, solved for the target VMAF.
///
/// Returns `None` when the fit is degenerate (all iterations at one CRF, a
/// flat slope, or a non-finite solution).
pub fn linear_fit_crf(iterations: &[Iteration], target_vmaf: f64) -> Option<f64> {
    let n = iterations.len() as f64;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xx = 0.0;
    let mut sum_xy = 0.0;

    for iteration in iterations {
        let x = iteration.crf() as f64;
        let y = iteration.vmaf();
        sum_x += x;
        sum_y += y;
        sum_xx += x * x;
        sum_xy += x * y;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return None;
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    if slope.abs() < 1e-12 {
        return None;
    }

    let intercept = (sum_y - slope * sum_x) / n;
    let predicted = (target_vmaf - intercept) / slope;
    predicted.is_finite().then_some(predicted)
}

/// Predict the next CRF to test.
///
/// First attempt uses the configured initial CRF. With two or more recorded
/// iterations a linear fit is solved for the middle of the VMAF band and
/// clamped to the current window; a degenerate fit (and the single-iteration
/// case) falls back to the window midpoint.
pub fn predict_next_crf(config: &AppConfig, stage: &EncodingStage, iterations: &[Iteration]) -> i32 {
    if stage.last_crf.is_none() {
        return config.initial_crf;
    }

    if iterations.len() >= 2 {
        let target_vmaf = (config.vmaf_min + config.vmaf_max) / 2.0;
        match linear_fit_crf(iterations, target_vmaf) {
            Some(predicted) => {
                return predicted
                    .round()
                    .clamp(stage.crf_range_min as f64, stage.crf_range_max as f64)
                    as i32;
            }
            None => {
                warn!("Prediction failed, falling back to binary search.");
            }
        }
    }

    midpoint(stage.crf_range_min, stage.crf_range_max)
}

/// False when the VMAF gained (or lost) per CRF step against the previous
/// iteration falls below the efficiency threshold.
pub fn is_encoding_efficient(
    efficiency_threshold: f64,
    stage: &EncodingStage,
    current_vmaf: f64,
    crf_to_test: i32,
) -> bool {
    let (Some(last_vmaf), Some(last_crf)) = (stage.last_vmaf, stage.last_crf) else {
        return true;
    };

    let vmaf_delta = (current_vmaf - last_vmaf).abs();
    let crf_delta = (crf_to_test - last_crf).abs() as f64;
    if crf_delta > 0.0 {
        let vmaf_per_crf = vmaf_delta / crf_delta;
        if vmaf_per_crf < efficiency_threshold {
            warn!(
                "Low encoding efficiency: |dVMAF|/|dCRF| = {:.4} < {:.4} \
                 (last CRF {}, last VMAF {:.4})",
                vmaf_per_crf, efficiency_threshold, last_crf, last_vmaf
            );
            return false;
        }
    }
    true
}

/// Iteration whose VMAF is nearest the lower target bound.
pub fn iteration_nearest_vmaf_min(iterations: &[Iteration], vmaf_min: f64) -> Option<&Iteration> {
    iterations.iter().min_by(|a, b| {
        let distance_a = (a.vmaf() - vmaf_min).abs();
        let distance_b = (b.vmaf() - vmaf_min).abs();
        distance_a.partial_cmp(&distance_b).unwrap_or(Ordering::Equal)
    })
}

/// State machine driving one job's CRF search to a terminal stage.
pub struct CrfSearchEngine<'a, R> {
    config: &'a AppConfig,
    runner: R,
}

impl<'a, R: IterationRunner> CrfSearchEngine<'a, R> {
    pub fn new(config: &'a AppConfig, runner: R) -> Self {
        Self { config, runner }
    }

    fn persist(&self, job: &EncoderJob) -> Result<(), JournalError> {
        journal::write_journal(&job.job_data, &job.metadata_json_file_path)
    }

    /// Run the search loop until a terminal stage is reached and persisted.
    ///
    /// An iteration failure leaves the job at its last durably-recorded
    /// stage; re-running the engine resumes from there.
    pub fn run(&mut self, job: &mut EncoderJob) -> Result<(), SearchError> {
        let vmaf_target_min = self.config.vmaf_min;
        let vmaf_target_max = self.config.vmaf_max;

        loop {
            let stage = job.job_data.encoding_stage.clone();

            if stage.crf_range_min > stage.crf_range_max {
                warn!(
                    "CRF bounds are broken ({}-{}). Ending search for {}.",
                    stage.crf_range_min,
                    stage.crf_range_max,
                    job.source_file_path.display()
                );
                job.job_data.encoding_stage = EncodingStage::new(
                    EncodingStageName::UnreachableVmaf,
                    stage.crf_range_min,
                    stage.crf_range_max,
                )
                .with_last(stage.last_crf, stage.last_vmaf)
                .with_total_time(stage.job_total_time_seconds);
                self.persist(job)?;
                break;
            }

            let crf_to_test = predict_next_crf(self.config, &stage, &job.job_data.iterations);
            if crf_to_test < stage.crf_range_min || crf_to_test > stage.crf_range_max {
                warn!(
                    "Predicted CRF {} is outside the window {}-{}. Ending search for {}.",
                    crf_to_test,
                    stage.crf_range_min,
                    stage.crf_range_max,
                    job.source_file_path.display()
                );
                job.job_data.encoding_stage = EncodingStage::new(
                    EncodingStageName::UnreachableVmaf,
                    stage.crf_range_min,
                    stage.crf_range_max,
                )
                .with_last(stage.last_crf, stage.last_vmaf)
                .with_total_time(stage.job_total_time_seconds);
                self.persist(job)?;
                break;
            }

            info!(
                "Starting iteration for {}: window {}-{}, testing CRF {}",
                job.source_file_path.display(),
                stage.crf_range_min,
                stage.crf_range_max,
                crf_to_test
            );

            let iteration = self.runner.run_iteration(job, crf_to_test)?;
            let current_vmaf = iteration.vmaf();
            let iteration_seconds = iteration
                .execution_data
                .iteration_time_seconds
                .unwrap_or(iteration.execution_data.encoding_time_seconds);
            let total_seconds =
                stage.job_total_time_seconds.unwrap_or(0.0) + iteration_seconds;

            job.job_data.iterations.push(iteration);

            if vmaf_target_min <= current_vmaf && current_vmaf <= vmaf_target_max {
                info!(
                    "CRF search successful for {}: CRF {} at VMAF {:.2}%",
                    job.source_file_path.display(),
                    crf_to_test,
                    current_vmaf
                );
                job.job_data.encoding_stage =
                    EncodingStage::new(EncodingStageName::CrfFound, crf_to_test, crf_to_test)
                        .with_last(Some(crf_to_test), Some(current_vmaf))
                        .with_total_time(Some(total_seconds));
                self.persist(job)?;
                break;
            }

            if !is_encoding_efficient(
                self.config.efficiency_threshold,
                &stage,
                current_vmaf,
                crf_to_test,
            ) {
                // The window stays as-is; the iteration nearest the lower
                // VMAF bound is reported as the best result.
                let (best_crf, best_vmaf) =
                    iteration_nearest_vmaf_min(&job.job_data.iterations, vmaf_target_min)
                        .map(|best| (best.crf(), best.vmaf()))
                        .unwrap_or((crf_to_test, current_vmaf));

                job.job_data.encoding_stage = EncodingStage::new(
                    EncodingStageName::StoppedVmafDelta,
                    stage.crf_range_min,
                    stage.crf_range_max,
                )
                .with_last(Some(best_crf), Some(best_vmaf))
                .with_total_time(Some(total_seconds));
                self.persist(job)?;
                break;
            }

            let (new_min, new_max) = if current_vmaf > vmaf_target_max {
                info!(
                    "VMAF {:.2}% is above target max {:.2}%, increasing CRF.",
                    current_vmaf, vmaf_target_max
                );
                (crf_to_test + 1, stage.crf_range_max)
            } else {
                info!(
                    "VMAF {:.2}% is below target min {:.2}%, decreasing CRF.",
                    current_vmaf, vmaf_target_min
                );
                (stage.crf_range_min, crf_to_test - 1)
            };

            job.job_data.encoding_stage =
                EncodingStage::new(EncodingStageName::SearchingCrf, new_min, new_max)
                    .with_last(Some(crf_to_test), Some(current_vmaf))
                    .with_total_time(Some(total_seconds));
            self.persist(job)?;
        }

        Ok(())
    }
}
