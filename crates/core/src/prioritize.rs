//! Job prioritization: composable pure rules scoring processing order.
//!
//! Every rule contributes a multiplier to a base score of 1.0; jobs are
//! processed in descending score order.

use crate::model::EncoderJob;
use std::cmp::Ordering;
use tracing::{debug, info};

/// A pure scoring rule. 1.0 is neutral, below deprioritizes, above promotes.
pub trait PriorityRule: Send + Sync {
    fn priority_multiplier(&self, job: &EncoderJob) -> f64;
}

/// Deprioritizes sources under 1000 kb/s: already-compressed material is a
/// poor candidate for further compression.
pub struct LowBitrateRule;

impl PriorityRule for LowBitrateRule {
    fn priority_multiplier(&self, job: &EncoderJob) -> f64 {
        let Some(attributes) = &job.job_data.source_video.video_attributes else {
            return 1.0;
        };
        if attributes.average_bitrate_kilobits_per_second < 1000.0 {
            0.1
        } else {
            1.0
        }
    }
}

/// Promotes high resolutions, which compress the most effectively.
pub struct ResolutionRule;

impl PriorityRule for ResolutionRule {
    fn priority_multiplier(&self, job: &EncoderJob) -> f64 {
        let Some(attributes) = &job.job_data.source_video.video_attributes else {
            return 1.0;
        };
        match attributes.height_px {
            h if h >= 2160 => 2.0,
            h if h >= 1080 => 1.5,
            h if h >= 720 => 1.0,
            _ => 0.5,
        }
    }
}

/// Applies a rule list to a job batch.
pub struct JobPrioritizer {
    rules: Vec<Box<dyn PriorityRule>>,
}

impl Default for JobPrioritizer {
    fn default() -> Self {
        Self {
            rules: vec![Box::new(LowBitrateRule), Box::new(ResolutionRule)],
        }
    }
}

impl JobPrioritizer {
    pub fn new(rules: Vec<Box<dyn PriorityRule>>) -> Self {
        Self { rules }
    }

    /// Compute and store the priority for every job.
    pub fn prioritize(&self, jobs: &mut [EncoderJob]) {
        if jobs.is_empty() {
            return;
        }

        info!("Calculating priority for {} jobs...", jobs.len());
        for job in jobs.iter_mut() {
            let mut score = 1.0;
            for rule in &self.rules {
                score *= rule.priority_multiplier(job);
            }
            job.priority = score;
            debug!(
                "Job: {}, Priority: {:.4}",
                job.job_data.source_video.file_attributes.file_name,
                score
            );
        }
    }
}

/// Sort jobs by descending priority; ties break by file name for a
/// deterministic processing order.
pub fn sort_by_priority(jobs: &mut [EncoderJob]) {
    jobs.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                a.job_data
                    .source_video
                    .file_attributes
                    .file_name
                    .cmp(&b.job_data.source_video.file_attributes.file_name)
            })
    });
}
