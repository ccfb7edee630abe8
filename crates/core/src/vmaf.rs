//! VMAF computation against the source, supervised like an encode.
//!
//! The filter graph normalizes both inputs to `yuv420p` and rescales the
//! encoded file to the reference's frame geometry, so container metadata
//! inconsistencies cannot skew the score. One of two NEG models is selected
//! by source geometry; the pooled mean is parsed from a JSON log written to
//! a temporary path.

use crate::fsutil;
use crate::model::VideoAttributes;
use crate::supervisor::{self, SupervisionOptions, SupervisorError};
use firefly_config::AppConfig;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

/// NEG model for sources up to 1920x1080.
pub const VMAF_MODEL_HD: &str = "vmaf_v0.6.1neg.json";

/// NEG model for sources above 1920x1080.
pub const VMAF_MODEL_4K: &str = "vmaf_4k_v0.6.1neg.json";

/// Error type for VMAF computation.
#[derive(Debug, Error)]
pub enum VmafError {
    #[error("Reference file not found: {}", .0.display())]
    ReferenceNotFound(PathBuf),

    #[error("Distorted file not found: {}", .0.display())]
    DistortedNotFound(PathBuf),

    #[error("VMAF model not found at: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// The JSON log could not be read back into a score.
    #[error("Failed to parse VMAF log: {0}")]
    ScoreParse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VmafError {
    /// True when the run was stopped by the memory governor and may be retried.
    pub fn is_low_resources(&self) -> bool {
        matches!(self, VmafError::Supervisor(SupervisorError::LowResources(_)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, VmafError::Supervisor(SupervisorError::Cancelled))
    }
}

/// Select the NEG model by source frame geometry.
pub fn select_model(width_px: u32, height_px: u32) -> &'static str {
    if width_px > 1920 || height_px > 1080 {
        VMAF_MODEL_4K
    } else {
        VMAF_MODEL_HD
    }
}

/// Filter graph normalizing both inputs and running libvmaf.
///
/// `[0:v]` is the reference, `[1:v]` the distorted input; the distorted
/// stream is rescaled to the reference geometry before comparison.
pub fn build_vmaf_filter(model_path: &str, n_threads: u32, log_path: &str) -> String {
    format!(
        "[1:v][0:v]scale2ref=flags=bicubic[dist][ref];\
         [dist]format=yuv420p[dist_f];\
         [ref]format=yuv420p[ref_f];\
         [dist_f][ref_f]libvmaf=model='path={}:n_threads={}':log_path='{}':log_fmt=json",
        model_path, n_threads, log_path
    )
}

/// ffmpeg argument list for one VMAF run.
pub fn build_vmaf_args(reference: &Path, distorted: &Path, filter: &str) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-i".to_string(),
        reference.display().to_string(),
        "-i".to_string(),
        distorted.display().to_string(),
        "-lavfi".to_string(),
        filter.to_string(),
        "-f".to_string(),
        "null".to_string(),
        "-".to_string(),
    ]
}

/// Extract `pooled_metrics.vmaf.mean` from a libvmaf JSON log.
pub fn parse_vmaf_score(log_json: &str) -> Result<f64, VmafError> {
    let value: Value =
        serde_json::from_str(log_json).map_err(|e| VmafError::ScoreParse(e.to_string()))?;

    value
        .get("pooled_metrics")
        .and_then(|v| v.get("vmaf"))
        .and_then(|v| v.get("mean"))
        .and_then(Value::as_f64)
        .ok_or_else(|| VmafError::ScoreParse("missing pooled_metrics.vmaf.mean".to_string()))
}

fn temp_log_path() -> PathBuf {
    let epoch_seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    std::env::temp_dir().join(format!(
        "vmaf_log_{}_{}.json",
        std::process::id(),
        epoch_seconds
    ))
}

/// Compare the encoded file against the source, returning the pooled VMAF mean.
///
/// Supervised identically to encodes, under the VMAF process priority.
pub fn compute_vmaf(
    reference: &Path,
    distorted: &Path,
    source_attributes: &VideoAttributes,
    n_threads: u32,
    config: &AppConfig,
    cancel: &AtomicBool,
) -> Result<f64, VmafError> {
    if !reference.is_file() {
        return Err(VmafError::ReferenceNotFound(reference.to_path_buf()));
    }
    if !distorted.is_file() {
        return Err(VmafError::DistortedNotFound(distorted.to_path_buf()));
    }

    let model_name = select_model(source_attributes.width_px, source_attributes.height_px);
    let model_path = config.vmaf_models_dir.join(model_name);
    if !model_path.is_file() {
        return Err(VmafError::ModelNotFound(model_path));
    }

    let log_path = temp_log_path();
    let filter = build_vmaf_filter(
        &model_path.display().to_string(),
        n_threads,
        &log_path.display().to_string(),
    );
    let args = build_vmaf_args(reference, distorted, &filter);

    info!("Using {} threads for VMAF calculation.", n_threads);
    debug!("Running VMAF with model {}", model_name);

    let options = SupervisionOptions::for_vmaf(config);
    let mut governor = (!config.disable_resources_monitoring)
        .then(|| crate::resources::MemoryGovernor::new(config));

    let run_result = supervisor::run_supervised("ffmpeg", &args, &options, governor.as_mut(), cancel);

    let score = match run_result {
        Ok(()) => fs::read_to_string(&log_path)
            .map_err(VmafError::Io)
            .and_then(|content| parse_vmaf_score(&content)),
        Err(e) => Err(e.into()),
    };

    fsutil::delete_file(&log_path);
    score
}
