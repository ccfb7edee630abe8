//! Encoder invocation: command assembly, supervised execution, embedded
//! provenance metadata, and the production iteration runner.
//!
//! Encoded outputs are named `<stem>_libx265_<preset>_crf_<N><ext>` in the
//! output directory. The x265 parameter string is tuned for VMAF evaluation
//! (`ssim-rd=1`, `aq-mode=3`).

use crate::environment;
use crate::fsutil;
use crate::locking::{self, LockMode, DEFAULT_LOCK_TIMEOUT};
use crate::model::{
    EncoderJob, EncoderSettings, ExecutionData, FfmpegMetadata, FileAttributes, Iteration,
};
use crate::probe;
use crate::resources::MemoryGovernor;
use crate::search::{IterationError, IterationRunner};
use crate::supervisor::{self, SupervisionOptions, SupervisorError};
use crate::vmaf;
use firefly_config::{AppConfig, AppMeta, EncoderPreset};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Encoder selected for every iteration.
pub const ENCODER_NAME: &str = "libx265";

/// Tag prefix of the provenance comment embedded in kept outputs.
pub const EMBEDDED_METADATA_PREFIX: &str = "encoder_metadata:";

/// Error type for embedded metadata writes.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// ffmpeg failed or was unavailable while rewriting the container.
    #[error("Metadata write failed: {0}")]
    Tool(String),

    #[error(transparent)]
    Lock(#[from] crate::locking::LockError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output path for one iteration: `<stem>_libx265_<preset>_crf_<N><ext>`.
pub fn output_file_path(
    output_dir: &Path,
    source_path: &Path,
    preset: EncoderPreset,
    crf: i32,
) -> PathBuf {
    let stem = source_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = source_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    output_dir.join(format!(
        "{}_{}_{}_crf_{}{}",
        stem, ENCODER_NAME, preset, crf, extension
    ))
}

/// x265 parameter string (VMAF-favourable tuning).
pub fn build_x265_params(crf: i32, threads: u32) -> String {
    format!("crf={}:pools={}:ssim-rd=1:aq-mode=3", crf, threads)
}

/// Assemble the full encoder argument list.
///
/// Colour metadata is passed through only when primaries, transfer and
/// colourspace are all present on the source; audio streams are copied,
/// stream/chapter/metadata maps preserved, and progress emitted on stderr.
pub fn build_encode_args(
    source_path: &Path,
    output_path: &Path,
    crf: i32,
    threads: u32,
    preset: EncoderPreset,
    source_metadata: &FfmpegMetadata,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-i".into(),
        source_path.display().to_string(),
        "-c:v".into(),
        ENCODER_NAME.into(),
        "-x265-params".into(),
        build_x265_params(crf, threads),
        "-preset".into(),
        preset.to_string(),
        "-fps_mode".into(),
        "passthrough".into(),
    ];

    if source_metadata.has_complete_color_metadata() {
        args.extend([
            "-color_primaries".into(),
            source_metadata.color_primaries.clone().unwrap_or_default(),
            "-color_trc".into(),
            source_metadata.color_trc.clone().unwrap_or_default(),
            "-colorspace".into(),
            source_metadata.colorspace.clone().unwrap_or_default(),
        ]);
    } else {
        warn!("Source video is missing colour metadata, encoding without explicit colour settings.");
    }

    args.extend([
        "-tag:v".into(),
        "hvc1".into(),
        "-c:a".into(),
        "copy".into(),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "0:a?".into(),
        "-map_metadata".into(),
        "0".into(),
        "-map_chapters".into(),
        "0".into(),
        "-movflags".into(),
        "+faststart".into(),
        output_path.display().to_string(),
        "-progress".into(),
        "pipe:2".into(),
        "-loglevel".into(),
        "quiet".into(),
        "-hide_banner".into(),
    ]);

    args
}

/// Shell-quoted command string recorded in iteration provenance.
pub fn readable_command(program: &str, args: &[String]) -> String {
    let full: Vec<&str> = std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect();
    shlex::try_join(full.iter().copied()).unwrap_or_else(|_| full.join(" "))
}

/// Run one supervised encode.
pub fn run_encode(
    args: &[String],
    total_duration_seconds: f64,
    config: &AppConfig,
    cancel: &AtomicBool,
) -> Result<(), SupervisorError> {
    let options = SupervisionOptions::for_encoder(config, total_duration_seconds);
    let mut governor =
        (!config.disable_resources_monitoring).then(|| MemoryGovernor::new(config));
    supervisor::run_supervised("ffmpeg", args, &options, governor.as_mut(), cancel)
}

/// Provenance record embedded into each kept output container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoEmbeddedMetadata {
    pub source_video_file_name: String,
    pub source_video_sha256_hash: String,
    pub encoding_software: String,
    pub encoding_software_version: String,
    pub ffmpeg_version: String,
    pub encoder: String,
    pub codec: String,
    pub preset: String,
    pub crf: i32,
    pub vmaf_from_source: f64,
    pub ffmpeg_command_used: String,
    pub encoding_finished_datetime: String,
}

impl VideoEmbeddedMetadata {
    pub fn from_iteration(meta: &AppMeta, job: &EncoderJob, iteration: &Iteration) -> Self {
        Self {
            source_video_file_name: job
                .job_data
                .source_video
                .file_attributes
                .file_name
                .clone(),
            source_video_sha256_hash: job.job_data.source_video.sha256_hash.clone(),
            encoding_software: meta.app_name.clone(),
            encoding_software_version: meta.app_version.clone(),
            ffmpeg_version: iteration.environment.ffmpeg_version.clone(),
            encoder: iteration.encoder_settings.encoder.clone(),
            codec: iteration.video_attributes.codec.clone(),
            preset: iteration.encoder_settings.preset.clone(),
            crf: iteration.encoder_settings.crf,
            vmaf_from_source: iteration.execution_data.source_to_encoded_vmaf_percent,
            ffmpeg_command_used: iteration.execution_data.ffmpeg_command_used.clone(),
            encoding_finished_datetime: iteration
                .execution_data
                .encoding_finished_datetime
                .clone(),
        }
    }
}

/// Sibling temp path for the metadata rewrite: `file.mp4` -> `file.tmp.mp4`.
fn temp_sibling(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    path.with_file_name(format!("{}.tmp{}", stem, extension))
}

fn cleanup_embed(temp_file: &Path, backup_file: &Path, original: &Path) {
    fsutil::delete_file(temp_file);
    if backup_file.is_file() {
        if !original.is_file() {
            let _ = std::fs::rename(backup_file, original);
        } else {
            fsutil::delete_file(backup_file);
        }
    }
}

/// Write the provenance comment into a completed output file.
///
/// Streams are copied into a sibling `.tmp` with the comment tag, then the
/// original is swapped out through a `.old` intermediate. On any failure the
/// temp and backup files are cleaned up and the original is left in place.
pub fn write_embedded_metadata(
    output_path: &Path,
    metadata: &VideoEmbeddedMetadata,
) -> Result<(), EmbedError> {
    let _lock =
        locking::acquire_file_operation_lock(output_path, LockMode::Exclusive, DEFAULT_LOCK_TIMEOUT)?;

    let json = serde_json::to_string(metadata).map_err(|e| EmbedError::Tool(e.to_string()))?;
    let temp_file = temp_sibling(output_path);
    let backup_file = output_path.with_extension("old");

    let run = Command::new("ffmpeg")
        .arg("-i")
        .arg(output_path)
        .arg("-metadata")
        .arg(format!("comment={}{}", EMBEDDED_METADATA_PREFIX, json))
        .args(["-c", "copy", "-map_metadata", "0", "-movflags", "+faststart"])
        .arg(&temp_file)
        .args(["-loglevel", "error", "-y"])
        .output();

    let output = match run {
        Ok(output) => output,
        Err(e) => {
            cleanup_embed(&temp_file, &backup_file, output_path);
            return Err(if e.kind() == ErrorKind::NotFound {
                EmbedError::Tool("ffmpeg not found".to_string())
            } else {
                EmbedError::Io(e)
            });
        }
    };

    if !output.status.success() {
        cleanup_embed(&temp_file, &backup_file, output_path);
        return Err(EmbedError::Tool(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let swap = (|| -> std::io::Result<()> {
        fsutil::delete_file(&backup_file);
        std::fs::rename(output_path, &backup_file)?;
        std::fs::rename(&temp_file, output_path)?;
        fsutil::delete_file(&backup_file);
        Ok(())
    })();

    match swap {
        Ok(()) => {
            info!("Wrote embedded metadata for {}", output_path.display());
            Ok(())
        }
        Err(e) => {
            cleanup_embed(&temp_file, &backup_file, output_path);
            Err(EmbedError::Io(e))
        }
    }
}

/// Production iteration runner: one encode, one VMAF pass, one probe, one
/// hash, with low-resource retries around the supervised phases.
pub struct FfmpegIterationRunner<'a> {
    config: &'a AppConfig,
    meta: &'a AppMeta,
    cancel: &'a AtomicBool,
}

impl<'a> FfmpegIterationRunner<'a> {
    pub fn new(config: &'a AppConfig, meta: &'a AppMeta, cancel: &'a AtomicBool) -> Self {
        Self {
            config,
            meta,
            cancel,
        }
    }

    fn restart_delay(&self) -> Duration {
        Duration::from_secs_f64(self.config.low_resources_restart_delay_seconds)
    }
}

impl IterationRunner for FfmpegIterationRunner<'_> {
    fn run_iteration(&mut self, job: &EncoderJob, crf: i32) -> Result<Iteration, IterationError> {
        let config = self.config;
        let source_path = &job.source_file_path;

        let source_attributes = job
            .job_data
            .source_video
            .video_attributes
            .clone()
            .ok_or_else(|| {
                IterationError::Encoding("Source video attributes missing.".to_string())
            })?;
        let source_metadata = job
            .job_data
            .source_video
            .ffmpeg_metadata
            .clone()
            .unwrap_or_default();

        let threads = environment::available_cpu_threads(config);
        let output_path =
            output_file_path(&config.output_dir, source_path, config.encoder_preset, crf);

        info!(
            "Encoding iteration: {} at CRF {} ({} threads) -> {}",
            source_path.display(),
            crf,
            threads,
            output_path.display()
        );

        let args = build_encode_args(
            source_path,
            &output_path,
            crf,
            threads,
            config.encoder_preset,
            &source_metadata,
        );
        let command_string = readable_command("ffmpeg", &args);

        let mut encoding_seconds = 0.0;
        loop {
            fsutil::delete_file_locked(&output_path)?;
            let attempt_start = Instant::now();

            match run_encode(&args, source_attributes.duration_seconds, config, self.cancel) {
                Ok(()) => {
                    encoding_seconds += attempt_start.elapsed().as_secs_f64();
                    break;
                }
                Err(SupervisorError::LowResources(reason)) => {
                    encoding_seconds += attempt_start.elapsed().as_secs_f64();
                    warn!(
                        "Encoding stopped due to low resources ({}). Sleeping for {} seconds...",
                        reason, config.low_resources_restart_delay_seconds
                    );
                    std::thread::sleep(self.restart_delay());
                    info!("Retrying encode iteration...");
                }
                Err(e) => {
                    fsutil::delete_file(&output_path);
                    return Err(e.into());
                }
            }
        }

        let encoding_finished = chrono::Utc::now().to_rfc3339();

        if !output_path.is_file() {
            return Err(IterationError::Encoding(
                "Encoding failed, output file not found.".to_string(),
            ));
        }

        info!(
            "Encoding finished. Calculating VMAF for {}",
            output_path.display()
        );

        let vmaf_threads = environment::available_cpu_threads(config);
        let mut vmaf_seconds = 0.0;
        let vmaf_value = loop {
            let attempt_start = Instant::now();
            match vmaf::compute_vmaf(
                source_path,
                &output_path,
                &source_attributes,
                vmaf_threads,
                config,
                self.cancel,
            ) {
                Ok(score) => {
                    vmaf_seconds += attempt_start.elapsed().as_secs_f64();
                    break score;
                }
                Err(e) if e.is_low_resources() => {
                    vmaf_seconds += attempt_start.elapsed().as_secs_f64();
                    warn!(
                        "VMAF calculation stopped due to low resources. Sleeping for {} seconds...",
                        config.low_resources_restart_delay_seconds
                    );
                    std::thread::sleep(self.restart_delay());
                    info!("Retrying VMAF calculation...");
                }
                Err(e) => return Err(e.into()),
            }
        };

        let (video_attributes, ffmpeg_metadata) = probe::probe_video(&output_path)?;
        let file_name = output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let iteration = Iteration {
            file_attributes: FileAttributes {
                file_name,
                file_size_bytes: fsutil::file_size_bytes(&output_path)?,
            },
            sha256_hash: fsutil::sha256_hex(&output_path)?,
            video_attributes,
            encoder_settings: EncoderSettings {
                encoder: ENCODER_NAME.to_string(),
                preset: config.encoder_preset.to_string(),
                crf,
                cpu_threads_to_use: threads,
            },
            execution_data: ExecutionData {
                ffmpeg_command_used: command_string,
                source_to_encoded_vmaf_percent: vmaf_value,
                encoding_finished_datetime: encoding_finished,
                encoding_time_seconds: encoding_seconds,
                calculating_vmaf_time_seconds: Some(vmaf_seconds),
                iteration_time_seconds: Some(encoding_seconds + vmaf_seconds),
                vmaf_cpu_threads_used: Some(vmaf_threads),
            },
            environment: environment::capture_environment(self.meta),
            ffmpeg_metadata,
        };

        let embedded = VideoEmbeddedMetadata::from_iteration(self.meta, job, &iteration);
        if let Err(e) = write_embedded_metadata(&output_path, &embedded) {
            warn!(
                "Error writing embedded metadata to {}: {}",
                output_path.display(),
                e
            );
        }

        info!(
            "Iteration encoded: {} at CRF {} scored VMAF {:.2}%",
            source_path.display(),
            crf,
            vmaf_value
        );

        Ok(iteration)
    }
}
