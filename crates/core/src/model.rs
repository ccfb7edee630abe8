//! Data model for encoding jobs and their on-disk journals.
//!
//! The structs in this module serialize to the schema v3 journal shape.
//! `JobData` is the durable unit; `EncoderJob` is the runtime handle that
//! owns it together with the source and journal paths.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Name and size of a file as captured at discovery or encode time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileAttributes {
    pub file_name: String,
    pub file_size_bytes: u64,
}

/// Probed attributes of a single video stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoAttributes {
    pub codec: String,
    pub width_px: u32,
    pub height_px: u32,
    pub duration_seconds: f64,
    pub fps: f64,
    pub average_bitrate_kilobits_per_second: f64,
}

/// HDR variants detectable from stream metadata.
///
/// PQ is the transfer family shared by HDR10, HDR10+ and Dolby Vision;
/// HLG is the SDR-compatible broadcast variant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HdrType {
    DolbyVision,
    Hdr10,
    Hdr10Plus,
    Hlg,
    Pq,
}

/// Container-level metadata probed from the source or an encoded output.
///
/// Undetermined fields stay `None`; the pixel aspect ratio falls back to
/// `"1:1"` at probe time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FfmpegMetadata {
    pub pixel_aspect_ratio: Option<String>,
    pub pixel_format: Option<String>,
    pub chroma_sample_location: Option<String>,
    pub color_primaries: Option<String>,
    pub color_trc: Option<String>,
    pub colorspace: Option<String>,
    pub profile: Option<String>,
    pub level: Option<i64>,
    #[serde(default)]
    pub hdr_types: BTreeSet<HdrType>,
}

impl FfmpegMetadata {
    /// True when any HDR variant was detected; an empty set means SDR.
    pub fn is_hdr(&self) -> bool {
        !self.hdr_types.is_empty()
    }

    /// True when all three colour fields needed for encode pass-through are present.
    pub fn has_complete_color_metadata(&self) -> bool {
        self.color_primaries.is_some() && self.color_trc.is_some() && self.colorspace.is_some()
    }
}

/// A discovered source file with its stable content hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceVideo {
    pub file_attributes: FileAttributes,
    /// SHA-256 over the exact bytes of the source at discovery time.
    pub sha256_hash: String,
    #[serde(default)]
    pub video_attributes: Option<VideoAttributes>,
    #[serde(default)]
    pub ffmpeg_metadata: Option<FfmpegMetadata>,
}

/// Encoder knobs used for one iteration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderSettings {
    pub encoder: String,
    pub preset: String,
    pub crf: i32,
    pub cpu_threads_to_use: u32,
}

/// Measurements taken while executing one iteration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionData {
    pub ffmpeg_command_used: String,
    /// VMAF of the encoded output against the source, in [0, 100].
    pub source_to_encoded_vmaf_percent: f64,
    /// RFC 3339 UTC timestamp taken when the encode finished.
    pub encoding_finished_datetime: String,
    /// Wall time of the encode including low-resource retries.
    pub encoding_time_seconds: f64,
    #[serde(default)]
    pub calculating_vmaf_time_seconds: Option<f64>,
    #[serde(default)]
    pub iteration_time_seconds: Option<f64>,
    #[serde(default)]
    pub vmaf_cpu_threads_used: Option<u32>,
}

/// Snapshot of the host and tool versions an iteration ran under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    pub script_version: String,
    pub ffmpeg_version: String,
    pub encoder_version: String,
    pub cpu_name: String,
    pub cpu_threads: u32,
}

/// Immutable record of one attempted encode. Append-only within a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Iteration {
    pub file_attributes: FileAttributes,
    pub sha256_hash: String,
    pub video_attributes: VideoAttributes,
    pub encoder_settings: EncoderSettings,
    pub execution_data: ExecutionData,
    pub environment: Environment,
    pub ffmpeg_metadata: FfmpegMetadata,
}

impl Iteration {
    pub fn crf(&self) -> i32 {
        self.encoder_settings.crf
    }

    pub fn vmaf(&self) -> f64 {
        self.execution_data.source_to_encoded_vmaf_percent
    }
}

/// Named position of a job in the state machine.
///
/// Negative stage numbers are terminal error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodingStageName {
    #[serde(rename = "job_prepared")]
    Prepared,
    #[serde(rename = "metadata_extracted")]
    MetadataExtracted,
    #[serde(rename = "searching_crf")]
    SearchingCrf,
    #[serde(rename = "perfect_crf_found")]
    CrfFound,
    #[serde(rename = "encoding_completed")]
    Completed,
    #[serde(rename = "encoding_failed")]
    Failed,
    #[serde(rename = "stopped_vmaf_delta")]
    StoppedVmafDelta,
    #[serde(rename = "unreachable_vmaf")]
    UnreachableVmaf,
    #[serde(rename = "skipped_is_hdr_video")]
    SkippedIsHdrVideo,
}

impl EncodingStageName {
    /// Stage number encoding: positive for forward progress, negative for errors.
    pub fn stage_number(self) -> i32 {
        match self {
            EncodingStageName::Prepared => 1,
            EncodingStageName::MetadataExtracted => 2,
            EncodingStageName::SearchingCrf => 3,
            EncodingStageName::CrfFound => 4,
            EncodingStageName::Completed => 5,
            EncodingStageName::Failed => -1,
            EncodingStageName::StoppedVmafDelta => -2,
            EncodingStageName::UnreachableVmaf => -3,
            EncodingStageName::SkippedIsHdrVideo => -4,
        }
    }

    pub fn is_error(self) -> bool {
        self.stage_number() < 0
    }

    /// Safe errors are terminal kinds where a best-effort output (or the
    /// original) can be retained for the user.
    pub fn is_safe_error(self) -> bool {
        matches!(
            self,
            EncodingStageName::StoppedVmafDelta
                | EncodingStageName::UnreachableVmaf
                | EncodingStageName::SkippedIsHdrVideo
        )
    }

    pub fn is_terminal(self) -> bool {
        self.is_error() || matches!(self, EncodingStageName::Completed)
    }
}

impl std::fmt::Display for EncodingStageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EncodingStageName::Prepared => "job_prepared",
            EncodingStageName::MetadataExtracted => "metadata_extracted",
            EncodingStageName::SearchingCrf => "searching_crf",
            EncodingStageName::CrfFound => "perfect_crf_found",
            EncodingStageName::Completed => "encoding_completed",
            EncodingStageName::Failed => "encoding_failed",
            EncodingStageName::StoppedVmafDelta => "stopped_vmaf_delta",
            EncodingStageName::UnreachableVmaf => "unreachable_vmaf",
            EncodingStageName::SkippedIsHdrVideo => "skipped_is_hdr_video",
        };
        write!(f, "{}", s)
    }
}

/// The job's position in the state machine plus the current CRF search window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingStage {
    pub stage_number_from_1: i32,
    pub stage_name: EncodingStageName,
    pub crf_range_min: i32,
    pub crf_range_max: i32,
    #[serde(default)]
    pub last_vmaf: Option<f64>,
    #[serde(default)]
    pub last_crf: Option<i32>,
    #[serde(default)]
    pub job_total_time_seconds: Option<f64>,
}

impl EncodingStage {
    /// Build a stage; the stage number is derived from the name so the
    /// negative-iff-error invariant holds by construction.
    pub fn new(name: EncodingStageName, crf_range_min: i32, crf_range_max: i32) -> Self {
        Self {
            stage_number_from_1: name.stage_number(),
            stage_name: name,
            crf_range_min,
            crf_range_max,
            last_vmaf: None,
            last_crf: None,
            job_total_time_seconds: None,
        }
    }

    pub fn with_last(mut self, last_crf: Option<i32>, last_vmaf: Option<f64>) -> Self {
        self.last_crf = last_crf;
        self.last_vmaf = last_vmaf;
        self
    }

    pub fn with_total_time(mut self, seconds: Option<f64>) -> Self {
        self.job_total_time_seconds = seconds;
        self
    }
}

/// Persisted unit of work: the journal content for one source video.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobData {
    pub schema_version: u32,
    pub source_video: SourceVideo,
    pub encoding_stage: EncodingStage,
    #[serde(default)]
    pub iterations: Vec<Iteration>,
}

impl JobData {
    /// All content hashes this job knows about: the source plus every
    /// iteration output. Used for discovery dedup.
    pub fn known_hashes(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.source_video.sha256_hash.as_str())
            .chain(self.iterations.iter().map(|i| i.sha256_hash.as_str()))
    }

    /// The iteration matching the collapsed CRF window and `last_vmaf`,
    /// if the search reached a successful terminal.
    pub fn final_iteration(&self) -> Option<&Iteration> {
        let stage = &self.encoding_stage;
        if stage.crf_range_min != stage.crf_range_max {
            return None;
        }
        let last_vmaf = stage.last_vmaf?;
        self.iterations
            .iter()
            .find(|i| i.crf() == stage.crf_range_min && i.vmaf() == last_vmaf)
    }
}

/// Runtime handle for one job: owns the journal content and both paths.
#[derive(Debug, Clone)]
pub struct EncoderJob {
    pub source_file_path: PathBuf,
    pub metadata_json_file_path: PathBuf,
    pub job_data: JobData,
    pub priority: f64,
}

impl EncoderJob {
    pub fn new(source_file_path: PathBuf, metadata_json_file_path: PathBuf, job_data: JobData) -> Self {
        Self {
            source_file_path,
            metadata_json_file_path,
            job_data,
            priority: 1.0,
        }
    }

    pub fn stage_name(&self) -> EncodingStageName {
        self.job_data.encoding_stage.stage_name
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn make_video_attributes(width: u32, height: u32, bitrate_kbps: f64) -> VideoAttributes {
        VideoAttributes {
            codec: "h264".to_string(),
            width_px: width,
            height_px: height,
            duration_seconds: 120.0,
            fps: 29.97,
            average_bitrate_kilobits_per_second: bitrate_kbps,
        }
    }

    pub fn make_source_video(file_name: &str, hash: &str) -> SourceVideo {
        SourceVideo {
            file_attributes: FileAttributes {
                file_name: file_name.to_string(),
                file_size_bytes: 100 * 1024 * 1024,
            },
            sha256_hash: hash.to_string(),
            video_attributes: Some(make_video_attributes(1920, 1080, 8000.0)),
            ffmpeg_metadata: Some(FfmpegMetadata::default()),
        }
    }

    pub fn make_iteration(file_name: &str, crf: i32, vmaf: f64) -> Iteration {
        Iteration {
            file_attributes: FileAttributes {
                file_name: file_name.to_string(),
                file_size_bytes: 40 * 1024 * 1024,
            },
            sha256_hash: format!("hash_of_{}", file_name),
            video_attributes: make_video_attributes(1920, 1080, 3500.0),
            encoder_settings: EncoderSettings {
                encoder: "libx265".to_string(),
                preset: "veryslow".to_string(),
                crf,
                cpu_threads_to_use: 16,
            },
            execution_data: ExecutionData {
                ffmpeg_command_used: "ffmpeg -i in.mp4 out.mp4".to_string(),
                source_to_encoded_vmaf_percent: vmaf,
                encoding_finished_datetime: "2025-06-01T12:00:00+00:00".to_string(),
                encoding_time_seconds: 600.0,
                calculating_vmaf_time_seconds: Some(60.0),
                iteration_time_seconds: Some(660.0),
                vmaf_cpu_threads_used: Some(16),
            },
            environment: Environment {
                script_version: "0.1.0".to_string(),
                ffmpeg_version: "7.1".to_string(),
                encoder_version: "unknown".to_string(),
                cpu_name: "test-cpu".to_string(),
                cpu_threads: 16,
            },
            ffmpeg_metadata: FfmpegMetadata::default(),
        }
    }

    pub fn make_job_data(file_name: &str, hash: &str) -> JobData {
        JobData {
            schema_version: 3,
            source_video: make_source_video(file_name, hash),
            encoding_stage: EncodingStage::new(EncodingStageName::Prepared, 12, 36),
            iterations: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use proptest::prelude::*;

    const ALL_STAGE_NAMES: &[EncodingStageName] = &[
        EncodingStageName::Prepared,
        EncodingStageName::MetadataExtracted,
        EncodingStageName::SearchingCrf,
        EncodingStageName::CrfFound,
        EncodingStageName::Completed,
        EncodingStageName::Failed,
        EncodingStageName::StoppedVmafDelta,
        EncodingStageName::UnreachableVmaf,
        EncodingStageName::SkippedIsHdrVideo,
    ];

    #[test]
    fn test_stage_numbers() {
        assert_eq!(EncodingStageName::Prepared.stage_number(), 1);
        assert_eq!(EncodingStageName::MetadataExtracted.stage_number(), 2);
        assert_eq!(EncodingStageName::SearchingCrf.stage_number(), 3);
        assert_eq!(EncodingStageName::CrfFound.stage_number(), 4);
        assert_eq!(EncodingStageName::Completed.stage_number(), 5);
        assert_eq!(EncodingStageName::Failed.stage_number(), -1);
        assert_eq!(EncodingStageName::StoppedVmafDelta.stage_number(), -2);
        assert_eq!(EncodingStageName::UnreachableVmaf.stage_number(), -3);
        assert_eq!(EncodingStageName::SkippedIsHdrVideo.stage_number(), -4);
    }

    #[test]
    fn test_stage_serde_names() {
        let pairs = [
            (EncodingStageName::Prepared, "\"job_prepared\""),
            (EncodingStageName::MetadataExtracted, "\"metadata_extracted\""),
            (EncodingStageName::SearchingCrf, "\"searching_crf\""),
            (EncodingStageName::CrfFound, "\"perfect_crf_found\""),
            (EncodingStageName::Completed, "\"encoding_completed\""),
            (EncodingStageName::Failed, "\"encoding_failed\""),
            (EncodingStageName::StoppedVmafDelta, "\"stopped_vmaf_delta\""),
            (EncodingStageName::UnreachableVmaf, "\"unreachable_vmaf\""),
            (EncodingStageName::SkippedIsHdrVideo, "\"skipped_is_hdr_video\""),
        ];

        for (name, expected_json) in pairs {
            assert_eq!(serde_json::to_string(&name).unwrap(), expected_json);
            let parsed: EncodingStageName = serde_json::from_str(expected_json).unwrap();
            assert_eq!(parsed, name);
        }
    }

    // Negative stage number iff the stage name is an error kind, for every stage.
    #[test]
    fn test_negative_number_iff_error() {
        for &name in ALL_STAGE_NAMES {
            let stage = EncodingStage::new(name, 12, 36);
            assert_eq!(
                stage.stage_number_from_1 < 0,
                name.is_error(),
                "stage {} breaks the negative-iff-error invariant",
                name
            );
        }
    }

    #[test]
    fn test_safe_error_classification() {
        assert!(EncodingStageName::StoppedVmafDelta.is_safe_error());
        assert!(EncodingStageName::UnreachableVmaf.is_safe_error());
        assert!(EncodingStageName::SkippedIsHdrVideo.is_safe_error());
        assert!(!EncodingStageName::Failed.is_safe_error());
        assert!(!EncodingStageName::Completed.is_safe_error());
        assert!(!EncodingStageName::SearchingCrf.is_safe_error());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(EncodingStageName::Completed.is_terminal());
        assert!(EncodingStageName::Failed.is_terminal());
        assert!(EncodingStageName::UnreachableVmaf.is_terminal());
        assert!(!EncodingStageName::Prepared.is_terminal());
        assert!(!EncodingStageName::SearchingCrf.is_terminal());
        assert!(!EncodingStageName::CrfFound.is_terminal());
    }

    #[test]
    fn test_known_hashes_cover_source_and_iterations() {
        let mut job = make_job_data("film.mp4", "source_hash");
        job.iterations.push(make_iteration("film_crf26.mp4", 26, 95.0));
        job.iterations.push(make_iteration("film_crf25.mp4", 25, 96.5));

        let hashes: Vec<&str> = job.known_hashes().collect();
        assert_eq!(
            hashes,
            vec![
                "source_hash",
                "hash_of_film_crf26.mp4",
                "hash_of_film_crf25.mp4"
            ]
        );
    }

    #[test]
    fn test_final_iteration_requires_collapsed_window() {
        let mut job = make_job_data("film.mp4", "source_hash");
        job.iterations.push(make_iteration("film_crf26.mp4", 26, 96.4));

        // Window still open: no final iteration.
        job.encoding_stage = EncodingStage::new(EncodingStageName::SearchingCrf, 12, 36)
            .with_last(Some(26), Some(96.4));
        assert!(job.final_iteration().is_none());

        // Collapsed window pointing at the recorded iteration.
        job.encoding_stage = EncodingStage::new(EncodingStageName::CrfFound, 26, 26)
            .with_last(Some(26), Some(96.4));
        let final_iter = job.final_iteration().expect("final iteration expected");
        assert_eq!(final_iter.crf(), 26);
    }

    #[test]
    fn test_hdr_helpers() {
        let mut metadata = FfmpegMetadata::default();
        assert!(!metadata.is_hdr());

        metadata.hdr_types.insert(HdrType::Pq);
        metadata.hdr_types.insert(HdrType::Hdr10);
        assert!(metadata.is_hdr());
    }

    #[test]
    fn test_color_metadata_completeness() {
        let mut metadata = FfmpegMetadata {
            color_primaries: Some("bt709".to_string()),
            color_trc: Some("bt709".to_string()),
            ..Default::default()
        };
        assert!(!metadata.has_complete_color_metadata());

        metadata.colorspace = Some("bt709".to_string());
        assert!(metadata.has_complete_color_metadata());
    }

    fn stage_name_strategy() -> impl Strategy<Value = EncodingStageName> {
        proptest::sample::select(ALL_STAGE_NAMES.to_vec())
    }

    fn job_data_strategy() -> impl Strategy<Value = JobData> {
        (
            "[a-zA-Z0-9_]{1,20}",
            "[a-f0-9]{64}",
            stage_name_strategy(),
            0i32..=51,
            0i32..=51,
            prop::option::of(0.0f64..100.0),
            prop::option::of(0i32..=51),
            prop::collection::vec((0i32..=51, 0.0f64..100.0), 0..4),
        )
            .prop_map(
                |(stem, hash, stage_name, min, max, last_vmaf, last_crf, iteration_seeds)| {
                    let file_name = format!("{}.mp4", stem);
                    let iterations = iteration_seeds
                        .into_iter()
                        .enumerate()
                        .map(|(index, (crf, vmaf))| {
                            make_iteration(&format!("{}_iter{}.mp4", stem, index), crf, vmaf)
                        })
                        .collect();
                    JobData {
                        schema_version: 3,
                        source_video: make_source_video(&file_name, &hash),
                        encoding_stage: EncodingStage::new(stage_name, min, max)
                            .with_last(last_crf, last_vmaf),
                        iterations,
                    }
                },
            )
    }

    // Write-then-read of any JobData yields an equal object.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_job_data_json_round_trip(job in job_data_strategy()) {
            let json = serde_json::to_string_pretty(&job).expect("JobData should serialize");
            let parsed: JobData = serde_json::from_str(&json).expect("JSON should parse back");
            prop_assert_eq!(job, parsed);
        }

        #[test]
        fn prop_stage_number_matches_name(name in stage_name_strategy(), min in 0i32..=51, max in 0i32..=51) {
            let stage = EncodingStage::new(name, min, max);
            prop_assert_eq!(stage.stage_number_from_1, name.stage_number());
            prop_assert_eq!(stage.stage_number_from_1 < 0, name.is_error());
        }
    }
}
