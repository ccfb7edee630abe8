//! Firefly
//!
//! Resumable, per-file quality-targeted video transcoding orchestrator.
//! For each source video the pipeline finds the highest CRF whose VMAF
//! against the source lies within a configured band, persisting every
//! decision to a per-job journal so interrupted work resumes cleanly.

pub mod compose;
pub mod driver;
pub mod encoder;
pub mod environment;
pub mod fsutil;
pub mod journal;
pub mod locking;
pub mod migrate;
pub mod model;
pub mod prioritize;
pub mod probe;
pub mod resources;
pub mod search;
pub mod supervisor;
pub mod validate;
pub mod vmaf;

pub use firefly_config as config;
pub use firefly_config::{AppConfig, AppMeta, ConfigError, EncoderPreset, ProcessPriority};

pub use compose::{compose_jobs, is_mp4, ComposeError};
pub use driver::{DriverError, DriverSummary, PipelineDriver};
pub use encoder::{
    build_encode_args, build_x265_params, output_file_path, readable_command,
    write_embedded_metadata, EmbedError, FfmpegIterationRunner, VideoEmbeddedMetadata,
    ENCODER_NAME,
};
pub use environment::{available_cpu_threads, capture_environment, parse_ffmpeg_version};
pub use fsutil::{delete_file, file_size_bytes, sha256_hex, FileOpError};
pub use journal::{
    jobs_directory, journal_path, read_journal, write_journal, JournalError, JOB_FILE_SUFFIX,
};
pub use locking::{
    acquire_application_lock, acquire_file_operation_lock, acquire_job_lock,
    acquire_metadata_lock, FileLockGuard, LockError, LockMode, APPLICATION_LOCK_NAME,
    DEFAULT_LOCK_TIMEOUT, JOB_LOCK_PREFIX,
};
pub use migrate::{JobDataMigrator, MigrationError, MigrationPipeline, V1ToV3Migrator};
pub use model::{
    EncoderJob, EncoderSettings, EncodingStage, EncodingStageName, Environment, ExecutionData,
    FfmpegMetadata, FileAttributes, HdrType, Iteration, JobData, SourceVideo, VideoAttributes,
};
pub use prioritize::{
    sort_by_priority, JobPrioritizer, LowBitrateRule, PriorityRule, ResolutionRule,
};
pub use probe::{parse_probe_output, probe_video, ProbeError};
pub use resources::{
    is_memory_low, nice_value, set_process_priority, terminate_process_tree, MemoryGovernor,
    MemorySample, ResourceError,
};
pub use search::{
    is_encoding_efficient, iteration_nearest_vmaf_min, linear_fit_crf, midpoint,
    predict_next_crf, CrfSearchEngine, IterationError, IterationRunner, SearchError,
};
pub use supervisor::{
    format_duration, parse_out_time_ms, render_progress, run_supervised, SupervisionOptions,
    SupervisorError,
};
pub use validate::validate_job;
pub use vmaf::{
    build_vmaf_args, build_vmaf_filter, compute_vmaf, parse_vmaf_score, select_model, VmafError,
    VMAF_MODEL_4K, VMAF_MODEL_HD,
};
