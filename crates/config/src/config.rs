//! Core configuration structures, loading and validation logic

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading a config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value failed a validation rule
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Host process priority applied to supervised encoder / VMAF processes.
///
/// Maps to a POSIX nice value (or a priority class on other hosts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessPriority {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
    RealTime,
}

impl Default for ProcessPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for ProcessPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessPriority::Idle => "idle",
            ProcessPriority::BelowNormal => "below_normal",
            ProcessPriority::Normal => "normal",
            ProcessPriority::AboveNormal => "above_normal",
            ProcessPriority::High => "high",
            ProcessPriority::RealTime => "real_time",
        };
        write!(f, "{}", s)
    }
}

/// x265 encoder preset, slowest presets give the best compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderPreset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    Medium,
    Slow,
    Slower,
    Veryslow,
    Placebo,
}

impl Default for EncoderPreset {
    fn default() -> Self {
        Self::Veryslow
    }
}

impl EncoderPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderPreset::Ultrafast => "ultrafast",
            EncoderPreset::Superfast => "superfast",
            EncoderPreset::Veryfast => "veryfast",
            EncoderPreset::Faster => "faster",
            EncoderPreset::Fast => "fast",
            EncoderPreset::Medium => "medium",
            EncoderPreset::Slow => "slow",
            EncoderPreset::Slower => "slower",
            EncoderPreset::Veryslow => "veryslow",
            EncoderPreset::Placebo => "placebo",
        }
    }
}

impl std::fmt::Display for EncoderPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_low_resources_restart_delay() -> f64 {
    20.0
}

fn default_ram_monitoring_interval() -> f64 {
    2.0
}

fn default_ram_percent_hard_limit() -> f64 {
    85.0
}

fn default_ram_hard_limit_bytes() -> u64 {
    500 * 1024 * 1024
}

fn default_crf_min() -> i32 {
    12
}

fn default_crf_max() -> i32 {
    36
}

fn default_initial_crf() -> i32 {
    26
}

fn default_vmaf_min() -> f64 {
    96.0
}

fn default_vmaf_max() -> f64 {
    97.0
}

fn default_efficiency_threshold() -> f64 {
    0.28
}

fn default_vmaf_models_dir() -> PathBuf {
    PathBuf::from("vmaf_models")
}

/// Main tunables, read once from the `[params]` table and then frozen.
///
/// Passed by reference into every component that needs it; there is no
/// process-wide mutable configuration state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Directory scanned (non-recursively) for `.mp4` source files.
    pub input_dir: PathBuf,
    /// Directory receiving encoded files, journals and lock files.
    pub output_dir: PathBuf,

    /// Pick a random effective thread count in `[1, threads_count]` per iteration.
    #[serde(default)]
    pub randomize_threads_count: bool,
    /// Worker threads for encoder / VMAF (0 = all host threads; clamped to host).
    #[serde(default)]
    pub threads_count: u32,

    /// Disable memory sampling and priority handling for supervised processes.
    #[serde(default)]
    pub disable_resources_monitoring: bool,
    /// Sleep before retrying a run aborted by memory pressure (seconds, >= 0.5).
    #[serde(default = "default_low_resources_restart_delay")]
    pub low_resources_restart_delay_seconds: f64,

    #[serde(default)]
    pub encoder_process_priority: ProcessPriority,
    #[serde(default)]
    pub vmaf_process_priority: ProcessPriority,

    /// Interval between memory samples while a supervised process runs (>= 0.5 s).
    #[serde(default = "default_ram_monitoring_interval")]
    pub ram_monitoring_interval_seconds: f64,
    /// Used-memory percentage above which the supervised process is offloaded.
    #[serde(default = "default_ram_percent_hard_limit")]
    pub ram_percent_hard_limit: f64,
    /// Available-memory floor below which the supervised process is offloaded.
    #[serde(default = "default_ram_hard_limit_bytes")]
    pub ram_hard_limit_bytes: u64,

    #[serde(default = "default_crf_min")]
    pub crf_min: i32,
    #[serde(default = "default_crf_max")]
    pub crf_max: i32,
    #[serde(default = "default_initial_crf")]
    pub initial_crf: i32,

    #[serde(default = "default_vmaf_min")]
    pub vmaf_min: f64,
    #[serde(default = "default_vmaf_max")]
    pub vmaf_max: f64,

    /// Minimum |dVMAF| per CRF step; below this the search stops as inefficient.
    #[serde(default = "default_efficiency_threshold")]
    pub efficiency_threshold: f64,

    #[serde(default)]
    pub encoder_preset: EncoderPreset,

    /// Directory holding the NEG VMAF model files.
    #[serde(default = "default_vmaf_models_dir")]
    pub vmaf_models_dir: PathBuf,
}

/// Wrapper matching the on-disk layout: everything lives under `[params]`.
#[derive(Debug, Deserialize)]
struct ParamsFile {
    params: AppConfig,
}

impl AppConfig {
    /// Load the `[params]` table from a TOML file.
    ///
    /// The result is not validated; call [`AppConfig::validate`] before use.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string holding a `[params]` table.
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let file: ParamsFile = toml::from_str(content)?;
        Ok(file.params)
    }

    /// Load and validate in one step.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, clamping unsafe but non-fatal values.
    ///
    /// Hard failures (invalid CRF / VMAF ranges, efficiency threshold, RAM
    /// percent limit, missing input directory) return `ConfigError::Invalid`.
    /// Soft failures are clamped to safe defaults with a warning.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let available_threads = num_cpus::get() as u32;

        if !self.input_dir.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "Input directory does not exist: {}",
                self.input_dir.display()
            )));
        }
        if !self.output_dir.is_dir() {
            warn!(
                "Output directory does not exist: {}. Will create it.",
                self.output_dir.display()
            );
            fs::create_dir_all(&self.output_dir)?;
        }

        if self.threads_count == 0 {
            warn!("Threads count is set to 0. Will use all available CPU threads.");
            self.threads_count = available_threads;
        }
        if self.threads_count > available_threads {
            warn!("Threads count is too large for the hardware. Using maximum available threads.");
            self.threads_count = available_threads;
        }

        if self.low_resources_restart_delay_seconds < 0.5 {
            warn!("Low resources restart delay is lower than safe. Clamping to 0.5 seconds.");
            self.low_resources_restart_delay_seconds = 0.5;
        }
        if self.ram_monitoring_interval_seconds < 0.5 {
            warn!("RAM monitoring interval is lower than safe. Clamping to 0.5 seconds.");
            self.ram_monitoring_interval_seconds = 0.5;
        }

        if self.ram_percent_hard_limit < 0.0 || self.ram_percent_hard_limit >= 100.0 {
            return Err(ConfigError::Invalid(
                "Invalid RAM percent hard limit in configuration. \
                 Expected: 0.0 < ram_percent_hard_limit < 100.0."
                    .to_string(),
            ));
        }
        if self.ram_percent_hard_limit == 0.0 {
            warn!("RAM percent hard limit is set to 0. Using default value of 85.");
            self.ram_percent_hard_limit = default_ram_percent_hard_limit();
        }
        if self.ram_hard_limit_bytes == 0 {
            warn!("RAM hard limit bytes is set to 0. Using default value of 500 MiB.");
            self.ram_hard_limit_bytes = default_ram_hard_limit_bytes();
        }

        if self.crf_min < 0 || self.crf_max > 51 || self.crf_min >= self.crf_max {
            return Err(ConfigError::Invalid(
                "Invalid CRF range in configuration. Expected: 0 <= crf_min < crf_max <= 51."
                    .to_string(),
            ));
        }
        if self.initial_crf < self.crf_min || self.initial_crf > self.crf_max {
            return Err(ConfigError::Invalid(
                "Invalid initial CRF in configuration. Expected: crf_min <= initial_crf <= crf_max."
                    .to_string(),
            ));
        }
        if self.vmaf_min < 0.0 || self.vmaf_max > 100.0 || self.vmaf_min >= self.vmaf_max {
            return Err(ConfigError::Invalid(
                "Invalid VMAF range in configuration. Expected: 0.0 <= vmaf_min < vmaf_max <= 100.0."
                    .to_string(),
            ));
        }
        if self.efficiency_threshold <= 0.0 || self.efficiency_threshold >= 0.5 {
            return Err(ConfigError::Invalid(
                "Invalid efficiency threshold in configuration. \
                 Expected: 0.0 < efficiency_threshold < 0.5."
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Application identity carried by the companion metadata TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppMeta {
    pub app_name: String,
    pub app_version: String,
    pub compression_engine_version: u32,
    pub schema_version: u32,
}

/// Raw shape of the metadata TOML (`[app]` + `[metadata]`).
#[derive(Debug, Deserialize)]
struct MetaFile {
    app: MetaAppSection,
    metadata: MetaVersionsSection,
}

#[derive(Debug, Deserialize)]
struct MetaAppSection {
    name: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct MetaVersionsSection {
    compression_engine_version: u32,
    schema_version: u32,
}

impl AppMeta {
    /// Load application metadata from the companion TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse application metadata from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let file: MetaFile = toml::from_str(content)?;
        if file.metadata.schema_version == 0 {
            return Err(ConfigError::Invalid(
                "Invalid schema version in metadata. Expected: schema_version >= 1.".to_string(),
            ));
        }
        Ok(Self {
            app_name: file.app.name,
            app_version: file.app.version,
            compression_engine_version: file.metadata.compression_engine_version,
            schema_version: file.metadata.schema_version,
        })
    }
}
