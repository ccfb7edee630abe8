//! Host and tool environment capture for iteration provenance.

use crate::model::Environment;
use firefly_config::{AppConfig, AppMeta};
use rand::Rng;
use std::process::Command;
use sysinfo::System;

/// Effective worker thread count for the next supervised run.
///
/// The configured count is already clamped to the host by validation; with
/// `randomize_threads_count` a fresh value in `[1, threads_count]` is drawn
/// per call.
pub fn available_cpu_threads(config: &AppConfig) -> u32 {
    let configured = config.threads_count.max(1);
    if config.randomize_threads_count && configured > 1 {
        rand::thread_rng().gen_range(1..=configured)
    } else {
        configured
    }
}

/// Capture the tool versions and host identity an iteration runs under.
pub fn capture_environment(meta: &AppMeta) -> Environment {
    Environment {
        script_version: meta.app_version.clone(),
        ffmpeg_version: extract_ffmpeg_version(),
        encoder_version: "unknown".to_string(),
        cpu_name: cpu_name(),
        cpu_threads: num_cpus::get() as u32,
    }
}

/// Version token from `ffmpeg -version`, or "unknown" when unavailable.
pub fn extract_ffmpeg_version() -> String {
    match Command::new("ffmpeg").arg("-version").output() {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            parse_ffmpeg_version(&stdout).unwrap_or_else(|| "unknown".to_string())
        }
        _ => "unknown".to_string(),
    }
}

/// Parse the version token out of ffmpeg banner output.
///
/// Handles plain versions ("7.1") and n-prefixed build strings
/// ("n8.0-12-gdeadbeef") without altering their case.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<String> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let mut words = version_line.split_whitespace();
    while let Some(word) = words.next() {
        if word.eq_ignore_ascii_case("version") {
            return words.next().map(str::to_string);
        }
    }
    None
}

/// CPU brand string of the host, or "unknown".
pub fn cpu_name() -> String {
    let mut system = System::new();
    system.refresh_cpu_all();
    system
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .filter(|brand| !brand.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use firefly_config::{EncoderPreset, ProcessPriority};
    use std::path::PathBuf;

    fn make_config(threads_count: u32, randomize: bool) -> AppConfig {
        AppConfig {
            input_dir: PathBuf::from("/in"),
            output_dir: PathBuf::from("/out"),
            randomize_threads_count: randomize,
            threads_count,
            disable_resources_monitoring: false,
            low_resources_restart_delay_seconds: 20.0,
            encoder_process_priority: ProcessPriority::Normal,
            vmaf_process_priority: ProcessPriority::Normal,
            ram_monitoring_interval_seconds: 2.0,
            ram_percent_hard_limit: 85.0,
            ram_hard_limit_bytes: 500 * 1024 * 1024,
            crf_min: 12,
            crf_max: 36,
            initial_crf: 26,
            vmaf_min: 96.0,
            vmaf_max: 97.0,
            efficiency_threshold: 0.28,
            encoder_preset: EncoderPreset::Veryslow,
            vmaf_models_dir: PathBuf::from("vmaf_models"),
        }
    }

    #[test]
    fn test_fixed_thread_count() {
        let config = make_config(8, false);
        assert_eq!(available_cpu_threads(&config), 8);
    }

    #[test]
    fn test_zero_thread_count_clamps_to_one() {
        let config = make_config(0, false);
        assert_eq!(available_cpu_threads(&config), 1);
    }

    #[test]
    fn test_randomized_thread_count_stays_in_range() {
        let config = make_config(16, true);
        for _ in 0..100 {
            let threads = available_cpu_threads(&config);
            assert!((1..=16).contains(&threads));
        }
    }

    #[test]
    fn test_parse_ffmpeg_version_plain() {
        let output = "ffmpeg version 7.1 Copyright (c) 2000-2024 the FFmpeg developers\n\
                      built with gcc 14.2.0";
        assert_eq!(parse_ffmpeg_version(output).as_deref(), Some("7.1"));
    }

    #[test]
    fn test_parse_ffmpeg_version_n_prefixed() {
        let output = "ffmpeg version n8.0-12-gdeadbeef Copyright (c) 2000-2025";
        assert_eq!(
            parse_ffmpeg_version(output).as_deref(),
            Some("n8.0-12-gdeadbeef")
        );
    }

    #[test]
    fn test_parse_ffmpeg_version_missing() {
        assert_eq!(parse_ffmpeg_version("not an ffmpeg banner"), None);
        assert_eq!(parse_ffmpeg_version(""), None);
    }

    #[test]
    fn test_parse_ffmpeg_version_skips_unrelated_lines() {
        let output = "configuration: --enable-libx265\n\
                      ffmpeg version 6.1.1-3ubuntu5 Copyright";
        assert_eq!(
            parse_ffmpeg_version(output).as_deref(),
            Some("6.1.1-3ubuntu5")
        );
    }
}
