//! Subprocess supervisor: launch, monitor and reap external tool processes.
//!
//! Children are spawned in their own process group with stderr piped. The
//! supervisor reads stderr line by line, runs the periodic memory gate,
//! parses `out_time_ms=` progress and renders a one-line progress display.
//! On memory pressure or cancellation the whole process tree is terminated.

use crate::resources::{self, MemoryGovernor, ResourceError};
use firefly_config::{AppConfig, ProcessPriority};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Number of trailing stderr lines kept for error reporting.
const STDERR_TAIL_LINES: usize = 20;

/// Error type for supervised subprocess execution.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The tool exited with a non-zero status.
    #[error("{tool} exited with status {status}: {stderr_tail}")]
    ToolFailed {
        tool: String,
        status: i32,
        stderr_tail: String,
    },

    /// The tool was terminated by a signal.
    #[error("{tool} was terminated by a signal")]
    Terminated { tool: String },

    /// Host memory crossed a hard limit; the caller should sleep and retry.
    #[error("Low system resources: {0}")]
    LowResources(String),

    /// The user interrupted the run; partial output must be discarded.
    #[error("Cancelled by user")]
    Cancelled,

    /// The tool binary is missing from the host.
    #[error("{0} not found. Please check your installation and PATH settings.")]
    ToolNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Policy applied to one supervised run.
#[derive(Debug, Clone)]
pub struct SupervisionOptions {
    pub priority: ProcessPriority,
    /// Interval between memory samples while the child runs.
    pub monitor_interval: Duration,
    /// Total media duration in seconds; enables the progress display.
    pub progress_total_seconds: Option<f64>,
}

impl SupervisionOptions {
    /// Options for an encoder run: encoder priority, progress display on.
    pub fn for_encoder(config: &AppConfig, total_duration_seconds: f64) -> Self {
        Self {
            priority: config.encoder_process_priority,
            monitor_interval: Duration::from_secs_f64(config.ram_monitoring_interval_seconds),
            progress_total_seconds: Some(total_duration_seconds),
        }
    }

    /// Options for a VMAF run: VMAF priority, no progress display.
    pub fn for_vmaf(config: &AppConfig) -> Self {
        Self {
            priority: config.vmaf_process_priority,
            monitor_interval: Duration::from_secs_f64(config.ram_monitoring_interval_seconds),
            progress_total_seconds: None,
        }
    }
}

/// Parse the encoded position from an ffmpeg progress line.
///
/// ffmpeg reports `out_time_ms` in microseconds.
pub fn parse_out_time_ms(line: &str) -> Option<u64> {
    line.trim().strip_prefix("out_time_ms=")?.trim().parse().ok()
}

/// Human-readable duration like `1h 4m 5s`. Negative values render as `0s`.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    if secs > 0 || parts.is_empty() {
        parts.push(format!("{}s", secs));
    }
    parts.join(" ")
}

/// One-line progress display for an in-flight encode.
pub fn render_progress(encoded_seconds: f64, total_seconds: f64, elapsed_seconds: f64) -> String {
    let percent = (encoded_seconds / total_seconds * 100.0).min(100.0);
    let eta_seconds = elapsed_seconds * (total_seconds - encoded_seconds) / encoded_seconds;

    format!(
        "Encoding progress: {:.2}% | Elapsed time: {} | Remaining time: ~{} | \
         Video duration (encoded/total): {:.1}/{:.1}s",
        percent,
        format_duration(elapsed_seconds),
        format_duration(eta_seconds),
        encoded_seconds,
        total_seconds
    )
}

/// Launch and supervise an external tool until it exits.
///
/// `governor` carries the memory gate; `None` disables resource monitoring.
/// On `LowResources` the child tree is already terminated and any partial
/// output is left in place for the caller's retry. On `Cancelled` the tree
/// is terminated and the caller must delete partial output.
pub fn run_supervised(
    program: &str,
    args: &[String],
    options: &SupervisionOptions,
    mut governor: Option<&mut MemoryGovernor>,
    cancel: &AtomicBool,
) -> Result<(), SupervisorError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    debug!("Launching supervised process: {}", program);

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            SupervisorError::ToolNotFound(program.to_string())
        } else {
            SupervisorError::Io(e)
        }
    })?;

    resources::set_process_priority(child.id(), options.priority);

    let stderr = match child.stderr.take() {
        Some(stderr) => stderr,
        None => {
            resources::terminate_process_tree(&mut child);
            return Err(SupervisorError::Io(std::io::Error::other(
                "child stderr pipe missing",
            )));
        }
    };

    let reader = BufReader::new(stderr);
    let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let start = Instant::now();
    let mut last_memory_check = Instant::now();
    let mut progress_rendered = false;

    let finish_progress_line = |rendered: bool| {
        if rendered {
            println!();
        }
    };

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };

        if cancel.load(Ordering::Relaxed) {
            finish_progress_line(progress_rendered);
            resources::terminate_process_tree(&mut child);
            return Err(SupervisorError::Cancelled);
        }

        if let Some(governor) = governor.as_deref_mut() {
            if last_memory_check.elapsed() >= options.monitor_interval {
                last_memory_check = Instant::now();
                if let Err(ResourceError::LowResources(reason)) = governor.check() {
                    finish_progress_line(progress_rendered);
                    resources::terminate_process_tree(&mut child);
                    return Err(SupervisorError::LowResources(reason));
                }
            }
        }

        if let (Some(total), Some(out_time)) =
            (options.progress_total_seconds, parse_out_time_ms(&line))
        {
            let encoded_seconds = out_time as f64 / 1_000_000.0;
            if total > 0.0 && encoded_seconds > 0.0 {
                let elapsed = start.elapsed().as_secs_f64();
                print!("\r{}", render_progress(encoded_seconds, total, elapsed));
                let _ = std::io::stdout().flush();
                progress_rendered = true;
            }
            continue;
        }

        if stderr_tail.len() == STDERR_TAIL_LINES {
            stderr_tail.pop_front();
        }
        stderr_tail.push_back(line);
    }

    finish_progress_line(progress_rendered);

    if cancel.load(Ordering::Relaxed) {
        resources::terminate_process_tree(&mut child);
        return Err(SupervisorError::Cancelled);
    }

    let status = child.wait()?;
    if status.success() {
        return Ok(());
    }

    match status.code() {
        Some(code) => Err(SupervisorError::ToolFailed {
            tool: program.to_string(),
            status: code,
            stderr_tail: stderr_tail.into_iter().collect::<Vec<_>>().join("\n"),
        }),
        None => Err(SupervisorError::Terminated {
            tool: program.to_string(),
        }),
    }
}
