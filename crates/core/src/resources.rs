//! Resource governor: host process priorities and memory-pressure offload.
//!
//! Priorities map the configured policy to a POSIX nice value; high-priority
//! values degrade to normal when access is denied. The memory governor
//! samples host memory and reports a low-resources condition when either
//! configured limit is breached, at which point the supervised process tree
//! is terminated (TERM, then KILL after a grace period).

use firefly_config::{AppConfig, ProcessPriority};
use std::process::Child;
use std::time::{Duration, Instant};
use sysinfo::System;
use thiserror::Error;
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL for a supervised process tree.
#[cfg(unix)]
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Grace period after SIGKILL before giving up on reaping.
#[cfg(unix)]
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Error type for resource-governor conditions.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Host memory crossed a configured hard limit; the supervised process
    /// was terminated and the caller should sleep and retry.
    #[error("Low system resources: {0}")]
    LowResources(String),
}

/// POSIX nice value for a priority policy.
pub fn nice_value(priority: ProcessPriority) -> i32 {
    match priority {
        ProcessPriority::Idle => 19,
        ProcessPriority::BelowNormal => 10,
        ProcessPriority::Normal => 0,
        ProcessPriority::AboveNormal => -5,
        ProcessPriority::High => -15,
        ProcessPriority::RealTime => -20,
    }
}

#[cfg(unix)]
fn try_set_nice(pid: u32, nice: i32) -> std::io::Result<()> {
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, pid as libc::id_t, nice) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Apply the configured priority to a freshly spawned process.
///
/// Raising priority needs elevated rights on most hosts; on access-denied
/// the call degrades to normal priority with a warning instead of failing.
#[cfg(unix)]
pub fn set_process_priority(pid: u32, priority: ProcessPriority) {
    let nice = nice_value(priority);
    match try_set_nice(pid, nice) {
        Ok(()) => debug!("Set process PID {} priority to {}", pid, priority),
        Err(err) => {
            let access_denied = matches!(
                err.raw_os_error(),
                Some(code) if code == libc::EACCES || code == libc::EPERM
            );
            if nice < 0 && access_denied {
                warn!(
                    "Elevated rights required for '{}' priority. Falling back to 'normal' (nice 0)",
                    priority
                );
                if let Err(err) = try_set_nice(pid, 0) {
                    warn!("Failed to set priority for PID {}: {}", pid, err);
                }
            } else {
                warn!("Failed to set priority for PID {}: {}", pid, err);
            }
        }
    }
}

#[cfg(not(unix))]
pub fn set_process_priority(pid: u32, priority: ProcessPriority) {
    warn!(
        "Priority '{}' not applied to PID {}: unsupported platform",
        priority, pid
    );
}

/// One host memory observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    pub used_percent: f64,
    pub available_bytes: u64,
}

/// True when either hard limit is breached.
pub fn is_memory_low(sample: MemorySample, percent_limit: f64, bytes_floor: u64) -> bool {
    sample.used_percent > percent_limit || sample.available_bytes < bytes_floor
}

/// Periodic memory sampler gating supervised child processes.
pub struct MemoryGovernor {
    system: System,
    percent_limit: f64,
    bytes_floor: u64,
}

impl MemoryGovernor {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            system: System::new(),
            percent_limit: config.ram_percent_hard_limit,
            bytes_floor: config.ram_hard_limit_bytes,
        }
    }

    /// Refresh and return the current memory observation.
    pub fn sample(&mut self) -> MemorySample {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let used_percent = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        MemorySample {
            used_percent,
            available_bytes: self.system.available_memory(),
        }
    }

    /// Sample host memory against the configured limits.
    pub fn check(&mut self) -> Result<(), ResourceError> {
        let sample = self.sample();
        if is_memory_low(sample, self.percent_limit, self.bytes_floor) {
            debug!(
                "System RAM is low ({:.1}% used, {} bytes available). Stopping to prevent swap",
                sample.used_percent, sample.available_bytes
            );
            return Err(ResourceError::LowResources(format!(
                "{:.1}% used, {} bytes available",
                sample.used_percent, sample.available_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn wait_with_deadline(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(_) => return true,
        }
    }
    false
}

/// Terminate a supervised child and everything it spawned.
///
/// The child must have been spawned as its own process group leader; the
/// whole group receives SIGTERM, then SIGKILL after the grace period.
#[cfg(unix)]
pub fn terminate_process_tree(child: &mut Child) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }

    let group = -(child.id() as i32);
    unsafe {
        libc::kill(group, libc::SIGTERM);
    }
    if wait_with_deadline(child, TERM_GRACE) {
        return;
    }

    unsafe {
        libc::kill(group, libc::SIGKILL);
    }
    let _ = wait_with_deadline(child, KILL_GRACE);
    let _ = child.try_wait();
}

#[cfg(not(unix))]
pub fn terminate_process_tree(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_nice_value_mapping() {
        assert_eq!(nice_value(ProcessPriority::Idle), 19);
        assert_eq!(nice_value(ProcessPriority::BelowNormal), 10);
        assert_eq!(nice_value(ProcessPriority::Normal), 0);
        assert_eq!(nice_value(ProcessPriority::AboveNormal), -5);
        assert_eq!(nice_value(ProcessPriority::High), -15);
        assert_eq!(nice_value(ProcessPriority::RealTime), -20);
    }

    #[test]
    fn test_memory_low_on_percent_breach() {
        let sample = MemorySample {
            used_percent: 90.0,
            available_bytes: 8 << 30,
        };
        assert!(is_memory_low(sample, 85.0, 500 << 20));
    }

    #[test]
    fn test_memory_low_on_available_floor() {
        let sample = MemorySample {
            used_percent: 40.0,
            available_bytes: 100 << 20,
        };
        assert!(is_memory_low(sample, 85.0, 500 << 20));
    }

    #[test]
    fn test_memory_fine_within_limits() {
        let sample = MemorySample {
            used_percent: 40.0,
            available_bytes: 8 << 30,
        };
        assert!(!is_memory_low(sample, 85.0, 500 << 20));
    }

    // Limits are strict: sitting exactly on them is not a breach.
    #[test]
    fn test_memory_limits_are_exclusive() {
        let sample = MemorySample {
            used_percent: 85.0,
            available_bytes: 500 << 20,
        };
        assert!(!is_memory_low(sample, 85.0, 500 << 20));
    }

    #[test]
    fn test_governor_sample_is_plausible() {
        let mut governor = MemoryGovernor {
            system: System::new(),
            percent_limit: 100.0,
            bytes_floor: 0,
        };
        let sample = governor.sample();
        assert!(sample.used_percent >= 0.0);
        assert!(sample.used_percent <= 100.0);
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_process_tree_kills_group() {
        use std::os::unix::process::CommandExt;
        use std::process::Command;

        let mut child = Command::new("sh")
            .args(["-c", "sleep 30"])
            .process_group(0)
            .spawn()
            .expect("spawn test child");

        let start = Instant::now();
        terminate_process_tree(&mut child);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(matches!(child.try_wait(), Ok(Some(_)) | Err(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_already_exited_child() {
        use std::os::unix::process::CommandExt;
        use std::process::Command;

        let mut child = Command::new("true").process_group(0).spawn().unwrap();
        let _ = child.wait();
        // Must be a no-op, not a panic or a stray signal.
        terminate_process_tree(&mut child);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Lowering available memory can only make the condition worse.
        #[test]
        fn prop_memory_low_monotonic_in_available(
            used_percent in 0.0f64..100.0,
            available in 0u64..u64::MAX / 2,
            floor in 0u64..u64::MAX / 2,
            delta in 0u64..1_000_000,
        ) {
            let high = MemorySample { used_percent, available_bytes: available.saturating_add(delta) };
            let low = MemorySample { used_percent, available_bytes: available };
            if is_memory_low(high, 85.0, floor) {
                prop_assert!(is_memory_low(low, 85.0, floor));
            }
        }
    }
}
