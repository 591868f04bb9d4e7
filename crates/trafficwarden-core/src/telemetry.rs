//! Process resource observation.
//!
//! The alert manager reads `memory_usage` and `uptime` through
//! [`ProcessStats`]; production uses [`PlatformStats`] and tests inject a
//! fixed reading.

use std::time::Instant;

/// Source of process-level readings.
pub trait ProcessStats: Send + Sync + std::fmt::Debug {
    /// Resident set size in bytes, if the platform exposes it.
    fn resident_bytes(&self) -> Option<u64>;

    /// Seconds since the process (or stats source) started.
    fn uptime_secs(&self) -> u64;
}

/// Platform-backed process stats for the current process.
#[derive(Debug)]
pub struct PlatformStats {
    started: Instant,
}

impl PlatformStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for PlatformStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessStats for PlatformStats {
    fn resident_bytes(&self) -> Option<u64> {
        collect_resident_bytes()
    }

    fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Fixed readings for tests and dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticStats {
    pub resident_bytes: Option<u64>,
    pub uptime_secs: u64,
}

impl ProcessStats for StaticStats {
    fn resident_bytes(&self) -> Option<u64> {
        self.resident_bytes
    }

    fn uptime_secs(&self) -> u64 {
        self.uptime_secs
    }
}

#[cfg(target_os = "linux")]
fn collect_resident_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

#[cfg(not(target_os = "linux"))]
fn collect_resident_bytes() -> Option<u64> {
    None
}

/// Extract `VmRSS` from `/proc/<pid>/status` text, in bytes.
fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(parse_kb_value)
        .map(|kb| kb * 1024)
}

/// Parse a value like "  12345 kB" → Some(12345).
fn parse_kb_value(s: &str) -> Option<u64> {
    s.trim().strip_suffix("kB")?.trim().parse().ok()
}

/// Bytes to whole-and-fractional megabytes.
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
