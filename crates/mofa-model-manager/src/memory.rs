//! Process memory snapshots for cache diagnostics
//!
//! Capturing a snapshot costs a `/proc` read, so the cache only does it when
//! `log_memory_usage` is enabled.

use std::fmt;

use sysinfo::{MemoryRefreshKind, ProcessesToUpdate, RefreshKind, System};

use crate::config::GIB;

/// Point-in-time view of process and system memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    /// Resident set size of this process in bytes (0 if unavailable)
    pub process_rss_bytes: u64,
    /// Available system RAM in bytes (0 if unavailable)
    pub available_ram_bytes: u64,
}

impl MemorySnapshot {
    pub fn capture() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let process_rss_bytes = match sysinfo::get_current_pid() {
            Ok(pid) => {
                sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));
                sys.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            Err(_) => 0,
        };

        Self {
            process_rss_bytes,
            available_ram_bytes: sys.available_memory(),
        }
    }

    /// Human readable change between two snapshots.
    pub fn diff(before: &Self, after: &Self) -> String {
        let delta = after.process_rss_bytes as i128 - before.process_rss_bytes as i128;
        format!(
            "Process RAM: {:.2}GB -> {:.2}GB ({:+.2}GB)",
            before.process_rss_bytes as f64 / GIB as f64,
            after.process_rss_bytes as f64 / GIB as f64,
            delta as f64 / GIB as f64,
        )
    }
}

impl fmt::Display for MemorySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rss={:.2}GB available={:.2}GB",
            self.process_rss_bytes as f64 / GIB as f64,
            self.available_ram_bytes as f64 / GIB as f64
        )
    }
}
