//! Status metrics for the UHD scaler
//!
//! A single snapshot shared between the worker, the ingest loop and the
//! status server, serialized as JSON.

use crate::registry::RegistryCounts;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// The file currently being encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveEncode {
    pub input_path: String,
    /// Label of the plan being attempted, e.g. `hevc/amd qp20`
    pub plan: String,
    /// Zero-based index into the candidate list
    pub attempt: usize,
    pub candidates: usize,
    pub started_unix_ms: i64,
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    /// Configured acceleration backend
    pub backend: String,
    pub active: Option<ActiveEncode>,
    pub system: SystemMetrics,
    /// Claimed files waiting for a worker
    pub queue_len: usize,
    /// Tracked files by state, refreshed on every stability poll
    pub files: RegistryCounts,
    pub done_files: u64,
    pub failed_files: u64,
    pub skipped_files: u64,
    /// Hardware attempts that fell through to a later plan
    pub hardware_fallbacks: u64,
    pub total_bytes_written: u64,
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}
