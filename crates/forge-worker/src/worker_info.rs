//! Process-local registry of live worker stats, surfaced for health endpoints.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use sysinfo::System;
use uuid::Uuid;

/// A point-in-time snapshot of one worker's stats.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub pid: u32,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub processed: u64,
    pub failed: u64,
    pub current_run_id: Option<Uuid>,
}

/// Counters for one worker process. Cheap to clone (all fields behind `Arc`-free atomics
/// read via `snapshot()`), safe to share across the worker's tokio tasks.
pub struct WorkerStats {
    worker_id: String,
    pid: u32,
    hostname: String,
    started_at: DateTime<Utc>,
    start_instant: Instant,
    processed: AtomicU64,
    failed: AtomicU64,
    current_run_id: parking_lot::Mutex<Option<Uuid>>,
}

impl WorkerStats {
    pub fn new(worker_id: impl Into<String>) -> Self {
        let pid = std::process::id();
        let hostname = System::host_name().unwrap_or_else(|| "unknown".to_string());
        Self {
            worker_id: worker_id.into(),
            pid,
            hostname,
            started_at: Utc::now(),
            start_instant: Instant::now(),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            current_run_id: parking_lot::Mutex::new(None),
        }
    }

    pub fn set_current_run(&self, run_id: Option<Uuid>) {
        *self.current_run_id.lock() = run_id;
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerInfo {
        WorkerInfo {
            worker_id: self.worker_id.clone(),
            pid: self.pid,
            hostname: self.hostname.clone(),
            started_at: self.started_at,
            uptime_seconds: self.start_instant.elapsed().as_secs(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            current_run_id: *self.current_run_id.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let stats = WorkerStats::new("worker-1");
        stats.record_processed();
        stats.record_processed();
        stats.record_failed();
        let run_id = Uuid::now_v7();
        stats.set_current_run(Some(run_id));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.worker_id, "worker-1");
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.current_run_id, Some(run_id));
    }
}
