//! Backup outcome counters.
//!
//! Handlers report through [`BackupMetrics`] instead of process-wide
//! registries so an exporter can be plugged in by the embedding service.

use std::sync::atomic::{AtomicU64, Ordering};

pub trait BackupMetrics: Send + Sync {
    fn full_backup_success(&self, routine: &str);
    fn full_backup_failure(&self, routine: &str);
    fn incremental_backup_success(&self, routine: &str);
    fn incremental_backup_failure(&self, routine: &str);
    fn full_backup_skipped(&self, routine: &str);
    fn incremental_backup_skipped(&self, routine: &str);
}

pub struct NoopMetrics;

impl BackupMetrics for NoopMetrics {
    fn full_backup_success(&self, _routine: &str) {}
    fn full_backup_failure(&self, _routine: &str) {}
    fn incremental_backup_success(&self, _routine: &str) {}
    fn incremental_backup_failure(&self, _routine: &str) {}
    fn full_backup_skipped(&self, _routine: &str) {}
    fn incremental_backup_skipped(&self, _routine: &str) {}
}

/// In-process totals across all routines.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    pub full_success: AtomicU64,
    pub full_failure: AtomicU64,
    pub incremental_success: AtomicU64,
    pub incremental_failure: AtomicU64,
    pub full_skipped: AtomicU64,
    pub incremental_skipped: AtomicU64,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            full_success: self.full_success.load(Ordering::Relaxed),
            full_failure: self.full_failure.load(Ordering::Relaxed),
            incremental_success: self.incremental_success.load(Ordering::Relaxed),
            incremental_failure: self.incremental_failure.load(Ordering::Relaxed),
            full_skipped: self.full_skipped.load(Ordering::Relaxed),
            incremental_skipped: self.incremental_skipped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub full_success: u64,
    pub full_failure: u64,
    pub incremental_success: u64,
    pub incremental_failure: u64,
    pub full_skipped: u64,
    pub incremental_skipped: u64,
}

impl BackupMetrics for CounterMetrics {
    fn full_backup_success(&self, _routine: &str) {
        self.full_success.fetch_add(1, Ordering::Relaxed);
    }

    fn full_backup_failure(&self, _routine: &str) {
        self.full_failure.fetch_add(1, Ordering::Relaxed);
    }

    fn incremental_backup_success(&self, _routine: &str) {
        self.incremental_success.fetch_add(1, Ordering::Relaxed);
    }

    fn incremental_backup_failure(&self, _routine: &str) {
        self.incremental_failure.fetch_add(1, Ordering::Relaxed);
    }

    fn full_backup_skipped(&self, _routine: &str) {
        self.full_skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn incremental_backup_skipped(&self, _routine: &str) {
        self.incremental_skipped.fetch_add(1, Ordering::Relaxed);
    }
}
