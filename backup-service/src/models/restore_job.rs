use crate::engine::{RestoreHandler, RestoreStats};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub type RestoreJobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Done,
    Failed,
}

pub struct RestoreJob {
    pub id: RestoreJobId,
    pub status: JobStatus,
    /// Records expected across every unit being restored, 0 if unknown
    pub total_records: u64,
    pub start_time: DateTime<Utc>,
    /// Set once the job leaves `Running`
    pub end_time: Option<DateTime<Utc>>,
    pub handlers: Vec<Arc<dyn RestoreHandler>>,
    pub error: Option<String>,
}

/// Point-in-time report of a restore job, polled by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreJobStatus {
    pub id: RestoreJobId,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    pub total_records: u64,
    #[serde(flatten)]
    pub stats: RestoreStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RestoreJob {
    pub fn new(id: RestoreJobId, total_records: u64, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Running,
            total_records,
            start_time,
            end_time: None,
            handlers: Vec::new(),
            error: None,
        }
    }

    /// Move a running job to `status`. Jobs that already finished keep
    /// their outcome; returns whether the transition happened.
    pub fn finish(&mut self, status: JobStatus, error: Option<String>, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.status = status;
        self.error = error;
        self.end_time = Some(now);
        true
    }

    pub fn stats(&self) -> RestoreStats {
        let mut total = RestoreStats::default();
        for handler in &self.handlers {
            total += handler.stats();
        }
        total
    }

    pub fn report(&self, now: DateTime<Utc>) -> RestoreJobStatus {
        let stats = self.stats();
        let estimated_end_time = match self.status {
            JobStatus::Running => {
                estimate_end_time(self.start_time, now, stats.records_read, self.total_records)
            }
            _ => None,
        };
        RestoreJobStatus {
            id: self.id,
            status: self.status,
            start_time: self.start_time,
            total_records: self.total_records,
            stats,
            estimated_end_time,
            end_time: self.end_time,
            error: match self.status {
                JobStatus::Failed => self.error.clone(),
                _ => None,
            },
        }
    }
}

/// Extrapolate completion from progress so far. No estimate below 1% done.
fn estimate_end_time(
    start: DateTime<Utc>,
    now: DateTime<Utc>,
    done: u64,
    total: u64,
) -> Option<DateTime<Utc>> {
    if total == 0 {
        return None;
    }
    let percent = done as f64 / total as f64;
    if percent < 0.01 {
        return None;
    }
    let elapsed = (now - start).num_milliseconds().max(0) as f64;
    let total_ms = elapsed / percent.min(1.0);
    Some(start + Duration::milliseconds(total_ms as i64))
}
