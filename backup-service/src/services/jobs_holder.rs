//! Registry of restore jobs and their live handlers.

use crate::engine::RestoreHandler;
use crate::models::{JobStatus, RestoreJob, RestoreJobId, RestoreJobStatus};
use crate::utils::time::now_millis;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Finished jobs stay queryable this long before they are evicted.
const FINISHED_JOB_RETENTION_HOURS: i64 = 24;

pub struct JobsHolder {
    jobs: DashMap<RestoreJobId, RestoreJob>,
    retention: Duration,
}

impl JobsHolder {
    pub fn new() -> Self {
        Self::with_retention(Duration::hours(FINISHED_JOB_RETENTION_HOURS))
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            retention,
        }
    }

    /// Allocate a running job expecting `total_records` records. Jobs that
    /// finished longer ago than the retention are dropped first.
    pub fn new_job(&self, total_records: u64) -> RestoreJobId {
        let now = now_millis();
        self.evict_finished(now);
        let id = Uuid::new_v4();
        self.jobs.insert(id, RestoreJob::new(id, total_records, now));
        id
    }

    pub fn add_handler(&self, id: RestoreJobId, handler: Arc<dyn RestoreHandler>) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            job.handlers.push(handler);
        }
    }

    pub fn set_done(&self, id: RestoreJobId) {
        self.finish(id, JobStatus::Done, None);
    }

    pub fn set_failed(&self, id: RestoreJobId, error: impl ToString) {
        self.finish(id, JobStatus::Failed, Some(error.to_string()));
    }

    fn finish(&self, id: RestoreJobId, status: JobStatus, error: Option<String>) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            if !job.finish(status, error, now_millis()) {
                warn!(job_id = %id, current = ?job.status, requested = ?status, "Ignoring update of finished job");
            }
        }
    }

    pub fn status(&self, id: RestoreJobId) -> Option<RestoreJobStatus> {
        self.jobs.get(&id).map(|job| job.report(now_millis()))
    }

    pub fn running_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| entry.value().status == JobStatus::Running)
            .count()
    }

    /// Drop jobs that finished before `now - retention`. Returns how many went.
    pub fn evict_finished(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let before = self.jobs.len();
        self.jobs
            .retain(|_, job| job.end_time.map_or(true, |end| end >= cutoff));
        let evicted = before.saturating_sub(self.jobs.len());
        if evicted > 0 {
            debug!(evicted, "Evicted finished restore jobs");
        }
        evicted
    }
}

impl Default for JobsHolder {
    fn default() -> Self {
        Self::new()
    }
}
