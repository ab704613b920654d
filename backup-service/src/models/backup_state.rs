use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-routine record of the last successful runs, persisted as `state.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupState {
    #[serde(default)]
    pub last_full_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_incr_run: Option<DateTime<Utc>>,
    /// Number of successful full backups
    #[serde(default)]
    pub performed: u64,
}

impl BackupState {
    pub fn set_last_full_run(&mut self, t: DateTime<Utc>) {
        self.last_full_run = Some(t);
        self.performed += 1;
    }

    pub fn set_last_incr_run(&mut self, t: DateTime<Utc>) {
        self.last_incr_run = Some(t);
    }

    /// Lower bound for the next incremental backup.
    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        match (self.last_full_run, self.last_incr_run) {
            (Some(full), Some(incr)) => Some(full.max(incr)),
            (full, incr) => full.or(incr),
        }
    }
}
