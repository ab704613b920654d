use crate::config::StorageConfig;
use crate::engine::BackupStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary of one completed namespace backup, written as `metadata.json`
/// next to the backup data files.
///
/// `[from, created)` is the modification window the unit covers. Full
/// backups have no lower bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    pub namespace: String,
    pub record_count: u64,
    pub byte_count: u64,
    pub file_count: u64,
    pub secondary_index_count: u64,
    pub udf_count: u64,
}

impl BackupMetadata {
    pub fn from_stats(
        namespace: &str,
        created: DateTime<Utc>,
        from: Option<DateTime<Utc>>,
        stats: &BackupStats,
    ) -> Self {
        Self {
            created,
            from,
            namespace: namespace.to_string(),
            record_count: stats.records_read,
            byte_count: stats.bytes_written,
            file_count: stats.file_count,
            secondary_index_count: stats.index_count,
            udf_count: stats.udf_count,
        }
    }
}

/// A listed backup unit: metadata plus where it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDetails {
    #[serde(flatten)]
    pub metadata: BackupMetadata,
    /// Folder holding the unit's data files, relative to the storage root
    pub key: String,
    pub storage: StorageConfig,
}

impl BackupDetails {
    pub fn created(&self) -> DateTime<Utc> {
        self.metadata.created
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }
}
