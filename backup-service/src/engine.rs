//! Contracts of the external collaborators the orchestration core drives:
//! the database client and the backup/restore execution library.
//!
//! Backup payloads are opaque here. The core only starts operations, waits
//! on them and reads their progress counters.

use crate::config::{ClusterConfig, RestorePolicy, SecretAgent, StorageConfig};
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A connected database client. Safe to share between concurrent operations.
#[async_trait]
pub trait DbClient: Send + Sync {
    async fn namespaces(&self) -> Result<Vec<String>>;

    /// Raw cluster configuration snapshot, stored next to full backups.
    async fn configuration_snapshot(&self) -> Result<Vec<u8>>;

    fn close(&self);
}

/// Options the client pool applies to every client it creates.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    pub cluster_name: String,
    pub label: Option<String>,
    pub max_parallel_scans: usize,
}

#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(
        &self,
        cluster: &ClusterConfig,
        options: &ClientOptions,
    ) -> Result<Arc<dyn DbClient>>;
}

/// Parameters of one namespace backup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupConfig {
    pub namespace: String,
    pub set_list: Vec<String>,
    pub bin_list: Vec<String>,
    pub modified_after: Option<DateTime<Utc>>,
    pub modified_before: Option<DateTime<Utc>>,
    pub parallel: Option<u32>,
    pub no_records: bool,
    pub no_indexes: bool,
    pub no_udfs: bool,
    pub file_limit_mb: Option<u64>,
    pub secret_agent: Option<SecretAgent>,
}

/// Parameters of one restore run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreConfig {
    pub policy: RestorePolicy,
    pub secret_agent: Option<SecretAgent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStats {
    pub records_read: u64,
    pub bytes_written: u64,
    pub file_count: u64,
    pub index_count: u64,
    pub udf_count: u64,
}

impl BackupStats {
    pub fn is_empty(&self) -> bool {
        self.records_read == 0 && self.index_count == 0 && self.udf_count == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreStats {
    pub records_read: u64,
    pub records_inserted: u64,
    pub records_skipped: u64,
    pub records_expired: u64,
    pub records_existed: u64,
    pub records_fresher: u64,
    pub index_count: u64,
    pub udf_count: u64,
    pub total_bytes: u64,
}

impl std::ops::AddAssign for RestoreStats {
    fn add_assign(&mut self, other: Self) {
        self.records_read += other.records_read;
        self.records_inserted += other.records_inserted;
        self.records_skipped += other.records_skipped;
        self.records_expired += other.records_expired;
        self.records_existed += other.records_existed;
        self.records_fresher += other.records_fresher;
        self.index_count += other.index_count;
        self.udf_count += other.udf_count;
        self.total_bytes += other.total_bytes;
    }
}

/// One in-flight namespace backup.
#[async_trait]
pub trait BackupHandler: Send + Sync {
    /// Block until the backup finishes.
    async fn wait(&self) -> Result<()>;
    fn stats(&self) -> BackupStats;
}

/// One in-flight restore.
#[async_trait]
pub trait RestoreHandler: Send + Sync {
    async fn wait(&self) -> Result<()>;
    fn stats(&self) -> RestoreStats;
}

/// The backup/restore execution library.
#[async_trait]
pub trait BackupEngine: Send + Sync {
    /// Start backing up `config.namespace` into `path` on `storage`.
    async fn start_backup(
        &self,
        client: Arc<dyn DbClient>,
        config: BackupConfig,
        storage: &StorageConfig,
        path: &str,
    ) -> Result<Arc<dyn BackupHandler>>;

    /// Start restoring the backup files under `path` on `storage`.
    async fn start_restore(
        &self,
        client: Arc<dyn DbClient>,
        config: RestoreConfig,
        storage: &StorageConfig,
        path: &str,
    ) -> Result<Arc<dyn RestoreHandler>>;
}
