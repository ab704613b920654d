//! Test doubles for the database client and the backup/restore library.

use crate::config::{
    BackupPolicy, BackupRoutine, ClusterConfig, Config, RemoveFiles, SeedNode, StorageConfig,
};
use crate::engine::{
    BackupConfig, BackupEngine, BackupHandler, BackupStats, ClientFactory, ClientOptions,
    DbClient, RestoreConfig, RestoreHandler, RestoreStats,
};
use crate::storage::{join_path, StorageAccessor};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub struct MockClient {
    pub namespaces: Vec<String>,
    pub closed: AtomicUsize,
}

#[async_trait]
impl DbClient for MockClient {
    async fn namespaces(&self) -> Result<Vec<String>> {
        Ok(self.namespaces.clone())
    }

    async fn configuration_snapshot(&self) -> Result<Vec<u8>> {
        Ok(b"service { proto-fd-max 15000 }".to_vec())
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockClientFactory {
    pub namespaces: Vec<String>,
    pub fail: bool,
    pub created: Mutex<Vec<Arc<MockClient>>>,
}

impl MockClientFactory {
    pub fn with_namespaces(namespaces: &[&str]) -> Self {
        Self {
            namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn created(&self) -> Vec<Arc<MockClient>> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn connect(
        &self,
        _cluster: &ClusterConfig,
        _options: &ClientOptions,
    ) -> Result<Arc<dyn DbClient>> {
        if self.fail {
            return Err(BackupError::Client("connection refused".into()));
        }
        let client = Arc::new(MockClient {
            namespaces: self.namespaces.clone(),
            closed: AtomicUsize::new(0),
        });
        self.created.lock().unwrap().push(client.clone());
        Ok(client)
    }
}

pub struct MockBackupHandler {
    stats: BackupStats,
    error: Option<String>,
    gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl BackupHandler for MockBackupHandler {
    async fn wait(&self) -> Result<()> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.map_err(|e| anyhow::anyhow!(e))?;
        }
        match &self.error {
            Some(e) => Err(BackupError::Backup(e.clone())),
            None => Ok(()),
        }
    }

    fn stats(&self) -> BackupStats {
        self.stats
    }
}

pub struct MockRestoreHandler {
    stats: RestoreStats,
    error: Option<String>,
}

#[async_trait]
impl RestoreHandler for MockRestoreHandler {
    async fn wait(&self) -> Result<()> {
        match &self.error {
            Some(e) => Err(BackupError::Restore(e.clone())),
            None => Ok(()),
        }
    }

    fn stats(&self) -> RestoreStats {
        self.stats
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartedBackup {
    pub config: BackupConfig,
    pub path: String,
}

/// Records every started operation. Backups write one fake data file so the
/// storage looks like a real backup.
#[derive(Default)]
pub struct MockEngine {
    pub accessor: Option<Arc<dyn StorageAccessor>>,
    /// Records reported by backups, per namespace (default 1)
    pub records: HashMap<String, u64>,
    pub fail_start: HashSet<String>,
    pub fail_wait: HashSet<String>,
    /// Restore paths containing one of these fail while waiting
    pub fail_restore: HashSet<String>,
    /// Starting a restore panics, like a crashing library would
    pub panic_restore: bool,
    /// Number of upcoming backup starts that fail regardless of namespace
    pub fail_next_starts: AtomicUsize,
    pub gate: Option<Arc<Semaphore>>,
    pub backups: Mutex<Vec<StartedBackup>>,
    pub restores: Mutex<Vec<String>>,
}

impl MockEngine {
    pub fn with_accessor(accessor: Arc<dyn StorageAccessor>) -> Self {
        Self {
            accessor: Some(accessor),
            ..Default::default()
        }
    }

    pub fn backups(&self) -> Vec<StartedBackup> {
        self.backups.lock().unwrap().clone()
    }

    pub fn restores(&self) -> Vec<String> {
        self.restores.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackupEngine for MockEngine {
    async fn start_backup(
        &self,
        _client: Arc<dyn DbClient>,
        config: BackupConfig,
        _storage: &StorageConfig,
        path: &str,
    ) -> Result<Arc<dyn BackupHandler>> {
        let namespace = config.namespace.clone();
        let fail_now = self
            .fail_next_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail_now || self.fail_start.contains(&namespace) {
            return Err(BackupError::Backup(format!("cannot start {namespace}")));
        }
        self.backups.lock().unwrap().push(StartedBackup {
            config,
            path: path.to_string(),
        });

        let records = self.records.get(&namespace).copied().unwrap_or(1);
        if records > 0 {
            if let Some(accessor) = &self.accessor {
                accessor
                    .write_file(&join_path(&[path, "0001.asb"]), b"records")
                    .await?;
            }
        }
        Ok(Arc::new(MockBackupHandler {
            stats: BackupStats {
                records_read: records,
                bytes_written: records * 100,
                file_count: u64::from(records > 0),
                index_count: 0,
                udf_count: 0,
            },
            error: self
                .fail_wait
                .contains(&namespace)
                .then(|| format!("{namespace} failed")),
            gate: self.gate.clone(),
        }))
    }

    async fn start_restore(
        &self,
        _client: Arc<dyn DbClient>,
        _config: RestoreConfig,
        _storage: &StorageConfig,
        path: &str,
    ) -> Result<Arc<dyn RestoreHandler>> {
        if self.panic_restore {
            panic!("restore library crashed on {path}");
        }
        self.restores.lock().unwrap().push(path.to_string());
        let failing = self.fail_restore.iter().any(|p| path.contains(p.as_str()));
        Ok(Arc::new(MockRestoreHandler {
            stats: RestoreStats {
                records_read: 1,
                records_inserted: 1,
                total_bytes: 100,
                ..Default::default()
            },
            error: failing.then(|| format!("restore of {path} failed")),
        }))
    }
}

pub fn cluster() -> ClusterConfig {
    ClusterConfig {
        label: Some("test".into()),
        seed_nodes: vec![SeedNode {
            host: "127.0.0.1".into(),
            port: 3000,
            tls_name: None,
        }],
        credentials: None,
        max_parallel_scans: 5,
        connection_timeout_ms: 1_000,
    }
}

/// One routine `routine` on cluster `cluster`, storing under `root`.
pub fn config(root: &Path, remove_files: RemoveFiles, namespaces: &[&str]) -> Config {
    let mut config = Config::default();
    config.clusters.insert("cluster".into(), cluster());
    config.storage.insert(
        "disk".into(),
        StorageConfig::Local {
            path: root.to_path_buf(),
        },
    );
    config.backup_policies.insert(
        "policy".into(),
        BackupPolicy {
            max_retries: 0,
            retry_delay_ms: 10,
            remove_files,
            ..Default::default()
        },
    );
    config.backup_routines.insert(
        "routine".into(),
        BackupRoutine {
            backup_policy: "policy".into(),
            source_cluster: "cluster".into(),
            storage: "disk".into(),
            secret_agent: None,
            interval_cron: "0 0 1 * * *".into(),
            incr_interval_cron: Some("0 */10 * * * *".into()),
            namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
            set_list: vec![],
            bin_list: vec![],
        },
    );
    config
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
