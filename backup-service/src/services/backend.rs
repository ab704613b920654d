//! Per-routine storage facade: path layout, state file, metadata listing.
//!
//! Layout relative to the storage root, for routine `R`:
//!
//! ```text
//! R/state.json
//! R/backup/<millis>/data/<ns>/metadata.json       full backups
//! R/backup/<millis>/configuration/cluster.conf    cluster configuration
//! R/backup/data/<ns>/metadata.json                full backups with RemoveAll
//! R/incremental/<millis>/data/<ns>/metadata.json  incremental backups
//! ```

use crate::config::{RemoveFiles, StorageConfig};
use crate::models::{BackupDetails, BackupMetadata, BackupState};
use crate::storage::{join_path, StorageAccessor, METADATA_FILE, STATE_FILE};
use crate::utils::errors::{BackupError, Result};
use crate::utils::time::TimeBounds;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

const FULL_BACKUP_FOLDER: &str = "backup";
const INCREMENTAL_BACKUP_FOLDER: &str = "incremental";
const DATA_FOLDER: &str = "data";
const CONFIGURATION_FOLDER: &str = "configuration";
const CONFIGURATION_FILE: &str = "cluster.conf";

/// Read access to a routine's backups, used by restore.
#[async_trait]
pub trait BackupListReader: Send + Sync {
    /// Full backups created within `bounds`, oldest first.
    async fn full_backup_list(&self, bounds: TimeBounds) -> Result<Vec<BackupDetails>>;

    /// Incremental backups created within `bounds`, oldest first.
    async fn incremental_backup_list(&self, bounds: TimeBounds) -> Result<Vec<BackupDetails>>;

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>>;

    fn storage(&self) -> &StorageConfig;

    /// Every namespace unit of the latest full backup created at or before `to`.
    async fn find_last_full_backup(&self, to: DateTime<Utc>) -> Result<Vec<BackupDetails>> {
        let all = self.full_backup_list(TimeBounds::all()).await?;
        let latest = all
            .iter()
            .map(BackupDetails::created)
            .filter(|created| *created <= to)
            .max()
            .ok_or_else(|| BackupError::BackupNotFound(format!("no full backup before {to}")))?;
        Ok(all.into_iter().filter(|b| b.created() == latest).collect())
    }

    /// Incrementals of `namespace` created in `(after, until]`, oldest first.
    async fn find_incrementals(
        &self,
        namespace: &str,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<BackupDetails>> {
        let mut list = self
            .incremental_backup_list(TimeBounds::after_until(after, until))
            .await?;
        list.retain(|b| b.namespace() == namespace);
        list.sort_by_key(BackupDetails::created);
        Ok(list)
    }
}

pub struct BackupBackend {
    routine_name: String,
    accessor: Arc<dyn StorageAccessor>,
    storage: StorageConfig,
    remove_files: RemoveFiles,
    state_path: String,
    full_backups_path: String,
    incremental_backups_path: String,
    runs: Arc<RunFlags>,
}

/// In-progress flags of one routine. Backends rebuilt on reload share them
/// with their predecessor.
#[derive(Default)]
struct RunFlags {
    full: AtomicBool,
    incremental: AtomicBool,
}

fn try_set(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

fn millis(t: DateTime<Utc>) -> String {
    t.timestamp_millis().to_string()
}

impl BackupBackend {
    pub fn new(
        routine_name: &str,
        accessor: Arc<dyn StorageAccessor>,
        storage: StorageConfig,
        remove_files: RemoveFiles,
    ) -> Self {
        Self {
            routine_name: routine_name.to_string(),
            accessor,
            storage,
            remove_files,
            state_path: join_path(&[routine_name, STATE_FILE]),
            full_backups_path: join_path(&[routine_name, FULL_BACKUP_FOLDER]),
            incremental_backups_path: join_path(&[routine_name, INCREMENTAL_BACKUP_FOLDER]),
            runs: Arc::new(RunFlags::default()),
        }
    }

    /// Share `previous`'s in-progress flags, so runs it started still
    /// exclude runs of this backend.
    pub fn inherit_runs(mut self, previous: &BackupBackend) -> Self {
        self.runs = previous.runs.clone();
        self
    }

    pub fn routine_name(&self) -> &str {
        &self.routine_name
    }

    pub fn accessor(&self) -> &Arc<dyn StorageAccessor> {
        &self.accessor
    }

    /// Set the in-progress flag. Returns `false` if a full backup already holds it.
    pub fn try_start_full_backup(&self) -> bool {
        try_set(&self.runs.full)
    }

    pub fn finish_full_backup(&self) {
        self.runs.full.store(false, Ordering::Release);
    }

    pub fn full_backup_in_progress(&self) -> bool {
        self.runs.full.load(Ordering::Acquire)
    }

    pub fn try_start_incremental_backup(&self) -> bool {
        try_set(&self.runs.incremental)
    }

    pub fn finish_incremental_backup(&self) {
        self.runs.incremental.store(false, Ordering::Release);
    }

    /// Where a full backup of `namespace` started at `now` is written.
    pub fn full_backup_path(&self, namespace: &str, now: DateTime<Utc>) -> String {
        match self.remove_files {
            RemoveFiles::RemoveAll => join_path(&[&self.full_backups_path, DATA_FOLDER, namespace]),
            _ => join_path(&[&self.full_backups_path, &millis(now), DATA_FOLDER, namespace]),
        }
    }

    pub fn incremental_backup_path(&self, namespace: &str, now: DateTime<Utc>) -> String {
        join_path(&[&self.incremental_backups_path, &millis(now), DATA_FOLDER, namespace])
    }

    pub fn configuration_path(&self, now: DateTime<Utc>) -> String {
        match self.remove_files {
            RemoveFiles::RemoveAll => join_path(&[
                &self.full_backups_path,
                CONFIGURATION_FOLDER,
                CONFIGURATION_FILE,
            ]),
            _ => join_path(&[
                &self.full_backups_path,
                &millis(now),
                CONFIGURATION_FOLDER,
                CONFIGURATION_FILE,
            ]),
        }
    }

    pub async fn read_state(&self) -> Result<BackupState> {
        self.accessor.read_state(&self.state_path).await
    }

    pub async fn write_state(&self, state: &BackupState) -> Result<()> {
        self.accessor.write_state(&self.state_path, state).await
    }

    pub async fn write_metadata(&self, data_path: &str, metadata: &BackupMetadata) -> Result<()> {
        self.accessor
            .write_metadata(&join_path(&[data_path, METADATA_FILE]), metadata)
            .await
    }

    pub async fn write_configuration(&self, now: DateTime<Utc>, data: &[u8]) -> Result<()> {
        self.accessor.write_file(&self.configuration_path(now), data).await
    }

    pub async fn delete_folder(&self, path: &str) -> Result<()> {
        self.accessor.delete_folder(path).await
    }

    pub async fn delete_incremental_backups(&self) -> Result<()> {
        self.accessor.delete_folder(&self.incremental_backups_path).await
    }

    /// Read one unit per namespace folder under `root/data`.
    async fn units_in(&self, root: &str, bounds: TimeBounds) -> Result<Vec<BackupDetails>> {
        let data_root = join_path(&[root, DATA_FOLDER]);
        let mut details = Vec::new();
        for namespace in self.accessor.list_subfolders(&data_root).await? {
            let key = join_path(&[&data_root, &namespace]);
            let metadata_path = join_path(&[&key, METADATA_FILE]);
            let metadata = match self.accessor.read_metadata(&metadata_path).await {
                Ok(metadata) => metadata,
                Err(BackupError::BackupNotFound(_)) => {
                    // Running or abandoned backup
                    debug!(routine = %self.routine_name, path = %key, "Skipping unit without metadata");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if bounds.contains(metadata.created) {
                details.push(BackupDetails {
                    metadata,
                    key,
                    storage: self.storage.clone(),
                });
            }
        }
        Ok(details)
    }

    /// Units under timestamped subfolders of `root`, oldest first.
    async fn timestamped_units(&self, root: &str, bounds: TimeBounds) -> Result<Vec<BackupDetails>> {
        let mut folders: Vec<(DateTime<Utc>, String)> = self
            .accessor
            .list_subfolders(root)
            .await?
            .into_iter()
            .filter_map(|name| {
                let millis = name.parse::<i64>().ok()?;
                Some((DateTime::from_timestamp_millis(millis)?, name))
            })
            .filter(|(created, _)| bounds.contains(*created))
            .collect();
        folders.sort();

        let mut details = Vec::new();
        for (_, name) in folders {
            details.extend(self.units_in(&join_path(&[root, &name]), bounds).await?);
        }
        Ok(details)
    }
}

#[async_trait]
impl BackupListReader for BackupBackend {
    async fn full_backup_list(&self, bounds: TimeBounds) -> Result<Vec<BackupDetails>> {
        match self.remove_files {
            RemoveFiles::RemoveAll => self.units_in(&self.full_backups_path, bounds).await,
            _ => self.timestamped_units(&self.full_backups_path, bounds).await,
        }
    }

    async fn incremental_backup_list(&self, bounds: TimeBounds) -> Result<Vec<BackupDetails>> {
        self.timestamped_units(&self.incremental_backups_path, bounds).await
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.accessor.read_file(path).await
    }

    fn storage(&self) -> &StorageConfig {
        &self.storage
    }
}

/// Configuration snapshot stored next to a full backup's `data/<ns>` folder.
pub fn configuration_path_for(backup_key: &str) -> Option<String> {
    let (parent, _namespace) = backup_key.rsplit_once('/')?;
    let root = match parent.rsplit_once('/') {
        Some((root, DATA_FOLDER)) => root,
        None if parent == DATA_FOLDER => "",
        _ => return None,
    };
    Some(join_path(&[root, CONFIGURATION_FOLDER, CONFIGURATION_FILE]))
}
