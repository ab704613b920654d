//! Restore orchestration.
//!
//! A restore returns its job id as soon as the job is registered; progress
//! and the outcome are polled through [`DataRestorer::job_status`].
//! Point-in-time restores replay, per namespace, the latest full backup at or
//! before the requested time followed by its incrementals in creation order.

use crate::config::{RestorePolicy, SecretAgent, StorageConfig};
use crate::engine::{BackupEngine, DbClient, RestoreConfig};
use crate::models::{BackupDetails, RestoreJobId, RestoreJobStatus};
use crate::services::backend::{configuration_path_for, BackupListReader};
use crate::services::backends_holder::BackendsHolder;
use crate::services::client_manager::{ClientLease, ClientManager};
use crate::services::jobs_holder::JobsHolder;
use crate::storage::{join_path, AccessorRegistry, StorageAccessor, METADATA_FILE};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Restore of one backup folder from an explicit storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Destination cluster name
    pub destination: String,
    pub source: StorageConfig,
    #[serde(default)]
    pub policy: RestorePolicy,
    pub backup_data_path: String,
    #[serde(default)]
    pub secret_agent: Option<SecretAgent>,
}

/// Restore of a routine's state as of `time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreTimestampRequest {
    pub destination: String,
    #[serde(default)]
    pub policy: RestorePolicy,
    pub routine: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub secret_agent: Option<SecretAgent>,
}

pub struct DataRestorer {
    backends: Arc<BackendsHolder>,
    client_manager: Arc<ClientManager>,
    engine: Arc<dyn BackupEngine>,
    registry: Arc<AccessorRegistry>,
    jobs: JobsHolder,
    cancel: CancellationToken,
}

impl DataRestorer {
    pub fn new(
        backends: Arc<BackendsHolder>,
        client_manager: Arc<ClientManager>,
        engine: Arc<dyn BackupEngine>,
        registry: Arc<AccessorRegistry>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            backends,
            client_manager,
            engine,
            registry,
            jobs: JobsHolder::new(),
            cancel,
        })
    }

    /// Start restoring the backup under `request.backup_data_path`.
    pub async fn restore(self: &Arc<Self>, request: RestoreRequest) -> Result<RestoreJobId> {
        request.policy.validate()?;

        let accessor = self.registry.accessor_for(&request.source)?;
        let has_data = accessor
            .list_files(&request.backup_data_path)
            .await?
            .iter()
            .any(|f| !f.path.ends_with(METADATA_FILE));
        if !has_data {
            return Err(BackupError::NoBackupFiles(request.backup_data_path));
        }

        let total_records = expected_records(accessor.as_ref(), &request.backup_data_path).await;
        let lease = self.client_manager.lease(&request.destination).await?;
        let job_id = self.jobs.new_job(total_records);
        info!(job_id = %job_id, path = %request.backup_data_path, "Restore started");

        let RestoreRequest {
            source,
            policy,
            backup_data_path,
            secret_agent,
            ..
        } = request;
        let config = RestoreConfig {
            policy,
            secret_agent,
        };
        let this = self.clone();
        let client = lease.client().clone();
        self.run_job(job_id, lease, async move {
            this.restore_unit(job_id, &client, &config, &source, &backup_data_path)
                .await
        });

        Ok(job_id)
    }

    /// Start restoring a routine to its state at `request.time`.
    pub async fn restore_by_time(self: &Arc<Self>, request: RestoreTimestampRequest) -> Result<RestoreJobId> {
        request.policy.validate()?;

        let reader = self
            .backends
            .get_reader(&request.routine)
            .ok_or_else(|| BackupError::BackendNotFound(request.routine.clone()))?;
        let full_backups = reader.find_last_full_backup(request.time).await?;
        let total_records = full_backups.iter().map(|b| b.metadata.record_count).sum();

        let lease = self.client_manager.lease(&request.destination).await?;
        let job_id = self.jobs.new_job(total_records);
        info!(
            job_id = %job_id,
            routine = %request.routine,
            time = %request.time,
            namespaces = full_backups.len(),
            "Point-in-time restore started"
        );

        let time = request.time;
        let config = RestoreConfig {
            policy: request.policy,
            secret_agent: request.secret_agent,
        };
        let this = self.clone();
        let client = lease.client().clone();
        self.run_job(job_id, lease, async move {
            let chains = full_backups.into_iter().map(|backup| {
                this.restore_chain(job_id, &client, &config, reader.as_ref(), backup, time)
            });
            let errors: Vec<BackupError> = join_all(chains)
                .await
                .into_iter()
                .filter_map(Result::err)
                .collect();
            BackupError::aggregate(errors).map_or(Ok(()), Err)
        });

        Ok(job_id)
    }

    /// Raw configuration snapshot taken with the last full backup at or before `to`.
    pub async fn retrieve_configuration(&self, routine: &str, to: DateTime<Utc>) -> Result<Vec<u8>> {
        let reader = self
            .backends
            .get_reader(routine)
            .ok_or_else(|| BackupError::BackendNotFound(routine.to_string()))?;
        let full_backups = reader.find_last_full_backup(to).await?;
        let backup = full_backups
            .first()
            .ok_or_else(|| BackupError::BackupNotFound(format!("no full backup before {to}")))?;
        let path = configuration_path_for(&backup.key)
            .ok_or_else(|| BackupError::ConfigurationNotFound(backup.key.clone()))?;
        reader
            .read_file(&path)
            .await?
            .ok_or(BackupError::ConfigurationNotFound(path))
    }

    pub fn job_status(&self, id: RestoreJobId) -> Option<RestoreJobStatus> {
        self.jobs.status(id)
    }

    pub fn jobs(&self) -> &JobsHolder {
        &self.jobs
    }

    /// Full backup of one namespace, then its incrementals oldest first.
    async fn restore_chain(
        &self,
        job_id: RestoreJobId,
        client: &Arc<dyn DbClient>,
        config: &RestoreConfig,
        reader: &dyn BackupListReader,
        full: BackupDetails,
        until: DateTime<Utc>,
    ) -> Result<()> {
        let namespace = full.namespace().to_string();
        let chain_error =
            |key: &str, e: BackupError| BackupError::Restore(format!("namespace {namespace}, {key}: {e}"));

        self.restore_unit(job_id, client, config, &full.storage, &full.key)
            .await
            .map_err(|e| chain_error(&full.key, e))?;

        let incrementals = reader
            .find_incrementals(&namespace, full.created(), until)
            .await
            .map_err(|e| chain_error(&full.key, e))?;
        debug!(job_id = %job_id, namespace = %namespace, count = incrementals.len(), "Applying incremental backups");

        for incremental in incrementals {
            self.restore_unit(job_id, client, config, &incremental.storage, &incremental.key)
                .await
                .map_err(|e| chain_error(&incremental.key, e))?;
        }
        Ok(())
    }

    async fn restore_unit(
        &self,
        job_id: RestoreJobId,
        client: &Arc<dyn DbClient>,
        config: &RestoreConfig,
        storage: &StorageConfig,
        path: &str,
    ) -> Result<()> {
        let handler = tokio::select! {
            handler = self.engine.start_restore(client.clone(), config.clone(), storage, path) => handler?,
            _ = self.cancel.cancelled() => return Err(BackupError::Cancelled),
        };
        self.jobs.add_handler(job_id, handler.clone());

        tokio::select! {
            result = handler.wait() => result,
            _ = self.cancel.cancelled() => Err(BackupError::Cancelled),
        }
    }

    /// Run `work` in the background as the body of `job_id`. The job is
    /// finalized and the client released even if `work` panics.
    fn run_job<F>(self: &Arc<Self>, job_id: RestoreJobId, lease: ClientLease, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            let result = match tokio::spawn(work).await {
                Ok(result) => result,
                Err(e) => Err(BackupError::Restore(format!("restore task ended abnormally: {e}"))),
            };
            lease.release().await;
            this.finish(job_id, result);
        });
    }

    fn finish(&self, job_id: RestoreJobId, result: Result<()>) {
        match result {
            Ok(()) => {
                info!(job_id = %job_id, "Restore completed");
                self.jobs.set_done(job_id);
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Restore failed");
                self.jobs.set_failed(job_id, e);
            }
        }
    }
}

/// Record count from the folder's metadata, 0 when there is none.
async fn expected_records(accessor: &dyn StorageAccessor, path: &str) -> u64 {
    match accessor.read_metadata(&join_path(&[path, METADATA_FILE])).await {
        Ok(metadata) => metadata.record_count,
        Err(_) => 0,
    }
}
