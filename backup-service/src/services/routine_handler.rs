//! Full and incremental backup execution for one routine.
//!
//! Full backups hold the backend's in-progress flag for their whole run and
//! are retried on failure. Incremental backups are best effort: they are
//! skipped while a full backup runs or before the first full backup exists,
//! and a failing namespace never blocks the others.

use crate::config::{parse_cron, RemoveFiles, ResolvedRoutine};
use crate::engine::{BackupConfig, BackupEngine, BackupHandler, BackupStats, DbClient};
use crate::metrics::BackupMetrics;
use crate::models::{BackupMetadata, BackupState};
use crate::services::backend::BackupBackend;
use crate::services::client_manager::ClientManager;
use crate::services::retry::RetryService;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type HandlerMap = Mutex<HashMap<String, Arc<dyn BackupHandler>>>;

/// Live progress of the backups a routine is running.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurrentStats {
    pub full: HashMap<String, BackupStats>,
    pub incremental: HashMap<String, BackupStats>,
}

pub struct BackupRoutineHandler {
    routine: ResolvedRoutine,
    backend: Arc<BackupBackend>,
    client_manager: Arc<ClientManager>,
    engine: Arc<dyn BackupEngine>,
    metrics: Arc<dyn BackupMetrics>,
    retry: Arc<RetryService>,
    state: Arc<tokio::sync::Mutex<BackupState>>,
    full_handlers: HandlerMap,
    incremental_handlers: HandlerMap,
    cancel: CancellationToken,
}

/// Clears a run's live handlers, then its in-progress flag, when dropped.
struct RunGuard<'a> {
    handlers: &'a HandlerMap,
    backend: &'a BackupBackend,
    finish: fn(&BackupBackend),
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        lock_handlers(self.handlers).clear();
        (self.finish)(self.backend);
    }
}

fn lock_handlers(map: &HandlerMap) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn BackupHandler>>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

impl BackupRoutineHandler {
    /// Build the handler and load the routine's persisted state.
    pub async fn new(
        routine: ResolvedRoutine,
        backend: Arc<BackupBackend>,
        client_manager: Arc<ClientManager>,
        engine: Arc<dyn BackupEngine>,
        metrics: Arc<dyn BackupMetrics>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let state = backend.read_state().await?;
        debug!(routine = %routine.name, ?state, "Loaded backup state");
        Ok(Self::build(
            routine,
            backend,
            client_manager,
            engine,
            metrics,
            cancel,
            Arc::new(tokio::sync::Mutex::new(state)),
        ))
    }

    /// Build the replacement of `previous` after a reload. Both share the
    /// in-memory state, so a run `previous` still has in flight updates
    /// what this handler sees.
    pub fn succeed(
        previous: &BackupRoutineHandler,
        routine: ResolvedRoutine,
        backend: Arc<BackupBackend>,
        client_manager: Arc<ClientManager>,
        engine: Arc<dyn BackupEngine>,
        metrics: Arc<dyn BackupMetrics>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        debug!(routine = %routine.name, "Carrying backup state over reload");
        Self::build(
            routine,
            backend,
            client_manager,
            engine,
            metrics,
            cancel,
            previous.state.clone(),
        )
    }

    fn build(
        routine: ResolvedRoutine,
        backend: Arc<BackupBackend>,
        client_manager: Arc<ClientManager>,
        engine: Arc<dyn BackupEngine>,
        metrics: Arc<dyn BackupMetrics>,
        cancel: CancellationToken,
        state: Arc<tokio::sync::Mutex<BackupState>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            retry: RetryService::new(routine.name.clone()),
            routine,
            backend,
            client_manager,
            engine,
            metrics,
            state,
            full_handlers: Mutex::new(HashMap::new()),
            incremental_handlers: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    pub fn routine_name(&self) -> &str {
        &self.routine.name
    }

    pub fn routine(&self) -> &ResolvedRoutine {
        &self.routine
    }

    pub fn backend(&self) -> &Arc<BackupBackend> {
        &self.backend
    }

    pub async fn state(&self) -> BackupState {
        self.state.lock().await.clone()
    }

    pub fn current_stats(&self) -> CurrentStats {
        let snapshot = |map: &HandlerMap| {
            lock_handlers(map)
                .iter()
                .map(|(ns, h)| (ns.clone(), h.stats()))
                .collect()
        };
        CurrentStats {
            full: snapshot(&self.full_handlers),
            incremental: snapshot(&self.incremental_handlers),
        }
    }

    /// Whether the last full backup is missing or older than the most recent
    /// scheduled fire time.
    pub async fn full_backup_overdue(&self, now: DateTime<Utc>) -> bool {
        let Some(last_full) = self.state.lock().await.last_full_run else {
            return true;
        };
        match parse_cron(&self.routine.routine.interval_cron) {
            Ok(schedule) => schedule.after(&last_full).next().is_some_and(|next| next <= now),
            Err(_) => false,
        }
    }

    /// Stop pending retries. A running attempt finishes and releases its
    /// client; in-flight waits end through the cancellation token.
    pub fn shutdown(&self) {
        self.retry.cancel();
    }

    /// Run a full backup now, retrying in the background per the routine's policy.
    pub async fn run_full_backup(self: &Arc<Self>, now: DateTime<Utc>) -> Result<()> {
        let this = self.clone();
        let delay = Duration::from_millis(self.routine.policy.retry_delay_ms);
        self.retry
            .retry(
                move || {
                    let this = this.clone();
                    async move { this.run_full_backup_internal(now).await }
                },
                delay,
                self.routine.policy.max_retries,
            )
            .await
    }

    /// One full backup attempt. A concurrent attempt is a successful no-op.
    pub async fn run_full_backup_internal(&self, now: DateTime<Utc>) -> Result<()> {
        if !self.backend.try_start_full_backup() {
            info!(routine = %self.routine.name, "Full backup already running, skipping");
            return Ok(());
        }
        let guard = RunGuard {
            handlers: &self.full_handlers,
            backend: &self.backend,
            finish: BackupBackend::finish_full_backup,
        };

        if self.cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        info!(routine = %self.routine.name, "Starting full backup");
        let result = match self.client_manager.lease(&self.routine.routine.source_cluster).await {
            Ok(lease) => {
                let result = self.full_backup_with_client(lease.client(), now).await;
                lease.release().await;
                result
            }
            Err(e) => Err(e),
        };
        drop(guard);

        match &result {
            Ok(()) => {
                self.metrics.full_backup_success(&self.routine.name);
                info!(routine = %self.routine.name, "Full backup completed");
            }
            Err(e) => {
                self.metrics.full_backup_failure(&self.routine.name);
                error!(routine = %self.routine.name, error = %e, "Full backup failed");
            }
        }
        result
    }

    async fn full_backup_with_client(&self, client: &Arc<dyn DbClient>, now: DateTime<Utc>) -> Result<()> {
        let namespaces = self.namespaces(client).await?;
        let policy = &self.routine.policy;
        let modified_before = policy.sealed.then_some(now);

        let mut started = Vec::with_capacity(namespaces.len());
        for namespace in &namespaces {
            let path = self.backend.full_backup_path(namespace, now);
            if policy.remove_files == RemoveFiles::RemoveAll {
                self.backend.delete_folder(&path).await?;
            }
            let config = self.backup_config(namespace, None, modified_before);
            let handler = self
                .engine
                .start_backup(client.clone(), config, &self.routine.storage, &path)
                .await
                .map_err(|e| {
                    BackupError::Backup(format!("could not start backup of namespace {namespace}: {e}"))
                })?;
            lock_handlers(&self.full_handlers).insert(namespace.clone(), handler.clone());
            started.push((namespace.clone(), path, handler));
        }

        let results = join_all(started.iter().map(|(_, _, h)| self.wait(h))).await;
        for ((namespace, _, _), result) in started.iter().zip(results) {
            result.map_err(|e| {
                BackupError::Backup(format!("full backup of namespace {namespace} failed: {e}"))
            })?;
        }

        for (namespace, path, handler) in &started {
            let metadata = BackupMetadata::from_stats(namespace, now, None, &handler.stats());
            self.backend.write_metadata(path, &metadata).await?;
        }

        {
            let mut state = self.state.lock().await;
            state.set_last_full_run(now);
            self.backend.write_state(&state).await?;
        }

        if policy.remove_files.clears_incrementals() {
            if let Err(e) = self.backend.delete_incremental_backups().await {
                warn!(routine = %self.routine.name, error = %e, "Failed to delete incremental backups");
            }
        }

        match client.configuration_snapshot().await {
            Ok(snapshot) => {
                if let Err(e) = self.backend.write_configuration(now, &snapshot).await {
                    warn!(routine = %self.routine.name, error = %e, "Failed to write cluster configuration");
                }
            }
            Err(e) => {
                warn!(routine = %self.routine.name, error = %e, "Failed to read cluster configuration");
            }
        }

        Ok(())
    }

    /// Back up records modified since the last run. Per-namespace failures
    /// are logged and counted, never returned.
    pub async fn run_incremental_backup(&self, now: DateTime<Utc>) -> Result<()> {
        let Some(last_run) = self.state.lock().await.last_run() else {
            debug!(routine = %self.routine.name, "No full backup yet, skipping incremental backup");
            return Ok(());
        };
        if self.backend.full_backup_in_progress() {
            debug!(routine = %self.routine.name, "Full backup running, skipping incremental backup");
            return Ok(());
        }
        if !self.backend.try_start_incremental_backup() {
            debug!(routine = %self.routine.name, "Incremental backup still running, skipping");
            return Ok(());
        }
        let _guard = RunGuard {
            handlers: &self.incremental_handlers,
            backend: &self.backend,
            finish: BackupBackend::finish_incremental_backup,
        };

        if self.cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let lease = self
            .client_manager
            .lease(&self.routine.routine.source_cluster)
            .await
            .inspect_err(|_| self.metrics.incremental_backup_failure(&self.routine.name))?;
        let result = self.incremental_backup_with_client(lease.client(), last_run, now).await;
        lease.release().await;
        result
    }

    async fn incremental_backup_with_client(
        &self,
        client: &Arc<dyn DbClient>,
        last_run: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let namespaces = self.namespaces(client).await.inspect_err(|_| {
            self.metrics.incremental_backup_failure(&self.routine.name)
        })?;
        let modified_before = self.routine.policy.sealed.then_some(now);

        let mut started = Vec::with_capacity(namespaces.len());
        for namespace in &namespaces {
            let path = self.backend.incremental_backup_path(namespace, now);
            let config = self.backup_config(namespace, Some(last_run), modified_before);
            match self
                .engine
                .start_backup(client.clone(), config, &self.routine.storage, &path)
                .await
            {
                Ok(handler) => {
                    lock_handlers(&self.incremental_handlers).insert(namespace.clone(), handler.clone());
                    started.push((namespace.clone(), path, handler));
                }
                Err(e) => {
                    self.metrics.incremental_backup_failure(&self.routine.name);
                    error!(
                        routine = %self.routine.name,
                        namespace = %namespace,
                        error = %e,
                        "Could not start incremental backup"
                    );
                }
            }
        }

        let results = join_all(started.iter().map(|(_, _, h)| self.wait(h))).await;
        for ((namespace, path, handler), result) in started.iter().zip(results) {
            if let Err(e) = result {
                self.metrics.incremental_backup_failure(&self.routine.name);
                error!(
                    routine = %self.routine.name,
                    namespace = %namespace,
                    error = %e,
                    "Incremental backup failed"
                );
                continue;
            }

            let stats = handler.stats();
            if stats.is_empty() {
                debug!(routine = %self.routine.name, namespace = %namespace, "Empty incremental backup, removing");
                if let Err(e) = self.backend.delete_folder(path).await {
                    warn!(routine = %self.routine.name, path = %path, error = %e, "Failed to remove empty backup");
                }
                continue;
            }

            let metadata = BackupMetadata::from_stats(namespace, now, Some(last_run), &stats);
            match self.backend.write_metadata(path, &metadata).await {
                Ok(()) => self.metrics.incremental_backup_success(&self.routine.name),
                Err(e) => {
                    self.metrics.incremental_backup_failure(&self.routine.name);
                    error!(routine = %self.routine.name, namespace = %namespace, error = %e, "Failed to write metadata");
                }
            }
        }

        let mut state = self.state.lock().await;
        state.set_last_incr_run(now);
        self.backend.write_state(&state).await
    }

    async fn namespaces(&self, client: &Arc<dyn DbClient>) -> Result<Vec<String>> {
        if !self.routine.routine.namespaces.is_empty() {
            return Ok(self.routine.routine.namespaces.clone());
        }
        client.namespaces().await
    }

    async fn wait(&self, handler: &Arc<dyn BackupHandler>) -> Result<()> {
        tokio::select! {
            result = handler.wait() => result,
            _ = self.cancel.cancelled() => Err(BackupError::Cancelled),
        }
    }

    fn backup_config(
        &self,
        namespace: &str,
        modified_after: Option<DateTime<Utc>>,
        modified_before: Option<DateTime<Utc>>,
    ) -> BackupConfig {
        let policy = &self.routine.policy;
        BackupConfig {
            namespace: namespace.to_string(),
            set_list: self.routine.routine.set_list.clone(),
            bin_list: self.routine.routine.bin_list.clone(),
            modified_after,
            modified_before,
            parallel: policy.parallel,
            no_records: policy.no_records,
            no_indexes: policy.no_indexes,
            no_udfs: policy.no_udfs,
            file_limit_mb: policy.file_limit_mb,
            secret_agent: self.routine.secret_agent.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::CounterMetrics;
    use crate::services::backend::BackupListReader;
    use crate::storage::{LocalAccessor, StorageAccessor};
    use crate::testutil::{self, wait_until, MockClientFactory, MockEngine};
    use crate::utils::time::TimeBounds;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    fn ms(v: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(v).unwrap()
    }

    struct Fixture {
        _dir: TempDir,
        accessor: Arc<dyn StorageAccessor>,
        factory: Arc<MockClientFactory>,
        engine: Arc<MockEngine>,
        metrics: Arc<CounterMetrics>,
        handler: Arc<BackupRoutineHandler>,
    }

    async fn fixture_with(
        remove_files: RemoveFiles,
        namespaces: &[&str],
        edit: impl FnOnce(&mut Config, &mut MockEngine),
    ) -> Fixture {
        let dir = TempDir::new().unwrap();
        let accessor: Arc<dyn StorageAccessor> = Arc::new(LocalAccessor::new(dir.path()));
        let mut config = testutil::config(dir.path(), remove_files, namespaces);
        let mut engine = MockEngine::with_accessor(accessor.clone());
        edit(&mut config, &mut engine);
        let engine = Arc::new(engine);

        let factory = Arc::new(MockClientFactory::with_namespaces(&["ns1", "ns2"]));
        let client_manager = Arc::new(ClientManager::new(factory.clone(), config.clusters.clone()));
        let metrics = Arc::new(CounterMetrics::new());
        let routine = config.resolve_routine("routine").unwrap();
        let backend = Arc::new(BackupBackend::new(
            "routine",
            accessor.clone(),
            routine.storage.clone(),
            remove_files,
        ));
        let handler = BackupRoutineHandler::new(
            routine,
            backend,
            client_manager,
            engine.clone(),
            metrics.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        Fixture {
            _dir: dir,
            accessor,
            factory,
            engine,
            metrics,
            handler,
        }
    }

    async fn fixture(remove_files: RemoveFiles, namespaces: &[&str]) -> Fixture {
        fixture_with(remove_files, namespaces, |_, _| {}).await
    }

    #[tokio::test]
    async fn test_first_full_backup_discovers_namespaces() {
        let f = fixture(RemoveFiles::KeepAll, &[]).await;

        f.handler.run_full_backup(ms(1_000)).await.unwrap();

        let started = f.engine.backups();
        assert_eq!(started.len(), 2);
        let full = f.handler.backend().full_backup_list(TimeBounds::all()).await.unwrap();
        let mut namespaces: Vec<_> = full.iter().map(|b| b.namespace().to_string()).collect();
        namespaces.sort();
        assert_eq!(namespaces, vec!["ns1", "ns2"]);
        assert!(full.iter().all(|b| b.created() == ms(1_000) && b.metadata.from.is_none()));

        let state = f.handler.state().await;
        assert_eq!(state.last_full_run, Some(ms(1_000)));
        assert_eq!(state.performed, 1);
        assert!(state.last_incr_run.is_none());
        assert_eq!(f.metrics.snapshot().full_success, 1);

        // State is persisted
        let persisted = f.accessor.read_state("routine/state.json").await.unwrap();
        assert_eq!(persisted, state);

        // Client released, configuration written
        assert_eq!(f.factory.created()[0].closed.load(Ordering::SeqCst), 1);
        let conf = f
            .accessor
            .read_file("routine/backup/1000/configuration/cluster.conf")
            .await
            .unwrap();
        assert!(conf.is_some());
        assert!(!f.handler.backend().full_backup_in_progress());
    }

    #[tokio::test]
    async fn test_explicit_namespaces_and_sealed_bound() {
        let f = fixture_with(RemoveFiles::KeepAll, &["ns1"], |config, _| {
            config.backup_policies.get_mut("policy").unwrap().sealed = true;
        })
        .await;

        f.handler.run_full_backup(ms(2_000)).await.unwrap();

        let started = f.engine.backups();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].config.namespace, "ns1");
        assert_eq!(started[0].config.modified_before, Some(ms(2_000)));
        assert_eq!(started[0].config.modified_after, None);
        assert_eq!(started[0].path, "routine/backup/2000/data/ns1");
    }

    #[tokio::test]
    async fn test_full_backup_failure_is_all_or_nothing() {
        let f = fixture_with(RemoveFiles::KeepAll, &["ns1", "ns2"], |_, engine| {
            engine.fail_wait.insert("ns2".into());
        })
        .await;

        let err = f.handler.run_full_backup(ms(1_000)).await.unwrap_err();
        assert!(err.to_string().contains("ns2"));

        assert!(f.handler.backend().full_backup_list(TimeBounds::all()).await.unwrap().is_empty());
        assert!(f.handler.state().await.last_full_run.is_none());
        assert_eq!(f.metrics.snapshot().full_failure, 1);
        assert!(!f.handler.backend().full_backup_in_progress());
        assert_eq!(f.factory.created()[0].closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_full_backup_retried() {
        let f = fixture_with(RemoveFiles::KeepAll, &["ns1"], |config, engine| {
            config.backup_policies.get_mut("policy").unwrap().max_retries = 2;
            engine.fail_start.insert("ns1".into());
        })
        .await;

        assert!(f.handler.run_full_backup(ms(1_000)).await.is_err());
        let metrics = f.metrics.clone();
        wait_until(move || metrics.snapshot().full_failure == 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.metrics.snapshot().full_failure, 3);
    }

    #[tokio::test]
    async fn test_shutdown_during_retry_releases_client() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture_with(RemoveFiles::KeepAll, &["ns1"], |config, engine| {
            config.backup_policies.get_mut("policy").unwrap().max_retries = 2;
            *engine.fail_next_starts.get_mut() = 1;
            engine.gate = Some(gate.clone());
        })
        .await;

        assert!(f.handler.run_full_backup(ms(1_000)).await.is_err());
        // The retry has started and holds a client
        let engine = f.engine.clone();
        wait_until(move || engine.backups().len() == 1).await;
        assert_eq!(f.handler.current_stats().full.len(), 1);

        f.handler.shutdown();
        gate.add_permits(1);
        let metrics = f.metrics.clone();
        wait_until(move || metrics.snapshot().full_success == 1).await;

        assert_eq!(f.handler.client_manager.pooled_count().await, 0);
        for client in f.factory.created() {
            assert_eq!(client.closed.load(Ordering::SeqCst), 1);
        }
        assert!(f.handler.current_stats().full.is_empty());
        assert!(!f.handler.backend().full_backup_in_progress());
        assert_eq!(f.handler.state().await.last_full_run, Some(ms(1_000)));
    }

    #[tokio::test]
    async fn test_aborted_run_releases_client_and_flag() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture_with(RemoveFiles::KeepAll, &["ns1"], |_, engine| {
            engine.gate = Some(gate.clone());
        })
        .await;

        let handler = f.handler.clone();
        let task = tokio::spawn(async move { handler.run_full_backup_internal(ms(1_000)).await });
        let engine = f.engine.clone();
        wait_until(move || engine.backups().len() == 1).await;

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        let factory = f.factory.clone();
        wait_until(move || factory.created()[0].closed.load(Ordering::SeqCst) == 1).await;
        assert_eq!(f.handler.client_manager.pooled_count().await, 0);
        assert!(f.handler.current_stats().full.is_empty());
        assert!(!f.handler.backend().full_backup_in_progress());
    }

    #[tokio::test]
    async fn test_successor_shares_state_and_flags() {
        let f = fixture(RemoveFiles::KeepAll, &["ns1"]).await;
        let backend = Arc::new(
            BackupBackend::new(
                "routine",
                f.accessor.clone(),
                f.handler.routine().storage.clone(),
                RemoveFiles::KeepAll,
            )
            .inherit_runs(f.handler.backend()),
        );
        let successor = BackupRoutineHandler::succeed(
            &f.handler,
            f.handler.routine().clone(),
            backend,
            f.handler.client_manager.clone(),
            f.engine.clone(),
            f.metrics.clone(),
            CancellationToken::new(),
        );

        assert!(f.handler.backend().try_start_full_backup());
        successor.run_full_backup_internal(ms(2_000)).await.unwrap();
        assert!(f.engine.backups().is_empty());
        f.handler.backend().finish_full_backup();

        f.handler.run_full_backup(ms(1_000)).await.unwrap();
        assert_eq!(successor.state().await.last_full_run, Some(ms(1_000)));
    }

    #[tokio::test]
    async fn test_overlapping_full_backup_is_noop() {
        let f = fixture(RemoveFiles::KeepAll, &["ns1"]).await;
        assert!(f.handler.backend().try_start_full_backup());

        f.handler.run_full_backup_internal(ms(1_000)).await.unwrap();
        assert!(f.engine.backups().is_empty());
        assert!(f.factory.created().is_empty());
        // The running backup still owns the flag
        assert!(f.handler.backend().full_backup_in_progress());
    }

    #[tokio::test]
    async fn test_incremental_skipped_before_first_full() {
        let f = fixture(RemoveFiles::KeepAll, &["ns1"]).await;

        f.handler.run_incremental_backup(ms(1_000)).await.unwrap();
        assert!(f.engine.backups().is_empty());
        assert!(f.factory.created().is_empty());
        assert!(f.handler.state().await.last_incr_run.is_none());
    }

    #[tokio::test]
    async fn test_incremental_skipped_during_full() {
        let f = fixture(RemoveFiles::KeepAll, &["ns1"]).await;
        f.handler.run_full_backup(ms(1_000)).await.unwrap();
        assert!(f.handler.backend().try_start_full_backup());

        f.handler.run_incremental_backup(ms(2_000)).await.unwrap();
        assert_eq!(f.engine.backups().len(), 1);
        f.handler.backend().finish_full_backup();
    }

    #[tokio::test]
    async fn test_incremental_time_bounds() {
        let f = fixture(RemoveFiles::KeepAll, &["ns1"]).await;
        f.handler.run_full_backup(ms(1_000)).await.unwrap();
        f.handler.run_incremental_backup(ms(2_000)).await.unwrap();
        f.handler.run_incremental_backup(ms(3_000)).await.unwrap();

        let started = f.engine.backups();
        assert_eq!(started[1].config.modified_after, Some(ms(1_000)));
        assert_eq!(started[1].config.modified_before, None);
        assert_eq!(started[2].config.modified_after, Some(ms(2_000)));
        assert_eq!(started[2].path, "routine/incremental/3000/data/ns1");

        let incrementals = f
            .handler
            .backend()
            .incremental_backup_list(TimeBounds::all())
            .await
            .unwrap();
        assert_eq!(incrementals.len(), 2);
        assert_eq!(incrementals[1].metadata.from, Some(ms(2_000)));
        assert_eq!(f.handler.state().await.last_incr_run, Some(ms(3_000)));
    }

    #[tokio::test]
    async fn test_incremental_failure_isolated() {
        let f = fixture_with(RemoveFiles::KeepAll, &["nsA", "nsB"], |_, engine| {
            engine.fail_start.insert("nsA".into());
        })
        .await;
        // Seed a full backup directly in state so only the incremental path runs
        {
            let mut state = f.handler.state.lock().await;
            state.set_last_full_run(ms(1_000));
        }

        f.handler.run_incremental_backup(ms(2_000)).await.unwrap();

        let incrementals = f
            .handler
            .backend()
            .incremental_backup_list(TimeBounds::all())
            .await
            .unwrap();
        assert_eq!(incrementals.len(), 1);
        assert_eq!(incrementals[0].namespace(), "nsB");
        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.incremental_failure, 1);
        assert_eq!(snapshot.incremental_success, 1);
        assert_eq!(f.handler.state().await.last_incr_run, Some(ms(2_000)));
    }

    #[tokio::test]
    async fn test_empty_incremental_removed() {
        let f = fixture_with(RemoveFiles::KeepAll, &["ns1", "ns2"], |_, engine| {
            engine.records.insert("ns2".into(), 0);
        })
        .await;
        f.handler.run_full_backup(ms(1_000)).await.unwrap();
        f.handler.run_incremental_backup(ms(2_000)).await.unwrap();

        let folders = f
            .accessor
            .list_subfolders("routine/incremental/2000/data")
            .await
            .unwrap();
        assert_eq!(folders, vec!["ns1"]);
    }

    #[tokio::test]
    async fn test_remove_incremental_clears_after_full() {
        let f = fixture(RemoveFiles::RemoveIncremental, &["ns1"]).await;
        f.handler.run_full_backup(ms(1_000)).await.unwrap();
        f.handler.run_incremental_backup(ms(2_000)).await.unwrap();
        assert_eq!(
            f.handler.backend().incremental_backup_list(TimeBounds::all()).await.unwrap().len(),
            1
        );

        f.handler.run_full_backup(ms(3_000)).await.unwrap();
        assert!(f
            .handler
            .backend()
            .incremental_backup_list(TimeBounds::all())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            f.handler.backend().full_backup_list(TimeBounds::all()).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_remove_all_overwrites_full_backup() {
        let f = fixture(RemoveFiles::RemoveAll, &["ns1"]).await;
        f.handler.run_full_backup(ms(1_000)).await.unwrap();
        f.handler.run_full_backup(ms(2_000)).await.unwrap();
        f.handler.run_full_backup(ms(3_000)).await.unwrap();

        let full = f.handler.backend().full_backup_list(TimeBounds::all()).await.unwrap();
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].created(), ms(3_000));
        assert_eq!(f.handler.state().await.performed, 3);
    }

    #[tokio::test]
    async fn test_keep_all_lists_each_run() {
        let f = fixture(RemoveFiles::KeepAll, &["ns1"]).await;
        f.handler.run_full_backup(ms(1_000)).await.unwrap();
        f.handler.run_full_backup(ms(2_000)).await.unwrap();
        let full = f.handler.backend().full_backup_list(TimeBounds::all()).await.unwrap();
        assert_eq!(full.len(), 2);
    }

    #[tokio::test]
    async fn test_state_loaded_on_construction() {
        let f = fixture(RemoveFiles::KeepAll, &["ns1"]).await;
        f.handler.run_full_backup(ms(1_000)).await.unwrap();

        let reloaded = BackupRoutineHandler::new(
            f.handler.routine().clone(),
            f.handler.backend().clone(),
            Arc::new(ClientManager::new(f.factory.clone(), HashMap::new())),
            f.engine.clone(),
            f.metrics.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(reloaded.state().await.last_full_run, Some(ms(1_000)));
    }

    #[tokio::test]
    async fn test_cancellation_ends_wait() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture_with(RemoveFiles::KeepAll, &["ns1"], |_, engine| {
            engine.gate = Some(gate.clone());
        })
        .await;

        let handler = f.handler.clone();
        let task = tokio::spawn(async move { handler.run_full_backup_internal(ms(1_000)).await });
        let engine = f.engine.clone();
        wait_until(move || engine.backups().len() == 1).await;
        assert_eq!(f.handler.current_stats().full.len(), 1);

        f.handler.cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(BackupError::Backup(msg)) if msg.contains("cancelled")));
        assert!(f.handler.current_stats().full.is_empty());
    }

    #[tokio::test]
    async fn test_full_backup_overdue() {
        let f = fixture(RemoveFiles::KeepAll, &["ns1"]).await;
        // Daily at 01:00:00
        let now = DateTime::parse_from_rfc3339("2024-05-02T12:00:00Z").unwrap().to_utc();
        assert!(f.handler.full_backup_overdue(now).await);

        f.handler.run_full_backup(DateTime::parse_from_rfc3339("2024-05-02T01:00:00Z").unwrap().to_utc()).await.unwrap();
        assert!(!f.handler.full_backup_overdue(now).await);

        let next_day = DateTime::parse_from_rfc3339("2024-05-03T02:00:00Z").unwrap().to_utc();
        assert!(f.handler.full_backup_overdue(next_day).await);
    }
}
