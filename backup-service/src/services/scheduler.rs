use crate::metrics::BackupMetrics;
use crate::services::routine_handler::BackupRoutineHandler;
use crate::utils::errors::{BackupError, Result};
use crate::utils::time::now_millis;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupKind {
    Full,
    Incremental,
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupKind::Full => f.write_str("full"),
            BackupKind::Incremental => f.write_str("incremental"),
        }
    }
}

/// One recurring backup of a routine. Overlapping ticks are skipped, never queued.
pub struct ScheduledBackup {
    handler: Arc<BackupRoutineHandler>,
    kind: BackupKind,
    metrics: Arc<dyn BackupMetrics>,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ScheduledBackup {
    pub fn new(
        handler: Arc<BackupRoutineHandler>,
        kind: BackupKind,
        metrics: Arc<dyn BackupMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler,
            kind,
            metrics,
            running: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> BackupKind {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn run(&self) {
        let routine = self.handler.routine_name();
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::info!(routine = %routine, kind = %self.kind, "Skipping scheduled run: backup already running");
            match self.kind {
                BackupKind::Full => self.metrics.full_backup_skipped(routine),
                BackupKind::Incremental => self.metrics.incremental_backup_skipped(routine),
            }
            return;
        }
        let _guard = RunningGuard(&self.running);

        let now = now_millis();
        let result = match self.kind {
            BackupKind::Full => self.handler.run_full_backup(now).await,
            BackupKind::Incremental => self.handler.run_incremental_backup(now).await,
        };
        if let Err(e) = result {
            tracing::error!(routine = %routine, kind = %self.kind, error = %e, "Scheduled backup failed");
        }
    }
}

struct RoutineJobs {
    full: Arc<ScheduledBackup>,
    ids: Vec<Uuid>,
}

fn scheduler_error(e: JobSchedulerError) -> BackupError {
    BackupError::Scheduler(e.to_string())
}

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    jobs: Mutex<HashMap<String, RoutineJobs>>,
    metrics: Arc<dyn BackupMetrics>,
}

impl BackupScheduler {
    pub async fn new(metrics: Arc<dyn BackupMetrics>) -> Result<Self> {
        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            jobs: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    async fn schedule_job(&self, backup: Arc<ScheduledBackup>, cron_expression: &str) -> Result<Uuid> {
        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let backup = backup.clone();
            Box::pin(async move {
                backup.run().await;
            })
        })
        .map_err(scheduler_error)?;

        self.scheduler.lock().await.add(job).await.map_err(scheduler_error)
    }

    /// Register the full and incremental jobs of a routine, replacing any
    /// previous registration. A missed full backup starts right away.
    pub async fn schedule_routine(&self, handler: Arc<BackupRoutineHandler>) -> Result<()> {
        let name = handler.routine_name().to_string();
        self.unschedule(&name).await?;

        let routine = handler.routine().routine.clone();
        let full = ScheduledBackup::new(handler.clone(), BackupKind::Full, self.metrics.clone());
        let mut ids = vec![self.schedule_job(full.clone(), &routine.interval_cron).await?];
        tracing::info!(routine = %name, cron = %routine.interval_cron, "Full backup scheduled");

        if let Some(cron) = &routine.incr_interval_cron {
            let incremental =
                ScheduledBackup::new(handler.clone(), BackupKind::Incremental, self.metrics.clone());
            ids.push(self.schedule_job(incremental, cron).await?);
            tracing::info!(routine = %name, cron = %cron, "Incremental backup scheduled");
        }

        if handler.full_backup_overdue(now_millis()).await {
            tracing::info!(routine = %name, "Full backup overdue, starting now");
            let job = full.clone();
            tokio::spawn(async move { job.run().await });
        }

        self.jobs.lock().await.insert(name, RoutineJobs { full, ids });
        Ok(())
    }

    async fn unschedule(&self, routine: &str) -> Result<()> {
        let Some(previous) = self.jobs.lock().await.remove(routine) else {
            return Ok(());
        };
        let scheduler = self.scheduler.lock().await;
        for id in previous.ids {
            scheduler.remove(&id).await.map_err(scheduler_error)?;
        }
        Ok(())
    }

    /// Drop every registered job.
    pub async fn clear(&self) -> Result<()> {
        let jobs: Vec<RoutineJobs> = self.jobs.lock().await.drain().map(|(_, jobs)| jobs).collect();
        let scheduler = self.scheduler.lock().await;
        for id in jobs.into_iter().flat_map(|jobs| jobs.ids) {
            scheduler.remove(&id).await.map_err(scheduler_error)?;
        }
        tracing::debug!("Cleared scheduled jobs");
        Ok(())
    }

    /// Run the routine's full backup job out of band.
    pub async fn trigger_full_backup(&self, routine: &str) -> Result<()> {
        let job = self
            .jobs
            .lock()
            .await
            .get(routine)
            .map(|jobs| jobs.full.clone())
            .ok_or_else(|| BackupError::BackendNotFound(routine.to_string()))?;
        tracing::info!(routine = %routine, "Full backup triggered");
        tokio::spawn(async move { job.run().await });
        Ok(())
    }

    pub async fn scheduled_routines(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.lock().await.start().await.map_err(scheduler_error)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.lock().await.shutdown().await.map_err(scheduler_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoveFiles;
    use crate::metrics::CounterMetrics;
    use crate::services::backend::BackupBackend;
    use crate::services::client_manager::ClientManager;
    use crate::storage::{LocalAccessor, StorageAccessor};
    use crate::testutil::{self, wait_until, MockClientFactory, MockEngine};
    use tempfile::TempDir;
    use tokio::sync::Semaphore;
    use tokio_util::sync::CancellationToken;

    async fn handler(
        dir: &TempDir,
        engine: Arc<MockEngine>,
        metrics: Arc<CounterMetrics>,
    ) -> Arc<BackupRoutineHandler> {
        let accessor: Arc<dyn StorageAccessor> = Arc::new(LocalAccessor::new(dir.path()));
        let config = testutil::config(dir.path(), RemoveFiles::KeepAll, &["ns1"]);
        let routine = config.resolve_routine("routine").unwrap();
        let backend = Arc::new(BackupBackend::new(
            "routine",
            accessor,
            routine.storage.clone(),
            RemoveFiles::KeepAll,
        ));
        let clients = Arc::new(ClientManager::new(
            Arc::new(MockClientFactory::default()),
            config.clusters.clone(),
        ));
        BackupRoutineHandler::new(routine, backend, clients, engine, metrics, CancellationToken::new())
            .await
            .unwrap()
    }

    fn gated_engine(dir: &TempDir, gate: &Arc<Semaphore>) -> Arc<MockEngine> {
        let accessor: Arc<dyn StorageAccessor> = Arc::new(LocalAccessor::new(dir.path()));
        let mut engine = MockEngine::with_accessor(accessor);
        engine.gate = Some(gate.clone());
        Arc::new(engine)
    }

    #[tokio::test]
    async fn test_overlapping_run_skipped() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let engine = gated_engine(&dir, &gate);
        let metrics = Arc::new(CounterMetrics::new());
        let handler = handler(&dir, engine.clone(), metrics.clone()).await;
        let job = ScheduledBackup::new(handler, BackupKind::Full, metrics.clone());

        let first = job.clone();
        let task = tokio::spawn(async move { first.run().await });
        let observed = engine.clone();
        wait_until(move || observed.backups().len() == 1).await;
        assert!(job.is_running());

        job.run().await;
        assert_eq!(metrics.snapshot().full_skipped, 1);

        gate.add_permits(1);
        task.await.unwrap();
        assert!(!job.is_running());
        assert_eq!(engine.backups().len(), 1);
        assert_eq!(metrics.snapshot().full_success, 1);
    }

    #[tokio::test]
    async fn test_flag_cleared_after_failure() {
        let dir = TempDir::new().unwrap();
        let accessor: Arc<dyn StorageAccessor> = Arc::new(LocalAccessor::new(dir.path()));
        let mut engine = MockEngine::with_accessor(accessor);
        engine.fail_start.insert("ns1".into());
        let metrics = Arc::new(CounterMetrics::new());
        let handler = handler(&dir, Arc::new(engine), metrics.clone()).await;
        let job = ScheduledBackup::new(handler, BackupKind::Full, metrics.clone());

        job.run().await;
        assert!(!job.is_running());
        job.run().await;
        assert_eq!(metrics.snapshot().full_failure, 2);
        assert_eq!(metrics.snapshot().full_skipped, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_overdue_full_backup_runs_on_schedule() {
        let dir = TempDir::new().unwrap();
        let accessor: Arc<dyn StorageAccessor> = Arc::new(LocalAccessor::new(dir.path()));
        let engine = Arc::new(MockEngine::with_accessor(accessor));
        let metrics = Arc::new(CounterMetrics::new());
        let handler = handler(&dir, engine.clone(), metrics.clone()).await;

        let scheduler = BackupScheduler::new(metrics.clone()).await.unwrap();
        scheduler.schedule_routine(handler.clone()).await.unwrap();
        assert_eq!(scheduler.scheduled_routines().await, vec!["routine"]);

        let observed = metrics.clone();
        wait_until(move || observed.snapshot().full_success == 1).await;
        assert!(handler.state().await.last_full_run.is_some());

        // Rescheduling a routine with a fresh full backup starts nothing
        scheduler.schedule_routine(handler.clone()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(engine.backups().len(), 1);

        scheduler.clear().await.unwrap();
        assert!(scheduler.scheduled_routines().await.is_empty());
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trigger_full_backup() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let engine = gated_engine(&dir, &gate);
        let metrics = Arc::new(CounterMetrics::new());
        let handler = handler(&dir, engine.clone(), metrics.clone()).await;

        let scheduler = BackupScheduler::new(metrics.clone()).await.unwrap();
        // Overdue on registration, so the job is already running
        scheduler.schedule_routine(handler).await.unwrap();
        let observed = engine.clone();
        wait_until(move || observed.backups().len() == 1).await;

        scheduler.trigger_full_backup("routine").await.unwrap();
        let observed = metrics.clone();
        wait_until(move || observed.snapshot().full_skipped == 1).await;

        gate.add_permits(1);
        let observed = metrics.clone();
        wait_until(move || observed.snapshot().full_success == 1).await;

        let err = scheduler.trigger_full_backup("missing").await.unwrap_err();
        assert!(matches!(err, BackupError::BackendNotFound(_)));
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_incremental_kind_counts_skips_separately() {
        let dir = TempDir::new().unwrap();
        let metrics = Arc::new(CounterMetrics::new());
        let engine = Arc::new(MockEngine::default());
        let handler = handler(&dir, engine, metrics.clone()).await;
        let job = ScheduledBackup::new(handler, BackupKind::Incremental, metrics.clone());

        job.running.store(true, Ordering::SeqCst);
        job.run().await;
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.incremental_skipped, 1);
        assert_eq!(snapshot.full_skipped, 0);
    }
}
