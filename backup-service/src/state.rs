use crate::config::Config;
use crate::engine::{BackupEngine, ClientFactory};
use crate::metrics::BackupMetrics;
use crate::services::{
    BackendsHolder, BackupRoutineHandler, BackupScheduler, ClientManager, ConfigApplier,
    DataRestorer,
};
use crate::storage::AccessorRegistry;
use crate::utils::errors::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a running backup service shares.
pub struct AppState {
    pub metrics: Arc<dyn BackupMetrics>,
    pub client_manager: Arc<ClientManager>,
    pub backends: Arc<BackendsHolder>,
    pub scheduler: Arc<BackupScheduler>,
    pub applier: ConfigApplier,
    pub restorer: Arc<DataRestorer>,
    pub cancel: CancellationToken,
}

impl AppState {
    pub async fn new(
        client_factory: Arc<dyn ClientFactory>,
        engine: Arc<dyn BackupEngine>,
        registry: AccessorRegistry,
        metrics: Arc<dyn BackupMetrics>,
    ) -> Result<Arc<Self>> {
        let cancel = CancellationToken::new();
        let registry = Arc::new(registry);
        let client_manager = Arc::new(ClientManager::new(client_factory, HashMap::new()));
        let backends = Arc::new(BackendsHolder::new());
        let scheduler = Arc::new(BackupScheduler::new(metrics.clone()).await?);

        let applier = ConfigApplier::new(
            registry.clone(),
            backends.clone(),
            client_manager.clone(),
            scheduler.clone(),
            engine.clone(),
            metrics.clone(),
            cancel.clone(),
        );
        let restorer = DataRestorer::new(
            backends.clone(),
            client_manager.clone(),
            engine,
            registry,
            cancel.clone(),
        );

        Ok(Arc::new(Self {
            metrics,
            client_manager,
            backends,
            scheduler,
            applier,
            restorer,
            cancel,
        }))
    }

    /// Apply `config` and start firing schedules.
    pub async fn start(&self, config: &Config) -> Result<()> {
        self.applier.apply(config).await?;
        self.scheduler.start().await?;
        tracing::info!(routines = config.backup_routines.len(), "Backup service started");
        Ok(())
    }

    pub async fn apply_config(&self, config: &Config) -> Result<()> {
        self.applier.apply(config).await
    }

    pub fn handler(&self, routine: &str) -> Option<Arc<BackupRoutineHandler>> {
        self.applier.handler(routine)
    }

    /// Cancel in-flight work, stop retries and schedules, then close clients.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down...");
        self.cancel.cancel();
        self.applier.shutdown_handlers();

        if let Err(e) = self.scheduler.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }

        self.client_manager.close_all().await;
        tracing::info!("Backup service stopped");
    }
}
