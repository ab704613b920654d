use crate::config::Config;
use crate::engine::BackupEngine;
use crate::metrics::BackupMetrics;
use crate::services::backend::BackupListReader;
use crate::services::backends_holder::BackendsHolder;
use crate::services::client_manager::ClientManager;
use crate::services::routine_handler::BackupRoutineHandler;
use crate::services::scheduler::BackupScheduler;
use crate::storage::AccessorRegistry;
use crate::utils::errors::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

type HandlerMap = HashMap<String, Arc<BackupRoutineHandler>>;

/// Rebuilds backends, handlers and schedules from a configuration.
///
/// Everything is built before anything is swapped in, so a rejected
/// configuration leaves the running one untouched.
pub struct ConfigApplier {
    registry: Arc<AccessorRegistry>,
    backends: Arc<BackendsHolder>,
    client_manager: Arc<ClientManager>,
    scheduler: Arc<BackupScheduler>,
    engine: Arc<dyn BackupEngine>,
    metrics: Arc<dyn BackupMetrics>,
    handlers: RwLock<HandlerMap>,
    cancel: CancellationToken,
}

impl ConfigApplier {
    pub fn new(
        registry: Arc<AccessorRegistry>,
        backends: Arc<BackendsHolder>,
        client_manager: Arc<ClientManager>,
        scheduler: Arc<BackupScheduler>,
        engine: Arc<dyn BackupEngine>,
        metrics: Arc<dyn BackupMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            backends,
            client_manager,
            scheduler,
            engine,
            metrics,
            handlers: RwLock::new(HashMap::new()),
            cancel,
        }
    }

    pub async fn apply(&self, config: &Config) -> Result<()> {
        config.validate()?;

        let backends = self.backends.build(config, &self.registry)?;
        let mut handlers = HashMap::with_capacity(backends.len());
        for (name, backend) in &backends {
            let routine = config.resolve_routine(name)?;
            // State only carries over while the routine keeps its storage
            let previous = self
                .handler(name)
                .filter(|previous| previous.backend().storage() == backend.storage());
            let handler = match previous {
                Some(previous) => BackupRoutineHandler::succeed(
                    &previous,
                    routine,
                    backend.clone(),
                    self.client_manager.clone(),
                    self.engine.clone(),
                    self.metrics.clone(),
                    self.cancel.child_token(),
                ),
                None => {
                    BackupRoutineHandler::new(
                        routine,
                        backend.clone(),
                        self.client_manager.clone(),
                        self.engine.clone(),
                        self.metrics.clone(),
                        self.cancel.child_token(),
                    )
                    .await?
                }
            };
            handlers.insert(name.clone(), handler);
        }

        self.backends.set_data(backends);
        self.client_manager.set_clusters(config.clusters.clone());
        let previous = std::mem::replace(&mut *self.write_handlers(), handlers.clone());
        for handler in previous.values() {
            handler.shutdown();
        }

        self.scheduler.clear().await?;
        for handler in handlers.into_values() {
            self.scheduler.schedule_routine(handler).await?;
        }

        info!(routines = self.handler_names().len(), "Configuration applied");
        Ok(())
    }

    pub fn handler(&self, routine: &str) -> Option<Arc<BackupRoutineHandler>> {
        self.read_handlers().get(routine).cloned()
    }

    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_handlers().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop the retry timers of every handler.
    pub fn shutdown_handlers(&self) {
        for handler in self.read_handlers().values() {
            handler.shutdown();
        }
    }

    fn read_handlers(&self) -> std::sync::RwLockReadGuard<'_, HandlerMap> {
        self.handlers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_handlers(&self) -> std::sync::RwLockWriteGuard<'_, HandlerMap> {
        self.handlers.write().unwrap_or_else(|e| e.into_inner())
    }
}
