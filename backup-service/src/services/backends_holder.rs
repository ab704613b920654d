use crate::config::Config;
use crate::services::backend::{BackupBackend, BackupListReader};
use crate::storage::AccessorRegistry;
use crate::utils::errors::{BackupError, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Routine name to backend map. Rebuilt wholesale and swapped in one step,
/// so readers never see a partial map.
#[derive(Default)]
pub struct BackendsHolder {
    data: RwLock<HashMap<String, Arc<BackupBackend>>>,
}

impl BackendsHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one backend per configured routine without installing them.
    /// Routines already held keep their in-progress flags.
    pub fn build(
        &self,
        config: &Config,
        registry: &AccessorRegistry,
    ) -> Result<HashMap<String, Arc<BackupBackend>>> {
        let mut backends = HashMap::new();
        for (name, routine) in &config.backup_routines {
            let storage = config.storage.get(&routine.storage).ok_or_else(|| {
                BackupError::Config(format!("routine {name}: storage {} not found", routine.storage))
            })?;
            let policy = config.backup_policies.get(&routine.backup_policy).ok_or_else(|| {
                BackupError::Config(format!(
                    "routine {name}: backup policy {} not found",
                    routine.backup_policy
                ))
            })?;
            let accessor = registry.accessor_for(storage)?;
            let mut backend = BackupBackend::new(name, accessor, storage.clone(), policy.remove_files);
            if let Some(previous) = self.get(name) {
                backend = backend.inherit_runs(&previous);
            }
            backends.insert(name.clone(), Arc::new(backend));
        }
        Ok(backends)
    }

    pub fn init(&self, config: &Config, registry: &AccessorRegistry) -> Result<()> {
        self.set_data(self.build(config, registry)?);
        Ok(())
    }

    pub fn set_data(&self, backends: HashMap<String, Arc<BackupBackend>>) {
        match self.data.write() {
            Ok(mut guard) => *guard = backends,
            Err(poisoned) => *poisoned.into_inner() = backends,
        }
    }

    pub fn get(&self, routine: &str) -> Option<Arc<BackupBackend>> {
        match self.data.read() {
            Ok(guard) => guard.get(routine).cloned(),
            Err(poisoned) => poisoned.into_inner().get(routine).cloned(),
        }
    }

    pub fn get_reader(&self, routine: &str) -> Option<Arc<dyn BackupListReader>> {
        self.get(routine).map(|b| b as Arc<dyn BackupListReader>)
    }

    pub fn get_all_readers(&self) -> HashMap<String, Arc<dyn BackupListReader>> {
        let data = match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        data.into_iter()
            .map(|(name, b)| (name, b as Arc<dyn BackupListReader>))
            .collect()
    }
}
