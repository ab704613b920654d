pub mod backend;
pub mod backends_holder;
pub mod client_manager;
pub mod config_applier;
pub mod jobs_holder;
pub mod restore;
pub mod retry;
pub mod routine_handler;
pub mod scheduler;

pub use backend::{BackupBackend, BackupListReader};
pub use backends_holder::BackendsHolder;
pub use client_manager::{ClientLease, ClientManager};
pub use config_applier::ConfigApplier;
pub use jobs_holder::JobsHolder;
pub use restore::{DataRestorer, RestoreRequest, RestoreTimestampRequest};
pub use retry::RetryService;
pub use routine_handler::{BackupRoutineHandler, CurrentStats};
pub use scheduler::{BackupKind, BackupScheduler, ScheduledBackup};
