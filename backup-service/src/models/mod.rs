pub mod backup_metadata;
pub mod backup_state;
pub mod restore_job;

pub use backup_metadata::{BackupDetails, BackupMetadata};
pub use backup_state::BackupState;
pub use restore_job::{JobStatus, RestoreJob, RestoreJobId, RestoreJobStatus};
