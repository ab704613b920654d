//! Custom error types for the backup service.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("backend not found: {0}")]
    BackendNotFound(String),

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("configuration snapshot not found: {0}")]
    ConfigurationNotFound(String),

    #[error("no backup files found in {0}")]
    NoBackupFiles(String),

    #[error("storage not supported: {0}")]
    StorageNotSupported(String),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Backup error: {0}")]
    Backup(String),

    #[error("Restore error: {0}")]
    Restore(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("{}", .0.join("; "))]
    Multiple(Vec<String>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BackupError {
    /// Collapse a list of errors into one. A single error is returned as is.
    pub fn aggregate(mut errors: Vec<BackupError>) -> Option<BackupError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(BackupError::Multiple(
                errors.iter().map(|e| e.to_string()).collect(),
            )),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
