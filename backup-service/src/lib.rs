//! Backup Service Library
//!
//! Scheduled full and incremental backups of a clustered database, with
//! point-in-time restore. The database client and the backup/restore
//! execution library are plugged in through the traits in [`engine`].

pub mod config;
pub mod engine;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types
pub use config::Config;
pub use state::AppState;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
