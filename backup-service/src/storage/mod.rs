//! Storage accessors: uniform file/folder access over local disk and
//! object stores.
//!
//! Paths are `/`-separated and relative to the configured storage root.

pub mod local;
pub mod object;

use crate::config::StorageConfig;
use crate::models::{BackupMetadata, BackupState};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::sync::Arc;

pub use local::{LocalAccessor, LocalAccessorFactory};
pub use object::{InMemoryObjectStore, ObjectStore, ObjectStoreAccessor, ObjectStoreFactory};

pub const STATE_FILE: &str = "state.json";
pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub path: String,
    pub size: u64,
}

#[async_trait]
pub trait StorageAccessor: Send + Sync {
    /// `None` if the file does not exist.
    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>>;

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Names of the direct child folders of `path`, sorted. Empty if `path` is missing.
    async fn list_subfolders(&self, path: &str) -> Result<Vec<String>>;

    /// Every file below `path`, recursively.
    async fn list_files(&self, path: &str) -> Result<Vec<FileDescriptor>>;

    /// Remove `path` and everything below it. Missing folders are not an error.
    async fn delete_folder(&self, path: &str) -> Result<()>;

    async fn create_folder(&self, path: &str) -> Result<()>;
}

impl dyn StorageAccessor + '_ {
    /// Missing state reads as the zero state.
    pub async fn read_state(&self, path: &str) -> Result<BackupState> {
        match self.read_file(path).await? {
            Some(data) => Ok(serde_json::from_slice(&data)?),
            None => Ok(BackupState::default()),
        }
    }

    pub async fn write_state(&self, path: &str, state: &BackupState) -> Result<()> {
        self.write_file(path, &serde_json::to_vec_pretty(state)?).await
    }

    pub async fn read_metadata(&self, path: &str) -> Result<BackupMetadata> {
        let data = self
            .read_file(path)
            .await?
            .ok_or_else(|| BackupError::BackupNotFound(format!("no metadata at {path}")))?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub async fn write_metadata(&self, path: &str, metadata: &BackupMetadata) -> Result<()> {
        self.write_file(path, &serde_json::to_vec_pretty(metadata)?).await
    }
}

/// Creates accessors for the storage configurations it supports.
pub trait AccessorFactory: Send + Sync {
    fn supports(&self, storage: &StorageConfig) -> bool;
    fn create(&self, storage: &StorageConfig) -> Result<Arc<dyn StorageAccessor>>;
}

/// Ordered list of accessor factories. The first one that supports a
/// storage configuration is used.
pub struct AccessorRegistry {
    factories: Vec<Box<dyn AccessorFactory>>,
}

impl AccessorRegistry {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Registry with the local disk accessor.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(LocalAccessorFactory));
        registry
    }

    pub fn register(&mut self, factory: Box<dyn AccessorFactory>) {
        self.factories.push(factory);
    }

    pub fn accessor_for(&self, storage: &StorageConfig) -> Result<Arc<dyn StorageAccessor>> {
        self.factories
            .iter()
            .find(|f| f.supports(storage))
            .ok_or_else(|| BackupError::StorageNotSupported(storage.kind().to_string()))?
            .create(storage)
    }
}

impl Default for AccessorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Join path segments with `/`, skipping empty ones.
pub fn join_path(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
