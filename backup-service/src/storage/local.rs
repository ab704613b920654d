//! Local disk accessor.

use super::{AccessorFactory, FileDescriptor, StorageAccessor};
use crate::config::StorageConfig;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

pub struct LocalAccessor {
    root: PathBuf,
}

impl LocalAccessor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a storage path under the root, rejecting anything that escapes it.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(BackupError::Config(format!("unsafe storage path '{path}'")));
        }
        Ok(self.root.join(relative))
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[async_trait]
impl StorageAccessor for LocalAccessor {
    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.resolve(path)?).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so readers never see a partial file
        let tmp = target.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    async fn list_subfolders(&self, path: &str) -> Result<Vec<String>> {
        let dir = self.resolve(path)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut folders = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                folders.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        folders.sort();
        Ok(folders)
    }

    async fn list_files(&self, path: &str) -> Result<Vec<FileDescriptor>> {
        let dir = self.resolve(path)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || {
            let accessor = LocalAccessor::new(root);
            let mut files = Vec::new();
            for entry in WalkDir::new(&dir).follow_links(false) {
                let entry = entry.map_err(|e| BackupError::Io(e.into()))?;
                if entry.file_type().is_file() {
                    files.push(FileDescriptor {
                        path: accessor.relative(entry.path()),
                        size: entry.metadata().map(|m| m.len()).unwrap_or(0),
                    });
                }
            }
            files.sort_by(|a, b| a.path.cmp(&b.path));
            Ok::<_, BackupError>(files)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

        Ok(files)
    }

    async fn delete_folder(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_folder(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.resolve(path)?).await?;
        Ok(())
    }
}

pub struct LocalAccessorFactory;

impl AccessorFactory for LocalAccessorFactory {
    fn supports(&self, storage: &StorageConfig) -> bool {
        matches!(storage, StorageConfig::Local { .. })
    }

    fn create(&self, storage: &StorageConfig) -> Result<Arc<dyn StorageAccessor>> {
        match storage {
            StorageConfig::Local { path } => Ok(Arc::new(LocalAccessor::new(path.clone()))),
            other => Err(BackupError::StorageNotSupported(other.kind().to_string())),
        }
    }
}
