//! Object store accessor for S3, Azure Blob and GCP Storage.
//!
//! Object stores have no real folders: a folder is a key prefix, child
//! folders come from delimiter listings, and deleting a folder deletes every
//! key under its prefix. Provider SDK clients plug in through [`ObjectStore`].

use super::{AccessorFactory, FileDescriptor, StorageAccessor};
use crate::config::StorageConfig;
use crate::utils::errors::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Largest batch accepted by the providers' bulk delete calls.
const DELETE_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectListing {
    pub objects: Vec<ObjectInfo>,
    /// Child prefixes ending with `/`, only filled for delimiter listings
    pub common_prefixes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// Minimal provider client contract.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;
    /// List keys under `prefix`. With `delimiter`, keys below the next
    /// delimiter are rolled up into `common_prefixes`.
    async fn list(&self, prefix: &str, delimiter: bool) -> Result<ObjectListing>;
    async fn delete(&self, keys: &[String]) -> Result<()>;
}

pub struct ObjectStoreAccessor {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStoreAccessor {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn key(&self, path: &str) -> String {
        super::join_path(&[&self.prefix, path])
    }

    fn folder_prefix(&self, path: &str) -> String {
        let key = self.key(path);
        if key.is_empty() {
            key
        } else {
            format!("{key}/")
        }
    }

    fn strip_root<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix)
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(key)
        }
    }
}

#[async_trait]
impl StorageAccessor for ObjectStoreAccessor {
    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.store.get(&self.key(path)).await
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.store.put(&self.key(path), data.to_vec()).await
    }

    async fn list_subfolders(&self, path: &str) -> Result<Vec<String>> {
        let prefix = self.folder_prefix(path);
        let listing = self.store.list(&prefix, true).await?;
        let mut folders: Vec<String> = listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.strip_prefix(&prefix))
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();
        folders.sort();
        folders.dedup();
        Ok(folders)
    }

    async fn list_files(&self, path: &str) -> Result<Vec<FileDescriptor>> {
        let listing = self.store.list(&self.folder_prefix(path), false).await?;
        Ok(listing
            .objects
            .into_iter()
            .map(|o| FileDescriptor {
                path: self.strip_root(&o.key).to_string(),
                size: o.size,
            })
            .collect())
    }

    async fn delete_folder(&self, path: &str) -> Result<()> {
        let listing = self.store.list(&self.folder_prefix(path), false).await?;
        let keys: Vec<String> = listing.objects.into_iter().map(|o| o.key).collect();
        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            self.store.delete(batch).await?;
        }
        Ok(())
    }

    async fn create_folder(&self, _path: &str) -> Result<()> {
        Ok(())
    }
}

type StoreConnector = dyn Fn(&StorageConfig) -> Result<Arc<dyn ObjectStore>> + Send + Sync;

/// Serves one storage kind (`s3`, `azure-blob`, `gcp`) through an object store client.
pub struct ObjectStoreFactory {
    kind: &'static str,
    connect: Box<StoreConnector>,
}

impl ObjectStoreFactory {
    pub fn new<F>(kind: &'static str, connect: F) -> Self
    where
        F: Fn(&StorageConfig) -> Result<Arc<dyn ObjectStore>> + Send + Sync + 'static,
    {
        Self {
            kind,
            connect: Box::new(connect),
        }
    }

    /// Every storage of `kind` shares one client.
    pub fn shared(kind: &'static str, store: Arc<dyn ObjectStore>) -> Self {
        Self::new(kind, move |_| Ok(store.clone()))
    }
}

impl AccessorFactory for ObjectStoreFactory {
    fn supports(&self, storage: &StorageConfig) -> bool {
        storage.kind() == self.kind
    }

    fn create(&self, storage: &StorageConfig) -> Result<Arc<dyn StorageAccessor>> {
        let store = (self.connect)(storage)?;
        Ok(Arc::new(ObjectStoreAccessor::new(
            store,
            storage.object_prefix().unwrap_or_default(),
        )))
    }
}

/// Object store kept in memory. Behaves like a bucket with no versioning.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> crate::utils::errors::BackupError {
    anyhow::anyhow!("object store lock poisoned").into()
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().map_err(poisoned)?.get(key).cloned())
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.objects
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn list(&self, prefix: &str, delimiter: bool) -> Result<ObjectListing> {
        let objects = self.objects.read().map_err(poisoned)?;
        let mut listing = ObjectListing::default();
        for (key, data) in objects.range(prefix.to_string()..) {
            let Some(rest) = key.strip_prefix(prefix) else {
                break;
            };
            match rest.find('/') {
                Some(idx) if delimiter => {
                    let common = format!("{prefix}{}", &rest[..=idx]);
                    if listing.common_prefixes.last() != Some(&common) {
                        listing.common_prefixes.push(common);
                    }
                }
                _ => listing.objects.push(ObjectInfo {
                    key: key.clone(),
                    size: data.len() as u64,
                }),
            }
        }
        Ok(listing)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut objects = self.objects.write().map_err(poisoned)?;
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }
}
