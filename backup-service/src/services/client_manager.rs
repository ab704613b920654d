//! Reference-counted pool of database clients keyed by cluster name.

use crate::config::ClusterConfig;
use crate::engine::{ClientFactory, ClientOptions, DbClient};
use crate::utils::errors::{BackupError, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct ClientInfo {
    client: Arc<dyn DbClient>,
    ref_count: usize,
}

/// Every [`ClientManager::get_client`] must be paired with exactly one
/// [`ClientManager::close`]. The connection is torn down when the last
/// reference is released.
pub struct ClientManager {
    factory: Arc<dyn ClientFactory>,
    clusters: RwLock<HashMap<String, ClusterConfig>>,
    pool: Mutex<HashMap<String, ClientInfo>>,
}

fn same_client(a: &Arc<dyn DbClient>, b: &Arc<dyn DbClient>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl ClientManager {
    pub fn new(factory: Arc<dyn ClientFactory>, clusters: HashMap<String, ClusterConfig>) -> Self {
        Self {
            factory,
            clusters: RwLock::new(clusters),
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the known clusters. Pooled clients stay until released.
    pub fn set_clusters(&self, clusters: HashMap<String, ClusterConfig>) {
        match self.clusters.write() {
            Ok(mut guard) => *guard = clusters,
            Err(poisoned) => *poisoned.into_inner() = clusters,
        }
    }

    fn cluster(&self, name: &str) -> Option<ClusterConfig> {
        match self.clusters.read() {
            Ok(guard) => guard.get(name).cloned(),
            Err(poisoned) => poisoned.into_inner().get(name).cloned(),
        }
    }

    pub async fn get_client(&self, cluster_name: &str) -> Result<Arc<dyn DbClient>> {
        let mut pool = self.pool.lock().await;

        if let Some(info) = pool.get_mut(cluster_name) {
            info.ref_count += 1;
            debug!(cluster = %cluster_name, refs = info.ref_count, "Reusing pooled client");
            return Ok(info.client.clone());
        }

        let cluster = self
            .cluster(cluster_name)
            .ok_or_else(|| BackupError::ClusterNotFound(cluster_name.to_string()))?;
        let options = ClientOptions {
            cluster_name: cluster_name.to_string(),
            label: cluster.label.clone(),
            max_parallel_scans: cluster.max_parallel_scans,
        };

        let client = self
            .factory
            .connect(&cluster, &options)
            .await
            .map_err(|e| {
                BackupError::Client(format!("failed to connect to cluster {cluster_name}: {e}"))
            })?;

        info!(cluster = %cluster_name, "Created database client");
        pool.insert(
            cluster_name.to_string(),
            ClientInfo {
                client: client.clone(),
                ref_count: 1,
            },
        );
        Ok(client)
    }

    /// Release one reference. Clients unknown to the pool are closed directly.
    pub async fn close(&self, client: &Arc<dyn DbClient>) {
        let mut pool = self.pool.lock().await;

        let name = pool
            .iter()
            .find(|(_, info)| same_client(&info.client, client))
            .map(|(name, _)| name.clone());

        let Some(name) = name else {
            warn!("Closing client that is not pooled");
            client.close();
            return;
        };

        if let Some(info) = pool.get_mut(&name) {
            info.ref_count = info.ref_count.saturating_sub(1);
            if info.ref_count > 0 {
                debug!(cluster = %name, refs = info.ref_count, "Released pooled client");
                return;
            }
        }

        if let Some(info) = pool.remove(&name) {
            info.client.close();
            info!(cluster = %name, "Closed database client");
        }
    }

    /// Close every pooled client regardless of outstanding references.
    pub async fn close_all(&self) {
        let mut pool = self.pool.lock().await;
        for (name, info) in pool.drain() {
            info.client.close();
            debug!(cluster = %name, refs = info.ref_count, "Closed client on shutdown");
        }
    }

    pub async fn pooled_count(&self) -> usize {
        self.pool.lock().await.len()
    }

    /// Like [`ClientManager::get_client`], but the reference is released
    /// when the returned lease is released or dropped.
    pub async fn lease(self: &Arc<Self>, cluster_name: &str) -> Result<ClientLease> {
        let client = self.get_client(cluster_name).await?;
        Ok(ClientLease {
            manager: self.clone(),
            client,
            released: false,
        })
    }
}

/// A pooled client reference that is returned to its [`ClientManager`]
/// exactly once, even if the task holding it is aborted or panics.
pub struct ClientLease {
    manager: Arc<ClientManager>,
    client: Arc<dyn DbClient>,
    released: bool,
}

impl ClientLease {
    pub fn client(&self) -> &Arc<dyn DbClient> {
        &self.client
    }

    pub async fn release(mut self) {
        self.released = true;
        self.manager.close(&self.client).await;
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = self.manager.clone();
        let client = self.client.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Releasing client from dropped lease");
                handle.spawn(async move { manager.close(&client).await });
            }
            Err(_) => {
                warn!("No runtime to release client, closing it directly");
                client.close();
            }
        }
    }
}
