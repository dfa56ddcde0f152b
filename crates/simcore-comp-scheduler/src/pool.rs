// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-replica pool of compute clients, one per cluster.
//!
//! Clients are created lazily on first use and shared by every caller
//! afterwards. A client is dropped from the pool, and its session released,
//! when a scope using it fails with a connectivity error or is cancelled, so
//! the next acquisition reconnects.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use simcore_comp_core::{ClusterId, Result, SchedulerError};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::compute::{
    Cluster, ClusterType, ComputeClient, ComputeClientFactory, FileLinkType, TaskHandlers,
};

type ClientMap = HashMap<ClusterId, Arc<dyn ComputeClient>>;

/// File link types used for the different kinds of clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Link type for the environment-configured cluster.
    pub default_cluster_file_link_type: FileLinkType,
    /// Link type for other permanent clusters.
    pub default_file_link_type: FileLinkType,
    /// Link type for on-demand clusters.
    pub on_demand_clusters_file_link_type: FileLinkType,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            default_cluster_file_link_type: FileLinkType::S3,
            default_file_link_type: FileLinkType::Presigned,
            on_demand_clusters_file_link_type: FileLinkType::Presigned,
        }
    }
}

fn same_client(a: &Arc<dyn ComputeClient>, b: &Arc<dyn ComputeClient>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

async fn evict(
    clients: &Mutex<ClientMap>,
    cluster_id: ClusterId,
    client: &Arc<dyn ComputeClient>,
    reason: &str,
) {
    let removed = {
        let mut map = clients.lock().await;
        match map.get(&cluster_id) {
            Some(current) if same_client(current, client) => map.remove(&cluster_id),
            _ => None,
        }
    };
    if removed.is_some() {
        warn!(cluster_id, reason, "Evicted cluster client");
    }
    if let Err(e) = client.delete().await {
        warn!(cluster_id, error = %e, "Failed to delete evicted cluster client");
    }
}

/// Evicts the client if the scope future is dropped before completing.
struct EvictOnDrop {
    clients: Arc<Mutex<ClientMap>>,
    cluster_id: ClusterId,
    client: Option<Arc<dyn ComputeClient>>,
}

impl EvictOnDrop {
    fn disarm(&mut self) {
        self.client = None;
    }
}

impl Drop for EvictOnDrop {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        let clients = self.clients.clone();
        let cluster_id = self.cluster_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    evict(&clients, cluster_id, &client, "scope cancelled").await;
                });
            }
            Err(_) => {
                warn!(cluster_id, "Scope cancelled outside a runtime, client not evicted");
            }
        }
    }
}

/// Pool of compute clients keyed by cluster.
pub struct ClusterClientPool {
    factory: Arc<dyn ComputeClientFactory>,
    settings: PoolSettings,
    clients: Arc<Mutex<ClientMap>>,
    handlers: RwLock<Option<TaskHandlers>>,
}

impl ClusterClientPool {
    /// Create an empty pool.
    pub fn new(factory: Arc<dyn ComputeClientFactory>, settings: PoolSettings) -> Self {
        Self {
            factory,
            settings,
            clients: Arc::new(Mutex::new(HashMap::new())),
            handlers: RwLock::new(None),
        }
    }

    /// Install the event handlers passed to every client created from now on.
    pub async fn register_handlers(&self, handlers: TaskHandlers) {
        *self.handlers.write().await = Some(handlers);
    }

    /// File link type used for `cluster`.
    pub fn file_link_type_for(&self, cluster: &Cluster) -> FileLinkType {
        if cluster.is_default() {
            self.settings.default_cluster_file_link_type
        } else if cluster.cluster_type == ClusterType::OnDemand {
            self.settings.on_demand_clusters_file_link_type
        } else {
            self.settings.default_file_link_type
        }
    }

    /// Run `scope` with the client of `cluster`, creating it if needed.
    ///
    /// Connectivity errors and cancellations returned by the scope evict the
    /// client before the error is returned. Dropping the returned future
    /// before it completes evicts the client as well.
    pub async fn acquire<F, Fut, T>(&self, cluster: &Cluster, scope: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn ComputeClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = self.get_or_create(cluster).await?;
        let mut guard = EvictOnDrop {
            clients: self.clients.clone(),
            cluster_id: cluster.id,
            client: Some(client.clone()),
        };

        let result = scope(client.clone()).await;
        guard.disarm();

        if let Err(e) = &result
            && e.triggers_client_eviction()
        {
            evict(&self.clients, cluster.id, &client, e.error_code()).await;
        }
        result
    }

    async fn get_or_create(&self, cluster: &Cluster) -> Result<Arc<dyn ComputeClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&cluster.id) {
            return Ok(client.clone());
        }

        let file_link_type = self.file_link_type_for(cluster);
        let handlers = self.handlers.read().await.clone();
        debug!(cluster_id = cluster.id, %file_link_type, "Creating cluster client");

        let client = self
            .factory
            .create(cluster, file_link_type, handlers)
            .await
            .map_err(|e| SchedulerError::ClientAcquisition {
                cluster_id: cluster.id,
                source: Box::new(e),
            })?;
        clients.insert(cluster.id, client.clone());

        info!(
            cluster_id = cluster.id,
            cluster_name = %cluster.name,
            client_type = client.client_type(),
            "Cluster client created"
        );
        Ok(client)
    }

    /// Number of live clients.
    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Whether the pool holds no client.
    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    /// Remove and delete every client, returning the failures.
    pub async fn delete(&self) -> Vec<(ClusterId, SchedulerError)> {
        let drained: Vec<(ClusterId, Arc<dyn ComputeClient>)> =
            self.clients.lock().await.drain().collect();
        let count = drained.len();

        let results = join_all(drained.into_iter().map(|(cluster_id, client)| async move {
            client.delete().await.err().map(|e| (cluster_id, e))
        }))
        .await;
        let failures: Vec<_> = results.into_iter().flatten().collect();

        for (cluster_id, error) in &failures {
            warn!(cluster_id, error = %error, "Failed to delete cluster client");
        }
        info!(clients = count, failed = failures.len(), "Cluster client pool disposed");
        failures
    }
}
