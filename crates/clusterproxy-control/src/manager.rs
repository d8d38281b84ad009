//! Registry of live tunnels, keyed by cluster name

use clusterproxy_transport::{BoxPacketSink, BoxPacketSource};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::tunnel::{Tunnel, TunnelId, TunnelInfo, DEFAULT_QUEUE_DEPTH};
use crate::TunnelError;

#[derive(Debug)]
pub(crate) struct ManagerShared {
    /// cluster -> instances; a cluster may be connected more than once
    tunnels: RwLock<HashMap<String, BTreeMap<TunnelId, Tunnel>>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl ManagerShared {
    pub(crate) async fn remove(&self, cluster_name: &str, id: TunnelId) -> bool {
        let mut tunnels = self.tunnels.write().await;
        let Some(instances) = tunnels.get_mut(cluster_name) else {
            return false;
        };
        let removed = instances.remove(&id).is_some();
        if instances.is_empty() {
            tunnels.remove(cluster_name);
        }
        if removed {
            debug!(cluster = %cluster_name, tunnel_id = %id, "Tunnel deregistered");
        }
        removed
    }
}

/// Maps cluster names to their live tunnels. Clones share one registry.
#[derive(Debug, Clone)]
pub struct TunnelManager {
    shared: Arc<ManagerShared>,
}

impl TunnelManager {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    /// Per-connection inbound queue depth for tunnels created by this manager
    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                tunnels: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                queue_depth,
            }),
        }
    }

    /// Create and register a tunnel over `sink`/`source`.
    ///
    /// Existing tunnels for the same cluster stay registered.
    pub async fn new_tunnel(
        &self,
        cluster_name: &str,
        sink: BoxPacketSink,
        source: BoxPacketSource,
    ) -> Tunnel {
        let id = TunnelId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let tunnel = Tunnel::build(
            id,
            cluster_name.to_string(),
            sink,
            source,
            self.shared.queue_depth,
            Arc::downgrade(&self.shared),
        );

        let mut tunnels = self.shared.tunnels.write().await;
        let instances = tunnels.entry(cluster_name.to_string()).or_default();
        instances.insert(id, tunnel.clone());

        info!(
            cluster = %cluster_name,
            tunnel_id = %id,
            instances = instances.len(),
            "Tunnel registered"
        );

        tunnel
    }

    /// The most recently registered live tunnel for `cluster_name`
    pub async fn get_tunnel(&self, cluster_name: &str) -> Result<Tunnel, TunnelError> {
        self.shared
            .tunnels
            .read()
            .await
            .get(cluster_name)
            .and_then(|instances| instances.values().rev().find(|t| !t.is_closed()).cloned())
            .ok_or_else(|| TunnelError::NotFound(cluster_name.to_string()))
    }

    /// Remove exactly this instance; returns false if it was already gone
    pub async fn remove_tunnel(&self, cluster_name: &str, id: TunnelId) -> bool {
        self.shared.remove(cluster_name, id).await
    }

    pub async fn list(&self) -> Vec<TunnelInfo> {
        let tunnels = self.shared.tunnels.read().await;
        let mut infos: Vec<TunnelInfo> = tunnels
            .values()
            .flat_map(|instances| instances.values().map(Tunnel::info))
            .collect();
        infos.sort_by(|a, b| {
            a.cluster_name
                .cmp(&b.cluster_name)
                .then(a.tunnel_id.cmp(&b.tunnel_id))
        });
        infos
    }

    pub async fn tunnel_count(&self) -> usize {
        self.shared
            .tunnels
            .read()
            .await
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    /// Ask every tunnel to stop; each deregisters itself once its serve loop exits
    pub async fn close_all(&self) {
        let tunnels = self.shared.tunnels.read().await;
        for tunnel in tunnels.values().flat_map(BTreeMap::values) {
            tunnel.close();
        }
    }
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterproxy_transport::memory_pair;

    fn stream() -> (BoxPacketSink, BoxPacketSource) {
        let (hub, _agent) = memory_pair(4);
        let (sink, source) = hub.split();
        (Box::new(sink), Box::new(source))
    }

    #[tokio::test]
    async fn test_unknown_cluster_not_found() {
        let manager = TunnelManager::new();
        assert!(matches!(
            manager.get_tunnel("unknown-cluster").await,
            Err(TunnelError::NotFound(name)) if name == "unknown-cluster"
        ));
    }

    #[tokio::test]
    async fn test_same_cluster_keeps_both_instances() {
        let manager = TunnelManager::new();
        let (sink, source) = stream();
        let first = manager.new_tunnel("edge", sink, source).await;
        let (sink, source) = stream();
        let second = manager.new_tunnel("edge", sink, source).await;

        assert_ne!(first.id(), second.id());
        assert_eq!(manager.tunnel_count().await, 2);
        assert_eq!(manager.get_tunnel("edge").await.unwrap().id(), second.id());

        // Newest gone: lookup falls back to the older live instance
        assert!(manager.remove_tunnel("edge", second.id()).await);
        assert_eq!(manager.get_tunnel("edge").await.unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn test_closed_instance_is_skipped() {
        let manager = TunnelManager::new();
        let (sink, source) = stream();
        let first = manager.new_tunnel("edge", sink, source).await;
        let (sink, source) = stream();
        let second = manager.new_tunnel("edge", sink, source).await;

        second.close();
        assert_eq!(manager.get_tunnel("edge").await.unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let manager = TunnelManager::new();
        let (sink, source) = stream();
        let tunnel = manager.new_tunnel("edge", sink, source).await;

        assert!(manager.remove_tunnel("edge", tunnel.id()).await);
        assert!(!manager.remove_tunnel("edge", tunnel.id()).await);
        assert!(!manager.remove_tunnel("other", tunnel.id()).await);
        assert_eq!(manager.tunnel_count().await, 0);
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_reports_connections() {
        let manager = TunnelManager::new();
        let (sink, source) = stream();
        let tunnel = manager.new_tunnel("b-cluster", sink, source).await;
        let (sink, source) = stream();
        manager.new_tunnel("a-cluster", sink, source).await;

        let _conn = tunnel.new_logical_connection().unwrap();

        let infos = manager.list().await;
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].cluster_name, "a-cluster");
        assert_eq!(infos[1].cluster_name, "b-cluster");
        assert_eq!(infos[1].active_connections, 1);
    }
}
