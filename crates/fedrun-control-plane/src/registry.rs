//! Node registry - identity, capabilities, and liveness of training nodes.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use fedrun_core::{ErrorKind, NodeId, NodeStatus, TrainingNode};

/// Registry errors. Never fatal to the caller.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node {0} is not available")]
    NodeUnavailable(NodeId),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NodeNotFound(_) => ErrorKind::NodeNotFound,
            Self::NodeUnavailable(_) => ErrorKind::NoAvailableNodes,
        }
    }
}

/// Counts and listing of the node network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub total_nodes: usize,
    pub available_nodes: usize,
    pub busy_nodes: usize,
    pub offline_nodes: usize,
    pub nodes: Vec<TrainingNode>,
}

/// Tracks training nodes.
///
/// A node must be `Available` to be claimed. The claimer owns its status until
/// it hands the node back as `Available` or `Offline`.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, TrainingNode>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding `nodes`.
    pub fn with_nodes(nodes: impl IntoIterator<Item = TrainingNode>) -> Self {
        Self {
            nodes: RwLock::new(nodes.into_iter().map(|n| (n.id.clone(), n)).collect()),
        }
    }

    /// Add or replace a node.
    /// Add `node`, replacing any node with the same id.
    ///
    /// A node currently checked out stays busy until its holder releases it.
    pub async fn register(&self, mut node: TrainingNode) {
        let mut nodes = self.nodes.write().await;
        if nodes
            .get(&node.id)
            .is_some_and(|existing| existing.status == NodeStatus::Busy)
        {
            node.status = NodeStatus::Busy;
        }
        info!(node_id = %node.id, address = %node.address, "Node registered");
        nodes.insert(node.id.clone(), node);
    }

    pub async fn remove(&self, node_id: &NodeId) -> Result<TrainingNode, RegistryError> {
        let removed = self
            .nodes
            .write()
            .await
            .remove(node_id)
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.clone()))?;
        info!(node_id = %node_id, "Node removed");
        Ok(removed)
    }

    pub async fn get(&self, node_id: &NodeId) -> Option<TrainingNode> {
        self.nodes.read().await.get(node_id).cloned()
    }

    /// Nodes in `status`, ordered by id.
    pub async fn list_by_status(&self, status: NodeStatus) -> Vec<TrainingNode> {
        let nodes = self.nodes.read().await;
        let mut selected: Vec<_> = nodes
            .values()
            .filter(|n| n.status == status)
            .cloned()
            .collect();
        selected.sort_by(|a, b| a.id.cmp(&b.id));
        selected
    }

    /// Claim a single available node.
    pub async fn mark_busy(&self, node_id: &NodeId) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.clone()))?;
        if node.status != NodeStatus::Available {
            return Err(RegistryError::NodeUnavailable(node_id.clone()));
        }
        node.status = NodeStatus::Busy;
        Ok(())
    }

    pub async fn mark_available(&self, node_id: &NodeId) -> Result<(), RegistryError> {
        self.set_status(node_id, NodeStatus::Available).await
    }

    pub async fn mark_offline(&self, node_id: &NodeId) -> Result<(), RegistryError> {
        self.set_status(node_id, NodeStatus::Offline).await
    }

    async fn set_status(&self, node_id: &NodeId, status: NodeStatus) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.clone()))?;
        debug!(node_id = %node_id, from = ?node.status, to = ?status, "Node status changed");
        node.status = status;
        Ok(())
    }

    /// Claim every available node at once.
    ///
    /// Two concurrent callers never receive the same node.
    pub async fn checkout_available(&self) -> Vec<TrainingNode> {
        let mut nodes = self.nodes.write().await;
        let mut claimed: Vec<_> = nodes
            .values_mut()
            .filter(|n| n.status == NodeStatus::Available)
            .map(|n| {
                n.status = NodeStatus::Busy;
                n.clone()
            })
            .collect();
        claimed.sort_by(|a, b| a.id.cmp(&b.id));
        claimed
    }

    /// Refresh a node's heartbeat, bringing it back online if it was offline.
    pub async fn record_heartbeat(&self, node_id: &NodeId) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.clone()))?;
        node.last_heartbeat = Utc::now();
        if node.status == NodeStatus::Offline {
            info!(node_id = %node_id, "Node back online");
            node.status = NodeStatus::Available;
        }
        Ok(())
    }

    /// Mark available nodes whose last heartbeat is older than `timeout` as offline.
    ///
    /// Busy nodes are left to their claimer.
    pub async fn sweep_stale(&self, timeout: Duration) -> Vec<NodeId> {
        let cutoff = match chrono::Duration::from_std(timeout) {
            Ok(timeout) => Utc::now() - timeout,
            Err(_) => return Vec::new(),
        };

        let mut nodes = self.nodes.write().await;
        let mut stale = Vec::new();
        for node in nodes.values_mut() {
            if node.status == NodeStatus::Available && node.last_heartbeat < cutoff {
                warn!(
                    node_id = %node.id,
                    last_heartbeat = %node.last_heartbeat,
                    "Node heartbeat timed out"
                );
                node.status = NodeStatus::Offline;
                stale.push(node.id.clone());
            }
        }
        stale.sort();
        stale
    }

    pub async fn network_status(&self) -> NetworkStatus {
        let nodes = self.nodes.read().await;
        let mut status = NetworkStatus {
            total_nodes: nodes.len(),
            available_nodes: 0,
            busy_nodes: 0,
            offline_nodes: 0,
            nodes: nodes.values().cloned().collect(),
        };
        for node in nodes.values() {
            match node.status {
                NodeStatus::Available => status.available_nodes += 1,
                NodeStatus::Busy => status.busy_nodes += 1,
                NodeStatus::Offline => status.offline_nodes += 1,
            }
        }
        status.nodes.sort_by(|a, b| a.id.cmp(&b.id));
        status
    }

    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NodeRegistry {
        NodeRegistry::with_nodes([
            TrainingNode::new("node-1", "http://localhost:8001"),
            TrainingNode::new("node-2", "http://localhost:8002"),
            TrainingNode::new("node-3", "http://localhost:8003").with_status(NodeStatus::Offline),
        ])
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let registry = registry();
        let id = NodeId::new("node-1");

        registry.mark_busy(&id).await.unwrap();
        assert!(matches!(
            registry.mark_busy(&id).await,
            Err(RegistryError::NodeUnavailable(_))
        ));
        registry.mark_offline(&id).await.unwrap();
        assert_eq!(registry.get(&id).await.unwrap().status, NodeStatus::Offline);

        let offline = registry.list_by_status(NodeStatus::Offline).await;
        let ids: Vec<_> = offline.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["node-1", "node-3"]);
    }

    #[tokio::test]
    async fn test_missing_node_is_reported() {
        let registry = registry();
        let ghost = NodeId::new("ghost");

        let err = registry.mark_available(&ghost).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NodeNotFound);
        assert!(registry.remove(&ghost).await.is_err());
        assert!(registry.record_heartbeat(&ghost).await.is_err());
        assert_eq!(registry.node_count().await, 3);
    }

    #[tokio::test]
    async fn test_concurrent_checkout_never_shares_nodes() {
        let registry = std::sync::Arc::new(registry());

        let a = tokio::spawn({
            let registry = registry.clone();
            async move { registry.checkout_available().await }
        });
        let b = tokio::spawn({
            let registry = registry.clone();
            async move { registry.checkout_available().await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(a.len() + b.len(), 2);
        assert!(a.iter().all(|n| !b.iter().any(|m| m.id == n.id)));
        assert_eq!(registry.list_by_status(NodeStatus::Busy).await.len(), 2);
    }

    #[tokio::test]
    async fn test_reregistering_busy_node_keeps_it_claimed() {
        let registry = registry();
        let claimed = registry.checkout_available().await;
        assert_eq!(claimed.len(), 2);

        registry
            .register(TrainingNode::new("node-1", "http://10.0.0.7:8001"))
            .await;
        let node_1 = registry.get(&NodeId::new("node-1")).await.unwrap();
        assert_eq!(node_1.status, NodeStatus::Busy);
        assert_eq!(node_1.address, "http://10.0.0.7:8001");
        assert!(registry.checkout_available().await.is_empty());

        registry.mark_available(&NodeId::new("node-1")).await.unwrap();
        assert_eq!(registry.checkout_available().await.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_and_sweep() {
        let registry = registry();
        let node_3 = NodeId::new("node-3");

        registry.record_heartbeat(&node_3).await.unwrap();
        assert!(registry.get(&node_3).await.unwrap().is_available());

        registry.mark_busy(&NodeId::new("node-2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stale = registry.sweep_stale(Duration::from_millis(5)).await;

        let stale: Vec<_> = stale.iter().map(|id| id.as_str()).collect();
        assert_eq!(stale, vec!["node-1", "node-3"]);
        assert_eq!(
            registry.get(&NodeId::new("node-2")).await.unwrap().status,
            NodeStatus::Busy
        );
    }

    #[tokio::test]
    async fn test_network_status() {
        let registry = registry();
        registry.mark_busy(&NodeId::new("node-2")).await.unwrap();

        let status = registry.network_status().await;
        assert_eq!(status.total_nodes, 3);
        assert_eq!(status.available_nodes, 1);
        assert_eq!(status.busy_nodes, 1);
        assert_eq!(status.offline_nodes, 1);
        assert_eq!(status.nodes[0].id.as_str(), "node-1");
    }
}
