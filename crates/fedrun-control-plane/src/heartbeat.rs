//! Heartbeat sweeper - takes silent nodes out of rotation.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::registry::NodeRegistry;

/// Spawn a task that marks stale available nodes offline every `interval`.
///
/// Abort the returned handle to stop sweeping.
pub fn spawn_heartbeat_monitor(
    registry: Arc<NodeRegistry>,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let stale = registry.sweep_stale(timeout).await;
            if stale.is_empty() {
                debug!("Heartbeat sweep found no stale nodes");
            } else {
                info!(count = stale.len(), "Marked stale nodes offline");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use fedrun_core::{NodeId, NodeStatus, TrainingNode};

    #[tokio::test]
    async fn test_sweeper_marks_silent_nodes_offline() {
        let registry = Arc::new(NodeRegistry::with_nodes([
            TrainingNode::new("node-1", "n1"),
            TrainingNode::new("node-2", "n2"),
        ]));
        let handle = spawn_heartbeat_monitor(
            registry.clone(),
            Duration::from_millis(10),
            Duration::from_millis(30),
        );

        // node-2 keeps heartbeating, node-1 goes silent.
        let node_2 = NodeId::new("node-2");
        for _ in 0..10 {
            registry.record_heartbeat(&node_2).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        let node_1 = registry.get(&NodeId::new("node-1")).await.unwrap();
        assert_eq!(node_1.status, NodeStatus::Offline);
        assert!(registry.get(&node_2).await.unwrap().is_available());
    }
}
