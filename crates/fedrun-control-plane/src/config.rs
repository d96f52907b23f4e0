//! Control plane configuration.

use std::time::Duration;

use fedrun_core::{Capability, TrainingNode};

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a single node may take to answer a training request.
    pub node_timeout: Duration,

    /// Weight of an aggregated delta in the shared model update.
    pub ema_alpha: f64,

    /// Heartbeat sweep interval (seconds).
    pub heartbeat_interval_secs: u64,

    /// Heartbeat age after which an idle node is considered offline (seconds).
    pub heartbeat_timeout_secs: u64,

    /// Finished training cycles kept for status queries. Older ones are evicted first.
    pub max_cycle_history: usize,

    /// Nodes registered at startup.
    pub nodes: Vec<TrainingNode>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_secs(5 * 60),
            ema_alpha: 0.1,
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 45,
            max_cycle_history: 1000,
            nodes: default_nodes(),
        }
    }
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Replace the startup nodes with plain training nodes at `addresses`.
    pub fn with_node_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes = addresses
            .into_iter()
            .enumerate()
            .map(|(i, address)| {
                TrainingNode::new(format!("node-{}", i + 1), address)
                    .with_capability(Capability::Training)
                    .with_capability(Capability::FederatedLearning)
            })
            .collect();
        self
    }
}

fn node_address(index: usize, default_port: u16) -> String {
    std::env::var(format!("FEDRUN_NODE_{index}_URL"))
        .unwrap_or_else(|_| format!("http://localhost:{default_port}"))
}

/// The three nodes a fresh control plane knows about.
///
/// Addresses can be overridden with `FEDRUN_NODE_1_URL` through `FEDRUN_NODE_3_URL`.
pub fn default_nodes() -> Vec<TrainingNode> {
    vec![
        TrainingNode::new("node-1", node_address(1, 8001))
            .with_capability(Capability::Training)
            .with_capability(Capability::Inference)
            .with_capability(Capability::FederatedLearning),
        TrainingNode::new("node-2", node_address(2, 8002))
            .with_capability(Capability::Training)
            .with_capability(Capability::Inference),
        TrainingNode::new("node-3", node_address(3, 8003))
            .with_capability(Capability::Training)
            .with_capability(Capability::FederatedLearning),
    ]
}
