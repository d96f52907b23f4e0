//! Training node information types.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{NodeId, NodeStatus};

/// Work a node advertises it can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Training,
    Inference,
    FederatedLearning,
}

/// A worker node in the training network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingNode {
    /// Unique node identifier.
    pub id: NodeId,

    /// Base URL the node accepts training requests on.
    pub address: String,

    pub capabilities: BTreeSet<Capability>,

    pub status: NodeStatus,

    pub last_heartbeat: DateTime<Utc>,
}

impl TrainingNode {
    /// Create an available node with no capabilities.
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            capabilities: BTreeSet::new(),
            status: NodeStatus::Available,
            last_heartbeat: Utc::now(),
        }
    }

    /// Builder method to add a capability.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    /// Builder method to override the initial status.
    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn is_available(&self) -> bool {
        self.status == NodeStatus::Available
    }
}
