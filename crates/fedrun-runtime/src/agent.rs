//! Agent directory: who may run tasks, and their long-lived usage record.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use fedrun_core::{AgentId, AgentStatus, ResourceUsage};

use crate::error::DirectoryError;

/// An agent as known to the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub status: AgentStatus,
    /// Usage of the agent's most recent successful task.
    pub resource_usage: ResourceUsage,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Lookup and bookkeeping for agents.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn get_agent(&self, agent_id: &AgentId) -> Option<AgentRecord>;

    async fn update_resource_usage(
        &self,
        agent_id: &AgentId,
        usage: &ResourceUsage,
    ) -> Result<(), DirectoryError>;
}

/// Directory kept in process memory.
#[derive(Default)]
pub struct InMemoryAgentDirectory {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
}

impl InMemoryAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent as active, replacing any previous record.
    pub async fn register(&self, agent_id: impl Into<AgentId>) -> AgentRecord {
        let now = Utc::now();
        let record = AgentRecord {
            id: agent_id.into(),
            status: AgentStatus::Active,
            resource_usage: ResourceUsage::default(),
            created_at: now,
            last_seen: now,
        };
        info!(agent_id = %record.id, "Agent registered");
        self.agents
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        record
    }

    pub async fn set_status(
        &self,
        agent_id: &AgentId,
        status: AgentStatus,
    ) -> Result<(), DirectoryError> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| DirectoryError::AgentNotFound(agent_id.clone()))?;

        info!(agent_id = %agent_id, from = ?agent.status, to = ?status, "Agent status updated");
        agent.status = status;
        agent.last_seen = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl AgentDirectory for InMemoryAgentDirectory {
    async fn get_agent(&self, agent_id: &AgentId) -> Option<AgentRecord> {
        self.agents.read().await.get(agent_id).cloned()
    }

    async fn update_resource_usage(
        &self,
        agent_id: &AgentId,
        usage: &ResourceUsage,
    ) -> Result<(), DirectoryError> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| DirectoryError::AgentNotFound(agent_id.clone()))?;
        if !agent.status.can_execute() {
            return Err(DirectoryError::AgentNotActive(agent_id.clone()));
        }

        agent.resource_usage = *usage;
        agent.last_seen = Utc::now();
        Ok(())
    }
}
