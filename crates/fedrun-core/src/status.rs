//! Status enums for tasks, agents, nodes, and training cycles.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a sandboxed task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Task context allocated, monitoring not yet started.
    #[default]
    Created,
    /// Unit of work running under the resource monitor.
    Monitoring,
    /// Unit of work finished first.
    Completed,
    /// Timed out, errored, or panicked.
    Failed,
    /// A resource ceiling was breached.
    QuotaExceeded,
    /// Stopped because the owning agent was decommissioned.
    Terminated,
}

impl TaskState {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::QuotaExceeded | Self::Terminated
        )
    }
}

/// Outcome tag recorded on every audit trail entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure,
    QuotaExceeded,
}

/// Status of an agent in the agent directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Active,
    Inactive,
    Suspended,
    Terminated,
}

impl AgentStatus {
    /// Only active agents may execute tasks.
    pub fn can_execute(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Liveness status of a training node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Node is idle and may be claimed by a dispatch.
    #[default]
    Available,
    /// Node is held by a dispatch in progress.
    Busy,
    /// Node failed its last request or stopped heartbeating.
    Offline,
}

/// Status of a training cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl CycleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}
