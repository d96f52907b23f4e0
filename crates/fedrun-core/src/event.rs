//! Lifecycle notifications and telemetry payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, ExecutionStep, QuotaBreach, TaskFailure, TaskId};

/// Notification emitted by the sandbox runtime as a task progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    TaskStarted {
        task_id: TaskId,
        agent_id: AgentId,
        metadata: BTreeMap<String, String>,
    },
    ExecutionStep {
        task_id: TaskId,
        step: ExecutionStep,
    },
    QuotaBreach {
        task_id: TaskId,
        breach: QuotaBreach,
    },
    TaskCompleted {
        task_id: TaskId,
        agent_id: AgentId,
        execution_time_ms: u64,
    },
    TaskFailed {
        task_id: TaskId,
        agent_id: AgentId,
        error: TaskFailure,
    },
    TaskTerminated {
        task_id: TaskId,
        agent_id: AgentId,
        reason: String,
    },
    TaskCleanup {
        task_id: TaskId,
        agent_id: AgentId,
    },
}

impl RuntimeEvent {
    /// Short event name, matching the serialized tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskStarted { .. } => "task_started",
            Self::ExecutionStep { .. } => "execution_step",
            Self::QuotaBreach { .. } => "quota_breach",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskTerminated { .. } => "task_terminated",
            Self::TaskCleanup { .. } => "task_cleanup",
        }
    }

    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::TaskStarted { task_id, .. }
            | Self::ExecutionStep { task_id, .. }
            | Self::QuotaBreach { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskTerminated { task_id, .. }
            | Self::TaskCleanup { task_id, .. } => task_id,
        }
    }
}

/// Event forwarded to the telemetry sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub category: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}
