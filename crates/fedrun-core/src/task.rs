//! Sandboxed task context, audit trail, and task results.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, ResourceUsage, StepOutcome, TaskId, TaskState};

/// Immutable audit trail entry describing one execution step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub resource: String,
    pub duration_ms: u64,
    pub outcome: StepOutcome,
    pub details: BTreeMap<String, String>,
}

impl ExecutionStep {
    pub fn new(
        action: impl Into<String>,
        resource: impl Into<String>,
        duration_ms: u64,
        outcome: StepOutcome,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            resource: resource.into(),
            duration_ms,
            outcome,
            details: BTreeMap::new(),
        }
    }

    /// Builder method to attach a detail.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
}

/// A unit of work accepted by the sandbox runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub agent_id: AgentId,
    pub started_at: DateTime<Utc>,
    pub state: TaskState,
    pub usage: ResourceUsage,
    pub metadata: BTreeMap<String, String>,
    /// Append-only, in real-time order.
    pub audit_trail: Vec<ExecutionStep>,
}

impl Task {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            id: TaskId::for_agent(&agent_id),
            agent_id,
            started_at: Utc::now(),
            state: TaskState::Created,
            usage: ResourceUsage::default(),
            metadata: BTreeMap::new(),
            audit_trail: Vec::new(),
        }
    }

    /// Builder method to attach caller metadata.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Append a step, stamping it no earlier than the previous entry.
    pub fn record(&mut self, mut step: ExecutionStep) -> &ExecutionStep {
        if let Some(last) = self.audit_trail.last() {
            if step.timestamp < last.timestamp {
                step.timestamp = last.timestamp;
            }
        }
        self.audit_trail.push(step);
        &self.audit_trail[self.audit_trail.len() - 1]
    }

    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Why a task did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ExecutionTimeout,
    QuotaExceeded,
    Terminated,
    WorkFailed,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionTimeout => "ExecutionTimeout",
            Self::QuotaExceeded => "QuotaExceeded",
            Self::Terminated => "Terminated",
            Self::WorkFailed => "WorkFailed",
        }
    }

    /// Terminal task state this failure maps to.
    pub fn task_state(&self) -> TaskState {
        match self {
            Self::QuotaExceeded => TaskState::QuotaExceeded,
            Self::Terminated => TaskState::Terminated,
            Self::ExecutionTimeout | Self::WorkFailed => TaskState::Failed,
        }
    }

    /// Outcome tag recorded in the audit trail.
    pub fn step_outcome(&self) -> StepOutcome {
        match self {
            Self::QuotaExceeded => StepOutcome::QuotaExceeded,
            _ => StepOutcome::Failure,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure carried by an unsuccessful [`TaskResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of one sandboxed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult<T> {
    pub task_id: TaskId,
    pub success: bool,
    pub output: Option<T>,
    pub error: Option<TaskFailure>,
    pub execution_time_ms: u64,
    pub resource_usage: ResourceUsage,
    pub audit_trail: Vec<ExecutionStep>,
}

impl<T> TaskResult<T> {
    pub fn completed(task: Task, output: T) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            execution_time_ms: task.elapsed_ms(),
            task_id: task.id,
            resource_usage: task.usage,
            audit_trail: task.audit_trail,
        }
    }

    pub fn failed(task: Task, failure: TaskFailure) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(failure),
            execution_time_ms: task.elapsed_ms(),
            task_id: task.id,
            resource_usage: task.usage,
            audit_trail: task.audit_trail,
        }
    }

    /// Kind of failure, if the task did not succeed.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
