//! Runtime error types.

use fedrun_core::{AgentId, ErrorKind, TaskId};
use thiserror::Error;

/// Error returned by a unit of work.
pub type WorkError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by [`crate::SandboxRuntime`] before a task result exists.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Agent {0} not found or not active")]
    AgentNotActive(AgentId),

    #[error("Resource monitor error: {0}")]
    Monitor(#[from] MonitorError),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AgentNotActive(_) => ErrorKind::AgentNotActive,
            Self::Monitor(_) => ErrorKind::Internal,
        }
    }
}

/// Resource monitor errors.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Task {0} is already being monitored")]
    AlreadyMonitoring(TaskId),

    #[error("Task {0} is not being monitored")]
    NotMonitored(TaskId),
}

/// Resource sampling errors. Logged, never fatal to a task.
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("Resource sampling unavailable: {0}")]
    Unavailable(String),

    #[error("Process {0} not found")]
    ProcessNotFound(String),
}

/// Agent directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Agent {0} is not active")]
    AgentNotActive(AgentId),
}

/// Telemetry sink errors. Swallowed by callers.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Telemetry sink unavailable: {0}")]
    Unavailable(String),
}

/// A sandbox policy refusal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("Path '{0}' is denied")]
    DeniedPath(String),

    #[error("Path '{0}' is outside the allowed paths")]
    PathNotAllowed(String),

    #[error("Path '{0}' escapes its parent directory")]
    PathTraversal(String),

    #[error("Domain '{0}' is denied")]
    DeniedDomain(String),

    #[error("Domain '{0}' is not in the allowed domains")]
    DomainNotAllowed(String),

    #[error("Tool '{0}' is denied")]
    DeniedTool(String),

    #[error("Tool '{0}' is not in the allowed tools")]
    ToolNotAllowed(String),

    #[error("File size {size} exceeds limit {limit}")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Network payload {size} exceeds limit {limit}")]
    PayloadTooLarge { size: u64, limit: u64 },
}
