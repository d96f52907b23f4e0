//! FedRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network transports
//! - Persistence
//! - Runtime specifics
//!
//! It covers the sandboxed task model (tasks, resource usage, audit trail) and
//! the federated training model (nodes, requests, deltas, cycles, shared model).

pub mod error;
pub mod event;
pub mod ids;
pub mod node;
pub mod status;
pub mod task;
pub mod training;
pub mod usage;

// Re-export commonly used types
pub use error::{CoreError, ErrorKind};
pub use event::{RuntimeEvent, TelemetryEvent};
pub use ids::{AgentId, CycleId, NodeId, RequestId, TaskId};
pub use node::{Capability, TrainingNode};
pub use status::{AgentStatus, CycleStatus, NodeStatus, StepOutcome, TaskState};
pub use task::{ExecutionStep, FailureKind, Task, TaskFailure, TaskResult};
pub use training::{
    ModelDelta, NodeResult, SharedModel, Tensors, TrainingCycle, TrainingMetrics,
    TrainingParameters, TrainingRequest,
};
pub use usage::{QuotaBreach, ResourceKind, ResourceLimits, ResourceUsage, UsageUpdate};
