//! FedRun sandboxed task runtime.
//!
//! Runs agent units of work under an execution deadline, per-task resource
//! quotas, and a sandbox access policy, keeping an audit trail of every step.

pub mod agent;
pub mod config;
pub mod error;
pub mod monitor;
pub mod policy;
pub mod runtime;
pub mod sampler;
pub mod telemetry;

pub use agent::{AgentDirectory, AgentRecord, InMemoryAgentDirectory};
pub use config::RuntimeConfig;
pub use error::{
    DirectoryError, MonitorError, PolicyViolation, RuntimeError, SamplerError, TelemetryError,
    WorkError,
};
pub use monitor::{BreachReceiver, ResourceMonitor};
pub use policy::SandboxPolicy;
pub use runtime::{RuntimeStats, SandboxRuntime, TaskScope};
pub use sampler::{FixedSampler, HostSampler, ResourceSampler};
pub use telemetry::{emit, MemoryTelemetry, TelemetrySink, TracingTelemetry};
