//! Resource samplers feeding the [`crate::ResourceMonitor`].
//!
//! The monitor owns the wall-clock dimension; samplers report everything else
//! they can observe and leave the rest as `None`.

use std::sync::Mutex;

use fedrun_core::{ResourceKind, TaskId, UsageUpdate};
use sysinfo::{Pid, System};

use crate::error::SamplerError;

/// Source of resource measurements for a running task.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self, task_id: &TaskId) -> Result<UsageUpdate, SamplerError>;
}

/// Samples memory and CPU of the current process.
///
/// Tasks share the process, so every task observes the same host figures.
pub struct HostSampler {
    pid: Pid,
    system: Mutex<System>,
}

impl HostSampler {
    pub fn new() -> Result<Self, SamplerError> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| SamplerError::Unavailable(e.to_string()))?;
        Ok(Self {
            pid,
            system: Mutex::new(System::new()),
        })
    }
}

impl ResourceSampler for HostSampler {
    fn sample(&self, _task_id: &TaskId) -> Result<UsageUpdate, SamplerError> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| SamplerError::Unavailable("sampler lock poisoned".into()))?;

        if !system.refresh_process(self.pid) {
            return Err(SamplerError::ProcessNotFound(self.pid.to_string()));
        }
        let process = system
            .process(self.pid)
            .ok_or_else(|| SamplerError::ProcessNotFound(self.pid.to_string()))?;

        Ok(UsageUpdate::default()
            .with(ResourceKind::Memory, process.memory() as f64 / (1024.0 * 1024.0))
            .with(ResourceKind::Cpu, f64::from(process.cpu_usage()) / 100.0))
    }
}

/// Reports the same update on every tick.
#[derive(Debug, Clone, Default)]
pub struct FixedSampler {
    update: UsageUpdate,
}

impl FixedSampler {
    pub fn new(update: UsageUpdate) -> Self {
        Self { update }
    }
}

impl ResourceSampler for FixedSampler {
    fn sample(&self, _task_id: &TaskId) -> Result<UsageUpdate, SamplerError> {
        Ok(self.update)
    }
}
