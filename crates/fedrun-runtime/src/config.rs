//! Runtime configuration.

use std::time::Duration;

use fedrun_core::ResourceLimits;

/// Sandbox runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Hard deadline for a single unit of work.
    pub max_execution_time: Duration,

    /// How often the resource monitor samples a task.
    pub sample_interval: Duration,

    /// Per-task resource ceilings.
    pub limits: ResourceLimits,

    /// Apply the sandbox policy to scope checks.
    pub enable_sandboxing: bool,

    /// Fail tasks that breach a ceiling.
    pub enable_quota_enforcement: bool,

    /// Capacity of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let max_execution_time = Duration::from_secs(30 * 60);
        Self {
            max_execution_time,
            sample_interval: Duration::from_secs(1),
            limits: ResourceLimits {
                max_time: max_execution_time.as_secs_f64(),
                ..ResourceLimits::default()
            },
            enable_sandboxing: true,
            enable_quota_enforcement: true,
            event_capacity: 256,
        }
    }
}

impl RuntimeConfig {
    /// Set the execution deadline; the wall-clock ceiling follows it.
    pub fn with_max_execution_time(mut self, timeout: Duration) -> Self {
        self.max_execution_time = timeout;
        self.limits.max_time = timeout.as_secs_f64();
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_quota_enforcement(mut self, enabled: bool) -> Self {
        self.enable_quota_enforcement = enabled;
        self
    }

    pub fn with_sandboxing(mut self, enabled: bool) -> Self {
        self.enable_sandboxing = enabled;
        self
    }
}
