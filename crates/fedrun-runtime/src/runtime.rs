//! Sandboxed execution of agent units of work.
//!
//! A task races its unit of work against three terminal signals: the
//! execution deadline, a quota breach from the resource monitor, and
//! termination of the owning agent. Whichever fires first decides the
//! outcome; cleanup afterwards is the same for every path.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use fedrun_core::{
    AgentId, ExecutionStep, FailureKind, QuotaBreach, ResourceUsage, RuntimeEvent, StepOutcome,
    Task, TaskFailure, TaskId, TaskResult, TaskState, UsageUpdate,
};

use crate::agent::AgentDirectory;
use crate::config::RuntimeConfig;
use crate::error::{MonitorError, PolicyViolation, RuntimeError, WorkError};
use crate::monitor::ResourceMonitor;
use crate::policy::SandboxPolicy;
use crate::sampler::{FixedSampler, HostSampler, ResourceSampler};
use crate::telemetry::{self, TelemetrySink};

const TERMINATION_REASON: &str = "agent_terminated";

struct ActiveTask {
    task: Task,
    /// Hands the task back to its `execute_task` call when terminated externally.
    terminate_tx: Option<oneshot::Sender<Task>>,
}

type ActiveTasks = Arc<Mutex<HashMap<TaskId, ActiveTask>>>;

fn lock(active: &ActiveTasks) -> MutexGuard<'_, HashMap<TaskId, ActiveTask>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn publish(events: &broadcast::Sender<RuntimeEvent>, event: RuntimeEvent) {
    // No subscribers is fine.
    let _ = events.send(event);
}

/// Append a step to an active task's audit trail and publish it.
///
/// Returns false if the task is no longer active.
fn record_active(
    active: &ActiveTasks,
    events: &broadcast::Sender<RuntimeEvent>,
    task_id: &TaskId,
    step: ExecutionStep,
) -> bool {
    let recorded = {
        let mut tasks = lock(active);
        match tasks.get_mut(task_id) {
            Some(entry) => Some(entry.task.record(step).clone()),
            None => None,
        }
    };
    match recorded {
        Some(step) => {
            debug!(
                task_id = %task_id,
                action = %step.action,
                resource = %step.resource,
                "Execution step"
            );
            publish(
                events,
                RuntimeEvent::ExecutionStep {
                    task_id: task_id.clone(),
                    step,
                },
            );
            true
        }
        None => false,
    }
}

enum RaceOutcome<T> {
    Completed(T),
    Failed(TaskFailure),
    QuotaExceeded(QuotaBreach),
    Terminated(Task),
}

/// Snapshot of runtime load.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeStats {
    pub active_tasks: usize,
    pub total_memory: f64,
    pub total_cpu: f64,
    pub oldest_task_started_at: Option<DateTime<Utc>>,
}

/// Handle given to a unit of work for reporting usage and consulting the sandbox policy.
#[derive(Clone)]
pub struct TaskScope {
    task_id: TaskId,
    agent_id: AgentId,
    sandboxing: bool,
    policy: Arc<SandboxPolicy>,
    monitor: Arc<ResourceMonitor>,
    active: ActiveTasks,
    events: broadcast::Sender<RuntimeEvent>,
}

impl TaskScope {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Report consumption the host sampler cannot see (tokens, network, file operations).
    pub fn report_usage(&self, update: UsageUpdate) -> Result<(), MonitorError> {
        self.monitor.update_usage(&self.task_id, &update)
    }

    pub fn usage(&self) -> Option<ResourceUsage> {
        self.monitor.usage(&self.task_id)
    }

    /// Append a custom step to the task's audit trail.
    pub fn record_step(&self, step: ExecutionStep) -> bool {
        record_active(&self.active, &self.events, &self.task_id, step)
    }

    pub fn check_path(&self, path: &Path) -> Result<(), PolicyViolation> {
        let verdict = self.enforce(|p| p.check_path(path));
        self.audit("access_path", &path.display().to_string(), verdict)
    }

    pub fn check_domain(&self, domain: &str) -> Result<(), PolicyViolation> {
        let verdict = self.enforce(|p| p.check_domain(domain));
        self.audit("access_domain", domain, verdict)
    }

    pub fn check_tool(&self, tool: &str) -> Result<(), PolicyViolation> {
        let verdict = self.enforce(|p| p.check_tool(tool));
        self.audit("use_tool", tool, verdict)
    }

    pub fn check_file_size(&self, size: u64) -> Result<(), PolicyViolation> {
        let verdict = self.enforce(|p| p.check_file_size(size));
        self.audit("file_size", &size.to_string(), verdict)
    }

    pub fn check_network_payload(&self, size: u64) -> Result<(), PolicyViolation> {
        let verdict = self.enforce(|p| p.check_network_payload(size));
        self.audit("network_payload", &size.to_string(), verdict)
    }

    fn enforce(
        &self,
        check: impl FnOnce(&SandboxPolicy) -> Result<(), PolicyViolation>,
    ) -> Result<(), PolicyViolation> {
        if self.sandboxing {
            check(&self.policy)
        } else {
            Ok(())
        }
    }

    fn audit(
        &self,
        action: &str,
        resource: &str,
        verdict: Result<(), PolicyViolation>,
    ) -> Result<(), PolicyViolation> {
        let step = match &verdict {
            Ok(()) => ExecutionStep::new(action, resource, 0, StepOutcome::Success),
            Err(violation) => {
                warn!(
                    task_id = %self.task_id,
                    action,
                    resource,
                    error = %violation,
                    "Sandbox policy violation"
                );
                ExecutionStep::new(action, resource, 0, StepOutcome::Failure)
                    .with_detail("violation", violation)
            }
        };
        self.record_step(step);
        verdict
    }
}

/// Executes units of work under a deadline, resource monitoring, and sandbox policy.
pub struct SandboxRuntime {
    config: RuntimeConfig,
    policy: Arc<SandboxPolicy>,
    monitor: Arc<ResourceMonitor>,
    agents: Arc<dyn AgentDirectory>,
    telemetry: Arc<dyn TelemetrySink>,
    events: broadcast::Sender<RuntimeEvent>,
    active: ActiveTasks,
}

impl SandboxRuntime {
    /// Create a runtime with the default policy, sampling the host process.
    pub fn new(
        config: RuntimeConfig,
        agents: Arc<dyn AgentDirectory>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let sampler: Arc<dyn ResourceSampler> = match HostSampler::new() {
            Ok(sampler) => Arc::new(sampler),
            Err(e) => {
                warn!(error = %e, "Host sampling unavailable, falling back to fixed sampler");
                Arc::new(FixedSampler::default())
            }
        };
        let monitor = Arc::new(Self::build_monitor(&config, sampler));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            config,
            policy: Arc::new(SandboxPolicy::default()),
            monitor,
            agents,
            telemetry,
            events,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Builder method to replace the sandbox policy.
    pub fn with_policy(mut self, policy: SandboxPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Builder method to replace the resource sampler.
    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.monitor = Arc::new(Self::build_monitor(&self.config, sampler));
        self
    }

    fn build_monitor(config: &RuntimeConfig, sampler: Arc<dyn ResourceSampler>) -> ResourceMonitor {
        ResourceMonitor::new(
            config.limits,
            config.sample_interval,
            config.enable_quota_enforcement,
            sampler,
        )
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    /// Run `work` for `agent_id` in the sandbox.
    ///
    /// Fails up front only if the agent is unknown or not active. Every
    /// other outcome, including timeouts and quota breaches, is reported in
    /// the returned [`TaskResult`].
    pub async fn execute_task<F, Fut, T>(
        &self,
        agent_id: &AgentId,
        work: F,
        metadata: BTreeMap<String, String>,
    ) -> Result<TaskResult<T>, RuntimeError>
    where
        F: FnOnce(TaskScope) -> Fut,
        Fut: Future<Output = Result<T, WorkError>> + Send + 'static,
        T: Send + 'static,
    {
        match self.agents.get_agent(agent_id).await {
            Some(agent) if agent.status.can_execute() => {}
            _ => {
                warn!(agent_id = %agent_id, "Rejecting task for inactive agent");
                return Err(RuntimeError::AgentNotActive(agent_id.clone()));
            }
        }

        let task = Task::new(agent_id.clone()).with_metadata(metadata.clone());
        let task_id = task.id.clone();
        let (terminate_tx, mut terminate_rx) = oneshot::channel();
        lock(&self.active).insert(
            task_id.clone(),
            ActiveTask {
                task,
                terminate_tx: Some(terminate_tx),
            },
        );

        info!(task_id = %task_id, agent_id = %agent_id, "Task started");
        publish(
            &self.events,
            RuntimeEvent::TaskStarted {
                task_id: task_id.clone(),
                agent_id: agent_id.clone(),
                metadata: metadata.clone(),
            },
        );
        telemetry::emit(
            &self.telemetry,
            "runtime",
            "task_started",
            json!({ "taskId": task_id, "agentId": agent_id, "metadata": metadata }),
        );

        let mut breach_rx = match self.monitor.start_monitoring(&task_id) {
            Ok(rx) => rx,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to start resource monitoring");
                lock(&self.active).remove(&task_id);
                self.cleanup_notice(&task_id, agent_id);
                return Err(e.into());
            }
        };
        if let Some(entry) = lock(&self.active).get_mut(&task_id) {
            entry.task.state = TaskState::Monitoring;
        }

        let timeout = self.config.max_execution_time;
        record_active(
            &self.active,
            &self.events,
            &task_id,
            ExecutionStep::new("task_started", "execution", 0, StepOutcome::Success)
                .with_detail("timeout_ms", timeout.as_millis()),
        );

        let scope = TaskScope {
            task_id: task_id.clone(),
            agent_id: agent_id.clone(),
            sandboxing: self.config.enable_sandboxing,
            policy: self.policy.clone(),
            monitor: self.monitor.clone(),
            active: self.active.clone(),
            events: self.events.clone(),
        };
        let mut handle = tokio::spawn(work(scope));

        let outcome = tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(output)) => RaceOutcome::Completed(output),
                Ok(Err(e)) => {
                    RaceOutcome::Failed(TaskFailure::new(FailureKind::WorkFailed, e.to_string()))
                }
                Err(e) => RaceOutcome::Failed(TaskFailure::new(
                    FailureKind::WorkFailed,
                    format!("unit of work panicked: {e}"),
                )),
            },
            _ = tokio::time::sleep(timeout) => RaceOutcome::Failed(TaskFailure::new(
                FailureKind::ExecutionTimeout,
                format!("Task execution timeout after {}ms", timeout.as_millis()),
            )),
            Ok(breach) = &mut breach_rx => RaceOutcome::QuotaExceeded(breach),
            Ok(task) = &mut terminate_rx => RaceOutcome::Terminated(task),
        };

        // The unit of work may still be running; its result is ignored from here on.
        if !handle.is_finished() {
            handle.abort();
        }
        let final_usage = self.monitor.release(&task_id);

        // Usage reported just before returning may not have been sampled yet.
        let outcome = match outcome {
            RaceOutcome::Completed(output) if self.config.enable_quota_enforcement => {
                let breach = breach_rx.try_recv().ok().or_else(|| {
                    final_usage
                        .as_ref()
                        .and_then(|usage| self.monitor.limits().first_breach(usage))
                });
                match breach {
                    Some(breach) => RaceOutcome::QuotaExceeded(breach),
                    None => RaceOutcome::Completed(output),
                }
            }
            other => other,
        };

        let (mut task, outcome) = match outcome {
            RaceOutcome::Terminated(task) => (task, None),
            other => {
                let removed = lock(&self.active).remove(&task_id);
                match removed {
                    Some(entry) => (entry.task, Some(other)),
                    // Terminated after the race was decided but before cleanup.
                    None => match terminate_rx.try_recv() {
                        Ok(task) => (task, None),
                        Err(_) => {
                            error!(task_id = %task_id, "Task context vanished during cleanup");
                            let mut task = Task::new(agent_id.clone());
                            task.id = task_id.clone();
                            (task, None)
                        }
                    },
                }
            }
        };
        if let Some(usage) = final_usage {
            task.usage = usage;
        }

        let result = match outcome {
            Some(RaceOutcome::Completed(output)) => self.finish_success(task, output).await,
            Some(RaceOutcome::QuotaExceeded(breach)) => {
                publish(
                    &self.events,
                    RuntimeEvent::QuotaBreach {
                        task_id: task_id.clone(),
                        breach,
                    },
                );
                let failure = TaskFailure::new(FailureKind::QuotaExceeded, breach.to_string());
                let step = ExecutionStep::new(
                    "quota_exceeded",
                    breach.resource.as_str(),
                    task.elapsed_ms(),
                    StepOutcome::QuotaExceeded,
                )
                .with_detail("current", breach.current)
                .with_detail("limit", breach.limit);
                self.finish_failure(task, failure, Some(step)).await
            }
            Some(RaceOutcome::Failed(failure)) => {
                let step = ExecutionStep::new(
                    "task_failed",
                    "execution",
                    task.elapsed_ms(),
                    failure.kind.step_outcome(),
                )
                .with_detail("error", &failure.message);
                self.finish_failure(task, failure, Some(step)).await
            }
            Some(RaceOutcome::Terminated(_)) | None => {
                let failure = TaskFailure::new(
                    FailureKind::Terminated,
                    format!("Task terminated: {TERMINATION_REASON}"),
                );
                self.finish_failure(task, failure, None).await
            }
        };

        self.cleanup_notice(&task_id, agent_id);
        Ok(result)
    }

    async fn finish_success<T>(&self, mut task: Task, output: T) -> TaskResult<T> {
        task.state = TaskState::Completed;
        let step = ExecutionStep::new(
            "task_completed",
            "execution",
            task.elapsed_ms(),
            StepOutcome::Success,
        );
        self.record_owned(&mut task, step);

        if let Err(e) = self
            .agents
            .update_resource_usage(&task.agent_id, &task.usage)
            .await
        {
            warn!(agent_id = %task.agent_id, error = %e, "Failed to update agent resource usage");
        }

        let result = TaskResult::completed(task.clone(), output);
        info!(
            task_id = %task.id,
            execution_time_ms = result.execution_time_ms,
            "Task completed"
        );
        publish(
            &self.events,
            RuntimeEvent::TaskCompleted {
                task_id: task.id.clone(),
                agent_id: task.agent_id.clone(),
                execution_time_ms: result.execution_time_ms,
            },
        );
        telemetry::emit(
            &self.telemetry,
            "runtime",
            "task_completed",
            json!({
                "taskId": task.id,
                "agentId": task.agent_id,
                "executionTimeMs": result.execution_time_ms,
                "resourceUsage": task.usage,
            }),
        );
        result
    }

    async fn finish_failure<T>(
        &self,
        mut task: Task,
        failure: TaskFailure,
        step: Option<ExecutionStep>,
    ) -> TaskResult<T> {
        task.state = failure.kind.task_state();
        if let Some(step) = step {
            self.record_owned(&mut task, step);
        }

        error!(task_id = %task.id, kind = %failure.kind, error = %failure.message, "Task failed");
        publish(
            &self.events,
            RuntimeEvent::TaskFailed {
                task_id: task.id.clone(),
                agent_id: task.agent_id.clone(),
                error: failure.clone(),
            },
        );
        telemetry::emit(
            &self.telemetry,
            "runtime",
            "task_failed",
            json!({
                "taskId": task.id,
                "agentId": task.agent_id,
                "kind": failure.kind,
                "error": failure.message,
            }),
        );
        TaskResult::failed(task, failure)
    }

    fn record_owned(&self, task: &mut Task, step: ExecutionStep) {
        let step = task.record(step).clone();
        publish(
            &self.events,
            RuntimeEvent::ExecutionStep {
                task_id: task.id.clone(),
                step,
            },
        );
    }

    fn cleanup_notice(&self, task_id: &TaskId, agent_id: &AgentId) {
        debug!(task_id = %task_id, "Task cleanup");
        publish(
            &self.events,
            RuntimeEvent::TaskCleanup {
                task_id: task_id.clone(),
                agent_id: agent_id.clone(),
            },
        );
    }

    /// Terminate every active task owned by `agent_id`, returning how many were stopped.
    pub async fn terminate_agent_tasks(&self, agent_id: &AgentId) -> usize {
        let terminated: Vec<(TaskId, ExecutionStep)> = {
            let mut tasks = lock(&self.active);
            let ids: Vec<TaskId> = tasks
                .iter()
                .filter(|(_, entry)| &entry.task.agent_id == agent_id)
                .map(|(id, _)| id.clone())
                .collect();

            let mut terminated = Vec::with_capacity(ids.len());
            for id in ids {
                self.monitor.stop_monitoring(&id);
                let Some(mut entry) = tasks.remove(&id) else {
                    continue;
                };
                entry.task.state = TaskState::Terminated;
                let step = entry
                    .task
                    .record(
                        ExecutionStep::new("task_terminated", "execution", 0, StepOutcome::Failure)
                            .with_detail("reason", TERMINATION_REASON),
                    )
                    .clone();
                if let Some(tx) = entry.terminate_tx.take() {
                    // The executing call may have already returned.
                    let _ = tx.send(entry.task);
                }
                terminated.push((id, step));
            }
            terminated
        };

        for (task_id, step) in &terminated {
            info!(task_id = %task_id, agent_id = %agent_id, "Task terminated");
            publish(
                &self.events,
                RuntimeEvent::ExecutionStep {
                    task_id: task_id.clone(),
                    step: step.clone(),
                },
            );
            publish(
                &self.events,
                RuntimeEvent::TaskTerminated {
                    task_id: task_id.clone(),
                    agent_id: agent_id.clone(),
                    reason: TERMINATION_REASON.to_string(),
                },
            );
            telemetry::emit(
                &self.telemetry,
                "runtime",
                "task_terminated",
                json!({ "taskId": task_id, "agentId": agent_id, "reason": TERMINATION_REASON }),
            );
        }

        terminated.len()
    }

    pub fn active_task_count(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn active_tasks_for(&self, agent_id: &AgentId) -> usize {
        lock(&self.active)
            .values()
            .filter(|entry| &entry.task.agent_id == agent_id)
            .count()
    }

    /// Snapshot of an active task with its latest usage.
    pub fn task_context(&self, task_id: &TaskId) -> Option<Task> {
        let mut task = lock(&self.active).get(task_id)?.task.clone();
        if let Some(usage) = self.monitor.usage(task_id) {
            task.usage = usage;
        }
        Some(task)
    }

    pub fn runtime_stats(&self) -> RuntimeStats {
        let tasks = lock(&self.active);
        let mut stats = RuntimeStats {
            active_tasks: tasks.len(),
            total_memory: 0.0,
            total_cpu: 0.0,
            oldest_task_started_at: None,
        };
        for (task_id, entry) in tasks.iter() {
            if let Some(usage) = self.monitor.usage(task_id) {
                stats.total_memory += usage.memory;
                stats.total_cpu += usage.cpu;
            }
            let started = entry.task.started_at;
            if stats.oldest_task_started_at.map_or(true, |oldest| started < oldest) {
                stats.oldest_task_started_at = Some(started);
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fedrun_core::{AgentStatus, ResourceKind};

    use crate::agent::InMemoryAgentDirectory;
    use crate::telemetry::tests::StalledSink;
    use crate::telemetry::MemoryTelemetry;

    struct Harness {
        runtime: Arc<SandboxRuntime>,
        agents: Arc<InMemoryAgentDirectory>,
        telemetry: Arc<MemoryTelemetry>,
        agent_id: AgentId,
    }

    async fn harness(config: RuntimeConfig, sampler: FixedSampler) -> Harness {
        let agents = Arc::new(InMemoryAgentDirectory::new());
        let telemetry = Arc::new(MemoryTelemetry::new());
        let agent_id = agents.register("agent-1").await.id;
        let runtime = SandboxRuntime::new(config, agents.clone(), telemetry.clone())
            .with_sampler(Arc::new(sampler));
        Harness {
            runtime: Arc::new(runtime),
            agents,
            telemetry,
            agent_id,
        }
    }

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig::default()
            .with_max_execution_time(Duration::from_secs(5))
            .with_sample_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_successful_task() {
        let h = harness(fast_config(), FixedSampler::default()).await;

        let result = h
            .runtime
            .execute_task(
                &h.agent_id,
                |scope| async move {
                    scope.report_usage(UsageUpdate::default().with(ResourceKind::Tokens, 42.0))?;
                    Ok::<_, WorkError>("done")
                },
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output, Some("done"));
        assert!(result.error.is_none());
        assert_eq!(result.resource_usage.tokens, 42.0);
        assert_eq!(result.audit_trail.first().unwrap().action, "task_started");
        assert_eq!(result.audit_trail.last().unwrap().action, "task_completed");
        assert_eq!(h.runtime.active_task_count(), 0);
        assert_eq!(h.runtime.monitor().active_monitors(), 0);

        let agent = h.agents.get_agent(&h.agent_id).await.unwrap();
        assert_eq!(agent.resource_usage.tokens, 42.0);
        assert_eq!(
            h.telemetry.wait_for("runtime", 2).await,
            vec!["task_started", "task_completed"]
        );
    }

    #[tokio::test]
    async fn test_inactive_agent_rejected() {
        let h = harness(fast_config(), FixedSampler::default()).await;
        h.agents
            .set_status(&h.agent_id, AgentStatus::Suspended)
            .await
            .unwrap();

        let err = h
            .runtime
            .execute_task(&h.agent_id, |_| async { Ok::<_, WorkError>(()) }, BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AgentNotActive(_)));

        let unknown = h
            .runtime
            .execute_task(
                &AgentId::new("ghost"),
                |_| async { Ok::<_, WorkError>(()) },
                BTreeMap::new(),
            )
            .await;
        assert!(matches!(unknown, Err(RuntimeError::AgentNotActive(_))));
    }

    #[tokio::test]
    async fn test_timeout_returns_promptly() {
        let config = fast_config()
            .with_max_execution_time(Duration::from_millis(50))
            .with_sample_interval(Duration::from_millis(100));
        let h = harness(config, FixedSampler::default()).await;

        let started = std::time::Instant::now();
        let result = h
            .runtime
            .execute_task(
                &h.agent_id,
                |_| async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok::<_, WorkError>(())
                },
                BTreeMap::new(),
            )
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(!result.success);
        assert_eq!(result.failure_kind(), Some(FailureKind::ExecutionTimeout));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(300), "took {elapsed:?}");
        assert_eq!(h.runtime.active_task_count(), 0);
    }

    #[tokio::test]
    async fn test_quota_breach_fails_task() {
        let sampler = FixedSampler::new(UsageUpdate::default().with(ResourceKind::Memory, 512.0));
        let h = harness(fast_config(), sampler).await;

        let result = h
            .runtime
            .execute_task(
                &h.agent_id,
                |_| async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok::<_, WorkError>("too late")
                },
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.output.is_none());
        assert_eq!(result.failure_kind(), Some(FailureKind::QuotaExceeded));
        let last = result.audit_trail.last().unwrap();
        assert_eq!(last.outcome, StepOutcome::QuotaExceeded);
        assert_eq!(last.resource, "memory");
        assert_eq!(result.resource_usage.memory, 512.0);
    }

    #[tokio::test]
    async fn test_usage_reported_before_return_is_enforced() {
        let h = harness(fast_config(), FixedSampler::default()).await;

        let result = h
            .runtime
            .execute_task(
                &h.agent_id,
                |scope| async move {
                    scope.report_usage(
                        UsageUpdate::default().with(ResourceKind::Tokens, 20_000.0),
                    )?;
                    Ok::<_, WorkError>("over budget")
                },
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.output.is_none());
        assert_eq!(result.failure_kind(), Some(FailureKind::QuotaExceeded));
        let last = result.audit_trail.last().unwrap();
        assert_eq!(last.outcome, StepOutcome::QuotaExceeded);
        assert_eq!(last.resource, "tokens");
        assert_eq!(result.resource_usage.tokens, 20_000.0);
    }

    #[tokio::test]
    async fn test_over_limit_usage_allowed_without_enforcement() {
        let h = harness(
            fast_config().with_quota_enforcement(false),
            FixedSampler::default(),
        )
        .await;

        let result = h
            .runtime
            .execute_task(
                &h.agent_id,
                |scope| async move {
                    scope.report_usage(
                        UsageUpdate::default().with(ResourceKind::Tokens, 20_000.0),
                    )?;
                    Ok::<_, WorkError>(())
                },
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
    }

    #[tokio::test]
    async fn test_stalled_telemetry_does_not_delay_timeout() {
        let agents = Arc::new(InMemoryAgentDirectory::new());
        let agent_id = agents.register("agent-1").await.id;
        let config = fast_config()
            .with_max_execution_time(Duration::from_millis(50))
            .with_sample_interval(Duration::from_millis(100));
        let runtime = SandboxRuntime::new(config, agents, Arc::new(StalledSink))
            .with_sampler(Arc::new(FixedSampler::default()));

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            runtime.execute_task(
                &agent_id,
                |_| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, WorkError>(())
                },
                BTreeMap::new(),
            ),
        )
        .await
        .expect("execute_task blocked on telemetry")
        .unwrap();

        assert_eq!(result.failure_kind(), Some(FailureKind::ExecutionTimeout));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_work_error_fails_task() {
        let h = harness(fast_config(), FixedSampler::default()).await;

        let result = h
            .runtime
            .execute_task(
                &h.agent_id,
                |_| async { Err::<(), WorkError>("model exploded".into()) },
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.failure_kind(), Some(FailureKind::WorkFailed));
        assert_eq!(result.error.unwrap().message, "model exploded");
        assert_eq!(
            h.telemetry.wait_for("runtime", 2).await,
            vec!["task_started", "task_failed"]
        );
    }

    #[tokio::test]
    async fn test_policy_checks_are_audited() {
        let h = harness(fast_config(), FixedSampler::default()).await;

        let result = h
            .runtime
            .execute_task(
                &h.agent_id,
                |scope| async move {
                    scope.check_tool("rag")?;
                    scope.check_path(Path::new("/etc/shadow"))?;
                    Ok::<_, WorkError>(())
                },
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.failure_kind(), Some(FailureKind::WorkFailed));
        let actions: Vec<_> = result
            .audit_trail
            .iter()
            .map(|s| (s.action.as_str(), s.outcome))
            .collect();
        assert_eq!(
            actions,
            vec![
                ("task_started", StepOutcome::Success),
                ("use_tool", StepOutcome::Success),
                ("access_path", StepOutcome::Failure),
                ("task_failed", StepOutcome::Failure),
            ]
        );
        let timestamps: Vec<_> = result.audit_trail.iter().map(|s| s.timestamp).collect();
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_sandboxing_disabled_allows_everything() {
        let h = harness(fast_config().with_sandboxing(false), FixedSampler::default()).await;

        let result = h
            .runtime
            .execute_task(
                &h.agent_id,
                |scope| async move {
                    scope.check_tool("shell")?;
                    Ok::<_, WorkError>(())
                },
                BTreeMap::new(),
            )
            .await
            .unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_terminate_agent_tasks() {
        let h = harness(fast_config(), FixedSampler::default()).await;
        let other = h.agents.register("agent-2").await.id;

        let spawn_task = |agent_id: AgentId| {
            let runtime = h.runtime.clone();
            tokio::spawn(async move {
                runtime
                    .execute_task(
                        &agent_id,
                        |_| async {
                            tokio::time::sleep(Duration::from_secs(3)).await;
                            Ok::<_, WorkError>(())
                        },
                        BTreeMap::new(),
                    )
                    .await
            })
        };
        let first = spawn_task(h.agent_id.clone());
        let second = spawn_task(h.agent_id.clone());
        let bystander = spawn_task(other.clone());

        for _ in 0..100 {
            if h.runtime.active_task_count() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.runtime.active_tasks_for(&h.agent_id), 2);

        let terminated = h.runtime.terminate_agent_tasks(&h.agent_id).await;
        assert_eq!(terminated, 2);
        assert_eq!(h.runtime.active_tasks_for(&h.agent_id), 0);
        assert_eq!(h.runtime.active_tasks_for(&other), 1);

        for handle in [first, second] {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.failure_kind(), Some(FailureKind::Terminated));
            assert!(result
                .audit_trail
                .iter()
                .any(|s| s.action == "task_terminated"));
        }

        assert_eq!(h.runtime.terminate_agent_tasks(&other).await, 1);
        let result = bystander.await.unwrap().unwrap();
        assert_eq!(result.failure_kind(), Some(FailureKind::Terminated));
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let h = harness(fast_config(), FixedSampler::default()).await;
        let mut events = h.runtime.subscribe();

        h.runtime
            .execute_task(&h.agent_id, |_| async { Ok::<_, WorkError>(1) }, BTreeMap::new())
            .await
            .unwrap();

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert_eq!(
            names,
            vec![
                "task_started",
                "execution_step",
                "execution_step",
                "task_completed",
                "task_cleanup"
            ]
        );
    }

    #[tokio::test]
    async fn test_runtime_stats_and_context() {
        let sampler = FixedSampler::new(UsageUpdate::default().with(ResourceKind::Memory, 50.0));
        let h = harness(fast_config(), sampler).await;
        let runtime = h.runtime.clone();
        let agent_id = h.agent_id.clone();

        let (seen_tx, seen_rx) = oneshot::channel();
        let running = tokio::spawn(async move {
            runtime
                .execute_task(
                    &agent_id,
                    |scope| async move {
                        let _ = seen_tx.send(scope.task_id().clone());
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, WorkError>(())
                    },
                    BTreeMap::new(),
                )
                .await
        });

        let task_id = seen_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let stats = h.runtime.runtime_stats();
        assert_eq!(stats.active_tasks, 1);
        assert_eq!(stats.total_memory, 50.0);
        assert!(stats.oldest_task_started_at.is_some());

        let context = h.runtime.task_context(&task_id).unwrap();
        assert_eq!(context.state, TaskState::Monitoring);
        assert_eq!(context.usage.memory, 50.0);

        assert!(running.await.unwrap().unwrap().success);
        assert!(h.runtime.task_context(&task_id).is_none());
    }
}
