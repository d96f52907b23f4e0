//! Per-task resource monitoring and quota enforcement.
//!
//! Each monitored task gets one sampling loop. Every tick merges a sample into
//! the task's usage, refreshes elapsed time, and checks ceilings. The first
//! breached dimension stops the loop and is delivered once through the
//! task's [`BreachReceiver`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use fedrun_core::{QuotaBreach, ResourceLimits, ResourceUsage, TaskId, UsageUpdate};

use crate::error::MonitorError;
use crate::sampler::ResourceSampler;

/// Resolves when the task breaches a ceiling.
pub type BreachReceiver = oneshot::Receiver<QuotaBreach>;

struct MonitorSlot {
    usage: ResourceUsage,
    started: Instant,
    sampling: Option<JoinHandle<()>>,
}

type Slots = Arc<Mutex<HashMap<TaskId, MonitorSlot>>>;

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<TaskId, MonitorSlot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracks resource usage of running tasks.
pub struct ResourceMonitor {
    limits: ResourceLimits,
    interval: Duration,
    enforce: bool,
    sampler: Arc<dyn ResourceSampler>,
    slots: Slots,
}

impl ResourceMonitor {
    pub fn new(
        limits: ResourceLimits,
        interval: Duration,
        enforce: bool,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Self {
        Self {
            limits,
            interval,
            enforce,
            sampler,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Start the sampling loop for a task.
    ///
    /// Fails if a loop is already running for this task id.
    pub fn start_monitoring(&self, task_id: &TaskId) -> Result<BreachReceiver, MonitorError> {
        let mut slots = lock(&self.slots);
        if slots.get(task_id).is_some_and(|s| s.sampling.is_some()) {
            return Err(MonitorError::AlreadyMonitoring(task_id.clone()));
        }

        let (breach_tx, breach_rx) = oneshot::channel();
        let sampling = tokio::spawn(sampling_loop(
            task_id.clone(),
            self.slots.clone(),
            self.sampler.clone(),
            self.limits,
            self.interval,
            self.enforce,
            breach_tx,
        ));

        slots.insert(
            task_id.clone(),
            MonitorSlot {
                usage: ResourceUsage::default(),
                started: Instant::now(),
                sampling: Some(sampling),
            },
        );
        debug!(
            task_id = %task_id,
            interval_ms = self.interval.as_millis() as u64,
            "Monitoring started"
        );
        Ok(breach_rx)
    }

    /// Cancel sampling. The last usage snapshot stays readable until [`Self::release`].
    ///
    /// Returns true if a loop was running.
    pub fn stop_monitoring(&self, task_id: &TaskId) -> bool {
        let mut slots = lock(&self.slots);
        let Some(slot) = slots.get_mut(task_id) else {
            return false;
        };
        match slot.sampling.take() {
            Some(handle) => {
                handle.abort();
                slot.usage.time = slot.started.elapsed().as_secs_f64();
                debug!(task_id = %task_id, "Monitoring stopped");
                true
            }
            None => false,
        }
    }

    /// Current usage snapshot for a task.
    pub fn usage(&self, task_id: &TaskId) -> Option<ResourceUsage> {
        lock(&self.slots).get(task_id).map(|s| s.usage)
    }

    /// Merge an externally observed update (tokens, network, file operations).
    pub fn update_usage(&self, task_id: &TaskId, update: &UsageUpdate) -> Result<(), MonitorError> {
        let mut slots = lock(&self.slots);
        let slot = slots
            .get_mut(task_id)
            .ok_or_else(|| MonitorError::NotMonitored(task_id.clone()))?;
        slot.usage.merge(update);
        Ok(())
    }

    /// Stop monitoring and drop the task's state, returning its final usage.
    pub fn release(&self, task_id: &TaskId) -> Option<ResourceUsage> {
        self.stop_monitoring(task_id);
        lock(&self.slots).remove(task_id).map(|s| s.usage)
    }

    pub fn is_monitoring(&self, task_id: &TaskId) -> bool {
        lock(&self.slots)
            .get(task_id)
            .is_some_and(|s| s.sampling.is_some())
    }

    /// Number of running sampling loops.
    pub fn active_monitors(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|s| s.sampling.is_some())
            .count()
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        for slot in lock(&self.slots).values_mut() {
            if let Some(handle) = slot.sampling.take() {
                handle.abort();
            }
        }
    }
}

async fn sampling_loop(
    task_id: TaskId,
    slots: Slots,
    sampler: Arc<dyn ResourceSampler>,
    limits: ResourceLimits,
    interval: Duration,
    enforce: bool,
    breach_tx: oneshot::Sender<QuotaBreach>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let sample = sampler.sample(&task_id);

        let breach = {
            let mut slots = lock(&slots);
            let Some(slot) = slots.get_mut(&task_id) else {
                return;
            };
            match sample {
                Ok(update) => slot.usage.merge(&update),
                Err(e) => warn!(task_id = %task_id, error = %e, "Resource sampling failed"),
            }
            slot.usage.time = slot.started.elapsed().as_secs_f64();

            let breach = if enforce {
                limits.first_breach(&slot.usage)
            } else {
                None
            };
            if breach.is_some() {
                // The loop ends here; detach our own handle instead of aborting it.
                slot.sampling = None;
            }
            breach
        };

        if let Some(breach) = breach {
            handle_quota_breach(&task_id, breach, breach_tx);
            return;
        }
    }
}

fn handle_quota_breach(
    task_id: &TaskId,
    breach: QuotaBreach,
    breach_tx: oneshot::Sender<QuotaBreach>,
) {
    warn!(
        task_id = %task_id,
        resource = %breach.resource,
        current = breach.current,
        limit = breach.limit,
        "Quota breach detected"
    );
    if breach_tx.send(breach).is_err() {
        debug!(task_id = %task_id, "Quota breach receiver already gone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SamplerError;
    use crate::sampler::FixedSampler;
    use fedrun_core::ResourceKind;

    struct FailingSampler;

    impl ResourceSampler for FailingSampler {
        fn sample(&self, _task_id: &TaskId) -> Result<UsageUpdate, SamplerError> {
            Err(SamplerError::Unavailable("no metrics source".into()))
        }
    }

    fn monitor(sampler: impl ResourceSampler + 'static, enforce: bool) -> ResourceMonitor {
        ResourceMonitor::new(
            ResourceLimits::default(),
            Duration::from_millis(10),
            enforce,
            Arc::new(sampler),
        )
    }

    #[tokio::test]
    async fn test_no_duplicate_monitors() {
        let monitor = monitor(FixedSampler::default(), true);
        let task_id = TaskId::new("t-1");

        let _rx = monitor.start_monitoring(&task_id).unwrap();
        assert!(matches!(
            monitor.start_monitoring(&task_id),
            Err(MonitorError::AlreadyMonitoring(_))
        ));
        assert_eq!(monitor.active_monitors(), 1);

        assert!(monitor.stop_monitoring(&task_id));
        assert!(!monitor.stop_monitoring(&task_id));
        assert_eq!(monitor.active_monitors(), 0);
    }

    #[tokio::test]
    async fn test_breach_reports_first_dimension_in_order() {
        let sampler = FixedSampler::new(
            UsageUpdate::default()
                .with(ResourceKind::Cpu, 8.0)
                .with(ResourceKind::Memory, 512.0),
        );
        let monitor = monitor(sampler, true);
        let task_id = TaskId::new("t-1");

        let rx = monitor.start_monitoring(&task_id).unwrap();
        let breach = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(breach.resource, ResourceKind::Memory);
        assert_eq!(breach.current, 512.0);
        assert_eq!(breach.limit, 200.0);
        assert!(!monitor.is_monitoring(&task_id));
        assert_eq!(monitor.usage(&task_id).unwrap().memory, 512.0);
    }

    #[tokio::test]
    async fn test_sampling_errors_are_not_fatal() {
        let monitor = monitor(FailingSampler, true);
        let task_id = TaskId::new("t-1");

        let mut rx = monitor.start_monitoring(&task_id).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(monitor.is_monitoring(&task_id));
        assert!(rx.try_recv().is_err());
        assert!(monitor.usage(&task_id).unwrap().time > 0.0);
    }

    #[tokio::test]
    async fn test_external_update_is_checked_on_next_tick() {
        let monitor = monitor(FixedSampler::default(), true);
        let task_id = TaskId::new("t-1");

        let rx = monitor.start_monitoring(&task_id).unwrap();
        monitor
            .update_usage(
                &task_id,
                &UsageUpdate::default().with(ResourceKind::Tokens, 10_001.0),
            )
            .unwrap();

        let breach = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(breach.resource, ResourceKind::Tokens);
    }

    #[tokio::test]
    async fn test_enforcement_disabled() {
        let sampler = FixedSampler::new(UsageUpdate::default().with(ResourceKind::Memory, 9_999.0));
        let monitor = monitor(sampler, false);
        let task_id = TaskId::new("t-1");

        let mut rx = monitor.start_monitoring(&task_id).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(monitor.usage(&task_id).unwrap().memory, 9_999.0);
    }

    #[tokio::test]
    async fn test_release_returns_final_usage() {
        let monitor = monitor(FixedSampler::default(), true);
        let task_id = TaskId::new("t-1");

        monitor.start_monitoring(&task_id).unwrap();
        monitor
            .update_usage(&task_id, &UsageUpdate::default().with(ResourceKind::FileOps, 3.0))
            .unwrap();

        let usage = monitor.release(&task_id).unwrap();
        assert_eq!(usage.file_ops, 3.0);
        assert!(monitor.usage(&task_id).is_none());
        assert!(matches!(
            monitor.update_usage(&task_id, &UsageUpdate::default()),
            Err(MonitorError::NotMonitored(_))
        ));
    }
}
