//! Telemetry sink seam.
//!
//! Delivery is fire-and-forget: each event is handed to its own spawned
//! task, so a slow or failing sink never delays the caller. Sink failures
//! are logged and otherwise ignored.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use fedrun_core::TelemetryEvent;

use crate::error::TelemetryError;

/// Receives structured telemetry events.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn log_event(&self, event: TelemetryEvent) -> Result<(), TelemetryError>;
}

/// Upper bound on a single delivery before it is abandoned.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Deliver an event in the background, swallowing sink failures.
///
/// Must be called from within a Tokio runtime.
pub fn emit(
    sink: &Arc<dyn TelemetrySink>,
    category: &str,
    name: &str,
    payload: serde_json::Value,
) {
    let sink = sink.clone();
    let event = TelemetryEvent::new(category, name, payload);
    tokio::spawn(async move {
        let category = event.category.clone();
        let name = event.name.clone();
        match tokio::time::timeout(DELIVERY_TIMEOUT, sink.log_event(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%category, %name, error = %e, "Telemetry delivery failed"),
            Err(_) => warn!(%category, %name, "Telemetry delivery timed out"),
        }
    });
}

/// Writes telemetry to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

#[async_trait]
impl TelemetrySink for TracingTelemetry {
    async fn log_event(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        debug!(
            target: "fedrun::telemetry",
            category = %event.category,
            name = %event.name,
            payload = %event.payload,
            "telemetry"
        );
        Ok(())
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Names of recorded events in `category`, in delivery order.
    pub fn names(&self, category: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.category == category)
            .map(|e| e.name)
            .collect()
    }

    /// Wait until `count` events in `category` have arrived, or one second
    /// has passed, and return their names.
    pub async fn wait_for(&self, category: &str, count: usize) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let names = self.names(category);
            if names.len() >= count || tokio::time::Instant::now() >= deadline {
                return names;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl TelemetrySink for MemoryTelemetry {
    async fn log_event(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        self.events
            .lock()
            .map_err(|_| TelemetryError::Unavailable("event buffer poisoned".into()))?
            .push(event);
        Ok(())
    }
}
