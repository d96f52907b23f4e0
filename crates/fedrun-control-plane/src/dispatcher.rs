//! Training dispatcher - fans one cycle out to every available node.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use fedrun_core::{CycleId, ErrorKind, NodeId, NodeResult, TrainingNode, TrainingRequest};
use fedrun_runtime::telemetry::{self, TelemetrySink};

use crate::registry::NodeRegistry;
use crate::transport::{NodeTransport, TrainingPayload, TransportError};

/// Dispatch errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No training nodes available")]
    NoAvailableNodes,

    #[error("All {attempted} training nodes failed")]
    AllNodesFailed { attempted: usize },
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoAvailableNodes => ErrorKind::NoAvailableNodes,
            Self::AllNodesFailed { .. } => ErrorKind::AllNodesFailed,
        }
    }
}

/// Results of one fan-out.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Successful node results, ordered by node id.
    pub results: Vec<NodeResult>,
    /// Nodes that errored or timed out, ordered by node id.
    pub failed: Vec<NodeId>,
    pub selected: usize,
}

/// Sends a training request to all available nodes in parallel.
pub struct TrainingDispatcher {
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    telemetry: Arc<dyn TelemetrySink>,
    node_timeout: Duration,
}

impl TrainingDispatcher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn NodeTransport>,
        telemetry: Arc<dyn TelemetrySink>,
        node_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            telemetry,
            node_timeout,
        }
    }

    /// Run `request` on every available node and wait for all of them.
    ///
    /// Failing nodes are marked offline and left out of the results. Only a
    /// fan-out where no node succeeds is an error.
    pub async fn dispatch(
        &self,
        cycle_id: &CycleId,
        request: &TrainingRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        let nodes = self.registry.checkout_available().await;
        if nodes.is_empty() {
            warn!(cycle_id = %cycle_id, "No available nodes for training cycle");
            return Err(DispatchError::NoAvailableNodes);
        }

        let selected = nodes.len();
        info!(cycle_id = %cycle_id, nodes = selected, "Dispatching training cycle");

        let payload = Arc::new(TrainingPayload::new(cycle_id, request));
        let attempts = nodes.into_iter().map(|node| {
            let attempt = NodeAttempt {
                registry: self.registry.clone(),
                transport: self.transport.clone(),
                telemetry: self.telemetry.clone(),
                timeout: self.node_timeout,
                payload: payload.clone(),
            };
            let node_id = node.id.clone();
            (node_id, tokio::spawn(attempt.run(node)))
        });
        let (node_ids, handles): (Vec<_>, Vec<_>) = attempts.unzip();

        let mut results = Vec::new();
        let mut failed = Vec::new();
        for (node_id, joined) in node_ids.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(Some(result)) => results.push(result),
                Ok(None) => failed.push(node_id),
                Err(e) => {
                    // The attempt task itself died; do not leave the node claimed.
                    error!(node_id = %node_id, error = %e, "Node attempt panicked");
                    let _ = self.registry.mark_offline(&node_id).await;
                    failed.push(node_id);
                }
            }
        }

        if results.is_empty() {
            error!(cycle_id = %cycle_id, attempted = selected, "All nodes failed");
            return Err(DispatchError::AllNodesFailed {
                attempted: selected,
            });
        }

        info!(
            cycle_id = %cycle_id,
            succeeded = results.len(),
            failed = failed.len(),
            "Dispatch finished"
        );
        Ok(DispatchOutcome {
            results,
            failed,
            selected,
        })
    }
}

struct NodeAttempt {
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    telemetry: Arc<dyn TelemetrySink>,
    timeout: Duration,
    payload: Arc<TrainingPayload>,
}

impl NodeAttempt {
    /// Train on one claimed node and hand the node back.
    async fn run(self, node: TrainingNode) -> Option<NodeResult> {
        let cycle_id = &self.payload.cycle_id;
        telemetry::emit(
            &self.telemetry,
            "training",
            "node_training_started",
            json!({ "cycleId": cycle_id, "nodeId": node.id }),
        );

        let started = Instant::now();
        let response = match tokio::time::timeout(
            self.timeout,
            self.transport
                .send_training_request(&node.address, &self.payload, self.timeout),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => Err(TransportError::Timeout {
                address: node.address.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match response {
            Ok(response) => {
                // Heartbeat before release: an answering node is alive.
                let _ = self.registry.record_heartbeat(&node.id).await;
                if let Err(e) = self.registry.mark_available(&node.id).await {
                    warn!(node_id = %node.id, error = %e, "Could not release node");
                }
                info!(node_id = %node.id, elapsed_ms, "Node training completed");
                telemetry::emit(
                    &self.telemetry,
                    "training",
                    "node_training_completed",
                    json!({
                        "cycleId": cycle_id,
                        "nodeId": node.id,
                        "elapsedMs": elapsed_ms,
                        "metrics": response.metrics,
                    }),
                );
                Some(NodeResult {
                    delta: response.model_delta.tagged(node.id.clone()),
                    node_id: node.id,
                    metrics: response.metrics,
                })
            }
            Err(e) => {
                warn!(node_id = %node.id, error = %e, elapsed_ms, "Node training failed");
                if let Err(e) = self.registry.mark_offline(&node.id).await {
                    warn!(node_id = %node.id, error = %e, "Could not mark node offline");
                }
                telemetry::emit(
                    &self.telemetry,
                    "training",
                    "node_training_failed",
                    json!({ "cycleId": cycle_id, "nodeId": node.id, "error": e.to_string() }),
                );
                None
            }
        }
    }
}
