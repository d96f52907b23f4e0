//! Training coordinator - one full dispatch, aggregate, apply cycle.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info};

use fedrun_core::{
    CoreError, CycleId, CycleStatus, ErrorKind, NodeId, SharedModel, TrainingCycle, TrainingNode,
    TrainingRequest,
};
use fedrun_runtime::telemetry::{self, TelemetrySink};

use crate::aggregator::{self, AggregationError};
use crate::config::Config;
use crate::dispatcher::{DispatchError, TrainingDispatcher};
use crate::registry::{NetworkStatus, NodeRegistry, RegistryError};
use crate::store::{SharedModelStore, StoreError};
use crate::transport::NodeTransport;

/// Coordinator errors. Each carries an [`ErrorKind`] and a readable message.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Invalid training request: {0}")]
    InvalidRequest(#[from] CoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("Shared model update failed: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Training cycle not found: {0}")]
    CycleNotFound(CycleId),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(e) => e.kind(),
            Self::Dispatch(e) => e.kind(),
            Self::Aggregation(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Registry(e) => e.kind(),
            Self::CycleNotFound(_) => ErrorKind::CycleNotFound,
        }
    }
}

/// Owns the training pipeline and the record of every cycle.
pub struct TrainingCoordinator {
    registry: Arc<NodeRegistry>,
    dispatcher: TrainingDispatcher,
    store: Arc<SharedModelStore>,
    telemetry: Arc<dyn TelemetrySink>,
    cycles: RwLock<HashMap<CycleId, TrainingCycle>>,
    max_cycle_history: usize,
}

impl TrainingCoordinator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn NodeTransport>,
        store: Arc<SharedModelStore>,
        telemetry: Arc<dyn TelemetrySink>,
        config: &Config,
    ) -> Self {
        let dispatcher = TrainingDispatcher::new(
            registry.clone(),
            transport,
            telemetry.clone(),
            config.node_timeout,
        );
        Self {
            registry,
            dispatcher,
            store,
            telemetry,
            cycles: RwLock::new(HashMap::new()),
            max_cycle_history: config.max_cycle_history,
        }
    }

    /// Build a coordinator from `config` with fresh registry and store.
    pub fn from_config(
        config: &Config,
        transport: Arc<dyn NodeTransport>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self, CoordinatorError> {
        let registry = Arc::new(NodeRegistry::with_nodes(config.nodes.clone()));
        let store = Arc::new(SharedModelStore::new(config.ema_alpha)?);
        Ok(Self::new(registry, transport, store, telemetry, config))
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Run one training cycle end to end.
    ///
    /// The shared model is only touched if at least one node answered and
    /// aggregation succeeded. The recorded cycle is returned either way via
    /// [`Self::training_status`].
    pub async fn execute_training_cycle(
        &self,
        request: &TrainingRequest,
    ) -> Result<TrainingCycle, CoordinatorError> {
        request.validate()?;

        let mut cycle = TrainingCycle::start(request);
        let cycle_id = cycle.id.clone();
        self.cycles
            .write()
            .await
            .insert(cycle_id.clone(), cycle.clone());

        info!(
            cycle_id = %cycle_id,
            agent_id = %request.agent_id,
            model_type = %request.model_type,
            "Training cycle started"
        );
        telemetry::emit(
            &self.telemetry,
            "training",
            "cycle_started",
            json!({
                "cycleId": cycle_id,
                "agentId": request.agent_id,
                "modelType": request.model_type,
            }),
        );

        let result = self.run_cycle(&mut cycle, request).await;

        match &result {
            Ok(version) => {
                info!(
                    cycle_id = %cycle_id,
                    nodes = cycle.nodes_succeeded,
                    version,
                    "Training cycle completed"
                );
                telemetry::emit(
                    &self.telemetry,
                    "training",
                    "cycle_completed",
                    json!({
                        "cycleId": cycle_id,
                        "nodesSelected": cycle.nodes_selected,
                        "nodesSucceeded": cycle.nodes_succeeded,
                        "metrics": cycle.metrics,
                        "modelVersion": version,
                        "durationMs": cycle.duration_ms(),
                    }),
                );
            }
            Err(e) => {
                cycle.fail(e.to_string());
                error!(cycle_id = %cycle_id, kind = %e.kind(), error = %e, "Training cycle failed");
                telemetry::emit(
                    &self.telemetry,
                    "training",
                    "cycle_failed",
                    json!({ "cycleId": cycle_id, "kind": e.kind(), "error": e.to_string() }),
                );
            }
        }

        {
            let mut cycles = self.cycles.write().await;
            cycles.insert(cycle_id, cycle.clone());
            prune_history(&mut cycles, self.max_cycle_history);
        }
        result.map(|_| cycle)
    }

    async fn run_cycle(
        &self,
        cycle: &mut TrainingCycle,
        request: &TrainingRequest,
    ) -> Result<u64, CoordinatorError> {
        let outcome = self.dispatcher.dispatch(&cycle.id, request).await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                if let DispatchError::AllNodesFailed { attempted } = &e {
                    cycle.nodes_selected = *attempted;
                }
                return Err(e.into());
            }
        };
        cycle.nodes_selected = outcome.selected;
        cycle.nodes_succeeded = outcome.results.len();

        let aggregate = aggregator::aggregate(&outcome.results)?;
        let version = self.store.apply_delta(&aggregate.delta).await?;

        telemetry::emit(
            &self.telemetry,
            "model",
            "shared_model_updated",
            json!({
                "cycleId": cycle.id,
                "version": version,
                "contributors": aggregate.contributors,
                "method": aggregate.method,
            }),
        );

        cycle.complete(aggregate.metrics, aggregate.delta, version);
        Ok(version)
    }

    /// Look up a cycle. Only the most recent finished cycles are retained.
    pub async fn training_status(
        &self,
        cycle_id: &CycleId,
    ) -> Result<TrainingCycle, CoordinatorError> {
        self.cycles
            .read()
            .await
            .get(cycle_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::CycleNotFound(cycle_id.clone()))
    }

    /// Cycles in `status`, oldest first.
    pub async fn cycles_by_status(&self, status: CycleStatus) -> Vec<TrainingCycle> {
        let cycles = self.cycles.read().await;
        let mut selected: Vec<_> = cycles
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        selected.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        selected
    }

    pub async fn shared_model(&self) -> SharedModel {
        self.store.snapshot().await
    }

    pub async fn network_status(&self) -> NetworkStatus {
        self.registry.network_status().await
    }

    pub async fn add_node(&self, node: TrainingNode) {
        let payload = json!({ "nodeId": node.id, "address": node.address });
        self.registry.register(node).await;
        telemetry::emit(&self.telemetry, "network", "node_added", payload);
    }

    pub async fn remove_node(&self, node_id: &NodeId) -> Result<TrainingNode, CoordinatorError> {
        let node = self.registry.remove(node_id).await?;
        telemetry::emit(&self.telemetry, "network", "node_removed", json!({ "nodeId": node_id }));
        Ok(node)
    }
}

/// Drop the oldest finished cycles until at most `limit` remain.
///
/// Running cycles are never evicted.
fn prune_history(cycles: &mut HashMap<CycleId, TrainingCycle>, limit: usize) {
    if cycles.len() <= limit {
        return;
    }
    let mut finished: Vec<_> = cycles
        .values()
        .filter(|c| c.status.is_terminal())
        .map(|c| (c.started_at, c.id.clone()))
        .collect();
    finished.sort();
    let excess = cycles.len() - limit;
    for (_, id) in finished.into_iter().take(excess) {
        cycles.remove(&id);
    }
}
