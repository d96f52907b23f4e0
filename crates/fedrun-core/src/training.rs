//! Training requests, model deltas, metrics, cycles, and the shared model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AgentId, CoreError, CycleId, CycleStatus, NodeId, RequestId};

/// Named numeric arrays.
pub type Tensors = BTreeMap<String, Vec<f64>>;

/// Hyperparameters forwarded to every node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingParameters {
    pub learning_rate: f64,
    pub epochs: u32,
    pub batch_size: u32,
}

impl Default for TrainingParameters {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            epochs: 1,
            batch_size: 32,
        }
    }
}

/// A request from an agent to run one distributed training cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingRequest {
    pub id: RequestId,
    pub agent_id: AgentId,
    pub model_type: String,
    pub parameters: TrainingParameters,
    /// Free-form parameters passed through to nodes untouched.
    #[serde(default)]
    pub training_params: serde_json::Value,
    /// Reference to the training data the nodes should load.
    pub data_ref: String,
}

impl TrainingRequest {
    pub fn new(
        agent_id: impl Into<AgentId>,
        model_type: impl Into<String>,
        data_ref: impl Into<String>,
    ) -> Self {
        Self {
            id: RequestId::generate(),
            agent_id: agent_id.into(),
            model_type: model_type.into(),
            parameters: TrainingParameters::default(),
            training_params: serde_json::Value::Null,
            data_ref: data_ref.into(),
        }
    }

    /// Builder method to set hyperparameters.
    pub fn with_parameters(mut self, parameters: TrainingParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Builder method to attach pass-through parameters.
    pub fn with_training_params(mut self, params: serde_json::Value) -> Self {
        self.training_params = params;
        self
    }

    /// Reject requests nodes could not act on.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.model_type.trim().is_empty() {
            return Err(CoreError::InvalidInput("model type is empty".into()));
        }
        if self.data_ref.trim().is_empty() {
            return Err(CoreError::InvalidInput("training data reference is empty".into()));
        }
        if self.parameters.epochs == 0 || self.parameters.batch_size == 0 {
            return Err(CoreError::InvalidInput(
                "epochs and batch size must be positive".into(),
            ));
        }
        if !(self.parameters.learning_rate.is_finite() && self.parameters.learning_rate > 0.0) {
            return Err(CoreError::InvalidInput(
                "learning rate must be a positive number".into(),
            ));
        }
        Ok(())
    }
}

/// Evaluation metrics reported by a node, or averaged across nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub epoch: u32,
}

/// Weight and bias updates produced by one node (or by aggregation).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDelta {
    /// Producing node; `None` for aggregated deltas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub weights: Tensors,
    #[serde(default)]
    pub biases: Tensors,
}

impl ModelDelta {
    /// Builder method to add a weight array.
    pub fn with_weight(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.weights.insert(name.into(), values);
        self
    }

    /// Builder method to add a bias array.
    pub fn with_bias(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.biases.insert(name.into(), values);
        self
    }

    /// Tag the delta with the node that produced it.
    pub fn tagged(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty() && self.biases.is_empty()
    }

    /// Iterate over every value in the delta.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.weights
            .values()
            .chain(self.biases.values())
            .flat_map(|v| v.iter().copied())
    }
}

/// Successful response from one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub delta: ModelDelta,
    pub metrics: TrainingMetrics,
}

/// One round of dispatch, aggregation, and model update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingCycle {
    pub id: CycleId,
    pub request_id: RequestId,
    pub agent_id: AgentId,
    pub model_type: String,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Nodes the cycle was dispatched to.
    pub nodes_selected: usize,
    /// Nodes that returned a delta.
    pub nodes_succeeded: usize,
    pub metrics: Option<TrainingMetrics>,
    /// Aggregated delta applied to the shared model.
    pub aggregated_delta: Option<ModelDelta>,
    /// Shared model version produced by this cycle.
    pub model_version: Option<u64>,
    pub error: Option<String>,
}

impl TrainingCycle {
    pub fn start(request: &TrainingRequest) -> Self {
        Self {
            id: CycleId::new(format!(
                "cycle_{}_{}_{}",
                Utc::now().timestamp_millis(),
                request.agent_id,
                &Uuid::new_v4().simple().to_string()[..8]
            )),
            request_id: request.id.clone(),
            agent_id: request.agent_id.clone(),
            model_type: request.model_type.clone(),
            status: CycleStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            nodes_selected: 0,
            nodes_succeeded: 0,
            metrics: None,
            aggregated_delta: None,
            model_version: None,
            error: None,
        }
    }

    pub fn complete(&mut self, metrics: TrainingMetrics, delta: ModelDelta, version: u64) {
        self.status = CycleStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.metrics = Some(metrics);
        self.aggregated_delta = Some(delta);
        self.model_version = Some(version);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = CycleStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// The single, versioned global model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedModel {
    pub version: u64,
    pub weights: Tensors,
    pub biases: Tensors,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_lifecycle() {
        let request = TrainingRequest::new("agent-1", "mlp", "s3://bucket/data");
        let mut cycle = TrainingCycle::start(&request);
        assert_eq!(cycle.status, CycleStatus::Running);
        assert!(cycle.id.as_str().starts_with("cycle_"));

        cycle.complete(TrainingMetrics::default(), ModelDelta::default(), 3);
        assert_eq!(cycle.status, CycleStatus::Completed);
        assert_eq!(cycle.model_version, Some(3));
        assert!(cycle.duration_ms().is_some());
    }

    #[test]
    fn test_validate_request() {
        assert!(TrainingRequest::new("a", "mlp", "data").validate().is_ok());
        assert!(TrainingRequest::new("a", " ", "data").validate().is_err());
        assert!(TrainingRequest::new("a", "mlp", "").validate().is_err());

        let bad = TrainingRequest::new("a", "mlp", "data").with_parameters(TrainingParameters {
            epochs: 0,
            ..Default::default()
        });
        assert!(matches!(bad.validate(), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_delta_wire_format() {
        let delta = ModelDelta::default().with_weight("w", vec![1.0, 2.0]);
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["weights"]["w"][1], 2.0);
        assert!(json.get("nodeId").is_none());

        let parsed: ModelDelta = serde_json::from_str(r#"{"weights":{"w":[3.0]}}"#).unwrap();
        assert!(parsed.biases.is_empty());
        assert_eq!(parsed.values().collect::<Vec<_>>(), vec![3.0]);
    }

    #[test]
    fn test_metrics_wire_names() {
        let metrics: TrainingMetrics = serde_json::from_str(
            r#"{"loss":0.5,"accuracy":0.9,"precision":0.8,"recall":0.7,"f1Score":0.75,"epoch":2}"#,
        )
        .unwrap();
        assert_eq!(metrics.f1_score, 0.75);
        assert_eq!(metrics.epoch, 2);
    }
}
