//! Node transport - the only network-facing call of the control plane.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use fedrun_core::{CycleId, ModelDelta, TrainingMetrics, TrainingParameters, TrainingRequest};

/// Transport errors. The dispatcher marks the node offline on any of these.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {address} timed out after {timeout_ms}ms")]
    Timeout { address: String, timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("node rejected request: {0}")]
    Rejected(String),
}

/// Body sent to a node's training endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingPayload {
    pub cycle_id: CycleId,
    pub model_type: String,
    pub parameters: TrainingParameters,
    #[serde(default)]
    pub training_params: serde_json::Value,
    pub data_ref: String,
}

impl TrainingPayload {
    pub fn new(cycle_id: &CycleId, request: &TrainingRequest) -> Self {
        Self {
            cycle_id: cycle_id.clone(),
            model_type: request.model_type.clone(),
            parameters: request.parameters,
            training_params: request.training_params.clone(),
            data_ref: request.data_ref.clone(),
        }
    }
}

/// Node answer to a training request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResponse {
    pub model_delta: ModelDelta,
    pub metrics: TrainingMetrics,
}

/// Sends training requests to nodes.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn send_training_request(
        &self,
        address: &str,
        payload: &TrainingPayload,
        timeout: Duration,
    ) -> Result<NodeResponse, TransportError>;
}

/// JSON over HTTP: `POST {address}/train`.
pub struct HttpTransport {
    inner: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            inner: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeTransport for HttpTransport {
    async fn send_training_request(
        &self,
        address: &str,
        payload: &TrainingPayload,
        timeout: Duration,
    ) -> Result<NodeResponse, TransportError> {
        let url = format!("{}/train", address.trim_end_matches('/'));
        debug!(url = %url, cycle_id = %payload.cycle_id, "POST training request");

        let response = self
            .inner
            .post(&url)
            .json(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout {
                        address: address.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }
                } else {
                    TransportError::Http(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(TransportError::Rejected(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedrun_core::AgentId;

    #[test]
    fn test_payload_wire_format() {
        let request = TrainingRequest::new(AgentId::new("agent-1"), "mlp", "s3://data")
            .with_training_params(serde_json::json!({ "dropout": 0.2 }));
        let payload = TrainingPayload::new(&CycleId::new("cycle-1"), &request);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["cycleId"], "cycle-1");
        assert_eq!(json["modelType"], "mlp");
        assert_eq!(json["dataRef"], "s3://data");
        assert_eq!(json["parameters"]["batchSize"], 32);
        assert_eq!(json["trainingParams"]["dropout"], 0.2);
    }

    #[test]
    fn test_response_parsing() {
        let response: NodeResponse = serde_json::from_str(
            r#"{
                "modelDelta": { "weights": { "w": [1.0, 2.0] }, "biases": { "b": [0.5] } },
                "metrics": { "loss": 0.3, "accuracy": 0.9, "precision": 0.8,
                             "recall": 0.85, "f1Score": 0.82, "epoch": 3 }
            }"#,
        )
        .unwrap();
        assert_eq!(response.model_delta.weights["w"], vec![1.0, 2.0]);
        assert_eq!(response.metrics.epoch, 3);
    }

    #[tokio::test]
    async fn test_unreachable_node_errors() {
        let transport = HttpTransport::new();
        let request = TrainingRequest::new(AgentId::new("a"), "mlp", "data");
        let payload = TrainingPayload::new(&CycleId::new("c"), &request);

        let result = transport
            .send_training_request("http://127.0.0.1:1", &payload, Duration::from_secs(2))
            .await;
        assert!(result.is_err());
    }
}
