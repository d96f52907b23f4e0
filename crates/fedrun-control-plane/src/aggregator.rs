//! Federated averaging of node results.
//!
//! Every function here is pure. Contributions are put into a canonical order
//! before summation so the output is bit-identical for any arrival order.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fedrun_core::{ErrorKind, ModelDelta, NodeId, NodeResult, Tensors, TrainingMetrics};

pub const FEDERATED_AVERAGE: &str = "federated_average";

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("non-finite value in {section} array '{key}'")]
    NonFinite { section: &'static str, key: String },
}

impl AggregationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Aggregation
    }
}

/// Combined update from one training cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub delta: ModelDelta,
    pub metrics: TrainingMetrics,
    /// Contributing nodes, sorted.
    pub contributors: Vec<NodeId>,
    pub method: String,
}

/// Average node results into one delta and one set of metrics.
pub fn aggregate(results: &[NodeResult]) -> Result<Aggregate, AggregationError> {
    for result in results {
        check_finite("weights", &result.delta.weights)?;
        check_finite("biases", &result.delta.biases)?;
    }

    let deltas: Vec<ModelDelta> = results.iter().map(|r| r.delta.clone()).collect();
    let metrics: Vec<TrainingMetrics> = results.iter().map(|r| r.metrics).collect();
    let mut contributors: Vec<NodeId> = results.iter().map(|r| r.node_id.clone()).collect();
    contributors.sort();

    Ok(Aggregate {
        delta: aggregate_deltas(&deltas),
        metrics: aggregate_metrics(&metrics),
        contributors,
        method: FEDERATED_AVERAGE.to_string(),
    })
}

/// Element-wise mean per named array.
///
/// A node missing a key does not contribute to that key. Arrays of different
/// lengths produce the longest length, each element averaged over the arrays
/// that reach it. No deltas yields an empty delta.
pub fn aggregate_deltas(deltas: &[ModelDelta]) -> ModelDelta {
    ModelDelta {
        node_id: None,
        weights: average_tensors(deltas.iter().map(|d| &d.weights)),
        biases: average_tensors(deltas.iter().map(|d| &d.biases)),
    }
}

/// Arithmetic mean of every metric; epoch is the maximum reported.
pub fn aggregate_metrics(metrics: &[TrainingMetrics]) -> TrainingMetrics {
    if metrics.is_empty() {
        return TrainingMetrics::default();
    }
    TrainingMetrics {
        loss: mean(metrics.iter().map(|m| m.loss)),
        accuracy: mean(metrics.iter().map(|m| m.accuracy)),
        precision: mean(metrics.iter().map(|m| m.precision)),
        recall: mean(metrics.iter().map(|m| m.recall)),
        f1_score: mean(metrics.iter().map(|m| m.f1_score)),
        epoch: metrics.iter().map(|m| m.epoch).max().unwrap_or(0),
    }
}

fn average_tensors<'a>(sources: impl Iterator<Item = &'a Tensors>) -> Tensors {
    let mut by_key: Tensors = Tensors::new();
    let mut contributions: std::collections::BTreeMap<&str, Vec<&[f64]>> = Default::default();
    for tensors in sources {
        for (key, values) in tensors {
            contributions
                .entry(key.as_str())
                .or_default()
                .push(values.as_slice());
        }
    }

    for (key, mut arrays) in contributions {
        arrays.sort_by(|a, b| canonical_cmp(a, b));
        let len = arrays.iter().map(|a| a.len()).max().unwrap_or(0);
        let averaged = (0..len)
            .map(|i| mean(arrays.iter().filter_map(|a| a.get(i).copied())))
            .collect();
        by_key.insert(key.to_string(), averaged);
    }
    by_key
}

/// Total lexicographic order over arrays, used to fix summation order.
fn canonical_cmp(a: &[f64], b: &[f64]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.total_cmp(y))
        .find(|o| o.is_ne())
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut values: Vec<f64> = values.collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    values.iter().sum::<f64>() / values.len() as f64
}

fn check_finite(section: &'static str, tensors: &Tensors) -> Result<(), AggregationError> {
    match tensors
        .iter()
        .find(|(_, values)| values.iter().any(|v| !v.is_finite()))
    {
        Some((key, _)) => Err(AggregationError::NonFinite {
            section,
            key: key.clone(),
        }),
        None => Ok(()),
    }
}
