//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;

use fedrun_core::CycleStatus;

use crate::coordinator::TrainingCoordinator;

/// Collect all metrics from the coordinator and format as Prometheus text.
pub async fn collect_metrics(coordinator: &TrainingCoordinator) -> String {
    let mut output = String::new();

    collect_node_metrics(coordinator, &mut output).await;
    collect_cycle_metrics(coordinator, &mut output).await;
    collect_model_metrics(coordinator, &mut output).await;

    output
}

/// Collect node metrics by status.
async fn collect_node_metrics(coordinator: &TrainingCoordinator, output: &mut String) {
    let status = coordinator.network_status().await;

    writeln!(output, "# HELP fedrun_nodes Number of training nodes by status").ok();
    writeln!(output, "# TYPE fedrun_nodes gauge").ok();
    for (label, count) in [
        ("available", status.available_nodes),
        ("busy", status.busy_nodes),
        ("offline", status.offline_nodes),
    ] {
        writeln!(output, "fedrun_nodes{{status=\"{label}\"}} {count}").ok();
    }
}

/// Collect training cycle metrics by status.
async fn collect_cycle_metrics(coordinator: &TrainingCoordinator, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP fedrun_training_cycles_total Total number of training cycles by status"
    )
    .ok();
    writeln!(output, "# TYPE fedrun_training_cycles_total gauge").ok();
    for (status, label) in [
        (CycleStatus::Pending, "pending"),
        (CycleStatus::Running, "running"),
        (CycleStatus::Completed, "completed"),
        (CycleStatus::Failed, "failed"),
    ] {
        let count = coordinator.cycles_by_status(status).await.len();
        writeln!(
            output,
            "fedrun_training_cycles_total{{status=\"{label}\"}} {count}"
        )
        .ok();
    }
}

async fn collect_model_metrics(coordinator: &TrainingCoordinator, output: &mut String) {
    let version = coordinator.shared_model().await.version;

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP fedrun_shared_model_version Current version of the shared model"
    )
    .ok();
    writeln!(output, "# TYPE fedrun_shared_model_version gauge").ok();
    writeln!(output, "fedrun_shared_model_version {version}").ok();
}
