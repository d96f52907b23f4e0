//! FedRun Control Plane

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fedrun_control_plane::{
    collect_metrics, spawn_heartbeat_monitor, Config, HttpTransport, TrainingCoordinator,
};
use fedrun_core::{AgentId, TrainingParameters, TrainingRequest};
use fedrun_runtime::TracingTelemetry;

/// FedRun control plane - distributed training over a pool of nodes
#[derive(Parser)]
#[command(name = "fedrun-control-plane")]
#[command(about = "Run federated training cycles against training nodes", long_about = None)]
struct Cli {
    /// Training node base URL (repeatable; replaces the default nodes)
    #[arg(long = "node")]
    nodes: Vec<String>,

    /// Per-node training timeout in seconds
    #[arg(long)]
    node_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one training cycle and print it as JSON
    Train {
        /// Model type the nodes should train
        #[arg(long)]
        model_type: String,

        /// Reference to the training data
        #[arg(long)]
        data_ref: String,

        /// Requesting agent
        #[arg(long, default_value = "cli")]
        agent: String,

        #[arg(long, default_value = "1")]
        epochs: u32,

        #[arg(long, default_value = "32")]
        batch_size: u32,

        #[arg(long, default_value = "0.001")]
        learning_rate: f64,
    },

    /// Print node network status as JSON
    Status,

    /// Print metrics in Prometheus text format
    Metrics,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    // Load config
    let mut config = Config::default();
    if !cli.nodes.is_empty() {
        config = config.with_node_addresses(cli.nodes);
    }
    if let Some(secs) = cli.node_timeout_secs {
        config.node_timeout = Duration::from_secs(secs);
    }

    let coordinator = TrainingCoordinator::from_config(
        &config,
        Arc::new(HttpTransport::new()),
        Arc::new(TracingTelemetry),
    )?;

    match cli.command {
        Commands::Train {
            model_type,
            data_ref,
            agent,
            epochs,
            batch_size,
            learning_rate,
        } => {
            let heartbeat = spawn_heartbeat_monitor(
                coordinator.registry().clone(),
                config.heartbeat_interval(),
                config.heartbeat_timeout(),
            );

            let request = TrainingRequest::new(AgentId::new(agent), model_type, data_ref)
                .with_parameters(TrainingParameters {
                    learning_rate,
                    epochs,
                    batch_size,
                });
            info!(
                nodes = config.nodes.len(),
                timeout_secs = config.node_timeout.as_secs(),
                "Starting training cycle"
            );

            let result = coordinator.execute_training_cycle(&request).await;
            heartbeat.abort();

            let cycle = result?;
            println!("{}", serde_json::to_string_pretty(&cycle)?);
        }
        Commands::Status => {
            let status = coordinator.network_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Metrics => {
            print!("{}", collect_metrics(&coordinator).await);
        }
    }

    Ok(())
}
