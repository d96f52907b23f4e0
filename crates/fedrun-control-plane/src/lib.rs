//! FedRun control plane.
//!
//! Tracks training nodes, fans training cycles out to them, averages their
//! updates, and folds the result into the versioned shared model.

pub mod aggregator;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod heartbeat;
pub mod metrics;
pub mod registry;
pub mod store;
pub mod transport;

pub use aggregator::{aggregate, aggregate_deltas, aggregate_metrics, Aggregate, AggregationError};
pub use config::Config;
pub use coordinator::{CoordinatorError, TrainingCoordinator};
pub use dispatcher::{DispatchError, DispatchOutcome, TrainingDispatcher};
pub use heartbeat::spawn_heartbeat_monitor;
pub use metrics::collect_metrics;
pub use registry::{NetworkStatus, NodeRegistry, RegistryError};
pub use store::{InMemoryPersistence, ModelPersistence, SharedModelStore, StoreError};
pub use transport::{HttpTransport, NodeResponse, NodeTransport, TrainingPayload, TransportError};
