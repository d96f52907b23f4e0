//! Core domain errors and the error taxonomy shared by every component.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::FailureKind;

/// Core domain errors for FedRun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Resource dimension name not recognised.
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Machine-readable error category attached to every surfaced failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    AgentNotActive,
    NodeNotFound,
    NoAvailableNodes,
    AllNodesFailed,
    ExecutionTimeout,
    QuotaExceeded,
    Terminated,
    WorkFailed,
    InvalidInput,
    CycleNotFound,
    Aggregation,
    Store,
    Transport,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<FailureKind> for ErrorKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::ExecutionTimeout => Self::ExecutionTimeout,
            FailureKind::QuotaExceeded => Self::QuotaExceeded,
            FailureKind::Terminated => Self::Terminated,
            FailureKind::WorkFailed => Self::WorkFailed,
        }
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownResource(_) | Self::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }
}
