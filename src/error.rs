//! Error taxonomy shared by the controller, the workers and the stressor.
use thiserror::Error;

use crate::WorkerId;

/// Malformed benchmark or stage configuration, detected before anything is
/// dispatched to workers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("benchmark '{0}' has no stages")]
    EmptyBenchmark(String),
    #[error("unknown key selector '{0}', expected one of: colliding, concurrent, gaussian")]
    UnknownKeySelector(String),
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("cannot parse stage definition: {0}")]
    Malformed(String),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Error raised by a capability adapter call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CapabilityError {
    /// The request failed in a way the system under test is allowed to fail
    /// (timeout, conflict, rejected write).
    #[error("request failed: {0}")]
    Request(String),
    /// Anything else: the adapter is broken or in an inconsistent state.
    #[error("unexpected capability error: {0}")]
    Unexpected(String),
}

/// Failure of a stage on a worker.
#[derive(Debug, Error)]
pub enum StageError {
    /// The stage ran but its outcome is negative.
    #[error("{0}")]
    Failed(String),
    /// The stage could not run or crashed.
    #[error("{message}")]
    Unexpected {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StageError {
    pub fn unexpected(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unexpected {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Delivery failure between main and a worker.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("worker {0} is not connected")]
    UnknownWorker(WorkerId),
    #[error("worker {worker} disconnected: {reason}")]
    Disconnected { worker: WorkerId, reason: String },
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors that end a controller run.
#[derive(Debug, Error)]
pub enum MasterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}
