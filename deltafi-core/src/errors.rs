//! Error types for the DeltaFi execution core.
//!
//! Every fallible operation in the crate returns [`DeltaFiError`]. Transient
//! version conflicts are distinguished from terminal failures so the
//! orchestrator can decide whether a unit of work is worth repeating.

use thiserror::Error;
use uuid::Uuid;

/// Convenience alias used throughout the crate.
pub type Result<T, E = DeltaFiError> = std::result::Result<T, E>;

/// The main error type for DeltaFi core operations.
#[derive(Debug, Error)]
pub enum DeltaFiError {
    /// No DeltaFile exists with the given id.
    #[error("DeltaFile {0} not found")]
    NotFound(Uuid),

    /// A save observed a newer version than the one that was loaded.
    #[error("DeltaFile {did} was modified concurrently (expected version {expected}, found {actual})")]
    ConcurrencyConflict {
        /// The DeltaFile that conflicted.
        did: Uuid,
        /// The version the writer loaded.
        expected: u64,
        /// The version currently stored.
        actual: u64,
    },

    /// Conflict retries ran out before the update could be applied.
    #[error("Gave up updating DeltaFile {did} after {attempts} conflicting attempts")]
    ConflictRetriesExhausted {
        /// The DeltaFile being updated.
        did: Uuid,
        /// How many attempts were made.
        attempts: usize,
    },

    /// A worker event referenced a flow that is not awaiting work.
    #[error("DeltaFile {did} received event for unexpected flow {flow} ({number})")]
    UnexpectedFlow {
        /// The DeltaFile id.
        did: Uuid,
        /// The flow name carried by the event.
        flow: String,
        /// The flow number carried by the event.
        number: usize,
    },

    /// A worker event referenced an action that is not outstanding.
    #[error("DeltaFile {did} received event for unexpected action {action} in flow {flow}")]
    UnexpectedAction {
        /// The DeltaFile id.
        did: Uuid,
        /// The flow name.
        flow: String,
        /// The action name carried by the event.
        action: String,
    },

    /// Flow configuration is missing or unusable.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// A resume or retry policy failed validation.
    #[error("Invalid policy: {}", .0.join(", "))]
    InvalidPolicy(Vec<String>),

    /// A dispatch queue operation failed.
    #[error("{0}")]
    Queue(#[from] QueueError),

    /// The persistence layer failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeltaFiError {
    /// Returns true if the error is an optimistic-concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Returns true if repeating the same operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::Queue(QueueError::Unavailable(_))
        )
    }
}

/// Errors raised when flow configuration cannot satisfy a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// No running flow subscribes to the data source.
    #[error("No running flows are configured for data source {0}")]
    NoFlowsForDataSource(String),

    /// A flow referenced by a DeltaFile is no longer configured.
    #[error("Flow {0} is not running")]
    FlowNotRunning(String),

    /// An action referenced by a DeltaFile is no longer configured.
    #[error("Action named {action} is no longer running in flow {flow}")]
    ActionNotRunning {
        /// The flow name.
        flow: String,
        /// The action name.
        action: String,
    },
}

/// Errors raised by dispatch queues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue backend could not be reached.
    #[error("Queue backend unavailable: {0}")]
    Unavailable(String),

    /// The result channel has been closed.
    #[error("Queue {0} is closed")]
    Closed(String),
}
