//! # DeltaFi Core
//!
//! The pipeline execution core of DeltaFi. It decides, for every DeltaFile
//! moving through configured flows, which action runs next, where that work
//! is queued, and what happens when an action fails.
//!
//! - **Flow advancement**: [`advancer::FlowAdvancer`] applies worker results
//!   and attaches successor flows by topic subscription
//! - **Queue backpressure**: [`queue::QueueClassifier`] parks work for
//!   overloaded queues in a persistent cold tier and promotes it later
//! - **Resume policies**: [`policy::ResumePolicyService`] turns matching
//!   failures into scheduled retries with backoff
//! - **Orchestration**: [`orchestrator::PipelineOrchestrator`] ties these
//!   together under optimistic-concurrency retry
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use deltafi_core::prelude::*;
//!
//! let flows = Arc::new(FlowRegistry::new(definitions));
//! let orchestrator = Arc::new(PipelineOrchestrator::new(
//!     CoreConfig::default(),
//!     flows,
//!     Arc::new(InMemoryDeltaFileRepository::new()),
//!     dispatch.clone(),
//!     Arc::new(ResumePolicyService::new(Arc::new(InMemoryPolicyStore::new()))),
//! ));
//!
//! let delta_file = orchestrator.ingest("input.csv", "rest-in", input).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod advancer;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod flows;
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod persistence;
pub mod policy;
pub mod queue;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::advancer::{EventOutcome, FlowAdvancer};
    pub use crate::config::{ConfigError, CoreConfig, LoggingConfig, MaintenanceConfig};
    pub use crate::core::{ActionState, ActionType, DeltaFileStage, FlowState, FlowType};
    pub use crate::errors::{ConfigurationError, DeltaFiError, QueueError, Result};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::flows::{
        ActionConfiguration, FlowConfigProvider, FlowDefinition, FlowRegistry, Requirement,
    };
    pub use crate::model::{ActionInput, DeltaFile, FlowInput, WorkerEvent, WorkerEventKind};
    pub use crate::observability::init_tracing;
    pub use crate::orchestrator::{
        spawn_maintenance, ConflictRetryConfig, EventProcessor, PipelineOrchestrator,
    };
    pub use crate::persistence::{DeltaFileRepository, InMemoryDeltaFileRepository};
    pub use crate::policy::{
        BackOff, InMemoryPolicyStore, ResumePolicy, ResumePolicyService, RetryPolicy,
        RetryPolicyService,
    };
    pub use crate::queue::{DispatchQueue, InMemoryDispatchQueue, QueueClassifier};
    pub use crate::utils::{Clock, SystemClock, Timestamp};
    pub use std::sync::Arc;
}
