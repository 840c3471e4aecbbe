//! Pipeline orchestration.
//!
//! [`PipelineOrchestrator`] wraps every DeltaFile mutation in an
//! optimistic-concurrency retry loop and routes the resulting work through
//! the queue classifier. [`EventProcessor`] feeds it worker results and
//! [`spawn_maintenance`] runs the periodic sweeps.

mod conflict_retry;
mod service;
mod worker;

#[cfg(test)]
mod integration_tests;

pub use conflict_retry::{retry_on_conflict, BackoffStrategy, ConflictRetryConfig, JitterStrategy};
pub use service::PipelineOrchestrator;
pub use worker::{spawn_maintenance, EventProcessor, MaintenanceHandle, DEFAULT_RESULT_QUEUE};
