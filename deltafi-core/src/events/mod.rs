//! Side-effect events emitted after DeltaFile mutations.
//!
//! Sinks receive these after the mutation has been saved; nothing in the
//! core depends on a sink succeeding.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A DeltaFile was created by ingest.
pub const DELTAFILE_INGESTED: &str = "deltafile.ingested";
/// A DeltaFile reached `COMPLETE`.
pub const DELTAFILE_COMPLETED: &str = "deltafile.completed";
/// A DeltaFile reached `ERROR`.
pub const DELTAFILE_ERRORED: &str = "deltafile.errored";
/// An attempt was handed to the dispatch queue.
pub const ACTION_QUEUED: &str = "action.queued";
/// A stale `QUEUED` attempt was handed to its warm queue again.
pub const ACTION_REQUEUED: &str = "action.requeued";
/// An attempt was parked in the cold tier.
pub const ACTION_COLD_QUEUED: &str = "action.cold_queued";
/// A worker reported completion.
pub const ACTION_COMPLETED: &str = "action.completed";
/// A worker reported a failure.
pub const ACTION_ERRORED: &str = "action.errored";
/// A worker filtered the content.
pub const ACTION_FILTERED: &str = "action.filtered";
/// A worker split the content into children.
pub const ACTION_SPLIT: &str = "action.split";
/// A failed attempt was scheduled for automatic resume.
pub const ACTION_AUTO_RESUME_SCHEDULED: &str = "action.auto_resume_scheduled";
/// Cold-queued attempts were promoted to their warm queue.
pub const QUEUE_PROMOTED: &str = "queue.promoted";
