//! Persistent data model: DeltaFiles, their flows, and action attempts.
//!
//! - [`DeltaFile`] is the aggregate root and carries the concurrency version
//! - [`DeltaFileFlow`] is one configured flow attached to a DeltaFile
//! - [`Action`] is one attempt of a named action inside a flow
//! - [`WorkerEvent`] and [`ActionInput`] cross the worker boundary

mod action;
mod action_input;
mod delta_file;
mod event;
mod flow;

pub use action::{Action, Content, Metadata};
pub use action_input::ActionInput;
pub use delta_file::DeltaFile;
pub use event::{CompleteOutcome, SplitChild, WorkerEvent, WorkerEventKind};
pub use flow::{DeltaFileFlow, FlowAttributes, FlowInput};
