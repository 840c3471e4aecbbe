//! Results reported by external workers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::action::{Content, Metadata};
use crate::utils::Timestamp;

/// Output of a successful action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteOutcome {
    /// Content produced. Empty means the input content passes through.
    #[serde(default)]
    pub content: Vec<Content>,
    /// Metadata to add.
    #[serde(default)]
    pub metadata: Metadata,
    /// Metadata keys to remove.
    #[serde(default)]
    pub delete_metadata_keys: Vec<String>,
    /// Domains produced.
    #[serde(default)]
    pub domains: BTreeMap<String, String>,
    /// Enrichments produced.
    #[serde(default)]
    pub enrichments: BTreeMap<String, String>,
}

/// One segment of a split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitChild {
    /// Name of the child DeltaFile.
    pub name: String,
    /// Content of the segment.
    #[serde(default)]
    pub content: Vec<Content>,
    /// Metadata of the segment.
    #[serde(default)]
    pub metadata: Metadata,
}

/// What happened to the action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerEventKind {
    /// The action succeeded.
    Complete(CompleteOutcome),
    /// The action failed.
    Error {
        /// Short cause, matched against policy error substrings.
        cause: String,
        /// Longer context such as a stack trace.
        context: Option<String>,
    },
    /// The action filtered the content.
    Filter {
        /// Why the content was filtered.
        message: String,
    },
    /// The action split the content into children.
    Split {
        /// One entry per child.
        children: Vec<SplitChild>,
    },
    /// The worker asked for the action to be run again immediately.
    Retry {
        /// Why the worker asked.
        reason: String,
    },
}

impl WorkerEventKind {
    /// Short label used in logs and events.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Complete(_) => "complete",
            Self::Error { .. } => "error",
            Self::Filter { .. } => "filter",
            Self::Split { .. } => "split",
            Self::Retry { .. } => "retry",
        }
    }
}

/// A worker's report for one action attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEvent {
    /// DeltaFile the work belonged to.
    pub did: Uuid,
    /// Flow name.
    pub flow_name: String,
    /// Flow number within the DeltaFile.
    pub flow_number: usize,
    /// Action name.
    pub action_name: String,
    /// When the worker started.
    pub start: Option<Timestamp>,
    /// When the worker stopped.
    pub stop: Option<Timestamp>,
    /// Annotations to merge into the DeltaFile.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Outcome.
    #[serde(flatten)]
    pub kind: WorkerEventKind,
}

impl WorkerEvent {
    /// Creates an event for the given action.
    #[must_use]
    pub fn new(
        did: Uuid,
        flow_name: impl Into<String>,
        flow_number: usize,
        action_name: impl Into<String>,
        kind: WorkerEventKind,
    ) -> Self {
        Self {
            did,
            flow_name: flow_name.into(),
            flow_number,
            action_name: action_name.into(),
            start: None,
            stop: None,
            annotations: BTreeMap::new(),
            kind,
        }
    }

    /// Creates a successful completion with no output.
    #[must_use]
    pub fn complete(did: Uuid, flow_name: &str, flow_number: usize, action_name: &str) -> Self {
        Self::new(
            did,
            flow_name,
            flow_number,
            action_name,
            WorkerEventKind::Complete(CompleteOutcome::default()),
        )
    }

    /// Creates an error report.
    #[must_use]
    pub fn error(
        did: Uuid,
        flow_name: &str,
        flow_number: usize,
        action_name: &str,
        cause: impl Into<String>,
    ) -> Self {
        Self::new(
            did,
            flow_name,
            flow_number,
            action_name,
            WorkerEventKind::Error {
                cause: cause.into(),
                context: None,
            },
        )
    }

    /// Sets annotations.
    #[must_use]
    pub fn with_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.annotations = annotations;
        self
    }

    /// Sets the worker timing window.
    #[must_use]
    pub fn with_timing(mut self, start: Timestamp, stop: Timestamp) -> Self {
        self.start = Some(start);
        self.stop = Some(stop);
        self
    }

    /// Returns the error cause for error events.
    #[must_use]
    pub fn error_cause(&self) -> Option<&str> {
        match &self.kind {
            WorkerEventKind::Error { cause, .. } => Some(cause),
            _ => None,
        }
    }
}
