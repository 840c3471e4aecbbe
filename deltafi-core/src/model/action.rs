//! A single execution attempt of a named action.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{ActionState, ActionType};
use crate::utils::Timestamp;

/// Key/value metadata carried alongside content.
pub type Metadata = BTreeMap<String, String>;

/// Opaque reference to stored content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    /// Content name, usually a filename.
    pub name: String,
    /// Media type.
    pub media_type: String,
    /// Size in bytes.
    pub size: u64,
}

impl Content {
    /// Creates a content reference.
    #[must_use]
    pub fn new(name: impl Into<String>, media_type: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            size,
        }
    }
}

/// One attempt of an action inside a flow.
///
/// Attempts are append-only: a resumed action is recorded as a new `Action`
/// with the same name and `attempt + 1`, and the superseded attempt moves to
/// [`ActionState::Retried`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// Configured action name.
    pub name: String,
    /// Kind of work.
    pub action_type: ActionType,
    /// Current state of this attempt.
    pub state: ActionState,
    /// 1-based attempt counter.
    pub attempt: u32,
    /// Queue the work is (or will be) dispatched to.
    pub queue_name: String,
    /// When this attempt was created.
    pub created: Timestamp,
    /// When this attempt was last handed to a warm queue.
    pub queued: Option<Timestamp>,
    /// Last state change.
    pub modified: Timestamp,
    /// Worker-reported start time.
    pub start: Option<Timestamp>,
    /// Worker-reported stop time.
    pub stop: Option<Timestamp>,
    /// Error cause, set only in `ERROR`.
    pub error_cause: Option<String>,
    /// Error context, set only in `ERROR`.
    pub error_context: Option<String>,
    /// Filter reason, set only in `FILTERED`.
    pub filtered_cause: Option<String>,
    /// When a policy scheduled the next attempt.
    pub next_auto_resume: Option<Timestamp>,
    /// Name of the policy that scheduled the next attempt.
    pub next_auto_resume_reason: Option<String>,
    /// Content produced by this attempt.
    #[serde(default)]
    pub content: Vec<Content>,
    /// Metadata added by this attempt.
    #[serde(default)]
    pub metadata: Metadata,
    /// Metadata keys removed by this attempt.
    #[serde(default)]
    pub delete_metadata_keys: Vec<String>,
    /// Domains produced by this attempt.
    #[serde(default)]
    pub domains: BTreeMap<String, String>,
    /// Enrichments produced by this attempt.
    #[serde(default)]
    pub enrichments: BTreeMap<String, String>,
}

impl Action {
    /// Creates a new queued attempt.
    #[must_use]
    pub fn queued(
        name: impl Into<String>,
        action_type: ActionType,
        queue_name: impl Into<String>,
        attempt: u32,
        now: Timestamp,
    ) -> Self {
        Self {
            name: name.into(),
            action_type,
            state: ActionState::Queued,
            attempt,
            queue_name: queue_name.into(),
            created: now,
            queued: Some(now),
            modified: now,
            start: None,
            stop: None,
            error_cause: None,
            error_context: None,
            filtered_cause: None,
            next_auto_resume: None,
            next_auto_resume_reason: None,
            content: Vec::new(),
            metadata: Metadata::new(),
            delete_metadata_keys: Vec::new(),
            domains: BTreeMap::new(),
            enrichments: BTreeMap::new(),
        }
    }

    /// Returns true while a worker still owes a result.
    #[must_use]
    pub const fn is_outstanding(&self) -> bool {
        self.state.is_outstanding()
    }

    /// Returns true if this attempt failed and is waiting on a scheduled resume.
    #[must_use]
    pub const fn awaiting_auto_resume(&self) -> bool {
        matches!(self.state, ActionState::Error) && self.next_auto_resume.is_some()
    }

    /// Parks the attempt in the cold tier.
    pub fn cold_queue(&mut self, now: Timestamp) {
        self.state = ActionState::ColdQueued;
        self.queued = None;
        self.modified = now;
    }

    /// Moves a cold-queued attempt onto its warm queue.
    pub fn warm_queue(&mut self, now: Timestamp) {
        self.state = ActionState::Queued;
        self.queued = Some(now);
        self.modified = now;
    }

    /// Records the worker's timing window.
    pub fn record_timing(&mut self, start: Option<Timestamp>, stop: Option<Timestamp>, now: Timestamp) {
        self.start = start.or(self.start);
        self.stop = stop.or(Some(now));
        self.modified = now;
    }

    /// Marks the attempt complete.
    pub fn complete(&mut self, now: Timestamp) {
        self.state = ActionState::Complete;
        self.modified = now;
    }

    /// Marks the attempt failed.
    pub fn error(&mut self, cause: impl Into<String>, context: Option<String>, now: Timestamp) {
        self.state = ActionState::Error;
        self.error_cause = Some(cause.into());
        self.error_context = context;
        self.modified = now;
    }

    /// Marks the attempt as having filtered its content.
    pub fn filter(&mut self, cause: impl Into<String>, now: Timestamp) {
        self.state = ActionState::Filtered;
        self.filtered_cause = Some(cause.into());
        self.modified = now;
    }

    /// Marks the attempt as having split its content.
    pub fn split(&mut self, now: Timestamp) {
        self.state = ActionState::Split;
        self.modified = now;
    }

    /// Marks the attempt as superseded by a newer attempt.
    pub fn retried(&mut self, now: Timestamp) {
        self.state = ActionState::Retried;
        self.next_auto_resume = None;
        self.modified = now;
    }

    /// Abandons the attempt.
    pub fn cancel(&mut self, now: Timestamp) {
        self.state = ActionState::Cancelled;
        self.next_auto_resume = None;
        self.modified = now;
    }

    /// Schedules the next attempt.
    pub fn schedule_auto_resume(&mut self, at: Timestamp, policy_name: impl Into<String>) {
        self.next_auto_resume = Some(at);
        self.next_auto_resume_reason = Some(policy_name.into());
    }
}
