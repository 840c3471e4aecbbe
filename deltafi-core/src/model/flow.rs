//! One configured flow attached to a DeltaFile.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::action::{Action, Content, Metadata};
use crate::core::{ActionState, FlowState, FlowType};
use crate::utils::Timestamp;

/// What a flow was seeded with when it was attached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowInput {
    /// Content handed to the first action.
    #[serde(default)]
    pub content: Vec<Content>,
    /// Metadata handed to the first action.
    #[serde(default)]
    pub metadata: Metadata,
    /// Domains accumulated by upstream flows.
    #[serde(default)]
    pub domains: BTreeMap<String, String>,
    /// Enrichments accumulated by upstream flows.
    #[serde(default)]
    pub enrichments: BTreeMap<String, String>,
    /// Topics through which this flow was reached.
    #[serde(default)]
    pub topics: BTreeSet<String>,
    /// Flow numbers of every ancestor, oldest first.
    #[serde(default)]
    pub ancestor_ids: Vec<usize>,
}

/// Attributes an action requirement is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct FlowAttributes<'a> {
    /// Domains visible to the flow.
    pub domains: &'a BTreeMap<String, String>,
    /// Enrichments visible to the flow.
    pub enrichments: &'a BTreeMap<String, String>,
    /// Current metadata.
    pub metadata: &'a Metadata,
    /// Subscribed topics.
    pub topics: &'a BTreeSet<String>,
}

/// An instance of a configured flow inside a DeltaFile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaFileFlow {
    /// Flow definition name.
    pub name: String,
    /// Position in the owning DeltaFile. Worker events address flows by it.
    pub number: usize,
    /// Flow definition type.
    pub flow_type: FlowType,
    /// Current state.
    pub state: FlowState,
    /// When the flow was attached.
    pub created: Timestamp,
    /// Last state change.
    pub modified: Timestamp,
    /// Append-only attempt history.
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Configured actions that have not been queued yet, in order.
    #[serde(default)]
    pub pending_actions: VecDeque<String>,
    /// Distance from the ingress flow.
    pub depth: usize,
    /// Seed data.
    #[serde(default)]
    pub input: FlowInput,
    /// True while the next action is parked in the cold tier.
    #[serde(default)]
    pub cold_queued: bool,
    /// Error or filter reason, once the flow has stopped for one.
    pub error_or_filter_cause: Option<String>,
    /// When an operator acknowledged the error.
    pub error_acknowledged: Option<Timestamp>,
    /// Operator-supplied acknowledgement reason.
    pub error_acknowledged_reason: Option<String>,
    /// Earliest scheduled resume among the flow's actions.
    pub next_auto_resume: Option<Timestamp>,
}

impl DeltaFileFlow {
    /// Creates a flow with the given configured action sequence.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        number: usize,
        flow_type: FlowType,
        depth: usize,
        pending_actions: impl IntoIterator<Item = String>,
        input: FlowInput,
        now: Timestamp,
    ) -> Self {
        Self {
            name: name.into(),
            number,
            flow_type,
            state: FlowState::InFlight,
            created: now,
            modified: now,
            actions: Vec::new(),
            pending_actions: pending_actions.into_iter().collect(),
            depth,
            input,
            cold_queued: false,
            error_or_filter_cause: None,
            error_acknowledged: None,
            error_acknowledged_reason: None,
            next_auto_resume: None,
        }
    }

    /// Returns the most recent attempt.
    #[must_use]
    pub fn last_action(&self) -> Option<&Action> {
        self.actions.last()
    }

    /// Returns the most recent attempt mutably.
    pub fn last_action_mut(&mut self) -> Option<&mut Action> {
        self.actions.last_mut()
    }

    /// Returns true if the flow cannot advance until something external
    /// happens: a worker result, or a resume of a failed attempt.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.last_action().is_some_and(|action| {
            matches!(
                action.state,
                ActionState::Queued | ActionState::ColdQueued | ActionState::Error
            )
        })
    }

    /// Returns true if the flow is running and free to queue its next action.
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        self.state == FlowState::InFlight && !self.is_blocked()
    }

    /// Finds the outstanding attempt of `name`.
    pub fn outstanding_action_mut(&mut self, name: &str) -> Option<&mut Action> {
        self.actions
            .iter_mut()
            .rev()
            .find(|action| action.name == name && action.is_outstanding())
    }

    /// Returns the attempt number the next run of `name` should use.
    #[must_use]
    pub fn next_attempt(&self, name: &str) -> u32 {
        self.actions
            .iter()
            .filter(|action| action.name == name)
            .map(|action| action.attempt)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Appends an attempt and clears the cold flag unless it is parked.
    pub fn add_action(&mut self, action: Action) {
        self.modified = action.modified;
        self.actions.push(action);
        self.refresh_cold_queued();
    }

    /// Recomputes `cold_queued` from the attempt history.
    pub fn refresh_cold_queued(&mut self) {
        self.cold_queued = self
            .actions
            .iter()
            .any(|action| action.state == ActionState::ColdQueued);
    }

    /// Recomputes `next_auto_resume` from the attempt history.
    pub fn refresh_next_auto_resume(&mut self) {
        self.next_auto_resume = self
            .actions
            .iter()
            .filter(|action| action.state == ActionState::Error)
            .filter_map(|action| action.next_auto_resume)
            .min();
    }

    /// Sets the flow state.
    pub fn set_state(&mut self, state: FlowState, now: Timestamp) {
        self.state = state;
        self.modified = now;
    }

    /// Content produced by the latest attempt that produced any, else the input.
    #[must_use]
    pub fn current_content(&self) -> &[Content] {
        self.completed_actions()
            .rev()
            .find(|action| !action.content.is_empty())
            .map_or(self.input.content.as_slice(), |action| action.content.as_slice())
    }

    /// Input metadata overlaid with every completed attempt's changes.
    #[must_use]
    pub fn current_metadata(&self) -> Metadata {
        let mut metadata = self.input.metadata.clone();
        for action in self.completed_actions() {
            metadata.extend(action.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
            for key in &action.delete_metadata_keys {
                metadata.remove(key);
            }
        }
        metadata
    }

    /// Domains inherited from upstream plus those produced here.
    #[must_use]
    pub fn current_domains(&self) -> BTreeMap<String, String> {
        let mut domains = self.input.domains.clone();
        for action in self.completed_actions() {
            domains.extend(action.domains.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        domains
    }

    /// Enrichments inherited from upstream plus those produced here.
    #[must_use]
    pub fn current_enrichments(&self) -> BTreeMap<String, String> {
        let mut enrichments = self.input.enrichments.clone();
        for action in self.completed_actions() {
            enrichments.extend(action.enrichments.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        enrichments
    }

    fn completed_actions(&self) -> impl DoubleEndedIterator<Item = &Action> {
        self.actions
            .iter()
            .filter(|action| action.state == ActionState::Complete)
    }
}
