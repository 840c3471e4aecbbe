//! The DeltaFile aggregate.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use super::action::{Action, Content, Metadata};
use super::flow::{DeltaFileFlow, FlowInput};
use crate::core::{ActionState, DeltaFileStage, FlowState, FlowType};
use crate::errors::{DeltaFiError, Result};
use crate::utils::{generate_did, Timestamp};

/// The aggregate record of one ingested object's journey through the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaFile {
    /// Unique id.
    pub did: Uuid,
    /// Name given at ingest.
    pub name: String,
    /// Data source the file entered through.
    pub data_source: String,
    /// Lifecycle stage.
    pub stage: DeltaFileStage,
    /// Attached flows in attachment order.
    #[serde(default)]
    pub flows: Vec<DeltaFileFlow>,
    /// Parents this file was split from.
    #[serde(default)]
    pub parent_dids: Vec<Uuid>,
    /// Children split from this file.
    #[serde(default)]
    pub child_dids: Vec<Uuid>,
    /// Optimistic concurrency token.
    pub version: u64,
    /// Number of times an action on this file has been re-queued.
    pub requeue_count: u32,
    /// True once content storage has been reclaimed.
    pub content_deleted: bool,
    /// True once any egress action completed.
    pub egressed: bool,
    /// True once any action filtered the content.
    pub filtered: bool,
    /// True while any flow is paused.
    pub paused: bool,
    /// Operator and worker annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Expected annotation keys not supplied yet.
    #[serde(default)]
    pub pending_annotations: BTreeSet<String>,
    /// Creation time.
    pub created: Timestamp,
    /// Last modification time.
    pub modified: Timestamp,
}

impl DeltaFile {
    /// Creates an empty DeltaFile in `INGRESS`.
    #[must_use]
    pub fn new(name: impl Into<String>, data_source: impl Into<String>, now: Timestamp) -> Self {
        Self {
            did: generate_did(),
            name: name.into(),
            data_source: data_source.into(),
            stage: DeltaFileStage::Ingress,
            flows: Vec::new(),
            parent_dids: Vec::new(),
            child_dids: Vec::new(),
            version: 0,
            requeue_count: 0,
            content_deleted: false,
            egressed: false,
            filtered: false,
            paused: false,
            annotations: BTreeMap::new(),
            pending_annotations: BTreeSet::new(),
            created: now,
            modified: now,
        }
    }

    /// Attaches a new flow and returns its number.
    pub fn add_flow(
        &mut self,
        name: impl Into<String>,
        flow_type: FlowType,
        depth: usize,
        pending_actions: impl IntoIterator<Item = String>,
        input: FlowInput,
        now: Timestamp,
    ) -> usize {
        let number = self.flows.len();
        self.flows.push(DeltaFileFlow::new(
            name,
            number,
            flow_type,
            depth,
            pending_actions,
            input,
            now,
        ));
        self.modified = now;
        number
    }

    /// Returns the flow with the given number.
    #[must_use]
    pub fn flow(&self, number: usize) -> Option<&DeltaFileFlow> {
        self.flows.get(number)
    }

    /// Returns the flow with the given number mutably.
    pub fn flow_mut(&mut self, number: usize) -> Option<&mut DeltaFileFlow> {
        self.flows.get_mut(number)
    }

    /// Returns the in-flight flow a worker event addresses.
    pub fn pending_flow_mut(&mut self, name: &str, number: usize) -> Result<&mut DeltaFileFlow> {
        let did = self.did;
        match self.flows.get_mut(number) {
            Some(flow) if flow.name == name && flow.state == FlowState::InFlight => Ok(flow),
            _ => Err(DeltaFiError::UnexpectedFlow {
                did,
                flow: name.to_string(),
                number,
            }),
        }
    }

    /// Returns the outstanding attempt a worker event addresses.
    pub fn pending_action_mut(
        &mut self,
        flow_name: &str,
        flow_number: usize,
        action_name: &str,
    ) -> Result<&mut Action> {
        let did = self.did;
        let flow = self.pending_flow_mut(flow_name, flow_number)?;
        flow.outstanding_action_mut(action_name)
            .ok_or_else(|| DeltaFiError::UnexpectedAction {
                did,
                flow: flow_name.to_string(),
                action: action_name.to_string(),
            })
    }

    /// Every action across every flow.
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.flows.iter().flat_map(|flow| flow.actions.iter())
    }

    /// Returns true if any flow is still running or paused.
    #[must_use]
    pub fn has_active_flows(&self) -> bool {
        self.flows.iter().any(|flow| !flow.state.is_terminal())
    }

    /// Returns true if an error is waiting for an operator.
    #[must_use]
    pub fn has_unacknowledged_errors(&self) -> bool {
        self.flows
            .iter()
            .any(|flow| flow.state == FlowState::Error && flow.error_acknowledged.is_none())
    }

    /// Earliest scheduled resume across all flows.
    #[must_use]
    pub fn next_auto_resume(&self) -> Option<Timestamp> {
        self.flows
            .iter()
            .filter(|flow| flow.state == FlowState::InFlight)
            .filter_map(|flow| flow.next_auto_resume)
            .min()
    }

    /// Returns true if a scheduled resume has come due.
    #[must_use]
    pub fn ready_for_auto_resume(&self, now: Timestamp) -> bool {
        self.stage != DeltaFileStage::Cancelled
            && self.next_auto_resume().is_some_and(|at| at <= now)
    }

    /// Recomputes `stage` from the flows.
    ///
    /// `CANCELLED` is sticky. While anything is running the stage is `EGRESS`
    /// once egress-family work has been queued, else `IN_FLIGHT`. Once every
    /// flow is terminal the stage is `ERROR` if any flow errored, else
    /// `COMPLETE`.
    pub fn update_stage(&mut self, now: Timestamp) {
        self.modified = now;
        if self.stage == DeltaFileStage::Cancelled || self.flows.is_empty() {
            return;
        }

        self.paused = self.flows.iter().any(|flow| flow.state == FlowState::Paused);
        for flow in &mut self.flows {
            flow.refresh_cold_queued();
            flow.refresh_next_auto_resume();
        }

        self.stage = if self.has_active_flows() {
            if self.actions().any(|action| action.action_type.is_egress_family()) {
                DeltaFileStage::Egress
            } else {
                DeltaFileStage::InFlight
            }
        } else if self.flows.iter().any(|flow| flow.state == FlowState::Error) {
            DeltaFileStage::Error
        } else {
            DeltaFileStage::Complete
        };
    }

    /// Abandons every running flow and outstanding attempt.
    pub fn cancel(&mut self, now: Timestamp) {
        for flow in &mut self.flows {
            if flow.state.is_terminal() {
                continue;
            }
            for action in &mut flow.actions {
                if action.is_outstanding() || action.awaiting_auto_resume() {
                    action.cancel(now);
                }
            }
            flow.pending_actions.clear();
            flow.set_state(FlowState::Cancelled, now);
            flow.refresh_cold_queued();
            flow.next_auto_resume = None;
        }
        self.stage = DeltaFileStage::Cancelled;
        self.paused = false;
        self.modified = now;
    }

    /// Merges annotations and clears any that were expected.
    pub fn add_annotations(&mut self, annotations: &BTreeMap<String, String>) {
        for (key, value) in annotations {
            self.pending_annotations.remove(key);
            self.annotations.insert(key.clone(), value.clone());
        }
    }

    /// Records annotation keys an egress flow expects to be supplied later.
    pub fn expect_annotations<'a>(&mut self, keys: impl IntoIterator<Item = &'a String>) {
        for key in keys {
            if !self.annotations.contains_key(key) {
                self.pending_annotations.insert(key.clone());
            }
        }
    }

    /// Number of cold-queued attempts per queue.
    #[must_use]
    pub fn cold_queued_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for action in self.actions().filter(|a| a.state == ActionState::ColdQueued) {
            *counts.entry(action.queue_name.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Oldest cold-queued time on `queue`, if any.
    #[must_use]
    pub fn oldest_cold_queued(&self, queue: &str) -> Option<Timestamp> {
        self.actions()
            .filter(|a| a.state == ActionState::ColdQueued && a.queue_name == queue)
            .map(|a| a.modified)
            .min()
    }

    /// Earliest warm-queue time among `QUEUED` attempts handed off at or
    /// before `before`.
    #[must_use]
    pub fn oldest_stale_queued(&self, before: Timestamp) -> Option<Timestamp> {
        self.actions()
            .filter(|a| a.state == ActionState::Queued)
            .filter_map(|a| a.queued)
            .filter(|at| *at <= before)
            .min()
    }

    /// Creates a child DeltaFile seeded from one split segment.
    ///
    /// The child carries a copy of `parent_flow` with its remaining pending
    /// actions and no attempt history.
    #[must_use]
    pub fn split_child(
        &self,
        parent_flow: &DeltaFileFlow,
        name: impl Into<String>,
        content: Vec<Content>,
        metadata: Metadata,
        now: Timestamp,
    ) -> Self {
        let mut child = Self::new(name, self.data_source.clone(), now);
        child.parent_dids.push(self.did);
        child.annotations = self.annotations.clone();

        let input = FlowInput {
            content,
            metadata,
            domains: parent_flow.current_domains(),
            enrichments: parent_flow.current_enrichments(),
            topics: parent_flow.input.topics.clone(),
            ancestor_ids: Vec::new(),
        };
        child.add_flow(
            parent_flow.name.clone(),
            parent_flow.flow_type,
            parent_flow.depth,
            parent_flow.pending_actions.iter().cloned(),
            input,
            now,
        );
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ActionType;
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;

    fn delta_file_with_flow() -> DeltaFile {
        let now = Utc::now();
        let mut df = DeltaFile::new("input.txt", "rest-in", now);
        df.add_flow(
            "rest-in",
            FlowType::RestDataSource,
            0,
            vec!["xform".to_string()],
            FlowInput::default(),
            now,
        );
        df
    }

    #[test]
    fn test_stage_in_flight_until_terminal() {
        let now = Utc::now();
        let mut df = delta_file_with_flow();
        df.update_stage(now);
        assert_eq!(df.stage, DeltaFileStage::InFlight);

        df.flows[0].set_state(FlowState::Complete, now);
        df.update_stage(now);
        assert_eq!(df.stage, DeltaFileStage::Complete);
    }

    #[test]
    fn test_stage_egress_once_egress_work_queued() {
        let now = Utc::now();
        let mut df = delta_file_with_flow();
        df.flows[0].add_action(Action::queued("fmt", ActionType::Format, "fmt", 1, now));
        df.update_stage(now);
        assert_eq!(df.stage, DeltaFileStage::Egress);
    }

    #[test]
    fn test_stage_error_when_any_flow_errored() {
        let now = Utc::now();
        let mut df = delta_file_with_flow();
        df.add_flow("sink", FlowType::DataSink, 1, Vec::new(), FlowInput::default(), now);
        df.flows[0].set_state(FlowState::Complete, now);
        df.flows[1].set_state(FlowState::Error, now);
        df.update_stage(now);
        assert_eq!(df.stage, DeltaFileStage::Error);
        assert!(df.has_unacknowledged_errors());
    }

    #[test]
    fn test_cancel_is_sticky() {
        let now = Utc::now();
        let mut df = delta_file_with_flow();
        df.flows[0].add_action(Action::queued("xform", ActionType::Transform, "xform", 1, now));
        df.cancel(now);
        assert_eq!(df.stage, DeltaFileStage::Cancelled);
        assert_eq!(df.flows[0].state, FlowState::Cancelled);
        assert_eq!(df.flows[0].actions[0].state, ActionState::Cancelled);

        df.update_stage(now);
        assert_eq!(df.stage, DeltaFileStage::Cancelled);
    }

    #[test]
    fn test_pending_flow_rejects_wrong_number() {
        let mut df = delta_file_with_flow();
        let err = df.pending_flow_mut("rest-in", 3).unwrap_err();
        assert!(matches!(err, DeltaFiError::UnexpectedFlow { number: 3, .. }));
    }

    #[test]
    fn test_pending_action_requires_outstanding_attempt() {
        let now = Utc::now();
        let mut df = delta_file_with_flow();
        df.flows[0].add_action(Action::queued("xform", ActionType::Transform, "xform", 1, now));
        assert!(df.pending_action_mut("rest-in", 0, "xform").is_ok());

        df.flows[0].actions[0].complete(now);
        let err = df.pending_action_mut("rest-in", 0, "xform").unwrap_err();
        assert!(matches!(err, DeltaFiError::UnexpectedAction { .. }));
    }

    #[test]
    fn test_ready_for_auto_resume() {
        let now = Utc::now();
        let mut df = delta_file_with_flow();
        let mut action = Action::queued("xform", ActionType::Transform, "xform", 1, now);
        action.error("boom", None, now);
        action.schedule_auto_resume(now + Duration::milliseconds(100), "policy");
        df.flows[0].add_action(action);
        df.update_stage(now);

        assert!(!df.ready_for_auto_resume(now));
        assert!(df.ready_for_auto_resume(now + Duration::milliseconds(100)));
    }

    #[test]
    fn test_annotations_clear_pending() {
        let mut df = delta_file_with_flow();
        let expected = vec!["reviewed".to_string(), "owner".to_string()];
        df.expect_annotations(&expected);
        assert_eq!(df.pending_annotations.len(), 2);

        let mut supplied = BTreeMap::new();
        supplied.insert("owner".to_string(), "ops".to_string());
        df.add_annotations(&supplied);
        assert_eq!(
            df.pending_annotations.iter().cloned().collect::<Vec<_>>(),
            vec!["reviewed".to_string()]
        );
    }

    #[test]
    fn test_split_child_inherits_pending_actions() {
        let now = Utc::now();
        let mut df = delta_file_with_flow();
        df.flows[0].pending_actions.push_back("egress".to_string());
        let parent_flow = df.flows[0].clone();

        let child = df.split_child(
            &parent_flow,
            "part-1",
            vec![Content::new("part-1", "text/plain", 1)],
            Metadata::new(),
            now,
        );
        assert_eq!(child.parent_dids, vec![df.did]);
        assert_eq!(child.flows.len(), 1);
        assert_eq!(child.flows[0].pending_actions.len(), 2);
        assert_eq!(child.flows[0].input.content[0].name, "part-1");
        assert_ne!(child.did, df.did);
    }
}
