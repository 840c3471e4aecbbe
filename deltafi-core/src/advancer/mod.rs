//! The flow state machine.
//!
//! [`FlowAdvancer`] applies worker results to a DeltaFile and works out what
//! runs next. It never touches storage or queues: every method mutates the
//! DeltaFile in place and returns the [`ActionInput`]s that should be routed,
//! leaving persistence and dispatch to the orchestrator.
//!
//! Advancing walks flows in attachment order, including flows attached
//! during the walk, so fan-out to several successor flows produces inputs
//! in a stable order.


use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::core::{ActionState, ActionType, DeltaFileStage, FlowState};
use crate::errors::{ConfigurationError, DeltaFiError, Result};
use crate::flows::{ActionConfiguration, FlowConfigSnapshot, FlowDefinition};
use crate::model::{
    ActionInput, Action, DeltaFile, DeltaFileFlow, FlowAttributes, FlowInput, WorkerEvent,
    WorkerEventKind,
};
use crate::utils::Timestamp;

/// Cause recorded when a successor would exceed the depth limit.
pub const MAX_DEPTH_CAUSE: &str = "Maximum flow depth exceeded";

/// Details of a failed attempt, handed to the policy matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFailure {
    /// Flow number.
    pub flow_number: usize,
    /// Flow name.
    pub flow_name: String,
    /// Action name.
    pub action_name: String,
    /// Action type.
    pub action_type: ActionType,
    /// Attempt that failed.
    pub attempt: u32,
    /// Reported cause.
    pub cause: String,
}

/// Result of applying one worker event.
#[derive(Debug)]
pub enum EventOutcome {
    /// The action completed; advance the file.
    Completed,
    /// The flow was filtered.
    Filtered,
    /// The action failed; the orchestrator decides whether it resumes.
    Errored(ActionFailure),
    /// The action split its content. Children are not yet advanced.
    Split(Vec<DeltaFile>),
    /// The worker asked for an immediate new attempt.
    RetryRequested(ActionInput),
    /// The DeltaFile was cancelled; the event was dropped.
    Ignored,
}

/// The flow state machine.
#[derive(Debug, Clone, Copy)]
pub struct FlowAdvancer {
    max_flow_depth: usize,
}

impl Default for FlowAdvancer {
    fn default() -> Self {
        Self::new(32)
    }
}

enum NextStep {
    Queued(ActionInput),
    Exhausted,
    Failed,
}

impl FlowAdvancer {
    /// Creates an advancer with the given successor depth limit.
    #[must_use]
    pub const fn new(max_flow_depth: usize) -> Self {
        Self { max_flow_depth }
    }

    /// Returns the depth limit.
    #[must_use]
    pub const fn max_flow_depth(&self) -> usize {
        self.max_flow_depth
    }

    /// Creates a DeltaFile for `data_source`, attaches its entry flows, and
    /// queues their first runnable actions.
    pub fn ingest(
        &self,
        snapshot: &FlowConfigSnapshot,
        name: &str,
        data_source: &str,
        input: FlowInput,
        now: Timestamp,
    ) -> Result<(DeltaFile, Vec<ActionInput>)> {
        let entry_flows = snapshot.flows_for_data_source(data_source);
        if entry_flows.is_empty() {
            return Err(ConfigurationError::NoFlowsForDataSource(data_source.to_string()).into());
        }

        let mut delta_file = DeltaFile::new(name, data_source, now);
        for definition in entry_flows {
            attach_flow(&mut delta_file, definition, 0, input.clone(), now);
        }
        let inputs = self.advance(&mut delta_file, snapshot, now);
        Ok((delta_file, inputs))
    }

    /// Applies a worker result to the DeltaFile.
    ///
    /// Errors leave pending actions untouched. Cancelled files ignore events.
    pub fn apply_event(
        &self,
        delta_file: &mut DeltaFile,
        event: &WorkerEvent,
        snapshot: &FlowConfigSnapshot,
        now: Timestamp,
    ) -> Result<EventOutcome> {
        if delta_file.stage == DeltaFileStage::Cancelled {
            warn!(
                did = %delta_file.did,
                flow = %event.flow_name,
                action = %event.action_name,
                "Received event for cancelled DeltaFile"
            );
            return Ok(EventOutcome::Ignored);
        }

        let action = delta_file.pending_action_mut(
            &event.flow_name,
            event.flow_number,
            &event.action_name,
        )?;
        action.record_timing(event.start, event.stop, now);

        let outcome = match &event.kind {
            WorkerEventKind::Complete(result) => {
                action.content.clone_from(&result.content);
                action.metadata.clone_from(&result.metadata);
                action.delete_metadata_keys.clone_from(&result.delete_metadata_keys);
                action.domains.clone_from(&result.domains);
                action.enrichments.clone_from(&result.enrichments);
                action.complete(now);
                if action.action_type == ActionType::Egress {
                    delta_file.egressed = true;
                }
                EventOutcome::Completed
            }
            WorkerEventKind::Error { cause, context } => {
                action.error(cause.clone(), context.clone(), now);
                EventOutcome::Errored(ActionFailure {
                    flow_number: event.flow_number,
                    flow_name: event.flow_name.clone(),
                    action_name: action.name.clone(),
                    action_type: action.action_type,
                    attempt: action.attempt,
                    cause: cause.clone(),
                })
            }
            WorkerEventKind::Filter { message } => {
                action.filter(message.clone(), now);
                let flow = &mut delta_file.flows[event.flow_number];
                flow.error_or_filter_cause = Some(message.clone());
                flow.set_state(FlowState::Filtered, now);
                delta_file.filtered = true;
                EventOutcome::Filtered
            }
            WorkerEventKind::Split { children } => {
                action.split(now);
                let parent_flow = delta_file.flows[event.flow_number].clone();
                let split: Vec<DeltaFile> = children
                    .iter()
                    .map(|child| {
                        delta_file.split_child(
                            &parent_flow,
                            child.name.clone(),
                            child.content.clone(),
                            child.metadata.clone(),
                            now,
                        )
                    })
                    .collect();
                delta_file.child_dids.extend(split.iter().map(|c| c.did));

                let flow = &mut delta_file.flows[event.flow_number];
                flow.pending_actions.clear();
                flow.set_state(FlowState::Complete, now);
                EventOutcome::Split(split)
            }
            WorkerEventKind::Retry { reason } => {
                debug!(
                    did = %event.did,
                    action = %event.action_name,
                    reason = %reason,
                    "Worker requested retry"
                );
                let config = action_config(snapshot, &event.flow_name, &event.action_name)?;
                action.retried(now);
                delta_file.requeue_count += 1;
                let input = queue_attempt(delta_file, event.flow_number, config, now);
                EventOutcome::RetryRequested(input)
            }
        };

        delta_file.add_annotations(&event.annotations);
        delta_file.update_stage(now);
        Ok(outcome)
    }

    /// Queues the next runnable action of every runnable flow and completes
    /// flows whose sequence is exhausted.
    pub fn advance(
        &self,
        delta_file: &mut DeltaFile,
        snapshot: &FlowConfigSnapshot,
        now: Timestamp,
    ) -> Vec<ActionInput> {
        let mut inputs = Vec::new();
        if delta_file.stage == DeltaFileStage::Cancelled {
            return inputs;
        }

        let mut index = 0;
        while index < delta_file.flows.len() {
            if delta_file.flows[index].is_runnable() {
                match next_action(delta_file, index, snapshot, now) {
                    NextStep::Queued(input) => inputs.push(input),
                    NextStep::Exhausted => self.complete_flow(delta_file, index, snapshot, now),
                    NextStep::Failed => {}
                }
            }
            index += 1;
        }

        delta_file.update_stage(now);
        inputs
    }

    /// Supersedes a failed attempt with a new queued attempt of the same action.
    pub fn resume_action(
        &self,
        delta_file: &mut DeltaFile,
        flow_number: usize,
        action_name: &str,
        snapshot: &FlowConfigSnapshot,
        now: Timestamp,
    ) -> Result<ActionInput> {
        let did = delta_file.did;
        let flow = delta_file
            .flow_mut(flow_number)
            .ok_or_else(|| DeltaFiError::UnexpectedFlow {
                did,
                flow: String::new(),
                number: flow_number,
            })?;
        let flow_name = flow.name.clone();

        let errored = flow
            .last_action()
            .is_some_and(|a| a.name == action_name && a.state == ActionState::Error);
        let resumable = matches!(flow.state, FlowState::InFlight | FlowState::Error);
        if !errored || !resumable {
            return Err(DeltaFiError::UnexpectedAction {
                did,
                flow: flow_name,
                action: action_name.to_string(),
            });
        }
        let config = action_config(snapshot, &flow_name, action_name)?;

        if let Some(action) = flow.last_action_mut() {
            action.retried(now);
        }
        flow.error_or_filter_cause = None;
        flow.error_acknowledged = None;
        flow.error_acknowledged_reason = None;
        flow.set_state(FlowState::InFlight, now);
        delta_file.requeue_count += 1;

        let input = queue_attempt(delta_file, flow_number, config, now);
        delta_file.update_stage(now);
        Ok(input)
    }

    /// Moves the cold-queued attempt of a flow back to its warm queue.
    ///
    /// If the action is no longer configured the attempt and its flow are
    /// failed instead and `None` is returned.
    pub fn warm_cold_action(
        &self,
        delta_file: &mut DeltaFile,
        flow_number: usize,
        snapshot: &FlowConfigSnapshot,
        now: Timestamp,
    ) -> Option<ActionInput> {
        let flow = delta_file.flow_mut(flow_number)?;
        let action = flow.last_action()?;
        if action.state != ActionState::ColdQueued {
            return None;
        }
        let action_name = action.name.clone();

        let Some(config) = snapshot.action_configuration(&flow.name, &action_name) else {
            let cause = ConfigurationError::ActionNotRunning {
                flow: flow.name.clone(),
                action: action_name,
            }
            .to_string();
            if let Some(action) = flow.last_action_mut() {
                action.error(cause.clone(), None, now);
            }
            fail_flow(flow, cause, now);
            delta_file.update_stage(now);
            return None;
        };

        let attempt = flow.last_action_mut().map_or(1, |action| {
            action.warm_queue(now);
            action.attempt
        });
        flow.refresh_cold_queued();
        let input = build_input(delta_file, flow_number, config, attempt, now);
        delta_file.update_stage(now);
        Some(input)
    }

    /// Hands a `QUEUED` attempt that never produced a result to its warm
    /// queue again. The attempt number is kept.
    ///
    /// If the action is no longer configured the attempt and its flow are
    /// failed instead and `None` is returned.
    pub fn requeue_action(
        &self,
        delta_file: &mut DeltaFile,
        flow_number: usize,
        snapshot: &FlowConfigSnapshot,
        now: Timestamp,
    ) -> Option<ActionInput> {
        let flow = delta_file.flow_mut(flow_number)?;
        let action = flow.last_action()?;
        if action.state != ActionState::Queued {
            return None;
        }
        let action_name = action.name.clone();

        let Some(config) = snapshot.action_configuration(&flow.name, &action_name) else {
            let cause = ConfigurationError::ActionNotRunning {
                flow: flow.name.clone(),
                action: action_name,
            }
            .to_string();
            if let Some(action) = flow.last_action_mut() {
                action.error(cause.clone(), None, now);
            }
            fail_flow(flow, cause, now);
            delta_file.update_stage(now);
            return None;
        };

        let attempt = flow.last_action_mut().map_or(1, |action| {
            action.warm_queue(now);
            action.attempt
        });
        delta_file.requeue_count += 1;
        let input = build_input(delta_file, flow_number, config, attempt, now);
        delta_file.update_stage(now);
        Some(input)
    }

    /// Releases paused flows whose definition is no longer paused and
    /// advances the file.
    pub fn unpause(
        &self,
        delta_file: &mut DeltaFile,
        snapshot: &FlowConfigSnapshot,
        now: Timestamp,
    ) -> Vec<ActionInput> {
        for flow in &mut delta_file.flows {
            if flow.state != FlowState::Paused {
                continue;
            }
            if snapshot.flow(&flow.name).is_some_and(|d| !d.paused) {
                flow.set_state(FlowState::InFlight, now);
            }
        }
        self.advance(delta_file, snapshot, now)
    }

    fn complete_flow(
        &self,
        delta_file: &mut DeltaFile,
        index: usize,
        snapshot: &FlowConfigSnapshot,
        now: Timestamp,
    ) {
        let flow_name = delta_file.flows[index].name.clone();
        let Some(definition) = snapshot.flow(&flow_name) else {
            fail_flow(
                &mut delta_file.flows[index],
                ConfigurationError::FlowNotRunning(flow_name).to_string(),
                now,
            );
            return;
        };
        delta_file.expect_annotations(&definition.expected_annotations);

        let successors: Vec<(&FlowDefinition, BTreeSet<String>)> =
            if !definition.publish_topics.is_empty() {
                snapshot.subscribers(&definition.publish_topics)
            } else if definition.flow_type.is_egress_family() {
                Vec::new()
            } else {
                snapshot
                    .matching_egress_flows(&delta_file.data_source)
                    .into_iter()
                    .map(|f| (f, BTreeSet::new()))
                    .collect()
            };

        let parent = &delta_file.flows[index];
        let depth = parent.depth + 1;
        if !successors.is_empty() && depth > self.max_flow_depth {
            warn!(
                did = %delta_file.did,
                flow = %flow_name,
                depth,
                "Not attaching successor flows past the depth limit"
            );
            fail_flow(&mut delta_file.flows[index], MAX_DEPTH_CAUSE.to_string(), now);
            return;
        }

        let seed = successor_input(parent);
        delta_file.flows[index].set_state(FlowState::Complete, now);
        for (definition, topics) in successors {
            let input = FlowInput {
                topics,
                ..seed.clone()
            };
            attach_flow(delta_file, definition, depth, input, now);
        }
    }
}

fn attach_flow(
    delta_file: &mut DeltaFile,
    definition: &FlowDefinition,
    depth: usize,
    input: FlowInput,
    now: Timestamp,
) {
    let number = delta_file.add_flow(
        definition.name.clone(),
        definition.flow_type,
        depth,
        definition.action_names(),
        input,
        now,
    );
    if definition.paused {
        debug!(did = %delta_file.did, flow = %definition.name, "Attaching paused flow");
        delta_file.flows[number].set_state(FlowState::Paused, now);
        delta_file.paused = true;
    }
}

fn successor_input(parent: &DeltaFileFlow) -> FlowInput {
    let mut ancestor_ids = parent.input.ancestor_ids.clone();
    ancestor_ids.push(parent.number);
    FlowInput {
        content: parent.current_content().to_vec(),
        metadata: parent.current_metadata(),
        domains: parent.current_domains(),
        enrichments: parent.current_enrichments(),
        topics: BTreeSet::new(),
        ancestor_ids,
    }
}

fn next_action(
    delta_file: &mut DeltaFile,
    index: usize,
    snapshot: &FlowConfigSnapshot,
    now: Timestamp,
) -> NextStep {
    let flow = &delta_file.flows[index];
    let flow_name = flow.name.clone();
    if snapshot.flow(&flow_name).is_none() {
        let cause = ConfigurationError::FlowNotRunning(flow_name).to_string();
        fail_flow(&mut delta_file.flows[index], cause, now);
        return NextStep::Failed;
    }

    let domains = flow.current_domains();
    let enrichments = flow.current_enrichments();
    let metadata = flow.current_metadata();
    let topics = flow.input.topics.clone();
    let attributes = FlowAttributes {
        domains: &domains,
        enrichments: &enrichments,
        metadata: &metadata,
        topics: &topics,
    };

    while let Some(action_name) = delta_file.flows[index].pending_actions.pop_front() {
        let Some(config) = snapshot.action_configuration(&flow_name, &action_name) else {
            let cause = ConfigurationError::ActionNotRunning {
                flow: flow_name,
                action: action_name,
            }
            .to_string();
            fail_flow(&mut delta_file.flows[index], cause, now);
            return NextStep::Failed;
        };

        if !config.requirement.is_satisfied(&attributes) {
            debug!(
                did = %delta_file.did,
                flow = %flow_name,
                action = %action_name,
                "Skipping action whose requirement is not met"
            );
            continue;
        }

        return NextStep::Queued(queue_attempt(delta_file, index, config, now));
    }

    NextStep::Exhausted
}

fn queue_attempt(
    delta_file: &mut DeltaFile,
    flow_number: usize,
    config: &ActionConfiguration,
    now: Timestamp,
) -> ActionInput {
    let flow = &mut delta_file.flows[flow_number];
    let attempt = flow.next_attempt(&config.name);
    flow.add_action(Action::queued(
        config.name.clone(),
        config.action_type,
        config.queue_name(),
        attempt,
        now,
    ));
    build_input(delta_file, flow_number, config, attempt, now)
}

fn build_input(
    delta_file: &DeltaFile,
    flow_number: usize,
    config: &ActionConfiguration,
    attempt: u32,
    now: Timestamp,
) -> ActionInput {
    let flow = &delta_file.flows[flow_number];
    ActionInput {
        did: delta_file.did,
        delta_file_name: delta_file.name.clone(),
        data_source: delta_file.data_source.clone(),
        flow_name: flow.name.clone(),
        flow_number,
        action_name: config.name.clone(),
        action_type: config.action_type,
        attempt,
        queue_name: config.queue_name().to_string(),
        content: flow.current_content().to_vec(),
        metadata: flow.current_metadata(),
        parameters: config.parameters.clone(),
        queued: now,
    }
}

fn action_config<'a>(
    snapshot: &'a FlowConfigSnapshot,
    flow: &str,
    action: &str,
) -> Result<&'a ActionConfiguration> {
    snapshot.action_configuration(flow, action).ok_or_else(|| {
        ConfigurationError::ActionNotRunning {
            flow: flow.to_string(),
            action: action.to_string(),
        }
        .into()
    })
}

fn fail_flow(flow: &mut DeltaFileFlow, cause: String, now: Timestamp) {
    warn!(flow = %flow.name, number = flow.number, cause = %cause, "Flow failed");
    flow.error_or_filter_cause = Some(cause);
    flow.set_state(FlowState::Error, now);
}
