//! The pipeline orchestrator.
//!
//! Every mutation follows the same shape: load the DeltaFile, mutate it with
//! the [`FlowAdvancer`], route the resulting inputs through the
//! [`QueueClassifier`], and save with a version check. The whole unit is
//! repeated on a concurrency conflict. Only after a successful save are the
//! warm inputs handed to the dispatch queue and side-effect events emitted.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::conflict_retry::retry_on_conflict;
use crate::advancer::{ActionFailure, EventOutcome, FlowAdvancer};
use crate::config::CoreConfig;
use crate::core::{ActionState, ActionType, DeltaFileStage, FlowState};
use crate::errors::{DeltaFiError, QueueError, Result};
use crate::events::{self, EventSink, NoOpEventSink};
use crate::flows::FlowConfigProvider;
use crate::model::{ActionInput, DeltaFile, FlowInput, WorkerEvent};
use crate::observability::SpanTimer;
use crate::persistence::DeltaFileRepository;
use crate::policy::{PolicyQuery, ResumeDetails, ResumePolicyService, RetryPolicyService};
use crate::queue::{DispatchQueue, QueueClassifier, QueueMetrics};
use crate::utils::{Clock, SystemClock, Timestamp};

type Effect = (&'static str, serde_json::Value);

/// What a saved unit of work still has to hand off.
#[derive(Debug, Default)]
struct Committed {
    warm: Vec<ActionInput>,
    effects: Vec<Effect>,
    affected: usize,
}

fn action_payload(input: &ActionInput) -> serde_json::Value {
    json!({
        "did": input.did,
        "flow": input.flow_name,
        "action": input.action_name,
        "queue": input.queue_name,
        "attempt": input.attempt,
    })
}

fn stage_effects(before: DeltaFileStage, delta_file: &DeltaFile, committed: &mut Committed) {
    if before == delta_file.stage {
        return;
    }
    let name = match delta_file.stage {
        DeltaFileStage::Complete => events::DELTAFILE_COMPLETED,
        DeltaFileStage::Error => events::DELTAFILE_ERRORED,
        _ => return,
    };
    committed
        .effects
        .push((name, json!({ "did": delta_file.did, "name": delta_file.name })));
}

fn as_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn fail_flow(delta_file: &mut DeltaFile, flow_number: usize, cause: String, now: Timestamp) {
    if let Some(flow) = delta_file.flow_mut(flow_number) {
        flow.error_or_filter_cause = Some(cause);
        flow.set_state(FlowState::Error, now);
    }
    delta_file.update_stage(now);
}

/// Coordinates the flow advancer, queue classifier, and policy matcher
/// over shared storage.
pub struct PipelineOrchestrator {
    config: CoreConfig,
    advancer: FlowAdvancer,
    flows: Arc<dyn FlowConfigProvider>,
    repository: Arc<dyn DeltaFileRepository>,
    dispatch: Arc<dyn DispatchQueue>,
    policies: Arc<ResumePolicyService>,
    retry_policies: Option<Arc<RetryPolicyService>>,
    classifier: QueueClassifier,
    metrics: Arc<QueueMetrics>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("advancer", &self.advancer)
            .field("classifier", &self.classifier)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Creates an orchestrator using the system clock and no event sink.
    #[must_use]
    pub fn new(
        config: CoreConfig,
        flows: Arc<dyn FlowConfigProvider>,
        repository: Arc<dyn DeltaFileRepository>,
        dispatch: Arc<dyn DispatchQueue>,
        policies: Arc<ResumePolicyService>,
    ) -> Self {
        let metrics = Arc::new(QueueMetrics::default());
        Self {
            advancer: FlowAdvancer::new(config.max_flow_depth),
            classifier: QueueClassifier::new(config.in_memory_queue_size, Arc::clone(&metrics)),
            metrics,
            config,
            flows,
            repository,
            dispatch,
            policies,
            retry_policies: None,
            clock: Arc::new(SystemClock),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the clock used for every timestamp.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the side-effect event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Consults retry policies when no resume policy applies.
    #[must_use]
    pub fn with_retry_policies(mut self, retry_policies: Arc<RetryPolicyService>) -> Self {
        self.retry_policies = Some(retry_policies);
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Current time according to the orchestrator's clock.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Returns the queue classifier.
    #[must_use]
    pub const fn classifier(&self) -> &QueueClassifier {
        &self.classifier
    }

    /// Returns the dispatch counters.
    #[must_use]
    pub fn metrics(&self) -> Arc<QueueMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Returns the resume policy service.
    #[must_use]
    pub fn policies(&self) -> Arc<ResumePolicyService> {
        Arc::clone(&self.policies)
    }

    /// Returns the dispatch queue.
    #[must_use]
    pub fn dispatch(&self) -> Arc<dyn DispatchQueue> {
        Arc::clone(&self.dispatch)
    }

    /// Creates a DeltaFile for `data_source` and dispatches its first actions.
    pub async fn ingest(
        &self,
        name: &str,
        data_source: &str,
        input: FlowInput,
    ) -> Result<DeltaFile> {
        let now = self.clock.now();
        let snapshot = self.flows.snapshot();
        let (mut delta_file, inputs) =
            self.advancer.ingest(&snapshot, name, data_source, input, now)?;

        let mut committed = Committed::default();
        committed.effects.push((
            events::DELTAFILE_INGESTED,
            json!({ "did": delta_file.did, "name": name, "dataSource": data_source }),
        ));
        self.route(&mut delta_file, inputs, &mut HashMap::new(), &mut committed, now);
        stage_effects(DeltaFileStage::Ingress, &delta_file, &mut committed);

        self.repository.insert(delta_file.clone()).await?;
        info!(
            did = %delta_file.did,
            name = %name,
            data_source = %data_source,
            flows = delta_file.flows.len(),
            "Ingested DeltaFile"
        );
        self.commit(committed).await?;
        Ok(delta_file)
    }

    /// Applies one worker result.
    ///
    /// Conflicting concurrent updates are retried from a fresh load. Events
    /// for cancelled DeltaFiles are dropped.
    pub async fn handle_worker_event(&self, event: WorkerEvent) -> Result<()> {
        let timer = SpanTimer::start("handle_worker_event");
        let this = self;
        let event_ref = &event;
        let committed = retry_on_conflict(&self.config.conflict_retry, event.did, move || {
            this.apply_worker_event(event_ref)
        })
        .await?;
        let dispatched = self.commit(committed).await?;

        debug!(
            did = %event.did,
            flow = %event.flow_name,
            action = %event.action_name,
            kind = event.kind.label(),
            dispatched,
            duration_ms = timer.elapsed_ms(),
            "Handled worker event"
        );
        Ok(())
    }

    async fn apply_worker_event(&self, event: &WorkerEvent) -> Result<Committed> {
        let now = self.clock.now();
        let snapshot = self.flows.snapshot();
        let mut delta_file = self.repository.load(event.did).await?;
        let stage_before = delta_file.stage;

        let mut committed = Committed::default();
        let mut inputs = Vec::new();
        let mut children = Vec::new();
        let payload = json!({
            "did": event.did,
            "flow": event.flow_name,
            "action": event.action_name,
        });

        match self.advancer.apply_event(&mut delta_file, event, &snapshot, now)? {
            EventOutcome::Ignored => return Ok(committed),
            EventOutcome::Completed => committed.effects.push((events::ACTION_COMPLETED, payload)),
            EventOutcome::Filtered => committed.effects.push((events::ACTION_FILTERED, payload)),
            EventOutcome::Split(split) => {
                committed.effects.push((
                    events::ACTION_SPLIT,
                    json!({
                        "did": event.did,
                        "action": event.action_name,
                        "children": split.iter().map(|c| c.did).collect::<Vec<_>>(),
                    }),
                ));
                children = split;
            }
            EventOutcome::RetryRequested(input) => inputs.push(input),
            EventOutcome::Errored(failure) => {
                committed.effects.push((
                    events::ACTION_ERRORED,
                    json!({
                        "did": event.did,
                        "flow": failure.flow_name,
                        "action": failure.action_name,
                        "attempt": failure.attempt,
                        "cause": failure.cause,
                    }),
                ));
                self.handle_failure(&mut delta_file, event, &failure, now, &mut committed);
            }
        }

        inputs.extend(self.advancer.advance(&mut delta_file, &snapshot, now));
        let mut pending = HashMap::new();
        self.route(&mut delta_file, inputs, &mut pending, &mut committed, now);
        for child in &mut children {
            let child_inputs = self.advancer.advance(child, &snapshot, now);
            self.route(child, child_inputs, &mut pending, &mut committed, now);
        }
        stage_effects(stage_before, &delta_file, &mut committed);

        // Children are stored before the parent records the split, so a
        // saved split always has its children.
        let child_dids: Vec<Uuid> = children.iter().map(|c| c.did).collect();
        if !children.is_empty() {
            if let Err(e) = self
                .repository
                .insert_batch(children, self.config.insert_batch_size)
                .await
            {
                self.discard_children(event.did, &child_dids).await;
                return Err(e);
            }
        }
        if let Err(e) = self.repository.save(&delta_file).await {
            self.discard_children(event.did, &child_dids).await;
            return Err(e);
        }
        committed.affected = 1;
        Ok(committed)
    }

    async fn discard_children(&self, parent: Uuid, child_dids: &[Uuid]) {
        if child_dids.is_empty() {
            return;
        }
        match self.repository.delete_batch(child_dids).await {
            Ok(removed) => debug!(did = %parent, removed, "Discarded unsaved split children"),
            Err(e) => error!(did = %parent, error = %e, "Failed to discard unsaved split children"),
        }
    }

    /// Decides what happens to a failed attempt: cancellation when the
    /// content is gone, a scheduled resume when a policy applies, otherwise
    /// a flow error awaiting acknowledgement.
    fn handle_failure(
        &self,
        delta_file: &mut DeltaFile,
        event: &WorkerEvent,
        failure: &ActionFailure,
        now: Timestamp,
        committed: &mut Committed,
    ) {
        if delta_file.content_deleted {
            info!(
                did = %delta_file.did,
                action = %failure.action_name,
                "Content already deleted, cancelling DeltaFile"
            );
            delta_file.cancel(now);
            return;
        }

        let details = self
            .policies
            .get_auto_resume_delay(delta_file, event, failure.action_type)
            .or_else(|| self.retry_details(delta_file, failure));

        match details {
            Some(details) => self.schedule_auto_resume(delta_file, failure, &details, now, committed),
            None => {
                warn!(
                    did = %delta_file.did,
                    flow = %failure.flow_name,
                    action = %failure.action_name,
                    attempt = failure.attempt,
                    cause = %failure.cause,
                    "Action failed with no applicable resume policy"
                );
                fail_flow(delta_file, failure.flow_number, failure.cause.clone(), now);
            }
        }
    }

    fn retry_details(&self, delta_file: &DeltaFile, failure: &ActionFailure) -> Option<ResumeDetails> {
        let retry_policies = self.retry_policies.as_ref()?;
        let query = PolicyQuery {
            attempt: failure.attempt,
            error_cause: &failure.cause,
            flow: &failure.flow_name,
            data_source: &delta_file.data_source,
            action: &failure.action_name,
            action_type: failure.action_type,
        };
        retry_policies.get_retry_details(&query)
    }

    fn schedule_auto_resume(
        &self,
        delta_file: &mut DeltaFile,
        failure: &ActionFailure,
        details: &ResumeDetails,
        now: Timestamp,
        committed: &mut Committed,
    ) {
        let delay = Duration::milliseconds(i64::try_from(details.delay_ms).unwrap_or(i64::MAX));
        let at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let action = delta_file.flow_mut(failure.flow_number).and_then(|flow| {
            flow.actions
                .iter_mut()
                .rev()
                .find(|a| a.name == failure.action_name && a.state == ActionState::Error)
        });
        if let Some(action) = action {
            action.schedule_auto_resume(at, details.policy_name.clone());
        }
        delta_file.update_stage(now);

        info!(
            did = %delta_file.did,
            flow = %failure.flow_name,
            action = %failure.action_name,
            attempt = failure.attempt,
            policy = %details.policy_name,
            delay_ms = details.delay_ms,
            "Scheduled automatic resume"
        );
        committed.effects.push((
            events::ACTION_AUTO_RESUME_SCHEDULED,
            json!({
                "did": delta_file.did,
                "flow": failure.flow_name,
                "action": failure.action_name,
                "policy": details.policy_name,
                "delayMs": details.delay_ms,
                "nextAutoResume": at,
            }),
        ));
    }

    /// Sends each input to its warm queue, or parks it on the DeltaFile when
    /// the queue is cold. `pending` counts what this unit has already sent
    /// to each queue.
    fn route(
        &self,
        delta_file: &mut DeltaFile,
        inputs: Vec<ActionInput>,
        pending: &mut HashMap<String, usize>,
        committed: &mut Committed,
        now: Timestamp,
    ) {
        for input in inputs {
            let queued = pending.entry(input.queue_name.clone()).or_insert(0);
            if self.classifier.is_cold(&input.queue_name, *queued) {
                if let Some(flow) = delta_file.flow_mut(input.flow_number) {
                    if let Some(action) = flow.outstanding_action_mut(&input.action_name) {
                        action.cold_queue(now);
                    }
                    flow.refresh_cold_queued();
                }
                self.metrics.record_cold_queued();
                debug!(
                    did = %input.did,
                    queue = %input.queue_name,
                    action = %input.action_name,
                    "Parking action in cold queue"
                );
                committed
                    .effects
                    .push((events::ACTION_COLD_QUEUED, action_payload(&input)));
            } else {
                *queued += 1;
                committed.effects.push((events::ACTION_QUEUED, action_payload(&input)));
                committed.warm.push(input);
            }
        }
    }

    /// Dispatches warm inputs and emits events for a saved unit of work.
    async fn commit(&self, committed: Committed) -> Result<usize> {
        let mut dispatched = 0;
        let mut failure: Option<QueueError> = None;
        for input in committed.warm {
            let queue = input.queue_name.clone();
            let did = input.did;
            let action = input.action_name.clone();
            match self.dispatch.enqueue(&queue, input).await {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    error!(
                        did = %did,
                        queue = %queue,
                        action = %action,
                        error = %e,
                        "Failed to dispatch action"
                    );
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        self.metrics.record_dispatched(as_u64(dispatched));

        for (name, data) in committed.effects {
            self.events.try_emit(name, Some(data));
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(dispatched),
        }
    }

    /// Resumes every errored attempt of `action_name` on a DeltaFile,
    /// overriding any scheduled automatic resume. Returns how many were
    /// resumed.
    pub async fn mark_for_resume(&self, did: Uuid, action_name: &str) -> Result<usize> {
        let this = self;
        let committed = retry_on_conflict(&self.config.conflict_retry, did, move || {
            this.resume_named(did, action_name)
        })
        .await?;
        let resumed = committed.affected;
        self.commit(committed).await?;
        if resumed > 0 {
            info!(did = %did, action = %action_name, count = resumed, "Marked for resume");
        }
        Ok(resumed)
    }

    async fn resume_named(&self, did: Uuid, action_name: &str) -> Result<Committed> {
        let now = self.clock.now();
        let snapshot = self.flows.snapshot();
        let mut delta_file = self.repository.load(did).await?;
        let stage_before = delta_file.stage;

        let numbers: Vec<usize> = delta_file
            .flows
            .iter()
            .filter(|flow| {
                flow.last_action()
                    .is_some_and(|a| a.name == action_name && a.state == ActionState::Error)
            })
            .map(|flow| flow.number)
            .collect();
        if numbers.is_empty() {
            return Ok(Committed::default());
        }

        let mut inputs = Vec::with_capacity(numbers.len());
        for number in numbers {
            inputs.push(
                self.advancer
                    .resume_action(&mut delta_file, number, action_name, &snapshot, now)?,
            );
        }

        let mut committed = Committed {
            affected: inputs.len(),
            ..Committed::default()
        };
        self.route(&mut delta_file, inputs, &mut HashMap::new(), &mut committed, now);
        stage_effects(stage_before, &delta_file, &mut committed);
        self.repository.save(&delta_file).await?;
        Ok(committed)
    }

    /// Re-queues every failed attempt whose scheduled resume is due at `now`.
    /// Returns how many attempts were re-queued.
    pub async fn auto_resume(&self, now: Timestamp) -> Result<usize> {
        let dids = self.repository.find_ready_for_auto_resume(now).await?;
        let this = self;
        let mut resumed = 0;
        for did in dids {
            let unit = retry_on_conflict(&self.config.conflict_retry, did, move || {
                this.resume_due(did, now)
            })
            .await;
            match unit {
                Ok(committed) => {
                    resumed += committed.affected;
                    if let Err(e) = self.commit(committed).await {
                        warn!(did = %did, error = %e, "Auto-resumed actions could not all be dispatched");
                    }
                }
                Err(e) => warn!(did = %did, error = %e, "Auto-resume failed"),
            }
        }
        if resumed > 0 {
            info!(count = resumed, "Auto-resumed actions");
        }
        Ok(resumed)
    }

    async fn resume_due(&self, did: Uuid, now: Timestamp) -> Result<Committed> {
        let snapshot = self.flows.snapshot();
        let mut delta_file = self.repository.load(did).await?;
        if !delta_file.ready_for_auto_resume(now) {
            return Ok(Committed::default());
        }
        let stage_before = delta_file.stage;

        let due: Vec<(usize, String)> = delta_file
            .flows
            .iter()
            .filter(|flow| flow.state == FlowState::InFlight)
            .filter_map(|flow| {
                let action = flow.last_action()?;
                let at = action.next_auto_resume?;
                (action.state == ActionState::Error && at <= now)
                    .then(|| (flow.number, action.name.clone()))
            })
            .collect();

        let mut inputs = Vec::with_capacity(due.len());
        for (number, action_name) in due {
            match self
                .advancer
                .resume_action(&mut delta_file, number, &action_name, &snapshot, now)
            {
                Ok(input) => inputs.push(input),
                Err(DeltaFiError::Configuration(e)) => {
                    warn!(did = %did, action = %action_name, error = %e, "Cannot resume action");
                    if let Some(action) = delta_file.flow_mut(number).and_then(|f| f.last_action_mut()) {
                        action.next_auto_resume = None;
                    }
                    fail_flow(&mut delta_file, number, e.to_string(), now);
                }
                Err(e) => return Err(e),
            }
        }

        let mut committed = Committed {
            affected: inputs.len(),
            ..Committed::default()
        };
        self.route(&mut delta_file, inputs, &mut HashMap::new(), &mut committed, now);
        stage_effects(stage_before, &delta_file, &mut committed);
        self.repository.save(&delta_file).await?;
        Ok(committed)
    }

    /// Re-dispatches every `QUEUED` attempt that was handed to its warm
    /// queue more than `requeue_duration_ms` before `now` and never produced
    /// a result. Returns how many attempts were re-dispatched.
    pub async fn requeue(&self, now: Timestamp) -> Result<usize> {
        let duration = Duration::milliseconds(
            i64::try_from(self.config.requeue_duration_ms).unwrap_or(i64::MAX),
        );
        let before = now.checked_sub_signed(duration).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let dids = self.repository.find_stale_queued(before).await?;
        let this = self;
        let mut requeued = 0;
        for did in dids {
            let unit = retry_on_conflict(&self.config.conflict_retry, did, move || {
                this.requeue_stale(did, before, now)
            })
            .await;
            match unit {
                Ok(committed) => {
                    requeued += committed.affected;
                    if let Err(e) = self.commit(committed).await {
                        warn!(did = %did, error = %e, "Requeued actions could not all be dispatched");
                    }
                }
                Err(e) => warn!(did = %did, error = %e, "Requeue failed"),
            }
        }
        if requeued > 0 {
            warn!(
                count = requeued,
                requeue_duration_ms = self.config.requeue_duration_ms,
                "Actions exceeded the requeue threshold, requeuing now"
            );
        }
        Ok(requeued)
    }

    async fn requeue_stale(&self, did: Uuid, before: Timestamp, now: Timestamp) -> Result<Committed> {
        let snapshot = self.flows.snapshot();
        let mut delta_file = self.repository.load(did).await?;
        let stage_before = delta_file.stage;

        let numbers: Vec<usize> = delta_file
            .flows
            .iter()
            .filter(|flow| {
                flow.last_action().is_some_and(|a| {
                    a.state == ActionState::Queued && a.queued.is_some_and(|at| at <= before)
                })
            })
            .map(|flow| flow.number)
            .collect();
        if numbers.is_empty() {
            return Ok(Committed::default());
        }

        let mut committed = Committed::default();
        for number in numbers {
            if let Some(input) = self
                .advancer
                .requeue_action(&mut delta_file, number, &snapshot, now)
            {
                committed.effects.push((events::ACTION_REQUEUED, action_payload(&input)));
                committed.warm.push(input);
            }
        }
        committed.affected = committed.warm.len();
        stage_effects(stage_before, &delta_file, &mut committed);
        self.repository.save(&delta_file).await?;
        Ok(committed)
    }

    /// Policy and delay that would apply to a failure, without side effects.
    #[must_use]
    pub fn get_auto_resume_delay(
        &self,
        delta_file: &DeltaFile,
        event: &WorkerEvent,
        action_type: ActionType,
    ) -> Option<ResumeDetails> {
        self.policies
            .get_auto_resume_delay(delta_file, event, action_type)
    }

    /// Records operator acknowledgement of every unacknowledged flow error.
    /// Returns how many flows were acknowledged.
    pub async fn acknowledge_errors(&self, did: Uuid, reason: &str) -> Result<usize> {
        let this = self;
        let committed = retry_on_conflict(&self.config.conflict_retry, did, move || {
            this.acknowledge(did, reason)
        })
        .await?;
        let acknowledged = committed.affected;
        self.commit(committed).await?;
        Ok(acknowledged)
    }

    async fn acknowledge(&self, did: Uuid, reason: &str) -> Result<Committed> {
        let now = self.clock.now();
        let mut delta_file = self.repository.load(did).await?;
        let mut acknowledged = 0;
        for flow in &mut delta_file.flows {
            if flow.state == FlowState::Error && flow.error_acknowledged.is_none() {
                flow.error_acknowledged = Some(now);
                flow.error_acknowledged_reason = Some(reason.to_string());
                flow.modified = now;
                acknowledged += 1;
            }
        }
        if acknowledged == 0 {
            return Ok(Committed::default());
        }
        delta_file.update_stage(now);
        self.repository.save(&delta_file).await?;
        info!(did = %did, count = acknowledged, reason = %reason, "Acknowledged errors");
        Ok(Committed {
            affected: acknowledged,
            ..Committed::default()
        })
    }

    /// Releases flows whose definition is no longer paused and dispatches
    /// their next actions. Returns how many actions were queued.
    pub async fn unpause(&self, did: Uuid) -> Result<usize> {
        let this = self;
        let committed = retry_on_conflict(&self.config.conflict_retry, did, move || {
            this.unpause_flows(did)
        })
        .await?;
        let queued = committed.affected;
        self.commit(committed).await?;
        Ok(queued)
    }

    async fn unpause_flows(&self, did: Uuid) -> Result<Committed> {
        let now = self.clock.now();
        let snapshot = self.flows.snapshot();
        let mut delta_file = self.repository.load(did).await?;
        if !delta_file.paused {
            return Ok(Committed::default());
        }
        let stage_before = delta_file.stage;

        let inputs = self.advancer.unpause(&mut delta_file, &snapshot, now);
        let mut committed = Committed {
            affected: inputs.len(),
            ..Committed::default()
        };
        self.route(&mut delta_file, inputs, &mut HashMap::new(), &mut committed, now);
        stage_effects(stage_before, &delta_file, &mut committed);
        self.repository.save(&delta_file).await?;
        Ok(committed)
    }

    /// Moves up to `count` cold-queued attempts for `queue` to the warm
    /// queue, oldest first. Returns how many were moved.
    pub async fn requeue_cold_queue_actions(&self, queue: &str, count: usize) -> Result<usize> {
        if count == 0 {
            return Ok(0);
        }
        let dids = self.repository.find_cold_queued(queue, count).await?;
        let this = self;
        let mut moved = 0;
        for did in dids {
            let remaining = count - moved;
            if remaining == 0 {
                break;
            }
            let committed = retry_on_conflict(&self.config.conflict_retry, did, move || {
                this.warm_cold(did, queue, remaining)
            })
            .await?;
            moved += committed.affected;
            self.commit(committed).await?;
        }

        if moved > 0 {
            info!(queue = %queue, count = moved, "Moving {} from the cold to warm queue", moved);
            self.metrics.record_promoted(as_u64(moved));
            self.events.try_emit(
                events::QUEUE_PROMOTED,
                Some(json!({ "queue": queue, "count": moved })),
            );
        }
        Ok(moved)
    }

    async fn warm_cold(&self, did: Uuid, queue: &str, limit: usize) -> Result<Committed> {
        let now = self.clock.now();
        let snapshot = self.flows.snapshot();
        let mut delta_file = self.repository.load(did).await?;
        let stage_before = delta_file.stage;

        let numbers: Vec<usize> = delta_file
            .flows
            .iter()
            .filter(|flow| {
                flow.last_action()
                    .is_some_and(|a| a.state == ActionState::ColdQueued && a.queue_name == queue)
            })
            .map(|flow| flow.number)
            .take(limit)
            .collect();
        if numbers.is_empty() {
            return Ok(Committed::default());
        }

        let mut committed = Committed::default();
        for number in numbers {
            if let Some(input) = self
                .advancer
                .warm_cold_action(&mut delta_file, number, &snapshot, now)
            {
                committed.effects.push((events::ACTION_QUEUED, action_payload(&input)));
                committed.warm.push(input);
            }
        }
        committed.affected = committed.warm.len();
        stage_effects(stage_before, &delta_file, &mut committed);
        self.repository.save(&delta_file).await?;
        Ok(committed)
    }

    /// Promotes cold-queued work on every queue with headroom. Does nothing
    /// if a promotion is already running or no refresh has succeeded yet.
    pub async fn promote_cold_to_warm(&self) -> Result<usize> {
        let Some(_guard) = self.classifier.try_begin_promotion() else {
            debug!("Cold to warm promotion already running");
            return Ok(0);
        };

        let counts = self.repository.cold_queued_counts().await?;
        let plan = self.classifier.promotion_plan(&counts);
        let mut promoted = 0;
        for (queue, count) in plan {
            promoted += self.requeue_cold_queue_actions(&queue, count).await?;
        }
        Ok(promoted)
    }

    /// Re-reads queue depths and reclassifies every queue.
    pub async fn refresh_queues(&self) -> Result<(), QueueError> {
        let queue_names = self.flows.snapshot().queue_names();
        self.classifier
            .refresh(self.dispatch.as_ref(), &queue_names)
            .await
    }
}
