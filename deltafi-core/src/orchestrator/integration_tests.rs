use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::*;
use crate::config::CoreConfig;
use crate::core::{ActionState, ActionType, DeltaFileStage, FlowState, FlowType};
use crate::errors::{ConfigurationError, DeltaFiError, QueueError};
use crate::events;
use crate::flows::{ActionConfiguration, FlowDefinition, FlowRegistry};
use crate::model::{Content, SplitChild, WorkerEvent, WorkerEventKind};
use crate::persistence::{DeltaFileRepository, InMemoryDeltaFileRepository};
use crate::policy::{BackOff, InMemoryPolicyStore, ResumePolicy, ResumePolicyService, RetryPolicy, RetryPolicyService};
use crate::queue::InMemoryDispatchQueue;
use crate::testing::fixtures::{
    complete_with_domain, epoch, fan_out_flows, skip_flows, text_input, TestHarness, DATA_SOURCE,
};
use crate::testing::{
    assert_action_state, assert_flow_state, assert_stage, ConflictingRepository, FlakyDispatchQueue,
};
use crate::utils::{Clock, FixedClock};

async fn smoke_retry_policy(harness: &TestHarness) {
    harness
        .policies
        .save(
            ResumePolicy::new("smoke-retry", 3, BackOff::fixed(100))
                .with_flow("smoke")
                .with_error_substring("boom"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_ingest_dispatches_first_action() {
    let harness = TestHarness::new(skip_flows());
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();

    let stored = harness.repository.get(df.did).unwrap();
    assert_stage(&stored, DeltaFileStage::InFlight);
    assert_action_state(&stored, "smoke", "a", ActionState::Queued);

    let queued = harness.dispatch.pending("a");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].did, df.did);
    assert_eq!(queued[0].attempt, 1);
    assert_eq!(
        harness.events.names(),
        vec![events::DELTAFILE_INGESTED, events::ACTION_QUEUED]
    );
    assert_eq!(harness.orchestrator.metrics().dispatched(), 1);
}

#[tokio::test]
async fn test_ingest_unknown_data_source_stores_nothing() {
    let harness = TestHarness::new(skip_flows());
    let err = harness
        .orchestrator
        .ingest("f.txt", "nope", text_input("f.txt"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DeltaFiError::Configuration(ConfigurationError::NoFlowsForDataSource(_))
    ));
    assert!(harness.repository.is_empty());
    assert!(harness.events.is_empty());
}

#[tokio::test]
async fn test_unmet_requirement_completes_deltafile() {
    let harness = TestHarness::new(skip_flows());
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();
    let _ = harness.dispatch.take_work("a");

    harness
        .orchestrator
        .handle_worker_event(WorkerEvent::complete(df.did, "smoke", 1, "a"))
        .await
        .unwrap();

    let stored = harness.repository.get(df.did).unwrap();
    assert_stage(&stored, DeltaFileStage::Complete);
    assert_flow_state(&stored, "smoke", FlowState::Complete);
    assert!(harness.dispatch.pending("b").is_empty());
    assert_eq!(
        harness.events.events_of_type(events::DELTAFILE_COMPLETED).len(),
        1
    );
}

#[tokio::test]
async fn test_met_requirement_dispatches_gated_action() {
    let harness = TestHarness::new(skip_flows());
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();

    let event = complete_with_domain(WorkerEvent::complete(df.did, "smoke", 1, "a"), "d");
    harness.orchestrator.handle_worker_event(event).await.unwrap();

    let stored = harness.repository.get(df.did).unwrap();
    assert_stage(&stored, DeltaFileStage::InFlight);
    assert_eq!(harness.dispatch.pending("b").len(), 1);
}

#[tokio::test]
async fn test_fan_out_completes_after_every_sink() {
    let harness = TestHarness::new(fan_out_flows());
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();

    harness
        .orchestrator
        .handle_worker_event(WorkerEvent::complete(df.did, "shared", 1, "normalize"))
        .await
        .unwrap();
    let queued: Vec<String> = harness
        .events
        .events_of_type(events::ACTION_QUEUED)
        .into_iter()
        .filter_map(|(_, data)| data?["action"].as_str().map(str::to_string))
        .collect();
    assert_eq!(queued, vec!["normalize", "sink-a-format", "sink-b-format"]);

    for (number, sink) in [(2, "sink-a"), (3, "sink-b")] {
        let stored = harness.repository.get(df.did).unwrap();
        assert_ne!(stored.stage, DeltaFileStage::Complete);
        for action in [format!("{sink}-format"), format!("{sink}-egress")] {
            harness
                .orchestrator
                .handle_worker_event(WorkerEvent::complete(df.did, sink, number, &action))
                .await
                .unwrap();
        }
        assert_flow_state(&harness.repository.get(df.did).unwrap(), sink, FlowState::Complete);
    }

    let stored = harness.repository.get(df.did).unwrap();
    assert_stage(&stored, DeltaFileStage::Complete);
    assert!(stored.egressed);
}

#[tokio::test]
async fn test_error_with_policy_schedules_auto_resume() {
    let harness = TestHarness::new(skip_flows());
    smoke_retry_policy(&harness).await;
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();
    let _ = harness.dispatch.take_work("a");

    harness
        .orchestrator
        .handle_worker_event(WorkerEvent::error(df.did, "smoke", 1, "a", "boom: disk full"))
        .await
        .unwrap();

    let stored = harness.repository.get(df.did).unwrap();
    assert_stage(&stored, DeltaFileStage::InFlight);
    assert_flow_state(&stored, "smoke", FlowState::InFlight);
    let action = stored.flows[1].last_action().unwrap();
    assert_eq!(action.state, ActionState::Error);
    assert_eq!(action.next_auto_resume_reason.as_deref(), Some("smoke-retry"));
    assert!(harness.dispatch.pending("a").is_empty());
    assert_eq!(
        harness
            .events
            .events_of_type(events::ACTION_AUTO_RESUME_SCHEDULED)
            .len(),
        1
    );

    harness.clock.advance_ms(99);
    let resumed = harness.orchestrator.auto_resume(harness.clock.now()).await.unwrap();
    assert_eq!(resumed, 0);

    harness.clock.advance_ms(1);
    let resumed = harness.orchestrator.auto_resume(harness.clock.now()).await.unwrap();
    assert_eq!(resumed, 1);
    let queued = harness.dispatch.pending("a");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].attempt, 2);

    let stored = harness.repository.get(df.did).unwrap();
    assert_action_state(&stored, "smoke", "a", ActionState::Queued);
    assert_eq!(stored.flows[1].next_auto_resume, None);
}

#[tokio::test]
async fn test_exhausted_policy_errors_flow() {
    let harness = TestHarness::new(skip_flows());
    smoke_retry_policy(&harness).await;
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();

    for attempt in 1..=3 {
        harness.dispatch.drain("a");
        harness
            .orchestrator
            .handle_worker_event(WorkerEvent::error(df.did, "smoke", 1, "a", "boom"))
            .await
            .unwrap();
        if attempt < 3 {
            harness.clock.advance_ms(100);
            let resumed = harness.orchestrator.auto_resume(harness.clock.now()).await.unwrap();
            assert_eq!(resumed, 1);
        }
    }

    let stored = harness.repository.get(df.did).unwrap();
    assert_stage(&stored, DeltaFileStage::Error);
    assert_flow_state(&stored, "smoke", FlowState::Error);
    assert_eq!(stored.flows[1].last_action().unwrap().attempt, 3);
    assert_eq!(stored.flows[1].error_or_filter_cause.as_deref(), Some("boom"));
    assert_eq!(
        harness.events.events_of_type(events::DELTAFILE_ERRORED).len(),
        1
    );
}

#[tokio::test]
async fn test_unmatched_error_waits_for_acknowledgement() {
    let harness = TestHarness::new(skip_flows());
    smoke_retry_policy(&harness).await;
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();

    harness
        .orchestrator
        .handle_worker_event(WorkerEvent::error(df.did, "smoke", 1, "a", "unrelated failure"))
        .await
        .unwrap();
    let stored = harness.repository.get(df.did).unwrap();
    assert_stage(&stored, DeltaFileStage::Error);
    assert!(stored.has_unacknowledged_errors());

    let acknowledged = harness
        .orchestrator
        .acknowledge_errors(df.did, "known outage")
        .await
        .unwrap();
    assert_eq!(acknowledged, 1);

    let stored = harness.repository.get(df.did).unwrap();
    assert!(!stored.has_unacknowledged_errors());
    assert_stage(&stored, DeltaFileStage::Error);
    assert_eq!(
        stored.flows[1].error_acknowledged_reason.as_deref(),
        Some("known outage")
    );

    let again = harness
        .orchestrator
        .acknowledge_errors(df.did, "again")
        .await
        .unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn test_mark_for_resume_requeues_failed_action() {
    let harness = TestHarness::new(skip_flows());
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();
    let _ = harness.dispatch.take_work("a");
    harness
        .orchestrator
        .handle_worker_event(WorkerEvent::error(df.did, "smoke", 1, "a", "boom"))
        .await
        .unwrap();

    let resumed = harness.orchestrator.mark_for_resume(df.did, "a").await.unwrap();
    assert_eq!(resumed, 1);

    let stored = harness.repository.get(df.did).unwrap();
    assert_stage(&stored, DeltaFileStage::InFlight);
    assert_flow_state(&stored, "smoke", FlowState::InFlight);
    assert_eq!(stored.flows[1].error_or_filter_cause, None);
    assert_eq!(harness.dispatch.pending("a")[0].attempt, 2);

    let resumed = harness.orchestrator.mark_for_resume(df.did, "a").await.unwrap();
    assert_eq!(resumed, 0);
}

#[tokio::test]
async fn test_retry_policy_applies_when_no_resume_policy_matches() {
    let flows = Arc::new(FlowRegistry::new(skip_flows()));
    let repository = Arc::new(InMemoryDeltaFileRepository::new());
    let dispatch = Arc::new(InMemoryDispatchQueue::new());
    let policies = Arc::new(ResumePolicyService::new(Arc::new(InMemoryPolicyStore::new())));
    let retry_policy = RetryPolicy::new(2, BackOff::fixed(50)).with_flow("smoke");
    let retry_policies = Arc::new(RetryPolicyService::new());
    retry_policies.replace_all(vec![retry_policy.clone()]).unwrap();

    let orchestrator = PipelineOrchestrator::new(
        CoreConfig::default(),
        flows,
        repository.clone(),
        dispatch,
        policies,
    )
    .with_clock(Arc::new(FixedClock::new(epoch())))
    .with_retry_policies(retry_policies);

    let df = orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();
    orchestrator
        .handle_worker_event(WorkerEvent::error(df.did, "smoke", 1, "a", "boom"))
        .await
        .unwrap();

    let stored = repository.get(df.did).unwrap();
    let action = stored.flows[1].last_action().unwrap();
    let expected_name = format!("retry-policy:{}", retry_policy.id);
    assert_eq!(action.next_auto_resume_reason.as_deref(), Some(expected_name.as_str()));
    assert_eq!(
        action.next_auto_resume,
        Some(epoch() + chrono::Duration::milliseconds(50))
    );
}

#[tokio::test]
async fn test_worker_retry_dispatches_new_attempt() {
    let harness = TestHarness::new(skip_flows());
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();
    let _ = harness.dispatch.take_work("a");

    let event = WorkerEvent::new(
        df.did,
        "smoke",
        1,
        "a",
        WorkerEventKind::Retry {
            reason: "lost lease".to_string(),
        },
    );
    harness.orchestrator.handle_worker_event(event).await.unwrap();

    let queued = harness.dispatch.pending("a");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].attempt, 2);
    assert_eq!(harness.repository.get(df.did).unwrap().requeue_count, 1);
}

#[tokio::test]
async fn test_split_stores_and_dispatches_children() {
    let flows = vec![
        FlowDefinition::new(DATA_SOURCE, FlowType::RestDataSource).publishing("raw"),
        FlowDefinition::new("splitter", FlowType::Transform)
            .subscribing("raw")
            .with_action(ActionConfiguration::new("split", ActionType::Transform))
            .with_action(ActionConfiguration::new("post", ActionType::Transform)),
    ];
    let harness = TestHarness::new(flows);
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();

    let children = (1..=3)
        .map(|i| SplitChild {
            name: format!("part-{i}"),
            content: vec![Content::new(format!("part-{i}"), "text/plain", 1)],
            metadata: BTreeMap::new(),
        })
        .collect();
    harness
        .orchestrator
        .handle_worker_event(WorkerEvent::new(
            df.did,
            "splitter",
            1,
            "split",
            WorkerEventKind::Split { children },
        ))
        .await
        .unwrap();

    let parent = harness.repository.get(df.did).unwrap();
    assert_stage(&parent, DeltaFileStage::Complete);
    let children = harness.repository.children(df.did);
    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|c| c.parent_dids == vec![df.did]));

    let queued = harness.dispatch.pending("post");
    assert_eq!(queued.len(), 3);
    let child_dids: Vec<_> = children.iter().map(|c| c.did).collect();
    assert_eq!(queued.iter().map(|i| i.did).collect::<Vec<_>>(), child_dids);
    assert_eq!(queued[0].content[0].name, "part-1");
}

#[tokio::test]
async fn test_deleted_content_cancels_on_error() {
    let harness = TestHarness::new(skip_flows());
    smoke_retry_policy(&harness).await;
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();

    let mut stored = harness.repository.get(df.did).unwrap();
    stored.content_deleted = true;
    harness.repository.save(&stored).await.unwrap();

    harness
        .orchestrator
        .handle_worker_event(WorkerEvent::error(df.did, "smoke", 1, "a", "boom"))
        .await
        .unwrap();
    let stored = harness.repository.get(df.did).unwrap();
    assert_stage(&stored, DeltaFileStage::Cancelled);
    assert_eq!(stored.next_auto_resume(), None);

    // Late results for a cancelled file are dropped.
    harness
        .orchestrator
        .handle_worker_event(WorkerEvent::complete(df.did, "smoke", 1, "a"))
        .await
        .unwrap();
    assert_stage(&harness.repository.get(df.did).unwrap(), DeltaFileStage::Cancelled);
}

#[tokio::test]
async fn test_unpause_dispatches_released_flow() {
    let mut flows = skip_flows();
    flows[1] = flows[1].clone().paused(true);
    let harness = TestHarness::new(flows);
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();
    assert!(harness.dispatch.pending("a").is_empty());

    assert_eq!(harness.orchestrator.unpause(df.did).await.unwrap(), 0);

    harness.flows.set_paused("smoke", false);
    assert_eq!(harness.orchestrator.unpause(df.did).await.unwrap(), 1);
    assert_eq!(harness.dispatch.pending("a").len(), 1);
    assert!(!harness.repository.get(df.did).unwrap().paused);
}

#[tokio::test]
async fn test_conflicts_are_retried_from_fresh_load() {
    let flows = Arc::new(FlowRegistry::new(skip_flows()));
    let inner = Arc::new(InMemoryDeltaFileRepository::new());
    let conflicting = Arc::new(ConflictingRepository::new(inner.clone(), 0));
    let harness =
        TestHarness::with_repository(flows, conflicting.clone(), inner, CoreConfig::default());
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();

    conflicting.fail_next(2);
    harness
        .orchestrator
        .handle_worker_event(WorkerEvent::complete(df.did, "smoke", 1, "a"))
        .await
        .unwrap();

    assert_eq!(conflicting.loads(), 3);
    assert_eq!(conflicting.saves(), 3);
    assert_stage(&harness.repository.get(df.did).unwrap(), DeltaFileStage::Complete);
    assert_eq!(
        harness.events.events_of_type(events::ACTION_COMPLETED).len(),
        1
    );
}

#[tokio::test]
async fn test_conflict_retries_exhausted() {
    let flows = Arc::new(FlowRegistry::new(skip_flows()));
    let inner = Arc::new(InMemoryDeltaFileRepository::new());
    let conflicting = Arc::new(ConflictingRepository::new(inner.clone(), 0));
    let harness =
        TestHarness::with_repository(flows, conflicting.clone(), inner, CoreConfig::default());
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();
    harness.events.clear();

    conflicting.fail_next(10);
    let err = harness
        .orchestrator
        .handle_worker_event(WorkerEvent::complete(df.did, "smoke", 1, "a"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DeltaFiError::ConflictRetriesExhausted { attempts: 3, .. }
    ));
    assert_stage(&harness.repository.get(df.did).unwrap(), DeltaFileStage::InFlight);
    assert!(harness.events.is_empty());
}

#[tokio::test]
async fn test_cold_queue_routing_and_promotion() {
    let config = CoreConfig::default().with_in_memory_queue_size(2);
    let harness = TestHarness::with_config(skip_flows(), config);
    let first = harness
        .orchestrator
        .ingest("first.txt", DATA_SOURCE, text_input("first.txt"))
        .await
        .unwrap();

    let filler = harness.dispatch.take_work("a").unwrap();
    harness.dispatch.fill("a", &filler, 3);
    harness.orchestrator.refresh_queues().await.unwrap();
    assert!(harness.orchestrator.classifier().is_cold("a", 0));

    let cold = harness
        .orchestrator
        .ingest("cold.txt", DATA_SOURCE, text_input("cold.txt"))
        .await
        .unwrap();
    let stored = harness.repository.get(cold.did).unwrap();
    assert_action_state(&stored, "smoke", "a", ActionState::ColdQueued);
    assert!(stored.flows[1].cold_queued);
    assert_eq!(harness.dispatch.pending("a").len(), 3);
    assert_eq!(harness.orchestrator.metrics().cold_queued(), 1);

    // Still cold: nothing is promoted.
    assert_eq!(harness.orchestrator.promote_cold_to_warm().await.unwrap(), 0);

    harness.dispatch.drain("a");
    harness.orchestrator.refresh_queues().await.unwrap();
    assert_eq!(harness.orchestrator.promote_cold_to_warm().await.unwrap(), 1);

    let stored = harness.repository.get(cold.did).unwrap();
    assert_action_state(&stored, "smoke", "a", ActionState::Queued);
    assert!(!stored.flows[1].cold_queued);
    let queued = harness.dispatch.pending("a");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].did, cold.did);
    assert_eq!(harness.orchestrator.metrics().promoted(), 1);
    assert_eq!(harness.events.events_of_type(events::QUEUE_PROMOTED).len(), 1);
    assert_ne!(first.did, cold.did);
}

#[tokio::test]
async fn test_pending_dispatches_count_toward_threshold() {
    let config = CoreConfig::default().with_in_memory_queue_size(0);
    let flows = vec![
        FlowDefinition::new(DATA_SOURCE, FlowType::RestDataSource).publishing("raw"),
        FlowDefinition::new("left", FlowType::Transform)
            .subscribing("raw")
            .with_action(ActionConfiguration::new("left-a", ActionType::Transform).with_queue("shared-q")),
        FlowDefinition::new("right", FlowType::Transform)
            .subscribing("raw")
            .with_action(ActionConfiguration::new("right-a", ActionType::Transform).with_queue("shared-q")),
    ];
    let harness = TestHarness::with_config(flows, config);
    harness.orchestrator.refresh_queues().await.unwrap();

    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();

    // Only the first input fits; it counts against the second.
    let stored = harness.repository.get(df.did).unwrap();
    assert_action_state(&stored, "left", "left-a", ActionState::Queued);
    assert_action_state(&stored, "right", "right-a", ActionState::ColdQueued);
    assert_eq!(harness.dispatch.pending("shared-q").len(), 1);
}

#[tokio::test]
async fn test_auto_resume_fails_flow_when_action_removed() {
    let harness = TestHarness::new(skip_flows());
    smoke_retry_policy(&harness).await;
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();
    harness
        .orchestrator
        .handle_worker_event(WorkerEvent::error(df.did, "smoke", 1, "a", "boom"))
        .await
        .unwrap();

    let mut flows = skip_flows();
    flows[1] = FlowDefinition::new("smoke", FlowType::Transform).subscribing("raw");
    let _ = harness.flows.replace(flows);
    harness.clock.advance_ms(100);

    let resumed = harness.orchestrator.auto_resume(harness.clock.now()).await.unwrap();
    assert_eq!(resumed, 0);
    let stored = harness.repository.get(df.did).unwrap();
    assert_stage(&stored, DeltaFileStage::Error);
    assert_flow_state(&stored, "smoke", FlowState::Error);
    assert_eq!(stored.next_auto_resume(), None);
}

fn splitter_flows() -> Vec<FlowDefinition> {
    vec![
        FlowDefinition::new(DATA_SOURCE, FlowType::RestDataSource).publishing("raw"),
        FlowDefinition::new("splitter", FlowType::Transform)
            .subscribing("raw")
            .with_action(ActionConfiguration::new("split", ActionType::Transform))
            .with_action(ActionConfiguration::new("post", ActionType::Transform)),
    ]
}

fn split_into(did: uuid::Uuid, parts: usize) -> WorkerEvent {
    let children = (1..=parts)
        .map(|i| SplitChild {
            name: format!("part-{i}"),
            content: vec![Content::new(format!("part-{i}"), "text/plain", 1)],
            metadata: BTreeMap::new(),
        })
        .collect();
    WorkerEvent::new(did, "splitter", 1, "split", WorkerEventKind::Split { children })
}

#[tokio::test]
async fn test_failed_child_insert_leaves_split_pending() {
    let flows = Arc::new(FlowRegistry::new(splitter_flows()));
    let inner = Arc::new(InMemoryDeltaFileRepository::new());
    let conflicting = Arc::new(ConflictingRepository::new(inner.clone(), 0));
    let harness =
        TestHarness::with_repository(flows, conflicting.clone(), inner, CoreConfig::default());
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();

    conflicting.fail_next_inserts(1);
    let err = harness
        .orchestrator
        .handle_worker_event(split_into(df.did, 3))
        .await
        .unwrap_err();
    assert!(matches!(err, DeltaFiError::Storage(_)));

    let parent = harness.repository.get(df.did).unwrap();
    assert_eq!(harness.repository.len(), 1);
    assert!(parent.child_dids.is_empty());
    assert_stage(&parent, DeltaFileStage::InFlight);
    assert_action_state(&parent, "splitter", "split", ActionState::Queued);
    assert!(harness.dispatch.pending("post").is_empty());

    // Redelivery succeeds once storage recovers.
    harness
        .orchestrator
        .handle_worker_event(split_into(df.did, 3))
        .await
        .unwrap();
    assert_stage(&harness.repository.get(df.did).unwrap(), DeltaFileStage::Complete);
    assert_eq!(harness.repository.children(df.did).len(), 3);
    assert_eq!(harness.repository.len(), 4);
    assert_eq!(harness.dispatch.pending("post").len(), 3);
}

#[tokio::test]
async fn test_split_conflict_discards_children_of_lost_attempt() {
    let flows = Arc::new(FlowRegistry::new(splitter_flows()));
    let inner = Arc::new(InMemoryDeltaFileRepository::new());
    let conflicting = Arc::new(ConflictingRepository::new(inner.clone(), 0));
    let harness =
        TestHarness::with_repository(flows, conflicting.clone(), inner, CoreConfig::default());
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();

    conflicting.fail_next(1);
    harness
        .orchestrator
        .handle_worker_event(split_into(df.did, 2))
        .await
        .unwrap();

    assert_eq!(conflicting.saves(), 2);
    assert_eq!(harness.repository.len(), 3);
    let children = harness.repository.children(df.did);
    assert_eq!(children.len(), 2);
    let queued: Vec<_> = harness.dispatch.pending("post").iter().map(|i| i.did).collect();
    assert_eq!(queued, children.iter().map(|c| c.did).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_requeue_redispatches_action_whose_dispatch_failed() {
    let queues = Arc::new(InMemoryDispatchQueue::new());
    let flaky = Arc::new(FlakyDispatchQueue::new(queues.clone(), 1));
    let config = CoreConfig::default().with_requeue_duration_ms(60_000);
    let harness = TestHarness::with_dispatch(skip_flows(), flaky, queues, config);

    let err = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeltaFiError::Queue(QueueError::Unavailable(_))));
    assert!(harness.dispatch.pending("a").is_empty());

    let dids = harness.repository.find_stale_queued(epoch()).await.unwrap();
    assert_eq!(dids.len(), 1);
    let did = dids[0];
    assert_action_state(&harness.repository.get(did).unwrap(), "smoke", "a", ActionState::Queued);

    // Not stale yet.
    assert_eq!(harness.orchestrator.requeue(harness.clock.now()).await.unwrap(), 0);

    harness.clock.advance_ms(60_001);
    let now = harness.clock.now();
    assert_eq!(harness.orchestrator.requeue(now).await.unwrap(), 1);

    let queued = harness.dispatch.pending("a");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].did, did);
    assert_eq!(queued[0].attempt, 1);
    let stored = harness.repository.get(did).unwrap();
    assert_eq!(stored.requeue_count, 1);
    assert_eq!(stored.flows[1].last_action().unwrap().queued, Some(now));
    assert_eq!(harness.events.events_of_type(events::ACTION_REQUEUED).len(), 1);

    // The fresh dispatch restarts the clock.
    assert_eq!(harness.orchestrator.requeue(now).await.unwrap(), 0);
}

#[tokio::test]
async fn test_requeue_skips_actions_with_results() {
    let harness = TestHarness::with_config(
        skip_flows(),
        CoreConfig::default().with_requeue_duration_ms(1000),
    );
    let df = harness
        .orchestrator
        .ingest("f.txt", DATA_SOURCE, text_input("f.txt"))
        .await
        .unwrap();
    let _ = harness.dispatch.take_work("a");
    harness
        .orchestrator
        .handle_worker_event(WorkerEvent::complete(df.did, "smoke", 1, "a"))
        .await
        .unwrap();

    harness.clock.advance_ms(5000);
    assert_eq!(harness.orchestrator.requeue(harness.clock.now()).await.unwrap(), 0);
    assert!(harness.dispatch.pending("a").is_empty());
    assert_eq!(harness.repository.get(df.did).unwrap().requeue_count, 0);
}
