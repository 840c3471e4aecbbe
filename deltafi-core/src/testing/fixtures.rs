//! Test fixtures: canned flow configurations, DeltaFiles, and an
//! orchestrator harness wired to in-memory collaborators.

use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::CoreConfig;
use crate::core::{ActionType, FlowType};
use crate::events::CollectingEventSink;
use crate::flows::{ActionConfiguration, FlowDefinition, FlowRegistry, Requirement};
use crate::model::{CompleteOutcome, Content, FlowInput, WorkerEvent, WorkerEventKind};
use crate::orchestrator::PipelineOrchestrator;
use crate::persistence::{DeltaFileRepository, InMemoryDeltaFileRepository};
use crate::policy::{InMemoryPolicyStore, ResumePolicyService};
use crate::queue::{DispatchQueue, InMemoryDispatchQueue};
use crate::utils::{FixedClock, Timestamp};

/// Data source used by every fixture configuration.
pub const DATA_SOURCE: &str = "rest-in";

/// A fixed, reproducible start time.
#[must_use]
pub fn epoch() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// One text file as flow input.
#[must_use]
pub fn text_input(name: &str) -> FlowInput {
    FlowInput {
        content: vec![Content::new(name, "text/plain", 42)],
        ..FlowInput::default()
    }
}

/// `rest-in` publishes `raw`; flow `smoke` subscribes and runs `a` then `b`,
/// where `b` requires domain `d`.
#[must_use]
pub fn skip_flows() -> Vec<FlowDefinition> {
    vec![
        FlowDefinition::new(DATA_SOURCE, FlowType::RestDataSource).publishing("raw"),
        FlowDefinition::new("smoke", FlowType::Transform)
            .subscribing("raw")
            .with_action(ActionConfiguration::new("a", ActionType::Transform))
            .with_action(
                ActionConfiguration::new("b", ActionType::Transform)
                    .with_requirement(Requirement::domain("d")),
            ),
    ]
}

/// `rest-in` publishes `raw`; `shared` transforms and publishes `clean`;
/// sinks `sink-a` and `sink-b` each format then egress.
#[must_use]
pub fn fan_out_flows() -> Vec<FlowDefinition> {
    let sink = |name: &str| {
        FlowDefinition::new(name, FlowType::DataSink)
            .subscribing("clean")
            .with_action(ActionConfiguration::new(format!("{name}-format"), ActionType::Format))
            .with_action(ActionConfiguration::new(format!("{name}-egress"), ActionType::Egress))
    };
    vec![
        FlowDefinition::new(DATA_SOURCE, FlowType::RestDataSource).publishing("raw"),
        FlowDefinition::new("shared", FlowType::Transform)
            .subscribing("raw")
            .with_action(ActionConfiguration::new("normalize", ActionType::Transform))
            .publishing("clean"),
        sink("sink-a"),
        sink("sink-b"),
    ]
}

/// A completion that produces the given domain.
#[must_use]
pub fn complete_with_domain(event: WorkerEvent, domain: &str) -> WorkerEvent {
    let mut domains = BTreeMap::new();
    domains.insert(domain.to_string(), "value".to_string());
    WorkerEvent {
        kind: WorkerEventKind::Complete(CompleteOutcome {
            domains,
            ..CompleteOutcome::default()
        }),
        ..event
    }
}

/// An orchestrator wired to in-memory collaborators and a fixed clock.
pub struct TestHarness {
    /// The orchestrator under test.
    pub orchestrator: Arc<PipelineOrchestrator>,
    /// Flow configuration.
    pub flows: Arc<FlowRegistry>,
    /// DeltaFile storage.
    pub repository: Arc<InMemoryDeltaFileRepository>,
    /// Worker queues.
    pub dispatch: Arc<InMemoryDispatchQueue>,
    /// Resume policies.
    pub policies: Arc<ResumePolicyService>,
    /// Clock shared with the orchestrator.
    pub clock: Arc<FixedClock>,
    /// Captured side-effect events.
    pub events: Arc<CollectingEventSink>,
}

impl TestHarness {
    /// Builds a harness over the given flows with default configuration.
    #[must_use]
    pub fn new(flows: Vec<FlowDefinition>) -> Self {
        Self::with_config(flows, CoreConfig::default())
    }

    /// Builds a harness over the given flows and configuration.
    #[must_use]
    pub fn with_config(flows: Vec<FlowDefinition>, config: CoreConfig) -> Self {
        let flows = Arc::new(FlowRegistry::new(flows));
        let repository = Arc::new(InMemoryDeltaFileRepository::new());
        Self::with_repository(flows, repository.clone(), repository, config)
    }

    /// Builds a harness whose orchestrator writes through `repository` while
    /// `inspect` exposes the underlying storage.
    #[must_use]
    pub fn with_repository(
        flows: Arc<FlowRegistry>,
        repository: Arc<dyn DeltaFileRepository>,
        inspect: Arc<InMemoryDeltaFileRepository>,
        config: CoreConfig,
    ) -> Self {
        let dispatch = Arc::new(InMemoryDispatchQueue::new());
        Self::build(flows, repository, inspect, dispatch.clone(), dispatch, config)
    }

    /// Builds a harness whose orchestrator dispatches through `dispatch`
    /// while `inspect` exposes the underlying queues.
    #[must_use]
    pub fn with_dispatch(
        flows: Vec<FlowDefinition>,
        dispatch: Arc<dyn DispatchQueue>,
        inspect: Arc<InMemoryDispatchQueue>,
        config: CoreConfig,
    ) -> Self {
        let flows = Arc::new(FlowRegistry::new(flows));
        let repository = Arc::new(InMemoryDeltaFileRepository::new());
        Self::build(flows, repository.clone(), repository, dispatch, inspect, config)
    }

    fn build(
        flows: Arc<FlowRegistry>,
        repository: Arc<dyn DeltaFileRepository>,
        inspect_repository: Arc<InMemoryDeltaFileRepository>,
        dispatch: Arc<dyn DispatchQueue>,
        inspect_dispatch: Arc<InMemoryDispatchQueue>,
        config: CoreConfig,
    ) -> Self {
        let policies = Arc::new(ResumePolicyService::new(Arc::new(InMemoryPolicyStore::new())));
        let clock = Arc::new(FixedClock::new(epoch()));
        let events = Arc::new(CollectingEventSink::new());

        let orchestrator =
            PipelineOrchestrator::new(config, flows.clone(), repository, dispatch, policies.clone())
                .with_clock(clock.clone())
                .with_event_sink(events.clone());

        Self {
            orchestrator: Arc::new(orchestrator),
            flows,
            repository: inspect_repository,
            dispatch: inspect_dispatch,
            policies,
            clock,
            events,
        }
    }
}
